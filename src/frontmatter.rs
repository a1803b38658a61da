/// YAML frontmatter extraction for chapter files.
///
/// A chapter may open with a `---` line, a YAML mapping, and a closing `---`
/// line. Anything that does not fit that shape is treated as plain body text:
/// parsing never fails.
use std::collections::BTreeMap;

use serde_yaml::Value;
use tracing::debug;

const DELIMITER: &str = "---";

/// Scalar metadata found in a frontmatter block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Frontmatter {
    fields: BTreeMap<String, Value>,
}

impl Frontmatter {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Raw YAML value for `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Value for `key` rendered as a string. Strings, numbers and booleans
    /// qualify; sequences, mappings and nulls do not.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.fields.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    fn from_yaml(region: &str) -> Self {
        let value: Value = match serde_yaml::from_str(region) {
            Ok(v) => v,
            Err(e) => {
                debug!("ignoring malformed frontmatter: {e}");
                return Self::default();
            }
        };

        let Value::Mapping(mapping) = value else {
            return Self::default();
        };

        let fields = mapping
            .into_iter()
            .filter_map(|(k, v)| {
                let key = match k {
                    Value::String(s) => s,
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key, v))
            })
            .collect();

        Self { fields }
    }
}

/// Split `content` into `(frontmatter, body)`.
///
/// The body is everything after the first bare `---` line that follows the
/// opening one. Without an opening delimiter, or without a closing one, the
/// frontmatter is empty and the body is `content` unchanged.
#[must_use]
pub fn parse(content: &str) -> (Frontmatter, String) {
    let mut lines = content.split_inclusive('\n');

    let Some(first) = lines.next() else {
        return (Frontmatter::default(), content.to_string());
    };
    if !is_delimiter(first) {
        return (Frontmatter::default(), content.to_string());
    }

    let region_start = first.len();
    let mut offset = region_start;
    for line in lines {
        if is_delimiter(line) {
            let region = &content[region_start..offset];
            let body = &content[offset + line.len()..];
            return (Frontmatter::from_yaml(region), body.to_string());
        }
        offset += line.len();
    }

    debug!("frontmatter opened but never closed; treating file as plain body");
    (Frontmatter::default(), content.to_string())
}

fn is_delimiter(line: &str) -> bool {
    line.trim_end() == DELIMITER
}
