use std::sync::LazyLock;

use regex::Regex;

const FENCE: &str = "```";

/// A `##` heading: exactly two marks, then visible text. A `#` may open the
/// title only after whitespace, so `###` never matches.
static SECTION_HEADING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^##(?:[ \t]+(\S.*)|([^#\s].*))$").expect("valid heading regex")
});

/// A titled slice of a chapter body.
#[derive(Debug, Clone, PartialEq)]
pub struct Section {
    pub title: String,
    pub text: String,
}

impl Section {
    /// Whether the section holds nothing but whitespace.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Classification of one body line.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Line<'a> {
    Heading(&'a str),
    Text(&'a str),
}

/// Walks body lines, tracking code fences so that nothing inside a fence is
/// read as a heading.
struct LineScanner<'a> {
    lines: std::str::Split<'a, char>,
    in_code_fence: bool,
}

impl<'a> LineScanner<'a> {
    fn new(body: &'a str) -> Self {
        Self {
            lines: body.split('\n'),
            in_code_fence: false,
        }
    }
}

impl<'a> Iterator for LineScanner<'a> {
    type Item = Line<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = self.lines.next()?;

        if line.trim().starts_with(FENCE) {
            self.in_code_fence = !self.in_code_fence;
            return Some(Line::Text(line));
        }
        if self.in_code_fence {
            return Some(Line::Text(line));
        }

        let visible = line.strip_suffix('\r').unwrap_or(line);
        match SECTION_HEADING.captures(visible) {
            Some(caps) => {
                let title = caps
                    .get(1)
                    .or_else(|| caps.get(2))
                    .map_or("", |m| m.as_str())
                    .trim();
                Some(Line::Heading(title))
            }
            None => Some(Line::Text(line)),
        }
    }
}

/// Splits a chapter body into sections at `##` headings.
///
/// Text before the first heading is titled `fallback_title`. Heading lines
/// are dropped; every other line lands in exactly one section, so joining the
/// section texts with `\n` rebuilds the body minus its heading lines. A
/// heading directly followed by another heading yields no section.
#[must_use]
pub fn split_sections(body: &str, fallback_title: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_title = fallback_title.to_string();
    let mut current_lines: Vec<&str> = Vec::new();

    for line in LineScanner::new(body) {
        match line {
            Line::Heading(title) => {
                if !current_lines.is_empty() {
                    sections.push(Section {
                        title: current_title,
                        text: current_lines.join("\n"),
                    });
                    current_lines.clear();
                }
                current_title = title.to_string();
            }
            Line::Text(text) => current_lines.push(text),
        }
    }

    if !current_lines.is_empty() {
        sections.push(Section {
            title: current_title,
            text: current_lines.join("\n"),
        });
    }

    sections
}

/// Titles of every `##` heading outside code fences, in document order.
#[must_use]
pub fn extract_headings(body: &str) -> Vec<String> {
    LineScanner::new(body)
        .filter_map(|line| match line {
            Line::Heading(title) => Some(title.to_string()),
            Line::Text(_) => None,
        })
        .collect()
}
