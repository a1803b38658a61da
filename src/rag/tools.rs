//! The two tools offered to the chat model.
//!
//! Tools validate their own input. A tool either returns a JSON payload or a
//! [`ToolError`]; the registry turns errors and unknown names into error
//! payloads so nothing escapes to the orchestrator.
use std::path::PathBuf;
use std::sync::Arc;

use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, de};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::warn;

use super::retriever::{Retriever, clamp_top_k};
use crate::indexer::cache::{ChapterSummary, MetadataCache};
use crate::llm::ToolSpec;

pub const SEARCH_CONTENT: &str = "search_content";
pub const GET_COURSE_OUTLINE: &str = "get_course_outline";

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{0} parameter is required")]
    MissingParameter(&'static str),

    #[error("{0}")]
    InvalidInput(String),

    #[error("failed to read chapters: {0:#}")]
    Corpus(anyhow::Error),
}

impl ToolError {
    /// Errors caused by the model's input, safe to echo back verbatim.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::MissingParameter(_) | Self::InvalidInput(_))
    }
}

pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema of the input object.
    fn input_schema(&self) -> Value;

    fn call(&self, input: &Value) -> Result<Value, ToolError>;

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
        }
    }
}

fn schema_of<T: JsonSchema>() -> Value {
    let mut schema = schemars::schema_for!(T);
    schema.remove("$schema");
    schema.to_value()
}

fn parse_input<'a, T: Deserialize<'a>>(input: &'a Value) -> Result<T, ToolError> {
    T::deserialize(input).map_err(|e| ToolError::InvalidInput(e.to_string()))
}

// ── search_content ───────────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct SearchContentParams {
    /// The search query to find relevant chapter content
    query: String,
    /// Number of results to return (1-5, default 3)
    #[serde(default, deserialize_with = "lenient_top_k")]
    #[schemars(with = "Option<u8>")]
    top_k: Option<usize>,
}

/// Read `top_k`, accepting integers, floats and numeric strings. Values are
/// clamped to `[1, 5]` afterwards, so negatives end up as 1.
fn top_k_from_value(value: &Value) -> Result<Option<usize>, String> {
    let raw = match value {
        Value::Null => return Ok(None),
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("invalid top_k: unsupported number {n}"))?,
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| format!("invalid top_k: '{s}' is not a number"))?,
        other => return Err(format!("invalid top_k: expected a number, got {other}")),
    };

    if !raw.is_finite() {
        return Err("invalid top_k: must be finite".into());
    }
    // Saturating cast; negatives become 0.
    Ok(Some(clamp_top_k(raw as usize)))
}

fn lenient_top_k<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<usize>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    top_k_from_value(&value).map_err(de::Error::custom)
}

pub struct SearchContentTool {
    retriever: Option<Arc<Retriever>>,
    default_top_k: usize,
}

impl SearchContentTool {
    #[must_use]
    pub fn new(retriever: Option<Arc<Retriever>>, default_top_k: usize) -> Self {
        Self {
            retriever,
            default_top_k: clamp_top_k(default_top_k),
        }
    }
}

fn no_results(error: &str) -> Value {
    json!({
        "error": error,
        "results": [],
        "results_count": 0,
    })
}

impl Tool for SearchContentTool {
    fn name(&self) -> &'static str {
        SEARCH_CONTENT
    }

    fn description(&self) -> &'static str {
        "Search the course chapters for specific information. Use this when users ask 'how to', \
         need details about features, or want examples."
    }

    fn input_schema(&self) -> Value {
        schema_of::<SearchContentParams>()
    }

    fn call(&self, input: &Value) -> Result<Value, ToolError> {
        if matches!(input.get("query"), None | Some(Value::Null)) {
            return Err(ToolError::MissingParameter("query"));
        }
        let params: SearchContentParams = parse_input(input)?;
        let query = params.query.as_str();
        if query.trim().is_empty() {
            return Err(ToolError::MissingParameter("query"));
        }
        let top_k = params.top_k.unwrap_or(self.default_top_k);

        let Some(retriever) = &self.retriever else {
            return Ok(no_results("Content search is not available"));
        };

        let hits = match retriever.retrieve(query, top_k) {
            Ok(hits) => hits,
            Err(e) => {
                warn!("search_content failed for {query:?}: {e}");
                return Ok(no_results("Content search failed"));
            }
        };

        let results: Vec<Value> = hits
            .into_iter()
            .map(|r| {
                json!({
                    "chapter": r.document_id,
                    "title": r.title,
                    "content": r.passage_text,
                    "url": r.url,
                    "relevance": r.relevance,
                })
            })
            .collect();

        Ok(json!({
            "results_count": results.len(),
            "results": results,
            "query": query,
        }))
    }
}

// ── get_course_outline ───────────────────────────────────────────────

#[derive(Deserialize, JsonSchema)]
struct CourseOutlineParams {
    /// Chapter identifier: number (e.g. '2'), chapter name (e.g. 'getting started', 'tools'),
    /// or 'all' for the complete list
    #[serde(default, deserialize_with = "lenient_identifier")]
    #[schemars(with = "Option<String>")]
    course_identifier: Option<String>,
}

/// Strings as given, numbers rendered, null as absent.
fn lenient_identifier<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        Value::Number(n) => Ok(Some(n.to_string())),
        other => Err(de::Error::custom(format!(
            "invalid course_identifier: expected a string, got {other}"
        ))),
    }
}

pub struct CourseOutlineTool {
    cache: Arc<MetadataCache>,
    chapters_dir: PathBuf,
}

impl CourseOutlineTool {
    #[must_use]
    pub fn new(cache: Arc<MetadataCache>, chapters_dir: PathBuf) -> Self {
        Self {
            cache,
            chapters_dir,
        }
    }
}

/// Exact ordinal first, then case-insensitive substring of title or id.
/// `chapters` must already be in ordinal order.
fn resolve<'a>(chapters: &[&'a ChapterSummary], identifier: &str) -> Option<&'a ChapterSummary> {
    let needle = identifier.trim().to_lowercase();

    if let Ok(number) = needle.parse::<u32>() {
        if let Some(found) = chapters.iter().copied().find(|c| c.number == number) {
            return Some(found);
        }
    }

    chapters
        .iter()
        .copied()
        .find(|c| c.title.to_lowercase().contains(&needle) || c.id.to_lowercase().contains(&needle))
}

impl Tool for CourseOutlineTool {
    fn name(&self) -> &'static str {
        GET_COURSE_OUTLINE
    }

    fn description(&self) -> &'static str {
        "Get the structure and lesson list for a course chapter. Use this when users ask \
         'what's in chapter X', 'show me topics', or want navigation information."
    }

    fn input_schema(&self) -> Value {
        schema_of::<CourseOutlineParams>()
    }

    fn call(&self, input: &Value) -> Result<Value, ToolError> {
        let params: CourseOutlineParams = parse_input(input)?;
        let identifier = match params.course_identifier {
            None => "all".to_string(),
            Some(s) if s.trim().is_empty() => {
                return Err(ToolError::MissingParameter("course_identifier"));
            }
            Some(s) => s,
        };

        let entry = self
            .cache
            .ensure_fresh(&self.chapters_dir)
            .map_err(ToolError::Corpus)?;
        let chapters = entry.ordered();

        if identifier.trim().eq_ignore_ascii_case("all") {
            let courses: Vec<Value> = chapters
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "number": c.number,
                        "title": c.title,
                        "url": c.url,
                        "lesson_count": c.lesson_count,
                    })
                })
                .collect();
            return Ok(json!({
                "courses_count": courses.len(),
                "courses": courses,
            }));
        }

        match resolve(&chapters, &identifier) {
            Some(course) => Ok(json!({ "course": course })),
            None => {
                let available: Vec<Value> = chapters
                    .iter()
                    .map(|c| json!({"number": c.number, "title": c.title, "identifier": c.id}))
                    .collect();
                Ok(json!({
                    "error": format!("No course found matching '{identifier}'"),
                    "available_courses": available,
                }))
            }
        }
    }
}

// ── Registry ─────────────────────────────────────────────────────────

/// Result of dispatching one tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub value: Value,
    pub is_error: bool,
}

/// The fixed set of tools the model may call.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new(search: SearchContentTool, outline: CourseOutlineTool) -> Self {
        Self {
            tools: vec![Box::new(search), Box::new(outline)],
        }
    }

    #[must_use]
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
    }

    /// Run `name` with `input`. Never fails: unknown tools and tool errors
    /// come back as `{"error": ...}` payloads flagged `is_error`. Only input
    /// validation messages reach the payload; other failures are logged.
    pub fn execute(&self, name: &str, input: &Value) -> ToolOutcome {
        let Some(tool) = self.get(name) else {
            warn!("model requested unknown tool {name}");
            return ToolOutcome {
                value: json!({ "error": format!("Unknown tool: {name}") }),
                is_error: true,
            };
        };

        match tool.call(input) {
            Ok(value) => ToolOutcome {
                value,
                is_error: false,
            },
            Err(e) => {
                warn!("tool {name} failed: {e}");
                let message = if e.is_validation() {
                    format!("Tool execution failed: {e}")
                } else {
                    "Tool execution failed".to_string()
                };
                ToolOutcome {
                    value: json!({ "error": message }),
                    is_error: true,
                }
            }
        }
    }
}
