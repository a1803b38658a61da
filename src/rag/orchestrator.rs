//! Bounded conversation loop between the chat model and the tool registry.
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::tools::ToolRegistry;
use crate::llm::{ChatError, ChatModel, ChatResponse, ContentBlock, Message, Role, StopReason};

/// Answer given when the loop ends without a usable reply.
pub const FALLBACK_ANSWER: &str = "I'm sorry, I wasn't able to finish answering that question. \
     Please try rephrasing it or asking about a more specific topic.";

/// Characters of a tool result kept in its [`ToolCallRecord`].
pub const SUMMARY_LIMIT: usize = 200;

pub const TOOL_SYSTEM_PROMPT: &str = "You are a helpful assistant that answers questions about a \
course made of numbered chapters.

You have two tools:
- search_content: full-text semantic search over the chapter contents. Use it for \"how do I\" \
questions, feature details and examples.
- get_course_outline: the list of chapters, or the lessons of one chapter. Use it for questions \
about structure, such as \"what's in chapter 3\" or \"which topics are covered\".

Call a tool whenever the answer depends on the course material, and cite the chapters you used. \
If the tools return nothing relevant, say so plainly. Keep answers concise and practical.";

/// One executed tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallRecord {
    pub tool_name: String,
    pub input: Value,
    /// Serialized result, cut to [`SUMMARY_LIMIT`] characters.
    pub result_summary: String,
    #[serde(skip)]
    pub result: Value,
    #[serde(skip)]
    pub is_error: bool,
}

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnEnd {
    FinalAnswer,
    /// The model stopped for a reason other than tool use or end of turn.
    Aborted,
    /// The iteration budget ran out while the model still wanted tools.
    BudgetExceeded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    pub answer: String,
    pub tool_calls: Vec<ToolCallRecord>,
    pub end: TurnEnd,
    pub model_calls: usize,
}

enum State {
    AwaitingModel,
    ToolRequested(ChatResponse),
    FinalAnswer(String),
    Aborted(String),
}

fn summarize(text: &str) -> String {
    text.chars().take(SUMMARY_LIMIT).collect()
}

pub struct Orchestrator<'a> {
    model: &'a dyn ChatModel,
    tools: &'a ToolRegistry,
    max_iterations: usize,
}

impl<'a> Orchestrator<'a> {
    pub fn new(model: &'a dyn ChatModel, tools: &'a ToolRegistry, max_iterations: usize) -> Self {
        Self {
            model,
            tools,
            max_iterations: max_iterations.max(1),
        }
    }

    /// Answer `question`, letting the model call tools for at most
    /// `max_iterations` model round trips. Only a chat model failure is an
    /// error; everything else resolves to an answer.
    pub fn run(&self, question: &str) -> Result<TurnOutcome, ChatError> {
        let specs = self.tools.specs();
        let mut messages = vec![Message::user_text(question)];
        let mut tool_calls = Vec::new();
        let mut model_calls = 0;
        let mut state = State::AwaitingModel;

        loop {
            state = match state {
                State::AwaitingModel => {
                    if model_calls == self.max_iterations {
                        warn!(
                            "tool loop hit its limit of {} iterations; using fallback answer",
                            self.max_iterations
                        );
                        return Ok(TurnOutcome {
                            answer: FALLBACK_ANSWER.to_string(),
                            tool_calls,
                            end: TurnEnd::BudgetExceeded,
                            model_calls,
                        });
                    }

                    model_calls += 1;
                    let response = self.model.respond(TOOL_SYSTEM_PROMPT, &messages, &specs)?;
                    debug!(
                        "model call {model_calls}: stop reason {:?}",
                        response.stop_reason
                    );

                    match response.stop_reason {
                        Some(StopReason::ToolUse) if response.tool_uses().next().is_some() => {
                            State::ToolRequested(response)
                        }
                        Some(StopReason::EndTurn) => {
                            State::FinalAnswer(response.text().unwrap_or_else(|| {
                                warn!("model ended its turn without text");
                                FALLBACK_ANSWER.to_string()
                            }))
                        }
                        other => {
                            warn!("model stopped early: {other:?}");
                            State::Aborted(
                                response
                                    .text()
                                    .unwrap_or_else(|| FALLBACK_ANSWER.to_string()),
                            )
                        }
                    }
                }

                State::ToolRequested(response) => {
                    let mut results = Vec::new();
                    for (id, name, input) in response.tool_uses() {
                        let outcome = self.tools.execute(name, input);
                        let text = outcome.value.to_string();
                        info!(
                            "tool {name} {}",
                            if outcome.is_error { "returned an error" } else { "succeeded" }
                        );

                        tool_calls.push(ToolCallRecord {
                            tool_name: name.to_string(),
                            input: input.clone(),
                            result_summary: summarize(&text),
                            result: outcome.value,
                            is_error: outcome.is_error,
                        });
                        results.push(ContentBlock::ToolResult {
                            tool_use_id: id.to_string(),
                            content: text,
                            is_error: outcome.is_error,
                        });
                    }

                    messages.push(Message {
                        role: Role::Assistant,
                        content: response
                            .content
                            .into_iter()
                            .filter(|b| !matches!(b, ContentBlock::Unknown))
                            .collect(),
                    });
                    messages.push(Message {
                        role: Role::User,
                        content: results,
                    });
                    State::AwaitingModel
                }

                State::FinalAnswer(answer) => {
                    return Ok(TurnOutcome {
                        answer,
                        tool_calls,
                        end: TurnEnd::FinalAnswer,
                        model_calls,
                    });
                }

                State::Aborted(answer) => {
                    return Ok(TurnOutcome {
                        answer,
                        tool_calls,
                        end: TurnEnd::Aborted,
                        model_calls,
                    });
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::cache::MetadataCache;
    use crate::llm::mock::{ScriptedChatModel, text_reply, tool_reply};
    use crate::rag::tools::{CourseOutlineTool, SearchContentTool};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::{TempDir, tempdir};

    fn registry() -> (TempDir, ToolRegistry) {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("chapter1_intro.md"),
            "---\ntitle: Intro\n---\n## Install\ntext\n## Usage\ntext\n",
        )
        .unwrap();
        let outline =
            CourseOutlineTool::new(Arc::new(MetadataCache::new()), dir.path().to_path_buf());
        (dir, ToolRegistry::new(SearchContentTool::new(None, 3), outline))
    }

    #[test]
    fn test_direct_answer() {
        let (_dir, tools) = registry();
        let model = ScriptedChatModel::new([text_reply("Hello there.")]);

        let outcome = Orchestrator::new(&model, &tools, 5).run("hi").unwrap();
        assert_eq!(outcome.answer, "Hello there.");
        assert_eq!(outcome.end, TurnEnd::FinalAnswer);
        assert!(outcome.tool_calls.is_empty());

        let requests = model.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].system, TOOL_SYSTEM_PROMPT);
        assert_eq!(requests[0].tool_names, vec!["search_content", "get_course_outline"]);
        assert_eq!(requests[0].messages, vec![Message::user_text("hi")]);
    }

    #[test]
    fn test_tool_result_fed_back() {
        let (_dir, tools) = registry();
        let model = ScriptedChatModel::new([
            tool_reply("t1", "get_course_outline", json!({"course_identifier": "1"})),
            text_reply("Chapter 1 covers Install and Usage."),
        ]);

        let outcome = Orchestrator::new(&model, &tools, 5).run("what's in chapter 1?").unwrap();
        assert_eq!(outcome.answer, "Chapter 1 covers Install and Usage.");
        assert_eq!(outcome.model_calls, 2);
        assert_eq!(outcome.tool_calls.len(), 1);
        assert_eq!(outcome.tool_calls[0].tool_name, "get_course_outline");
        assert_eq!(outcome.tool_calls[0].result["course"]["lesson_count"], 2);

        let second = &model.requests()[1].messages;
        assert_eq!(second.len(), 3);
        assert_eq!(second[1].role, Role::Assistant);
        assert_eq!(second[2].role, Role::User);
        match &second[2].content[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                assert_eq!(tool_use_id, "t1");
                assert!(!is_error);
                let parsed: Value = serde_json::from_str(content).unwrap();
                assert_eq!(parsed["course"]["title"], "Intro");
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }

    #[test]
    fn test_every_tool_use_runs_in_order() {
        let (_dir, tools) = registry();
        let both = ChatResponse {
            content: vec![
                ContentBlock::Text {
                    text: "Checking.".into(),
                },
                ContentBlock::ToolUse {
                    id: "a".into(),
                    name: "search_content".into(),
                    input: json!({"query": "install"}),
                },
                ContentBlock::ToolUse {
                    id: "b".into(),
                    name: "get_course_outline".into(),
                    input: json!({"course_identifier": "all"}),
                },
            ],
            stop_reason: Some(StopReason::ToolUse),
        };
        let model = ScriptedChatModel::new([both, text_reply("done")]);

        let outcome = Orchestrator::new(&model, &tools, 5).run("q").unwrap();
        let names: Vec<_> = outcome.tool_calls.iter().map(|c| c.tool_name.as_str()).collect();
        assert_eq!(names, vec!["search_content", "get_course_outline"]);

        let combined = &model.requests()[1].messages[2];
        let ids: Vec<_> = combined
            .content
            .iter()
            .map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, .. } => tool_use_id.as_str(),
                _ => "",
            })
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_unhandled_blocks_not_echoed() {
        let (_dir, tools) = registry();
        let reply = ChatResponse {
            content: vec![
                ContentBlock::Unknown,
                ContentBlock::ToolUse {
                    id: "t1".into(),
                    name: "get_course_outline".into(),
                    input: json!({}),
                },
            ],
            stop_reason: Some(StopReason::ToolUse),
        };
        let model = ScriptedChatModel::new([reply, text_reply("done")]);

        let outcome = Orchestrator::new(&model, &tools, 5).run("q").unwrap();
        assert_eq!(outcome.answer, "done");

        let echoed = &model.requests()[1].messages[1];
        assert_eq!(echoed.role, Role::Assistant);
        assert_eq!(echoed.content.len(), 1);
        assert!(matches!(echoed.content[0], ContentBlock::ToolUse { .. }));
    }

    #[test]
    fn test_tool_failure_does_not_end_turn() {
        let (_dir, tools) = registry();
        let model = ScriptedChatModel::new([
            tool_reply("t1", "search_content", json!({})),
            tool_reply("t2", "no_such_tool", json!({})),
            text_reply("Sorry, I could not search."),
        ]);

        let outcome = Orchestrator::new(&model, &tools, 5).run("q").unwrap();
        assert_eq!(outcome.end, TurnEnd::FinalAnswer);
        assert_eq!(outcome.tool_calls.len(), 2);
        assert!(outcome.tool_calls.iter().all(|c| c.is_error));
        assert!(outcome.tool_calls[0].result_summary.contains("Tool execution failed"));
        assert!(outcome.tool_calls[1].result_summary.contains("Unknown tool"));

        let last = &model.requests()[2].messages;
        assert!(matches!(
            last[4].content[0],
            ContentBlock::ToolResult { is_error: true, .. }
        ));
    }

    #[test]
    fn test_budget_exhaustion_falls_back() {
        let (_dir, tools) = registry();
        let model = ScriptedChatModel::new((0..5).map(|i| {
            tool_reply(
                &format!("t{i}"),
                "get_course_outline",
                json!({"course_identifier": "all"}),
            )
        }));

        let outcome = Orchestrator::new(&model, &tools, 5).run("loop forever").unwrap();
        assert_eq!(outcome.answer, FALLBACK_ANSWER);
        assert_eq!(outcome.end, TurnEnd::BudgetExceeded);
        assert_eq!(outcome.tool_calls.len(), 5);
        assert_eq!(model.call_count(), 5);
    }

    #[test]
    fn test_custom_budget() {
        let (_dir, tools) = registry();
        let model = ScriptedChatModel::new([
            tool_reply("t1", "get_course_outline", json!({})),
            tool_reply("t2", "get_course_outline", json!({})),
        ]);
        let outcome = Orchestrator::new(&model, &tools, 2).run("q").unwrap();
        assert_eq!(outcome.end, TurnEnd::BudgetExceeded);
        assert_eq!(outcome.tool_calls.len(), 2);
    }

    #[test]
    fn test_aborted_turn() {
        let (_dir, tools) = registry();
        let truncated = ChatResponse {
            content: vec![ContentBlock::Text {
                text: "Partial answer".into(),
            }],
            stop_reason: Some(StopReason::MaxTokens),
        };
        let model = ScriptedChatModel::new([truncated]);
        let outcome = Orchestrator::new(&model, &tools, 5).run("q").unwrap();
        assert_eq!(outcome.end, TurnEnd::Aborted);
        assert_eq!(outcome.answer, "Partial answer");

        let silent = ChatResponse {
            content: vec![],
            stop_reason: None,
        };
        let model = ScriptedChatModel::new([silent]);
        let outcome = Orchestrator::new(&model, &tools, 5).run("q").unwrap();
        assert_eq!(outcome.end, TurnEnd::Aborted);
        assert_eq!(outcome.answer, FALLBACK_ANSWER);
    }

    #[test]
    fn test_tool_use_without_calls_is_aborted() {
        let (_dir, tools) = registry();
        let empty = ChatResponse {
            content: vec![],
            stop_reason: Some(StopReason::ToolUse),
        };
        let model = ScriptedChatModel::new([empty]);
        let outcome = Orchestrator::new(&model, &tools, 5).run("q").unwrap();
        assert_eq!(outcome.end, TurnEnd::Aborted);
        assert_eq!(model.call_count(), 1);
    }

    #[test]
    fn test_end_turn_without_text_falls_back() {
        let (_dir, tools) = registry();
        let model = ScriptedChatModel::new([ChatResponse {
            content: vec![],
            stop_reason: Some(StopReason::EndTurn),
        }]);
        let outcome = Orchestrator::new(&model, &tools, 5).run("q").unwrap();
        assert_eq!(outcome.end, TurnEnd::FinalAnswer);
        assert_eq!(outcome.answer, FALLBACK_ANSWER);
    }

    #[test]
    fn test_chat_error_propagates() {
        let (_dir, tools) = registry();
        let model = ScriptedChatModel::default();
        let err = Orchestrator::new(&model, &tools, 5).run("q").unwrap_err();
        assert!(matches!(err, ChatError::Decode(_)));
    }

    #[test]
    fn test_summary_truncated() {
        let long = "é".repeat(500);
        assert_eq!(summarize(&long).chars().count(), SUMMARY_LIMIT);
        assert_eq!(summarize("short"), "short");
    }
}
