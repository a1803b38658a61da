/// Scripted chat model for tests and offline runs.
use std::collections::VecDeque;
use std::sync::Mutex;

use serde_json::Value;

use super::{ChatError, ChatModel, ChatResponse, ContentBlock, Message, StopReason, ToolSpec};

/// What the model was asked, captured per call.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tool_names: Vec<String>,
}

/// Replays queued responses in order and records every request. Running out
/// of responses is a [`ChatError::Decode`].
#[derive(Debug, Default)]
pub struct ScriptedChatModel {
    responses: Mutex<VecDeque<ChatResponse>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedChatModel {
    #[must_use]
    pub fn new(responses: impl IntoIterator<Item = ChatResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }
}

impl ChatModel for ScriptedChatModel {
    fn respond(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, ChatError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(RecordedRequest {
                system: system.to_string(),
                messages: messages.to_vec(),
                tool_names: tools.iter().map(|t| t.name.clone()).collect(),
            });
        }

        self.responses
            .lock()
            .ok()
            .and_then(|mut q| q.pop_front())
            .ok_or_else(|| ChatError::Decode("no scripted response left".into()))
    }
}

/// A final answer.
#[must_use]
pub fn text_reply(text: &str) -> ChatResponse {
    ChatResponse {
        content: vec![ContentBlock::Text { text: text.into() }],
        stop_reason: Some(StopReason::EndTurn),
    }
}

/// A response requesting a single tool call.
#[must_use]
pub fn tool_reply(id: &str, name: &str, input: Value) -> ChatResponse {
    ChatResponse {
        content: vec![ContentBlock::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }],
        stop_reason: Some(StopReason::ToolUse),
    }
}
