/// Blocking client for the Anthropic Messages API.
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::{ChatError, ChatModel, ChatResponse, Message, ToolSpec};
use crate::config::ChatConfig;

/// Longest slice of an error body kept in [`ChatError::Api`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "no_tools")]
    tools: &'a [ToolSpec],
}

fn no_tools(tools: &&[ToolSpec]) -> bool {
    tools.is_empty()
}

pub struct AnthropicClient {
    http: reqwest::blocking::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    version: String,
}

impl AnthropicClient {
    /// Build a client from configuration, reading the key from the
    /// configured environment variable.
    pub fn from_config(cfg: &ChatConfig, timeout: Duration) -> Result<Self, ChatError> {
        let api_key = std::env::var(&cfg.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ChatError::MissingApiKey(cfg.api_key_env.clone()))?;

        let http = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            api_url: cfg.api_url.clone(),
            api_key,
            model: cfg.model.clone(),
            max_tokens: cfg.max_tokens,
            version: cfg.anthropic_version.clone(),
        })
    }

    fn request_body<'a>(
        &'a self,
        system: &'a str,
        messages: &'a [Message],
        tools: &'a [ToolSpec],
    ) -> MessagesRequest<'a> {
        MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            system,
            messages,
            tools,
        }
    }
}

impl ChatModel for AnthropicClient {
    fn respond(
        &self,
        system: &str,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ChatResponse, ChatError> {
        debug!(
            "chat request: {} messages, {} tools",
            messages.len(),
            tools.len()
        );

        let resp = self
            .http
            .post(&self.api_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.version)
            .json(&self.request_body(system, messages, tools))
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let cut = (0..=MAX_ERROR_BODY)
                    .rev()
                    .find(|&i| body.is_char_boundary(i))
                    .unwrap_or(0);
                body.truncate(cut);
            }
            warn!("chat API returned {status}");
            return Err(ChatError::Api {
                status: status.as_u16(),
                body,
            });
        }

        resp.json::<ChatResponse>()
            .map_err(|e| ChatError::Decode(e.to_string()))
    }
}
