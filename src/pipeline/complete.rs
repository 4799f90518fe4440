//! # Completion Stage Adapter
//!
//! Calls an OpenAI-compatible chat-completions API with the session's
//! conversation window, prepending the fixed voice-agent system prompt.
//! One network call per turn, no retries; the orchestrator handles failure
//! by substituting the fallback reply.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::conversation::ChatTurn;
use crate::pipeline::CompletionService;

/// Chat-completions request body.
#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: Vec<RequestMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct RequestMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// OpenAI-backed completion collaborator.
pub struct OpenAiCompletion {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    system_prompt: String,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiCompletion {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        api_key: String,
        model: String,
        system_prompt: String,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            http,
            endpoint,
            api_key,
            model,
            system_prompt,
            max_tokens,
            temperature,
        }
    }

    /// Build the request body: system instruction first, then the window.
    fn request_body<'a>(&'a self, turns: &'a [ChatTurn]) -> CompletionRequest<'a> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        messages.push(RequestMessage {
            role: "system",
            content: &self.system_prompt,
        });
        for turn in turns {
            messages.push(RequestMessage {
                role: match turn.role {
                    crate::conversation::Role::User => "user",
                    crate::conversation::Role::Assistant => "assistant",
                },
                content: &turn.content,
            });
        }

        CompletionRequest {
            model: &self.model,
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, turns: &[ChatTurn]) -> Result<String> {
        debug!("Requesting completion for {} context turns", turns.len());

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(turns))
            .send()
            .await
            .context("completion request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("completion API returned {}: {}", status, body));
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .context("completion response was not valid JSON")?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| anyhow!("completion response contained no choices"))
    }
}
