//! # Synthesis Stage Adapter
//!
//! Calls an OpenAI-compatible speech API to turn the agent's reply into
//! encoded audio (mp3). The synthesized bytes go back to the client as a
//! `tts_audio` header immediately followed by one binary frame.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use crate::pipeline::SpeechSynthesisService;

#[derive(Debug, Serialize)]
struct SynthesisRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// OpenAI-backed speech-synthesis collaborator.
pub struct OpenAiSynthesis {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    voice: String,
}

impl OpenAiSynthesis {
    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        api_key: String,
        model: String,
        voice: String,
    ) -> Self {
        Self {
            http,
            endpoint,
            api_key,
            model,
            voice,
        }
    }
}

#[async_trait]
impl SpeechSynthesisService for OpenAiSynthesis {
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        debug!("Requesting synthesis for {} chars", text.len());

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&SynthesisRequest {
                model: &self.model,
                input: text,
                voice: &self.voice,
                response_format: "mp3",
            })
            .send()
            .await
            .context("synthesis request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("synthesis API returned {}: {}", status, body));
        }

        let bytes = response
            .bytes()
            .await
            .context("failed reading synthesis audio body")?;

        if bytes.is_empty() {
            return Err(anyhow!("synthesis API returned no audio"));
        }

        Ok(bytes.to_vec())
    }

    fn format(&self) -> &str {
        "mp3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_body_shape() {
        let body = serde_json::to_value(SynthesisRequest {
            model: "tts-1",
            input: "Hello there!",
            voice: "onyx",
            response_format: "mp3",
        })
        .unwrap();

        assert_eq!(body["model"], "tts-1");
        assert_eq!(body["input"], "Hello there!");
        assert_eq!(body["voice"], "onyx");
        assert_eq!(body["response_format"], "mp3");
    }
}
