//! Cloud completion backend (OpenAI Responses API).

use async_trait::async_trait;
use serde_json::Value as Json;
use tracing::debug;

use crate::config::Config;

use super::{BackendError, BackendReply, CommandBackend, GenerateRequest, SYSTEM_PROMPT,
    extract_commands};

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: Option<String>,
    model: String,
    base_url: String,
}

impl OpenAiBackend {
    pub fn new(api_key: Option<String>, model: String, base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.openai_api_key.clone(),
            config.openai_model.clone(),
            config.openai_base_url.clone(),
        )
    }

    pub(crate) fn build_request_body(&self, request: &GenerateRequest) -> Json {
        serde_json::json!({
            "model": self.model,
            "temperature": 0.3,
            "input": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": request.user_payload().to_string() },
            ],
            "text": { "format": { "type": "json_object" } },
        })
    }
}

/// Pull the text completion out of a Responses API reply.
fn output_text(body: &Json) -> Option<String> {
    if let Some(text) = body.get("output_text").and_then(Json::as_str) {
        return Some(text.to_string());
    }
    for item in body.get("output")?.as_array()? {
        let Some(contents) = item.get("content").and_then(Json::as_array) else {
            continue;
        };
        for content in contents {
            if content.get("type").and_then(Json::as_str) == Some("output_text")
                && let Some(text) = content.get("text").and_then(Json::as_str)
            {
                return Some(text.to_string());
            }
        }
    }
    None
}

#[async_trait]
impl CommandBackend for OpenAiBackend {
    fn name(&self) -> &'static str {
        "openai-api"
    }

    async fn generate(&self, request: &GenerateRequest) -> Result<BackendReply, BackendError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or(BackendError::MissingCredentials)?;

        let url = format!("{}/responses", self.base_url);
        debug!(%url, model = %self.model, "requesting completion");
        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&self.build_request_body(request))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(BackendError::Http {
                status: status.as_u16(),
                message,
            });
        }

        let body: Json = response.json().await?;
        let text = output_text(&body).ok_or(BackendError::Empty)?;
        let extraction = extract_commands(&text)?;
        let confidence = extraction.confidence();
        Ok(BackendReply {
            commands: extraction.commands,
            model: self.model.clone(),
            confidence,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use riff_protocol::{Intent, SessionSnapshot};

    fn backend() -> OpenAiBackend {
        OpenAiBackend::new(
            Some("sk-test".into()),
            "gpt-4.1-mini".into(),
            "https://api.openai.com/v1/".into(),
        )
    }

    #[test]
    fn request_body_carries_prompt_and_state() {
        let request = GenerateRequest {
            prompt: "set bpm to 140".into(),
            intent: Intent::Edit,
            snapshot: SessionSnapshot::default(),
            failure: None,
        };
        let body = backend().build_request_body(&request);
        assert_eq!(body["model"], "gpt-4.1-mini");
        assert_eq!(body["input"][0]["role"], "system");
        let user: Json =
            serde_json::from_str(body["input"][1]["content"].as_str().unwrap()).unwrap();
        assert_eq!(user["request"], "set bpm to 140");
        assert_eq!(user["intent"], "edit");
        assert!(user.get("violations").is_none());
    }

    #[test]
    fn trailing_slash_in_base_url_is_trimmed() {
        assert_eq!(backend().base_url, "https://api.openai.com/v1");
    }

    #[test]
    fn output_text_handles_both_reply_shapes() {
        let nested = serde_json::json!({
            "output": [{
                "content": [{ "type": "output_text", "text": "[{\"op\": \"clock_clear\"}]" }]
            }]
        });
        assert_eq!(
            output_text(&nested).unwrap(),
            "[{\"op\": \"clock_clear\"}]"
        );

        let flat = serde_json::json!({ "output_text": "[]" });
        assert_eq!(output_text(&flat).unwrap(), "[]");

        assert!(output_text(&serde_json::json!({})).is_none());
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_network_io() {
        let backend = OpenAiBackend::new(None, "gpt-4.1-mini".into(), "http://127.0.0.1:1".into());
        let request = GenerateRequest {
            prompt: "anything".into(),
            intent: Intent::Edit,
            snapshot: SessionSnapshot::default(),
            failure: None,
        };
        assert!(matches!(
            backend.generate(&request).await,
            Err(BackendError::MissingCredentials)
        ));
    }
}
