//! Chat-completion client for OpenAI-compatible APIs.
//!
//! Calls `POST {base_url}/chat/completions`. The base and enhanced profiles
//! map to `model.base_model` and `model.enhanced_model`. The API key is read
//! from the environment variable named by `model.api_key_env` on each call,
//! so commands that never reach the model work without one.
//!
//! No retries happen here: the reasoning pipeline owns timeouts and the
//! single base-profile fallback.

use async_trait::async_trait;

use crate::config::ModelConfig;
use crate::error::ModelCallError;
use crate::reasoning::{CompletionRequest, LanguageModel, ModelProfile};

pub struct ChatModel {
    base_url: String,
    api_key_env: String,
    base_model: String,
    enhanced_model: String,
    client: reqwest::Client,
}

impl ChatModel {
    pub fn new(config: &ModelConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
            base_model: config.base_model.clone(),
            enhanced_model: config.enhanced_model.clone(),
            client,
        })
    }

    pub fn model_for(&self, profile: ModelProfile) -> &str {
        match profile {
            ModelProfile::Base => &self.base_model,
            ModelProfile::Enhanced => &self.enhanced_model,
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.model_for(request.profile),
            "messages": [
                { "role": "system", "content": request.system },
                { "role": "user", "content": request.prompt },
            ],
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });
        if let Some(top_p) = request.params.top_p {
            body["top_p"] = serde_json::json!(top_p);
        }
        body
    }
}

#[async_trait]
impl LanguageModel for ChatModel {
    async fn complete(&self, request: &CompletionRequest) -> Result<String, ModelCallError> {
        let api_key = std::env::var(&self.api_key_env).map_err(|_| {
            ModelCallError::Unconfigured(format!(
                "{} environment variable not set",
                self.api_key_env
            ))
        })?;

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| ModelCallError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelCallError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelCallError::InvalidResponse(e.to_string()))?;
        parse_chat_response(&json)
    }
}

/// Extract `choices[0].message.content`.
fn parse_chat_response(json: &serde_json::Value) -> Result<String, ModelCallError> {
    json.get("choices")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| {
            ModelCallError::InvalidResponse("missing choices[0].message.content".to_string())
        })
}
