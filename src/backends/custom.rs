//! Invoker for user-supplied OpenAI-compatible endpoints.
//!
//! Covers self-hosted and proxy deployments (Ollama, Azure-style gateways,
//! OpenRouter and similar): anything speaking the chat-completions SSE
//! protocol at a configurable URL.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::sse;
use super::{Invoker, ProviderKind};
use crate::channel::{Channel, ChannelEvent};
use crate::config::{is_using_custom_model, UserConfig};
use crate::error::InvokeError;
use crate::session::{conversation_pairs, ChatMessage, Session};

pub struct CustomInvoker {
    client: reqwest::Client,
}

impl CustomInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for CustomInvoker {
    fn default() -> Self {
        Self::new()
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

#[async_trait]
impl Invoker for CustomInvoker {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Custom
    }

    fn matches(&self, session: &Session, config: &UserConfig) -> bool {
        is_using_custom_model(session, config)
    }

    async fn invoke(
        &self,
        channel: Arc<dyn Channel>,
        question: &str,
        mut session: Session,
        config: &UserConfig,
    ) -> Result<(), InvokeError> {
        let api_mode = session.api_mode.clone();
        let api_mode = api_mode.as_ref();
        let url = api_mode
            .and_then(|m| m.custom_url.as_deref())
            .and_then(non_empty)
            .or_else(|| non_empty(&config.custom_model_api_url))
            .unwrap_or("http://localhost:8000/v1/chat/completions")
            .to_string();
        let api_key = api_mode
            .and_then(|m| m.api_key.as_deref())
            .and_then(non_empty)
            .or_else(|| non_empty(&config.custom_api_key))
            .map(str::to_string);
        let model = api_mode
            .and_then(|m| m.custom_name.as_deref())
            .and_then(non_empty)
            .or_else(|| non_empty(&config.custom_model_name))
            .unwrap_or_default()
            .to_string();

        let mut messages = conversation_pairs(&session.conversation_records);
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: question.to_string(),
        });

        log::debug!("custom endpoint call: url={} model={}", url, model);
        let mut request = self.client.post(&url).json(&json!({
            "model": model,
            "messages": messages,
            "stream": true,
        }));
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = sse::ensure_ok(request.send().await?).await?;

        let mut answer = String::new();
        sse::drive(response, |data| {
            if data == "[DONE]" {
                return Ok(false);
            }
            let value: Value = serde_json::from_str(data)?;
            if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
                answer.push_str(delta);
                channel.send(ChannelEvent::answer(answer.clone()))?;
            }
            Ok(true)
        })
        .await?;

        session.push_record(question, &answer);
        channel.send(ChannelEvent::terminal(answer, session))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model_name_to_api_mode;

    #[test]
    fn matches_only_custom_sessions() {
        let invoker = CustomInvoker::new();
        let config = UserConfig::default();

        let mut custom = Session::new("custom-llama3");
        custom.api_mode = Some(model_name_to_api_mode("custom-llama3"));
        assert!(invoker.matches(&custom, &config));

        let openai = Session::new("gpt-4o");
        assert!(!invoker.matches(&openai, &config));
    }
}
