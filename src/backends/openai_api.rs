//! Invoker for the OpenAI chat completions API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::sse;
use super::{Invoker, ProviderKind};
use crate::channel::{Channel, ChannelEvent};
use crate::config::{is_using_openai_api_model, UserConfig};
use crate::error::InvokeError;
use crate::session::{conversation_pairs, ChatMessage, Session};

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

pub struct OpenAiApiInvoker {
    client: reqwest::Client,
}

impl OpenAiApiInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OpenAiApiInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for OpenAiApiInvoker {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAiApi
    }

    fn matches(&self, session: &Session, config: &UserConfig) -> bool {
        is_using_openai_api_model(session, config)
    }

    async fn invoke(
        &self,
        channel: Arc<dyn Channel>,
        question: &str,
        mut session: Session,
        config: &UserConfig,
    ) -> Result<(), InvokeError> {
        if config.api_key.trim().is_empty() {
            return Err(InvokeError::Unauthorized);
        }
        let model = session
            .model_name
            .clone()
            .unwrap_or_else(|| config.model_name.clone());

        let mut messages = conversation_pairs(&session.conversation_records);
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: question.to_string(),
        });

        log::debug!("openai api call: model={}", model);
        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(config.api_key.trim())
            .json(&json!({
                "model": model,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await?;
        let response = sse::ensure_ok(response).await?;

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

    #[test]
    fn matches_gpt_style_models() {
        let invoker = OpenAiApiInvoker::new();
        let config = UserConfig::default();

        assert!(invoker.matches(&Session::new("gpt-4o"), &config));
        assert!(!invoker.matches(&Session::new("claude-web"), &config));
        assert!(!invoker.matches(&Session::new("claude-3-5-sonnet-latest"), &config));
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized_before_any_request() {
        let invoker = OpenAiApiInvoker::new();
        let config = UserConfig::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let err = invoker
            .invoke(Arc::new(tx), "hi", Session::new("gpt-4o"), &config)
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::Unauthorized));
    }
}
