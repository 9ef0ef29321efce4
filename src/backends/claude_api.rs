//! Invoker for the Anthropic Messages API.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::sse;
use super::{Invoker, ProviderKind};
use crate::channel::{Channel, ChannelEvent};
use crate::config::{is_using_claude_api_model, UserConfig};
use crate::error::InvokeError;
use crate::session::{conversation_pairs, ChatMessage, Session};

const MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct ClaudeApiInvoker {
    client: reqwest::Client,
}

impl ClaudeApiInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ClaudeApiInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for ClaudeApiInvoker {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ClaudeApi
    }

    fn matches(&self, session: &Session, config: &UserConfig) -> bool {
        is_using_claude_api_model(session, config)
    }

    async fn invoke(
        &self,
        channel: Arc<dyn Channel>,
        question: &str,
        mut session: Session,
        config: &UserConfig,
    ) -> Result<(), InvokeError> {
        if config.claude_api_key.trim().is_empty() {
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

        log::debug!("claude api call: model={}", model);
        let response = self
            .client
            .post(MESSAGES_URL)
            .header("x-api-key", config.claude_api_key.trim())
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&json!({
                "model": model,
                "max_tokens": MAX_TOKENS,
                "messages": messages,
                "stream": true,
            }))
            .send()
            .await?;
        let response = sse::ensure_ok(response).await?;

        let mut answer = String::new();
        sse::drive(response, |data| {
            let value: Value = serde_json::from_str(data)?;
            match value["type"].as_str() {
                Some("content_block_delta") => {
                    if let Some(text) = value["delta"]["text"].as_str() {
                        answer.push_str(text);
                        channel.send(ChannelEvent::answer(answer.clone()))?;
                    }
                    Ok(true)
                }
                Some("error") => {
                    let message = value["error"]["message"]
                        .as_str()
                        .unwrap_or("claude api stream error")
                        .to_string();
                    Err(InvokeError::Api(message))
                }
                Some("message_stop") => Ok(false),
                _ => Ok(true),
            }
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
    fn matches_claude_api_models_but_not_claude_web() {
        let invoker = ClaudeApiInvoker::new();
        let config = UserConfig::default();

        assert!(invoker.matches(&Session::new("claude-3-5-sonnet-latest"), &config));
        assert!(!invoker.matches(&Session::new("claude-web"), &config));
        assert!(!invoker.matches(&Session::new("gpt-4o"), &config));
    }

    #[tokio::test]
    async fn missing_api_key_is_unauthorized_before_any_request() {
        let invoker = ClaudeApiInvoker::new();
        let config = UserConfig::default();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();

        let err = invoker
            .invoke(
                Arc::new(tx),
                "hi",
                Session::new("claude-3-5-sonnet-latest"),
                &config,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, InvokeError::Unauthorized));
    }
}
