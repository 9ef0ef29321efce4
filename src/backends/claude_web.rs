//! Invoker for the Claude web session backend.
//!
//! Talks to claude.ai with a user session cookie. The conversation handle
//! is kept verbatim under the `claudeConversation` continuation key, so a
//! target can continue its own thread across turns without the orchestrator
//! ever looking inside it.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use super::sse;
use super::{Invoker, ProviderKind};
use crate::channel::{Channel, ChannelEvent};
use crate::config::{is_using_claude_web_model, UserConfig};
use crate::error::InvokeError;
use crate::session::Session;

const BASE_URL: &str = "https://claude.ai/api";
const CONVERSATION_KEY: &str = "claudeConversation";

pub struct ClaudeWebInvoker {
    client: reqwest::Client,
}

impl ClaudeWebInvoker {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn cookie(session_key: &str) -> String {
        format!("sessionKey={}", session_key)
    }

    /// Resolve or create the conversation handle for this session.
    async fn ensure_conversation(
        &self,
        session: &mut Session,
        session_key: &str,
    ) -> Result<(String, String), InvokeError> {
        if let Some(handle) = session.provider_state.get(CONVERSATION_KEY) {
            if let (Some(uuid), Some(org)) = (
                handle["uuid"].as_str(),
                handle["organizationId"].as_str(),
            ) {
                return Ok((org.to_string(), uuid.to_string()));
            }
        }

        let response = self
            .client
            .get(format!("{}/organizations", BASE_URL))
            .header(reqwest::header::COOKIE, Self::cookie(session_key))
            .send()
            .await?;
        let organizations: Value = sse::ensure_ok(response).await?.json().await?;
        let organization_id = organizations[0]["uuid"]
            .as_str()
            .ok_or_else(|| InvokeError::Api("no claude organization available".to_string()))?
            .to_string();

        let conversation_id = Uuid::new_v4().to_string();
        let response = self
            .client
            .post(format!(
                "{}/organizations/{}/chat_conversations",
                BASE_URL, organization_id
            ))
            .header(reqwest::header::COOKIE, Self::cookie(session_key))
            .json(&json!({"uuid": conversation_id, "name": ""}))
            .send()
            .await?;
        sse::ensure_ok(response).await?;

        session.provider_state.insert(
            CONVERSATION_KEY.to_string(),
            json!({"uuid": conversation_id, "organizationId": organization_id}),
        );
        Ok((organization_id, conversation_id))
    }
}

impl Default for ClaudeWebInvoker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Invoker for ClaudeWebInvoker {
    fn kind(&self) -> ProviderKind {
        ProviderKind::ClaudeWeb
    }

    fn matches(&self, session: &Session, config: &UserConfig) -> bool {
        is_using_claude_web_model(session, config)
    }

    async fn invoke(
        &self,
        channel: Arc<dyn Channel>,
        question: &str,
        mut session: Session,
        config: &UserConfig,
    ) -> Result<(), InvokeError> {
        let session_key = config.claude_session_key.trim();
        if session_key.is_empty() {
            return Err(InvokeError::Unauthorized);
        }

        let (organization_id, conversation_id) =
            self.ensure_conversation(&mut session, session_key).await?;
        log::debug!("claude web call: conversation={}", conversation_id);

        let response = self
            .client
            .post(format!(
                "{}/organizations/{}/chat_conversations/{}/completion",
                BASE_URL, organization_id, conversation_id
            ))
            .header(reqwest::header::COOKIE, Self::cookie(session_key))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&json!({
                "prompt": question,
                "timezone": "UTC",
            }))
            .send()
            .await?;
        let response = sse::ensure_ok(response).await?;

        // Completion events carry the full answer so far, not deltas.
        let mut answer = String::new();
        sse::drive(response, |data| {
            let value: Value = serde_json::from_str(data)?;
            if let Some(message) = value["error"]["message"].as_str() {
                return Err(InvokeError::Api(message.to_string()));
            }
            if let Some(completion) = value["completion"].as_str() {
                answer = completion.to_string();
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
