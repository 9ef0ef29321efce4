//! Conversation sessions, targets, and per-target continuation state.
//!
//! A session is a plain value: invocations receive owned snapshots and hand
//! back an updated copy in their terminal stream update, so concurrent
//! targets can never race on shared mutable state.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{model_name_to_api_mode, ApiMode};
use crate::fanout::FanoutMode;

/// The fixed, closed list of provider continuation-state keys.
///
/// These are copied verbatim between a session and its per-target state
/// fragments, never interpreted. Extending the list is enough to support a
/// new provider's continuation data; no orchestrator change is needed.
pub const PROVIDER_STATE_KEYS: &[&str] = &[
    "conversationId",
    "messageId",
    "parentMessageId",
    "wsRequestId",
    "claudeConversation",
];

/// Opaque bag of provider continuation fields, keyed by
/// [`PROVIDER_STATE_KEYS`] entries.
pub type StateFragment = serde_json::Map<String, Value>;

/// One backend selected to receive a question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    /// Stable id, derived from the model name; unique within a session.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_mode: Option<ApiMode>,
    pub model_name: String,
    /// Display grouping only; not used for dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

impl Target {
    pub fn from_model_name(model_name: &str) -> Self {
        let api_mode = model_name_to_api_mode(model_name);
        Self {
            id: model_name.to_string(),
            provider: Some(api_mode.group.to_string()),
            api_mode: Some(api_mode),
            model_name: model_name.to_string(),
        }
    }
}

/// Provenance of a conversation record or answer buffer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_from_target_ids: Option<Vec<String>>,
}

/// One question/answer pair in the conversation history.
///
/// `question: None` marks a fanout-result record appended for a single
/// target; the paired question lives in the run's primary record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    pub question: Option<String>,
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<RecordMeta>,
    #[serde(default)]
    pub timestamp: i64,
}

impl ConversationRecord {
    pub fn new(question: Option<String>, answer: String, meta: Option<RecordMeta>) -> Self {
        Self {
            question,
            answer,
            meta,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Message in provider wire format, built from conversation records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// The unit of conversation: history, selected targets, and per-target
/// provider continuation state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(default)]
    pub conversation_records: Vec<ConversationRecord>,
    /// Empty means "use the default single active model".
    #[serde(default)]
    pub targets: Vec<Target>,
    #[serde(default)]
    pub target_states: HashMap<String, StateFragment>,
    /// Consumed once per invocation.
    #[serde(default)]
    pub is_retry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_id: Option<String>,
    #[serde(default)]
    pub fanout: FanoutMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_mode: Option<ApiMode>,
    /// The session's own continuation fields, flattened onto the wire shape
    /// so invokers read and write them as top-level keys.
    #[serde(flatten)]
    pub provider_state: StateFragment,
}

impl Session {
    pub fn new(model_name: &str) -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            question: None,
            conversation_records: Vec::new(),
            targets: Vec::new(),
            target_states: HashMap::new(),
            is_retry: false,
            last_run_id: None,
            fanout: FanoutMode::default(),
            model_name: Some(model_name.to_string()),
            api_mode: None,
            provider_state: StateFragment::new(),
        }
    }

    /// Snapshot for one fanout target: target overrides applied, retry flag
    /// cleared, and the target's stored continuation state hydrated onto
    /// the copy. Sibling targets' state is untouched.
    pub fn derive_for_target(
        &self,
        target_id: &str,
        api_mode: Option<&ApiMode>,
        model_name: Option<&str>,
    ) -> Session {
        let mut derived = self.clone();
        if let Some(api_mode) = api_mode {
            derived.api_mode = Some(api_mode.clone());
        }
        if let Some(model_name) = model_name {
            derived.model_name = Some(model_name.to_string());
        }
        derived.is_retry = false;
        if let Some(state) = self.target_states.get(target_id) {
            for key in PROVIDER_STATE_KEYS {
                if let Some(value) = state.get(*key) {
                    derived.provider_state.insert((*key).to_string(), value.clone());
                }
            }
        }
        derived
    }

    /// The continuation fields currently set on this session, restricted to
    /// the enumerated key list.
    pub fn extract_provider_state(&self) -> StateFragment {
        let mut fragment = StateFragment::new();
        for key in PROVIDER_STATE_KEYS {
            if let Some(value) = self.provider_state.get(*key) {
                fragment.insert((*key).to_string(), value.clone());
            }
        }
        fragment
    }

    /// Merge a fragment into one target's stored state. Last write wins per
    /// key within the target's fragment; other targets are never touched.
    pub fn merge_target_state(&mut self, target_id: &str, fragment: StateFragment) {
        if fragment.is_empty() {
            return;
        }
        let state = self.target_states.entry(target_id.to_string()).or_default();
        for (key, value) in fragment {
            state.insert(key, value);
        }
    }

    /// Append a completed question/answer pair to the history.
    pub fn push_record(&mut self, question: &str, answer: &str) {
        self.conversation_records.push(ConversationRecord::new(
            Some(question.to_string()),
            answer.to_string(),
            None,
        ));
    }

    /// Clear the conversation: records, per-target state, and run
    /// bookkeeping reset together.
    pub fn clear(&mut self) {
        self.question = None;
        self.conversation_records.clear();
        self.target_states.clear();
        self.provider_state.clear();
        self.is_retry = false;
        self.last_run_id = None;
    }
}

/// History as alternating user/assistant messages for chat-style APIs.
pub fn conversation_pairs(records: &[ConversationRecord]) -> Vec<ChatMessage> {
    let mut pairs = Vec::new();
    for record in records {
        if let Some(question) = &record.question {
            pairs.push(ChatMessage {
                role: "user".to_string(),
                content: question.clone(),
            });
        }
        if !record.answer.is_empty() {
            pairs.push(ChatMessage {
                role: "assistant".to_string(),
                content: record.answer.clone(),
            });
        }
    }
    pairs
}

/// History as a plain-text transcript for completion-style APIs.
pub fn conversation_transcript(records: &[ConversationRecord]) -> String {
    let mut transcript = String::new();
    for record in records {
        if let Some(question) = &record.question {
            transcript.push_str("Human: ");
            transcript.push_str(question);
            transcript.push('\n');
        }
        transcript.push_str("AI: ");
        transcript.push_str(&record.answer);
        transcript.push('\n');
    }
    transcript
}
