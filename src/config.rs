//! User configuration and model/provider selection.
//!
//! Holds the credentials and defaults the dispatch tiers read, plus the
//! model-name conventions that map a selected model to a provider group.
//! Selection predicates mirror the dispatch priority: custom endpoint
//! override first, then web-session backends, then key-based API backends.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fanout::FanoutMode;
use crate::session::Session;

/// Display grouping of a backend provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProviderGroup {
    /// User-supplied OpenAI-compatible endpoint (covers Ollama, Azure-style
    /// deployments, OpenRouter and friends).
    Custom,
    /// Claude web session (cookie-based).
    ClaudeWeb,
    /// OpenAI chat completions with an API key.
    OpenAiApi,
    /// Anthropic Messages API with an API key.
    ClaudeApi,
}

impl std::fmt::Display for ProviderGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderGroup::Custom => "custom",
            ProviderGroup::ClaudeWeb => "claudeWeb",
            ProviderGroup::OpenAiApi => "openaiApi",
            ProviderGroup::ClaudeApi => "claudeApi",
        };
        write!(f, "{}", name)
    }
}

/// Structured provider configuration attached to a session or target.
///
/// Absent means "use the default provider for the session's model name".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiMode {
    pub group: ProviderGroup,
    /// Model identifier within the group.
    pub item_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_name: Option<String>,
}

/// Stable model name for an api mode; this doubles as the target id.
pub fn api_mode_to_model_name(api_mode: &ApiMode) -> String {
    match api_mode.group {
        ProviderGroup::Custom => {
            let name = api_mode
                .custom_name
                .as_deref()
                .filter(|n| !n.is_empty())
                .unwrap_or(api_mode.item_name.as_str());
            format!("custom-{}", name)
        }
        _ => api_mode.item_name.clone(),
    }
}

/// Inverse of [`api_mode_to_model_name`] for the built-in name conventions.
pub fn model_name_to_api_mode(model_name: &str) -> ApiMode {
    if let Some(rest) = model_name.strip_prefix("custom-") {
        return ApiMode {
            group: ProviderGroup::Custom,
            item_name: rest.to_string(),
            custom_url: None,
            api_key: None,
            custom_name: Some(rest.to_string()),
        };
    }
    let group = if model_name == "claude-web" {
        ProviderGroup::ClaudeWeb
    } else if model_name.starts_with("claude-") {
        ProviderGroup::ClaudeApi
    } else {
        ProviderGroup::OpenAiApi
    };
    ApiMode {
        group,
        item_name: model_name.to_string(),
        custom_url: None,
        api_key: None,
        custom_name: None,
    }
}

fn default_model_name() -> String {
    "gpt-4o-mini".to_string()
}

fn default_custom_url() -> String {
    "http://localhost:8000/v1/chat/completions".to_string()
}

/// User-facing configuration, persisted by the storage layer.
///
/// Every field defaults so partially-written config files keep loading
/// across versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    /// Default active model when a session selects no targets.
    #[serde(default = "default_model_name")]
    pub model_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_mode: Option<ApiMode>,
    /// OpenAI API key.
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub claude_api_key: String,
    /// Claude web session cookie value. Retrieval is the embedder's job.
    #[serde(default)]
    pub claude_session_key: String,
    #[serde(default = "default_custom_url")]
    pub custom_model_api_url: String,
    #[serde(default)]
    pub custom_api_key: String,
    #[serde(default)]
    pub custom_model_name: String,
    #[serde(default)]
    pub default_fanout: FanoutMode,
}

impl Default for UserConfig {
    fn default() -> Self {
        Self {
            model_name: default_model_name(),
            api_mode: None,
            api_key: String::new(),
            claude_api_key: String::new(),
            claude_session_key: String::new(),
            custom_model_api_url: default_custom_url(),
            custom_api_key: String::new(),
            custom_model_name: String::new(),
            default_fanout: FanoutMode::default(),
        }
    }
}

/// Config handle shared between the router and its dispatch tasks.
pub type SharedConfig = Arc<parking_lot::RwLock<UserConfig>>;

pub fn shared_config(config: UserConfig) -> SharedConfig {
    Arc::new(parking_lot::RwLock::new(config))
}

fn effective_group(session: &Session, config: &UserConfig) -> ProviderGroup {
    if let Some(api_mode) = &session.api_mode {
        return api_mode.group;
    }
    if let Some(model_name) = &session.model_name {
        return model_name_to_api_mode(model_name).group;
    }
    if let Some(api_mode) = &config.api_mode {
        return api_mode.group;
    }
    model_name_to_api_mode(&config.model_name).group
}

pub fn is_using_custom_model(session: &Session, config: &UserConfig) -> bool {
    effective_group(session, config) == ProviderGroup::Custom
}

pub fn is_using_claude_web_model(session: &Session, config: &UserConfig) -> bool {
    effective_group(session, config) == ProviderGroup::ClaudeWeb
}

pub fn is_using_openai_api_model(session: &Session, config: &UserConfig) -> bool {
    effective_group(session, config) == ProviderGroup::OpenAiApi
}

pub fn is_using_claude_api_model(session: &Session, config: &UserConfig) -> bool {
    effective_group(session, config) == ProviderGroup::ClaudeApi
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_model_names_round_trip() {
        let api_mode = model_name_to_api_mode("custom-llama3");
        assert_eq!(api_mode.group, ProviderGroup::Custom);
        assert_eq!(api_mode_to_model_name(&api_mode), "custom-llama3");
    }

    #[test]
    fn claude_web_is_distinct_from_claude_api() {
        assert_eq!(
            model_name_to_api_mode("claude-web").group,
            ProviderGroup::ClaudeWeb
        );
        assert_eq!(
            model_name_to_api_mode("claude-3-5-sonnet-latest").group,
            ProviderGroup::ClaudeApi
        );
    }

    #[test]
    fn unknown_names_fall_back_to_openai_api() {
        assert_eq!(
            model_name_to_api_mode("gpt-4o").group,
            ProviderGroup::OpenAiApi
        );
        assert_eq!(
            model_name_to_api_mode("o4-mini").group,
            ProviderGroup::OpenAiApi
        );
    }

    #[test]
    fn session_api_mode_wins_over_model_name() {
        let mut session = Session::new("gpt-4o");
        session.api_mode = Some(model_name_to_api_mode("custom-llama3"));
        let config = UserConfig::default();
        assert!(is_using_custom_model(&session, &config));
        assert!(!is_using_openai_api_model(&session, &config));
    }

    #[test]
    fn config_defaults_apply_when_session_is_bare() {
        let mut session = Session::new("gpt-4o");
        session.model_name = None;
        let config = UserConfig {
            model_name: "claude-web".to_string(),
            ..Default::default()
        };
        assert!(is_using_claude_web_model(&session, &config));
    }

    #[test]
    fn config_deserializes_from_empty_object() {
        let config: UserConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.model_name, "gpt-4o-mini");
        assert!(config.custom_model_api_url.contains("localhost"));
    }
}
