//! Multi-backend abstraction layer for AI chat providers.
//!
//! Every provider implements one shared [`Invoker`] interface; the
//! [`InvokerRegistry`] replaces per-provider branching with an ordered
//! lookup, so dispatch is testable per provider in isolation.

pub(crate) mod sse;

pub mod claude_api;
pub mod claude_web;
pub mod custom;
pub mod openai_api;

use std::sync::Arc;

use async_trait::async_trait;

use crate::channel::Channel;
use crate::config::UserConfig;
use crate::error::InvokeError;
use crate::session::Session;

/// Identifies the kind of backend provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    Custom,
    ClaudeWeb,
    OpenAiApi,
    ClaudeApi,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProviderKind::Custom => "custom",
            ProviderKind::ClaudeWeb => "claude-web",
            ProviderKind::OpenAiApi => "openai-api",
            ProviderKind::ClaudeApi => "claude-api",
        };
        write!(f, "{}", name)
    }
}

/// One pluggable backend.
///
/// An invocation emits zero or more progress updates and exactly one
/// terminal update (`done` or `error`) on the given channel, and may return
/// provider continuation state by including its session snapshot in the
/// terminal update. Credentials are read lazily inside `invoke`, never
/// during matching, so unmatched providers cost nothing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Invoker: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// True when this invoker should handle the session's selected model.
    fn matches(&self, session: &Session, config: &UserConfig) -> bool;

    async fn invoke(
        &self,
        channel: Arc<dyn Channel>,
        question: &str,
        session: Session,
        config: &UserConfig,
    ) -> Result<(), InvokeError>;
}

/// Registry of invokers in fixed priority order: custom API override first,
/// then web-session backends, then key-based API backends.
pub struct InvokerRegistry {
    invokers: Vec<Arc<dyn Invoker>>,
}

impl InvokerRegistry {
    pub fn new() -> Self {
        Self {
            invokers: Vec::new(),
        }
    }

    /// Registry with the built-in providers in their priority order.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(custom::CustomInvoker::new()));
        registry.register(Arc::new(claude_web::ClaudeWebInvoker::new()));
        registry.register(Arc::new(openai_api::OpenAiApiInvoker::new()));
        registry.register(Arc::new(claude_api::ClaudeApiInvoker::new()));
        registry
    }

    /// Append an invoker at the end of the priority order.
    pub fn register(&mut self, invoker: Arc<dyn Invoker>) {
        self.invokers.push(invoker);
    }

    /// First invoker whose predicate matches the session, if any.
    pub fn resolve(&self, session: &Session, config: &UserConfig) -> Option<Arc<dyn Invoker>> {
        self.invokers
            .iter()
            .find(|invoker| invoker.matches(session, config))
            .cloned()
    }

    pub fn kinds(&self) -> Vec<ProviderKind> {
        self.invokers.iter().map(|invoker| invoker.kind()).collect()
    }
}

impl Default for InvokerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
