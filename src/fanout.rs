//! Fanout orchestration: one question, many targets, one tagged stream.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backends::InvokerRegistry;
use crate::channel::{Channel, ChannelEvent, ChildChannel, RunEnd, RunStart};
use crate::config::{ApiMode, UserConfig};
use crate::error::InvokeError;
use crate::session::Session;

/// How a run walks its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanoutMode {
    #[default]
    Parallel,
    Sequential,
}

/// One target as named in a fanout request. `api_mode`/`model_name` are
/// overrides applied to the derived session; absent means "as the base
/// session has it".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_mode: Option<ApiMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
}

/// A fanout dispatch as posted by the consumer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fanout_mode: Option<FanoutMode>,
    #[serde(default)]
    pub targets: Vec<TargetSpec>,
}

/// One fanout execution. Ephemeral: its only durable trace is the run id
/// stamped onto resulting records and the updated target states.
#[derive(Debug, Clone)]
pub struct Run {
    pub run_id: String,
    pub mode: FanoutMode,
    pub target_ids: Vec<String>,
}

/// Execute a fanout run against the base session.
///
/// Emits `FANOUT_START` before any target begins and `FANOUT_DONE` after
/// every target reached a terminal event. One target's failure never aborts
/// its siblings: invoker errors are converted into terminal error updates
/// on that target's child channel. Lifecycle markers are sent best-effort;
/// a consumer that disconnected mid-run simply misses them.
pub async fn run_fanout(
    base: &Session,
    channel: Arc<dyn Channel>,
    registry: &InvokerRegistry,
    config: &UserConfig,
    request: FanoutRequest,
) -> Run {
    let run = Run {
        run_id: request
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        mode: request.fanout_mode.unwrap_or_default(),
        target_ids: request.targets.iter().map(|t| t.id.clone()).collect(),
    };
    log::info!(
        "fanout run {} starting: mode={:?} targets={:?}",
        run.run_id,
        run.mode,
        run.target_ids
    );

    let _ = channel.send(ChannelEvent::FanoutStart {
        fanout: RunStart {
            run_id: run.run_id.clone(),
            target_ids: run.target_ids.clone(),
        },
    });

    match run.mode {
        FanoutMode::Sequential => {
            for target in &request.targets {
                run_single(base, &channel, registry, config, &run.run_id, target).await;
            }
        }
        FanoutMode::Parallel => {
            join_all(
                request
                    .targets
                    .iter()
                    .map(|target| run_single(base, &channel, registry, config, &run.run_id, target)),
            )
            .await;
        }
    }

    let _ = channel.send(ChannelEvent::FanoutDone {
        fanout: RunEnd {
            run_id: run.run_id.clone(),
        },
    });
    log::info!("fanout run {} done", run.run_id);
    run
}

/// Run one target to its terminal event. Never fails: errors become a
/// terminal update on the target's child channel.
async fn run_single(
    base: &Session,
    channel: &Arc<dyn Channel>,
    registry: &InvokerRegistry,
    config: &UserConfig,
    run_id: &str,
    target: &TargetSpec,
) {
    let child: Arc<dyn Channel> =
        Arc::new(ChildChannel::new(channel.clone(), run_id, &target.id));
    let derived = base.derive_for_target(
        &target.id,
        target.api_mode.as_ref(),
        target.model_name.as_deref(),
    );
    let question = derived.question.clone().unwrap_or_default();

    let invoker = match registry.resolve(&derived, config) {
        Some(invoker) => invoker,
        None => {
            let model = derived
                .model_name
                .clone()
                .unwrap_or_else(|| target.id.clone());
            let _ = child.send(ChannelEvent::failure(
                InvokeError::UnsupportedModel(model).to_string(),
                derived,
            ));
            return;
        }
    };

    if let Err(err) = invoker
        .invoke(child.clone(), &question, derived.clone(), config)
        .await
    {
        log::error!("target {} failed: {}", target.id, err);
        let _ = child.send(ChannelEvent::failure(err.to_string(), derived));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::{Invoker, ProviderKind};
    use crate::error::ChannelClosed;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Collector(Mutex<Vec<ChannelEvent>>);

    impl Collector {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Vec::new())))
        }

        fn events(&self) -> Vec<ChannelEvent> {
            self.0.lock().unwrap().clone()
        }
    }

    impl Channel for Collector {
        fn send(&self, event: ChannelEvent) -> Result<(), ChannelClosed> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Emits one answer then one done update, optionally after a pause so
    /// parallel interleaving is observable.
    struct ScriptedInvoker {
        answer: String,
        delay: Duration,
        fail: bool,
    }

    impl ScriptedInvoker {
        fn ok(answer: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.to_string(),
                delay: Duration::ZERO,
                fail: false,
            })
        }

        fn slow(answer: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                answer: answer.to_string(),
                delay,
                fail: false,
            })
        }

        fn failing(message: &str) -> Arc<Self> {
            Arc::new(Self {
                answer: message.to_string(),
                delay: Duration::ZERO,
                fail: true,
            })
        }
    }

    #[async_trait]
    impl Invoker for ScriptedInvoker {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Custom
        }

        fn matches(&self, _session: &Session, _config: &UserConfig) -> bool {
            true
        }

        async fn invoke(
            &self,
            channel: Arc<dyn Channel>,
            question: &str,
            mut session: Session,
            _config: &UserConfig,
        ) -> Result<(), InvokeError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(InvokeError::Api(self.answer.clone()));
            }
            channel.send(ChannelEvent::answer(self.answer.clone()))?;
            session.push_record(question, &self.answer);
            channel.send(ChannelEvent::terminal(self.answer.clone(), session))?;
            Ok(())
        }
    }

    fn registry_with(invoker: Arc<dyn Invoker>) -> InvokerRegistry {
        let mut registry = InvokerRegistry::new();
        registry.register(invoker);
        registry
    }

    fn request(targets: &[&str], mode: FanoutMode) -> FanoutRequest {
        FanoutRequest {
            run_id: Some("r-1".to_string()),
            fanout_mode: Some(mode),
            targets: targets
                .iter()
                .map(|id| TargetSpec {
                    id: id.to_string(),
                    api_mode: None,
                    model_name: Some(id.to_string()),
                })
                .collect(),
        }
    }

    fn base_session() -> Session {
        let mut session = Session::new("gpt-4o");
        session.question = Some("Hi".to_string());
        session
    }

    fn tag_of(event: &ChannelEvent) -> Option<(String, String)> {
        match event {
            ChannelEvent::Update {
                fanout: Some(tag), ..
            } => Some((tag.run_id.clone(), tag.target_id.clone())),
            _ => None,
        }
    }

    #[tokio::test]
    async fn markers_bracket_all_tagged_events() {
        let collector = Collector::new();
        let registry = registry_with(ScriptedInvoker::ok("answer"));

        run_fanout(
            &base_session(),
            collector.clone(),
            &registry,
            &UserConfig::default(),
            request(&["m1", "m2"], FanoutMode::Parallel),
        )
        .await;

        let events = collector.events();
        assert!(matches!(events.first(), Some(ChannelEvent::FanoutStart { fanout })
            if fanout.target_ids == vec!["m1".to_string(), "m2".to_string()]));
        assert!(matches!(events.last(), Some(ChannelEvent::FanoutDone { fanout })
            if fanout.run_id == "r-1"));
        // every in-between event is tagged with the run
        for event in &events[1..events.len() - 1] {
            let (run_id, _) = tag_of(event).expect("tagged update");
            assert_eq!(run_id, "r-1");
        }
    }

    #[tokio::test]
    async fn sequential_mode_finishes_a_target_before_starting_the_next() {
        let collector = Collector::new();
        let registry = registry_with(ScriptedInvoker::slow(
            "answer",
            Duration::from_millis(10),
        ));

        run_fanout(
            &base_session(),
            collector.clone(),
            &registry,
            &UserConfig::default(),
            request(&["a", "b"], FanoutMode::Sequential),
        )
        .await;

        let tags: Vec<_> = collector.events().iter().filter_map(tag_of).collect();
        let first_b = tags.iter().position(|(_, t)| t == "b").unwrap();
        let last_a = tags.iter().rposition(|(_, t)| t == "a").unwrap();
        assert!(
            last_a < first_b,
            "target a must be terminal before b starts: {:?}",
            tags
        );
    }

    #[tokio::test]
    async fn one_failing_target_does_not_abort_its_sibling() {
        let collector = Collector::new();
        let mut registry = InvokerRegistry::new();
        // m-bad matches first but only for its own derived session
        struct PickyFailing;
        #[async_trait]
        impl Invoker for PickyFailing {
            fn kind(&self) -> ProviderKind {
                ProviderKind::ClaudeApi
            }
            fn matches(&self, session: &Session, _config: &UserConfig) -> bool {
                session.model_name.as_deref() == Some("claude")
            }
            async fn invoke(
                &self,
                _channel: Arc<dyn Channel>,
                _question: &str,
                _session: Session,
                _config: &UserConfig,
            ) -> Result<(), InvokeError> {
                Err(InvokeError::Api("network down".to_string()))
            }
        }
        registry.register(Arc::new(PickyFailing));
        registry.register(ScriptedInvoker::ok("gpt answer"));

        run_fanout(
            &base_session(),
            collector.clone(),
            &registry,
            &UserConfig::default(),
            request(&["gpt4", "claude"], FanoutMode::Parallel),
        )
        .await;

        let events = collector.events();
        let claude_error = events.iter().any(|e| matches!(e,
            ChannelEvent::Update { update, fanout: Some(tag) }
                if tag.target_id == "claude"
                    && update.done
                    && update.error.as_deref() == Some("network down")));
        let gpt_done = events.iter().any(|e| matches!(e,
            ChannelEvent::Update { update, fanout: Some(tag) }
                if tag.target_id == "gpt4"
                    && update.done
                    && update.answer.as_deref() == Some("gpt answer")));
        assert!(claude_error, "claude must surface its error: {:?}", events);
        assert!(gpt_done, "gpt4 must still complete: {:?}", events);
        assert!(matches!(events.last(), Some(ChannelEvent::FanoutDone { .. })));
    }

    #[tokio::test]
    async fn dispatch_miss_surfaces_unsupported_model_error() {
        let collector = Collector::new();
        let registry = InvokerRegistry::new();

        run_fanout(
            &base_session(),
            collector.clone(),
            &registry,
            &UserConfig::default(),
            request(&["mystery"], FanoutMode::Parallel),
        )
        .await;

        let events = collector.events();
        let miss = events.iter().any(|e| matches!(e,
            ChannelEvent::Update { update, fanout: Some(tag) }
                if tag.target_id == "mystery"
                    && update.done
                    && update.error.as_deref().is_some_and(|m| m.contains("mystery"))));
        assert!(miss, "expected unsupported-model error: {:?}", events);
    }

    #[tokio::test]
    async fn hydration_flows_stored_target_state_into_the_invocation() {
        struct StateEcho;
        #[async_trait]
        impl Invoker for StateEcho {
            fn kind(&self) -> ProviderKind {
                ProviderKind::Custom
            }
            fn matches(&self, _session: &Session, _config: &UserConfig) -> bool {
                true
            }
            async fn invoke(
                &self,
                channel: Arc<dyn Channel>,
                _question: &str,
                session: Session,
                _config: &UserConfig,
            ) -> Result<(), InvokeError> {
                let conversation = session
                    .provider_state
                    .get("conversationId")
                    .and_then(|v| v.as_str())
                    .unwrap_or("none")
                    .to_string();
                channel.send(ChannelEvent::terminal(conversation, session))?;
                Ok(())
            }
        }

        let collector = Collector::new();
        let registry = registry_with(Arc::new(StateEcho));
        let mut session = base_session();
        session.merge_target_state(
            "m1",
            [(
                "conversationId".to_string(),
                serde_json::Value::String("c-42".to_string()),
            )]
            .into_iter()
            .collect(),
        );

        run_fanout(
            &session,
            collector.clone(),
            &registry,
            &UserConfig::default(),
            request(&["m1", "m2"], FanoutMode::Sequential),
        )
        .await;

        let answers: Vec<_> = collector
            .events()
            .iter()
            .filter_map(|e| match e {
                ChannelEvent::Update {
                    update,
                    fanout: Some(tag),
                } if update.done => {
                    Some((tag.target_id.clone(), update.answer.clone().unwrap()))
                }
                _ => None,
            })
            .collect();
        assert_eq!(
            answers,
            vec![
                ("m1".to_string(), "c-42".to_string()),
                ("m2".to_string(), "none".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn empty_target_list_is_a_marker_only_run() {
        let collector = Collector::new();
        let registry = InvokerRegistry::new();

        run_fanout(
            &base_session(),
            collector.clone(),
            &registry,
            &UserConfig::default(),
            FanoutRequest::default(),
        )
        .await;

        let events = collector.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChannelEvent::FanoutStart { .. }));
        assert!(matches!(events[1], ChannelEvent::FanoutDone { .. }));
    }

    #[tokio::test]
    async fn generated_run_id_is_used_when_none_supplied() {
        let collector = Collector::new();
        let registry = InvokerRegistry::new();

        let run = run_fanout(
            &base_session(),
            collector.clone(),
            &registry,
            &UserConfig::default(),
            FanoutRequest::default(),
        )
        .await;

        assert!(!run.run_id.is_empty());
        match &collector.events()[0] {
            ChannelEvent::FanoutStart { fanout } => assert_eq!(fanout.run_id, run.run_id),
            other => panic!("expected start marker, got {:?}", other),
        }
    }
}
