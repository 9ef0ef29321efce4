//! The duplex channel between the relay and one UI consumer.
//!
//! Outbound events are a typed tagged union so consumers can exhaustively
//! match instead of probing optional fields. Inbound requests mirror the
//! three messages a consumer may post: a single-target turn, a stop for the
//! legacy in-flight call, and a fanout run.

mod mux;

pub use mux::ChildChannel;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ChannelClosed;
use crate::fanout::FanoutRequest;
use crate::session::Session;

/// Outbound half of the duplex port.
///
/// `send` fails only when the consumer is gone; callers that must survive a
/// disconnected consumer (the fanout path) wrap this in a [`ChildChannel`],
/// which swallows the failure.
pub trait Channel: Send + Sync {
    fn send(&self, event: ChannelEvent) -> Result<(), ChannelClosed>;
}

impl Channel for mpsc::UnboundedSender<ChannelEvent> {
    fn send(&self, event: ChannelEvent) -> Result<(), ChannelClosed> {
        mpsc::UnboundedSender::send(self, event).map_err(|_| ChannelClosed)
    }
}

/// Identifies which (run, target) pair a stream update belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FanoutTag {
    pub run_id: String,
    pub target_id: String,
}

/// Announces a run before any of its targets begins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStart {
    pub run_id: String,
    pub target_ids: Vec<String>,
}

/// Marks a run finished: every target reached a terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEnd {
    pub run_id: String,
}

/// Incremental or terminal progress from one backend invocation.
///
/// Providers send full answer snapshots, not deltas. Exactly one update per
/// invocation carries `done: true`; a terminal update may also carry the
/// invoker's session snapshot so continuation state flows back.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<Box<Session>>,
}

/// Everything the relay sends toward the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelEvent {
    FanoutStart {
        fanout: RunStart,
    },
    Update {
        #[serde(flatten)]
        update: StreamUpdate,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fanout: Option<FanoutTag>,
    },
    FanoutDone {
        fanout: RunEnd,
    },
}

impl ChannelEvent {
    /// Untagged update for the legacy single-target flow.
    pub fn update(update: StreamUpdate) -> Self {
        ChannelEvent::Update {
            update,
            fanout: None,
        }
    }

    pub fn answer(answer: impl Into<String>) -> Self {
        ChannelEvent::update(StreamUpdate {
            answer: Some(answer.into()),
            ..Default::default()
        })
    }

    pub fn terminal(answer: impl Into<String>, session: Session) -> Self {
        ChannelEvent::update(StreamUpdate {
            answer: Some(answer.into()),
            done: true,
            session: Some(Box::new(session)),
            ..Default::default()
        })
    }

    pub fn failure(error: impl Into<String>, session: Session) -> Self {
        ChannelEvent::update(StreamUpdate {
            error: Some(error.into()),
            done: true,
            session: Some(Box::new(session)),
            ..Default::default()
        })
    }
}

/// Everything a consumer may post toward the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRequest {
    /// Start a fanout run against the listed targets.
    Fanout {
        fanout: FanoutRequest,
        session: Session,
    },
    /// Start or continue a single-target turn.
    Ask { session: Session },
    /// Cancel the legacy single-target in-flight call.
    Stop { stop: bool },
}
