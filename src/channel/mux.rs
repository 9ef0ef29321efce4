//! Virtual child channels: one tagging wrapper per (run, target).

use std::sync::Arc;

use super::{Channel, ChannelEvent, FanoutTag};
use crate::error::ChannelClosed;

/// Tags every update with its (run, target) pair before forwarding to the
/// real channel.
///
/// Send failures are swallowed: a disconnected UI must not crash a backend
/// call already in flight. The wrapper exposes no inbound surface, so
/// invokers that need bidirectional signaling (true cancellation) cannot
/// get it through a fanout run; that is a documented limitation of the
/// fanout contract, not an accident.
pub struct ChildChannel {
    inner: Arc<dyn Channel>,
    tag: FanoutTag,
}

impl ChildChannel {
    pub fn new(inner: Arc<dyn Channel>, run_id: &str, target_id: &str) -> Self {
        Self {
            inner,
            tag: FanoutTag {
                run_id: run_id.to_string(),
                target_id: target_id.to_string(),
            },
        }
    }
}

impl Channel for ChildChannel {
    fn send(&self, event: ChannelEvent) -> Result<(), ChannelClosed> {
        let tagged = match event {
            ChannelEvent::Update { update, .. } => ChannelEvent::Update {
                update,
                fanout: Some(self.tag.clone()),
            },
            other => other,
        };
        if self.inner.send(tagged).is_err() {
            log::debug!(
                "dropping event for target {}: channel closed",
                self.tag.target_id
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamUpdate;
    use std::sync::Mutex;

    struct Collector(Mutex<Vec<ChannelEvent>>);

    impl Channel for Collector {
        fn send(&self, event: ChannelEvent) -> Result<(), ChannelClosed> {
            self.0.lock().unwrap().push(event);
            Ok(())
        }
    }

    struct Disconnected;

    impl Channel for Disconnected {
        fn send(&self, _event: ChannelEvent) -> Result<(), ChannelClosed> {
            Err(ChannelClosed)
        }
    }

    #[test]
    fn updates_are_tagged_with_run_and_target() {
        let real = Arc::new(Collector(Mutex::new(Vec::new())));
        let child = ChildChannel::new(real.clone(), "r-1", "m1");

        child.send(ChannelEvent::answer("partial")).unwrap();

        let events = real.0.lock().unwrap();
        match &events[0] {
            ChannelEvent::Update { fanout, update } => {
                let tag = fanout.as_ref().unwrap();
                assert_eq!(tag.run_id, "r-1");
                assert_eq!(tag.target_id, "m1");
                assert_eq!(update.answer.as_deref(), Some("partial"));
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn existing_tags_are_replaced_not_nested() {
        let real = Arc::new(Collector(Mutex::new(Vec::new())));
        let child = ChildChannel::new(real.clone(), "r-2", "m2");

        child
            .send(ChannelEvent::Update {
                update: StreamUpdate::default(),
                fanout: Some(FanoutTag {
                    run_id: "stale".to_string(),
                    target_id: "stale".to_string(),
                }),
            })
            .unwrap();

        let events = real.0.lock().unwrap();
        match &events[0] {
            ChannelEvent::Update { fanout, .. } => {
                assert_eq!(fanout.as_ref().unwrap().run_id, "r-2");
            }
            other => panic!("expected update, got {:?}", other),
        }
    }

    #[test]
    fn send_failures_are_swallowed() {
        let child = ChildChannel::new(Arc::new(Disconnected), "r-1", "m1");
        assert!(child.send(ChannelEvent::answer("lost")).is_ok());
    }
}
