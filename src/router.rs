//! Port serve loop: the background side of the duplex protocol.
//!
//! One router serves one connected port, reading inbound requests and
//! driving dispatch. Single-target turns run in a tracked task slot so a
//! `stop` request can abort them; fanout runs are fire-and-forget (true
//! abort is only supported for the legacy single-target flow).

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::backends::InvokerRegistry;
use crate::channel::{Channel, ChannelEvent, PortRequest};
use crate::config::SharedConfig;
use crate::error::InvokeError;
use crate::fanout::run_fanout;
use crate::session::Session;

type TaskSlot = Arc<Mutex<Option<JoinHandle<()>>>>;

/// Cancel and await the task stored in the slot, if any.
async fn abort_task_slot(slot: &TaskSlot) {
    let handle = {
        let mut guard = slot.lock().await;
        guard.take()
    };
    if let Some(handle) = handle {
        handle.abort();
        let _ = handle.await;
    }
}

pub struct Router {
    registry: Arc<InvokerRegistry>,
    config: SharedConfig,
}

impl Router {
    pub fn new(registry: Arc<InvokerRegistry>, config: SharedConfig) -> Self {
        Self { registry, config }
    }

    /// Serve one port until the consumer closes its inbound side.
    pub async fn serve(
        self: Arc<Self>,
        mut inbound: UnboundedReceiver<PortRequest>,
        channel: Arc<dyn Channel>,
    ) {
        let slot: TaskSlot = Arc::new(Mutex::new(None));

        while let Some(request) = inbound.recv().await {
            match request {
                PortRequest::Ask { session } => {
                    // one legacy call in flight per port
                    abort_task_slot(&slot).await;
                    let router = self.clone();
                    let channel = channel.clone();
                    let handle = tokio::spawn(async move {
                        router.dispatch_single(session, channel).await;
                    });
                    *slot.lock().await = Some(handle);
                }
                PortRequest::Stop { .. } => {
                    abort_task_slot(&slot).await;
                }
                PortRequest::Fanout { fanout, session } => {
                    let router = self.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        let config = router.config.read().clone();
                        run_fanout(&session, channel, &router.registry, &config, fanout).await;
                    });
                }
            }
        }
        abort_task_slot(&slot).await;
    }

    /// Resolve and run one single-target invocation, converting every
    /// failure into a terminal error update.
    async fn dispatch_single(&self, session: Session, channel: Arc<dyn Channel>) {
        let config = self.config.read().clone();
        let question = session.question.clone().unwrap_or_default();
        log::debug!(
            "dispatch: model={:?} apiMode={:?}",
            session.model_name,
            session.api_mode
        );

        let invoker = match self.registry.resolve(&session, &config) {
            Some(invoker) => invoker,
            None => {
                let model = session
                    .model_name
                    .clone()
                    .unwrap_or_else(|| config.model_name.clone());
                let _ = channel.send(ChannelEvent::failure(
                    InvokeError::UnsupportedModel(model).to_string(),
                    session,
                ));
                return;
            }
        };

        if let Err(err) = invoker
            .invoke(channel.clone(), &question, session.clone(), &config)
            .await
        {
            log::error!("invocation failed: {}", err);
            let _ = channel.send(ChannelEvent::failure(err.to_string(), session));
        }
    }
}
