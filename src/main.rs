//! JSONL-over-stdio binding of the relay protocol.
//!
//! Reads one inbound request per stdin line, writes one outbound event per
//! stdout line. Embedders that want a different transport use the library
//! directly.

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use polychat::channel::{ChannelEvent, PortRequest};
use polychat::config::shared_config;
use polychat::router::Router;
use polychat::storage;
use polychat::InvokerRegistry;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match storage::load_user_config() {
        Ok(config) => config,
        Err(err) => {
            log::warn!("could not load config, using defaults: {}", err);
            Default::default()
        }
    };
    let router = Arc::new(Router::new(
        Arc::new(InvokerRegistry::with_defaults()),
        shared_config(config),
    ));

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ChannelEvent>();
    let (request_tx, request_rx) = mpsc::unbounded_channel::<PortRequest>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(event) = event_rx.recv().await {
            let line = match serde_json::to_string(&event) {
                Ok(line) => line,
                Err(err) => {
                    log::error!("unserializable event: {}", err);
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if stdout.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let reader = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PortRequest>(&line) {
                Ok(request) => {
                    if request_tx.send(request).is_err() {
                        break;
                    }
                }
                Err(err) => log::warn!("ignoring malformed request: {}", err),
            }
        }
    });

    router.serve(request_rx, Arc::new(event_tx)).await;
    let _ = reader.await;
    let _ = writer.await;
}
