//! Bus subscriber — one long-lived consumer per process
//!
//! Subscribes to all six channels and hands every decoded event to the
//! WebSocket fan-out registry. Connection loss triggers exponential backoff
//! and resubscription; malformed payloads are logged and skipped so one bad
//! producer cannot stall the stream.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::events::{BusChannel, BusEvent};
use crate::ws::FanoutRegistry;

/// Cap for the reconnect backoff.
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Run the subscriber until cancellation. Returns only when `cancel` fires.
pub async fn run_subscriber(
    config: BusConfig,
    registry: Arc<FanoutRegistry>,
    cancel: CancellationToken,
) {
    let url = config.url();
    let mut attempt: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match consume_once(&url, &registry, &cancel).await {
            Ok(()) => break, // cancelled inside the stream loop
            Err(e) => {
                attempt = attempt.saturating_add(1);
                let backoff =
                    Duration::from_millis(500 * 2u64.pow(attempt.min(6))).min(MAX_BACKOFF);
                warn!(
                    error = %e,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "bus subscriber disconnected — reconnecting"
                );
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(backoff) => {}
                }
            }
        }
    }

    info!("bus subscriber stopped");
}

/// Subscribe and pump messages until the connection drops or `cancel` fires.
async fn consume_once(
    url: &str,
    registry: &FanoutRegistry,
    cancel: &CancellationToken,
) -> Result<(), redis::RedisError> {
    let client = redis::Client::open(url)?;
    let mut pubsub = client.get_async_pubsub().await?;

    for channel in BusChannel::all() {
        pubsub.subscribe(channel.as_str()).await?;
    }
    info!("bus subscriber connected to all channels");

    let mut stream = pubsub.on_message();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            msg = stream.next() => {
                let Some(msg) = msg else {
                    // stream closed — treat as a disconnect
                    return Err(redis::RedisError::from((
                        redis::ErrorKind::IoError,
                        "pubsub stream closed",
                    )));
                };
                dispatch(&msg, registry);
            }
        }
    }
}

/// Decode one raw message and forward it to every subscribing topic.
fn dispatch(msg: &redis::Msg, registry: &FanoutRegistry) {
    let channel = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(p) => p,
        Err(e) => {
            warn!(channel, error = %e, "non-text bus payload — skipping");
            return;
        }
    };

    match serde_json::from_str::<BusEvent>(&payload) {
        Ok(event) => {
            debug!(channel, "bus event received");
            registry.dispatch(&event);
        }
        Err(e) => {
            warn!(channel, error = %e, "undecodable bus payload — skipping");
        }
    }
}
