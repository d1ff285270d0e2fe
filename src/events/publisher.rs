//! Fire-and-forget event publisher
//!
//! Publish failures are logged and swallowed: the database is the state of
//! truth, the bus is best-effort delivery. A publisher built against an
//! unreachable Redis degrades to a no-op.

use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::config::BusConfig;
use crate::events::BusEvent;

/// Publishing half of the event bus.
#[derive(Clone)]
pub struct EventPublisher {
    conn: Option<MultiplexedConnection>,
}

impl EventPublisher {
    /// Connect to the bus. On failure the publisher is created disabled so
    /// the rest of the service keeps working without event delivery.
    pub async fn connect(config: &BusConfig) -> Self {
        let url = config.url();
        let conn = match redis::Client::open(url.as_str()) {
            Ok(client) => match client.get_multiplexed_async_connection().await {
                Ok(conn) => {
                    info!(host = %config.host, port = config.port, "Connected to event bus");
                    Some(conn)
                }
                Err(e) => {
                    warn!(error = %e, "Event bus unreachable — publishing disabled");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "Invalid event bus configuration — publishing disabled");
                None
            }
        };
        Self { conn }
    }

    /// A publisher that never publishes (tests, `BUS_PUBSUB_ENABLED=false`).
    pub fn disabled() -> Self {
        Self { conn: None }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Serialize and publish one event on its channel. Never fails: errors
    /// are logged and dropped.
    pub async fn publish(&self, event: &BusEvent) {
        let Some(conn) = &self.conn else {
            debug!(channel = %event.channel(), "publisher disabled — dropping event");
            return;
        };

        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, channel = %event.channel(), "failed to serialize event");
                return;
            }
        };

        let mut conn = conn.clone();
        let channel = event.channel().as_str();
        match conn.publish::<_, _, i64>(channel, payload).await {
            Ok(receivers) => {
                debug!(channel, receivers, "event published");
            }
            Err(e) => {
                warn!(error = %e, channel, "event publish failed — dropping");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnomalySeverity;
    use chrono::Utc;

    #[tokio::test]
    async fn disabled_publisher_swallows_events() {
        let publisher = EventPublisher::disabled();
        assert!(!publisher.is_connected());
        // must not panic or block
        publisher
            .publish(&BusEvent::SystemAlert {
                alert_type: "test".into(),
                severity: AnomalySeverity::Info,
                message: "noop".into(),
                details: None,
                published_at: Utc::now(),
            })
            .await;
    }
}
