//! WebSocket fan-out — topic endpoints backed by the event bus
//!
//! Four pure broadcast topics (`dashboard`, `anomalies`, `training`,
//! `events`). Delivery is explicitly eventual: every client owns a bounded
//! sink and a client that cannot keep up is dropped, not buffered forever.
//! Critical information is persisted by the engines; the socket is a mirror.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::events::{envelope, BusEvent, WsTopic};

/// Per-client outbound queue. Overflow drops the client (slowest-reader
/// policy), keeping one stuck browser from stalling the fan-out.
pub const CLIENT_QUEUE_CAPACITY: usize = 64;

type ClientKey = (WsTopic, String);

// ============================================================================
// Connection Registry
// ============================================================================

/// In-memory registry of connected clients, keyed by (topic, client id).
pub struct FanoutRegistry {
    clients: DashMap<ClientKey, mpsc::Sender<String>>,
    max_connections: usize,
}

impl FanoutRegistry {
    pub fn new(max_connections: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_connections,
        }
    }

    /// Register a client and hand back the receiving half of its sink.
    ///
    /// Re-registering an existing (topic, client id) replaces the old sink,
    /// which terminates the previous socket loop. Refuses new clients once
    /// the total cap is reached.
    pub fn register(
        &self,
        topic: WsTopic,
        client_id: &str,
    ) -> Result<mpsc::Receiver<String>, CoreError> {
        let key = (topic, client_id.to_string());
        if !self.clients.contains_key(&key) && self.clients.len() >= self.max_connections {
            return Err(CoreError::TooManyConnections { retry_after: 10 });
        }
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        self.clients.insert(key, tx);
        Ok(rx)
    }

    pub fn remove(&self, topic: WsTopic, client_id: &str) {
        self.clients.remove(&(topic, client_id.to_string()));
    }

    pub fn connection_count(&self) -> usize {
        self.clients.len()
    }

    /// Connected clients per topic (introspection / health).
    pub fn topic_counts(&self) -> HashMap<&'static str, usize> {
        let mut counts: HashMap<&'static str, usize> =
            WsTopic::all().iter().map(|t| (t.as_str(), 0)).collect();
        for entry in self.clients.iter() {
            *counts.entry(entry.key().0.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Drop every client sink. Each socket loop observes its closed channel,
    /// sends a close frame and exits; used during shutdown.
    pub fn drain(&self) {
        self.clients.clear();
    }

    /// Forward one bus event to every client of every subscribing topic.
    ///
    /// Clients whose sink is full or closed are dropped from the registry.
    pub fn dispatch(&self, event: &BusEvent) {
        let channel = event.channel();
        let mut stale: Vec<ClientKey> = Vec::new();

        for topic in WsTopic::all() {
            if !topic.subscribes_to(channel) {
                continue;
            }
            let frame = envelope(topic, event).to_string();
            for entry in self.clients.iter().filter(|e| e.key().0 == topic) {
                match entry.value().try_send(frame.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        warn!(
                            topic = %topic,
                            client_id = %entry.key().1,
                            "client sink overflow — dropping client"
                        );
                        stale.push(entry.key().clone());
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        stale.push(entry.key().clone());
                    }
                }
            }
        }

        for key in stale {
            self.clients.remove(&key);
        }
    }
}

// ============================================================================
// Topic Endpoint
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub client_id: Option<String>,
}

/// GET /ws/{topic}?client_id=... — upgrade to a topic broadcast socket.
pub async fn ws_topic_handler(
    Path(topic): Path<String>,
    Query(query): Query<WsQuery>,
    State(ctx): State<Arc<CoreContext>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !ctx.config.websocket.enabled {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(topic) = WsTopic::parse(&topic) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let client_id = query
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, ctx, topic, client_id))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<CoreContext>, topic: WsTopic, client_id: String) {
    let mut rx = match ctx.fanout.register(topic, &client_id) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(topic = %topic, client_id = %client_id, error = %e, "rejecting websocket client");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();

    // Greeting frame confirms the registration to the client.
    let greeting = serde_json::json!({
        "type": "connection",
        "status": "connected",
        "client_id": client_id,
        "connection_type": topic.as_str(),
        "timestamp": Utc::now(),
    });
    if sender
        .send(Message::Text(greeting.to_string().into()))
        .await
        .is_err()
    {
        ctx.fanout.remove(topic, &client_id);
        return;
    }

    info!(topic = %topic, client_id = %client_id, "websocket client connected");

    let heartbeat = Duration::from_secs(ctx.config.websocket.heartbeat_interval_secs);
    let mut heartbeat_timer = tokio::time::interval(heartbeat);
    heartbeat_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    heartbeat_timer.tick().await; // first tick completes immediately

    loop {
        tokio::select! {
            // Bus events queued for this client
            frame = rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame.into())).await.is_err() {
                            break;
                        }
                    }
                    // sink replaced or registry dropped us
                    None => break,
                }
            }

            // Client traffic: text pings, protocol pings, close
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if text.trim().eq_ignore_ascii_case("ping") {
                            let pong = serde_json::json!({
                                "type": "pong",
                                "timestamp": Utc::now(),
                            });
                            if sender.send(Message::Text(pong.to_string().into())).await.is_err() {
                                break;
                            }
                        } else {
                            debug!(topic = %topic, client_id = %client_id, "ignoring client text frame");
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(topic = %topic, client_id = %client_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }

            // Liveness probe; a dead peer fails the send and ends the loop
            _ = heartbeat_timer.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    ctx.fanout.remove(topic, &client_id);
    let _ = sender.send(Message::Close(None)).await;
    info!(topic = %topic, client_id = %client_id, "websocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AnomalySeverity, AnomalyType};

    fn anomaly_event() -> BusEvent {
        BusEvent::AnomalyDetected {
            machine_id: "M-1".into(),
            metric: "power_kw".into(),
            value: 120.0,
            expected: 80.0,
            severity: AnomalySeverity::Critical,
            anomaly_type: AnomalyType::Spike,
            confidence: 0.9,
            timestamp: Utc::now(),
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn dispatch_reaches_subscribing_topics_only() {
        let registry = FanoutRegistry::new(10);
        let mut dashboard = registry.register(WsTopic::Dashboard, "d1").unwrap();
        let mut anomalies = registry.register(WsTopic::Anomalies, "a1").unwrap();
        let mut training = registry.register(WsTopic::Training, "t1").unwrap();

        registry.dispatch(&anomaly_event());

        let frame = dashboard.try_recv().unwrap();
        assert!(frame.contains("anomaly.detected"));
        assert!(anomalies.try_recv().is_ok());
        // training does not subscribe to anomaly.detected
        assert!(training.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflowed_client_is_dropped() {
        let registry = FanoutRegistry::new(10);
        let rx = registry.register(WsTopic::Anomalies, "slow").unwrap();
        // keep rx alive but never drain it
        let _rx = rx;

        for _ in 0..=CLIENT_QUEUE_CAPACITY {
            registry.dispatch(&anomaly_event());
        }

        assert_eq!(registry.connection_count(), 0, "slow client must be dropped");
    }

    #[tokio::test]
    async fn closed_client_is_pruned_on_dispatch() {
        let registry = FanoutRegistry::new(10);
        let rx = registry.register(WsTopic::Dashboard, "gone").unwrap();
        drop(rx);

        registry.dispatch(&anomaly_event());
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn connection_cap_rejects_new_clients() {
        let registry = FanoutRegistry::new(2);
        let _a = registry.register(WsTopic::Dashboard, "a").unwrap();
        let _b = registry.register(WsTopic::Events, "b").unwrap();

        let err = registry.register(WsTopic::Dashboard, "c").unwrap_err();
        assert!(matches!(err, CoreError::TooManyConnections { .. }));

        // replacing an existing key is allowed at the cap
        assert!(registry.register(WsTopic::Dashboard, "a").is_ok());
    }

    #[tokio::test]
    async fn reregistering_replaces_the_old_sink() {
        let registry = FanoutRegistry::new(10);
        let mut old_rx = registry.register(WsTopic::Anomalies, "c1").unwrap();
        let mut new_rx = registry.register(WsTopic::Anomalies, "c1").unwrap();

        registry.dispatch(&anomaly_event());

        assert!(new_rx.try_recv().is_ok());
        // old sink's sender was dropped on replacement
        assert!(matches!(
            old_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert_eq!(registry.connection_count(), 1);
    }

    #[tokio::test]
    async fn topic_counts_reflect_registrations() {
        let registry = FanoutRegistry::new(10);
        let _a = registry.register(WsTopic::Dashboard, "a").unwrap();
        let _b = registry.register(WsTopic::Dashboard, "b").unwrap();
        let _c = registry.register(WsTopic::Training, "c").unwrap();

        let counts = registry.topic_counts();
        assert_eq!(counts["dashboard"], 2);
        assert_eq!(counts["training"], 1);
        assert_eq!(counts["anomalies"], 0);
        assert_eq!(counts["events"], 0);
    }
}
