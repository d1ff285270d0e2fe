//! Throttle and fan-out introspection

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use utoipa::ToSchema;

use crate::context::CoreContext;

use super::super::ApiResult;

#[derive(Debug, Serialize, ToSchema)]
pub struct ConnectionStats {
    /// Concurrently open HTTP requests.
    pub open_requests: usize,
    pub open_requests_per_ip: HashMap<String, usize>,
    pub max_per_ip: usize,
    pub max_total: usize,
    /// Connected WebSocket clients.
    pub websocket_clients: usize,
    pub websocket_clients_per_topic: HashMap<String, usize>,
    pub websocket_max: usize,
}

/// GET /api/v1/stats/connections
#[utoipa::path(get, path = "/api/v1/stats/connections",
    responses((status = 200, description = "Connection-throttle and fan-out counters", body = ConnectionStats)))]
pub async fn connections(State(ctx): State<Arc<CoreContext>>) -> ApiResult<ConnectionStats> {
    let per_ip = ctx
        .throttle
        .snapshot()
        .into_iter()
        .map(|(ip, count)| (ip.to_string(), count))
        .collect();
    let per_topic = ctx
        .fanout
        .topic_counts()
        .into_iter()
        .map(|(topic, count)| (topic.to_string(), count))
        .collect();

    Ok(Json(ConnectionStats {
        open_requests: ctx.throttle.total_open(),
        open_requests_per_ip: per_ip,
        max_per_ip: ctx.config.throttle.max_per_ip,
        max_total: ctx.config.throttle.max_total,
        websocket_clients: ctx.fanout.connection_count(),
        websocket_clients_per_topic: per_topic,
        websocket_max: ctx.config.websocket.max_connections,
    }))
}
