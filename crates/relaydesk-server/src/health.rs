//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub uptime_secs: u64,
    /// Live WebSocket connections.
    pub connections: usize,
    pub available_agents: usize,
}

pub fn health_check(start_time: Instant, connections: usize, available_agents: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        available_agents,
    }
}
