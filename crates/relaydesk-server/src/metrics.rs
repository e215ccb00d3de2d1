//! Metric names recorded by the server.

/// Relayed messages (counter, labels: sender).
pub const RELAY_MESSAGES_TOTAL: &str = "relay_messages_total";
/// Frames that could not be queued to a connection (counter, labels: reason).
pub const RELAY_DELIVERY_FAILURES_TOTAL: &str = "relay_delivery_failures_total";
/// Relay latency from call to fan-out complete (histogram, milliseconds).
pub const RELAY_LATENCY_MS: &str = "relay_latency_ms";
/// Handoff attempts (counter, labels: transition, outcome).
pub const HANDOFF_TRANSITIONS_TOTAL: &str = "handoff_transitions_total";
/// Lifecycle events fanned out to agents (counter, labels: event).
pub const FANOUT_EVENTS_TOTAL: &str = "fanout_events_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket connections opened (counter, labels: role).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Connections evicted by the liveness sweep (counter).
pub const WS_EVICTIONS_TOTAL: &str = "ws_evictions_total";
/// Assistant reply failures (counter).
pub const ASSISTANT_FAILURES_TOTAL: &str = "assistant_failures_total";
