//! Notification Fan-out: lifecycle events to available agents' lobby
//! connections.

use std::sync::Arc;

use relaydesk_core::events::LifecycleEvent;
use relaydesk_telemetry::MetricsRecorder;
use tracing::{debug, warn};

use crate::metrics;
use crate::presence::PresenceRegistry;
use crate::wire;

pub struct NotificationFanout {
    presence: Arc<PresenceRegistry>,
    metrics: Arc<MetricsRecorder>,
}

impl NotificationFanout {
    pub fn new(presence: Arc<PresenceRegistry>, metrics: Arc<MetricsRecorder>) -> Self {
        Self { presence, metrics }
    }

    /// Push `event` to every connected, available agent not bound to a
    /// session. At most once per connection, no replay for late joiners.
    /// Returns how many connections accepted the frame.
    pub fn broadcast_to_available_agents(&self, event: &LifecycleEvent) -> usize {
        let frame = wire::event_frame(event);
        let targets = self.presence.lobby_connections();
        let mut delivered = 0;
        for conn in &targets {
            match conn.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(failure) => {
                    warn!(
                        conn_id = %conn.id,
                        event = event.kind(),
                        reason = failure.as_str(),
                        "failed to send lifecycle event"
                    );
                    self.metrics.counter_inc(
                        metrics::RELAY_DELIVERY_FAILURES_TOTAL,
                        &[("reason", failure.as_str())],
                        1,
                    );
                }
            }
        }
        self.metrics
            .counter_inc(metrics::FANOUT_EVENTS_TOTAL, &[("event", event.kind())], 1);
        debug!(
            event = event.kind(),
            session_id = %event.session_id(),
            recipients = delivered,
            targets = targets.len(),
            "lifecycle event fanned out"
        );
        delivered
    }
}
