//! Presence Registry: live connections, agent availability, and which
//! active session each agent holds.
//!
//! Everything sits behind one short-held lock. Callers never hold it
//! across an await, and it is never taken while waiting for a session
//! lock, so it cannot participate in a lock-ordering cycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info};

use relaydesk_core::ids::{AgentId, ConnectionId, SessionId};
use relaydesk_core::session::{Availability, Participant};
use relaydesk_core::RelayError;

use crate::connection::ClientConnection;

#[derive(Default)]
struct PresenceIndex {
    /// Registration order is kept so fan-out order is stable.
    connections: Vec<Arc<ClientConnection>>,
    availability: HashMap<AgentId, Availability>,
    engaged: HashMap<AgentId, SessionId>,
    reserved: HashSet<AgentId>,
}

impl PresenceIndex {
    fn is_available(&self, agent: &AgentId) -> bool {
        self.availability.get(agent).copied().unwrap_or(Availability::Available)
            == Availability::Available
    }
}

pub struct PresenceRegistry {
    index: Mutex<PresenceIndex>,
    queue_depth: usize,
}

impl PresenceRegistry {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            index: Mutex::new(PresenceIndex::default()),
            queue_depth: queue_depth.max(1),
        }
    }

    /// Register a connection and return it with the receiving end of its
    /// outbound queue.
    pub fn register(
        &self,
        session_id: Option<SessionId>,
        participant: Participant,
    ) -> (Arc<ClientConnection>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let conn = Arc::new(ClientConnection::new(session_id, participant, tx));
        self.index.lock().connections.push(conn.clone());
        debug!(
            conn_id = %conn.id,
            participant = %conn.participant,
            session_id = ?conn.session_id,
            "connection registered"
        );
        (conn, rx)
    }

    /// Remove a connection. Session state is untouched. Returns whether it
    /// was still registered.
    pub fn unregister(&self, conn_id: &ConnectionId) -> bool {
        let mut index = self.index.lock();
        let before = index.connections.len();
        index.connections.retain(|c| &c.id != conn_id);
        let removed = index.connections.len() != before;
        if removed {
            debug!(conn_id = %conn_id, "connection unregistered");
        }
        removed
    }

    /// Connections bound to `session_id`, in registration order.
    pub fn connections_for(&self, session_id: &SessionId) -> Vec<Arc<ClientConnection>> {
        self.index
            .lock()
            .connections
            .iter()
            .filter(|c| c.session_id.as_ref() == Some(session_id))
            .cloned()
            .collect()
    }

    /// Agent connections without a session whose agent is available.
    pub fn lobby_connections(&self) -> Vec<Arc<ClientConnection>> {
        let index = self.index.lock();
        index
            .connections
            .iter()
            .filter(|c| c.session_id.is_none())
            .filter(|c| c.participant.as_agent().is_some_and(|a| index.is_available(a)))
            .cloned()
            .collect()
    }

    pub fn set_agent_availability(&self, agent_id: &AgentId, availability: Availability) {
        let _ = self
            .index
            .lock()
            .availability
            .insert(agent_id.clone(), availability);
        info!(agent_id = %agent_id, ?availability, "agent availability changed");
    }

    pub fn availability(&self, agent_id: &AgentId) -> Availability {
        if self.index.lock().is_available(agent_id) {
            Availability::Available
        } else {
            Availability::Busy
        }
    }

    /// Connected agents that have not declared themselves busy.
    pub fn available_agents(&self) -> BTreeSet<AgentId> {
        let index = self.index.lock();
        index
            .connections
            .iter()
            .filter_map(|c| c.participant.as_agent())
            .filter(|a| index.is_available(a))
            .cloned()
            .collect()
    }

    /// The active session `agent_id` currently holds, if any.
    pub fn engagement(&self, agent_id: &AgentId) -> Option<SessionId> {
        self.index.lock().engaged.get(agent_id).cloned()
    }

    /// Claim the right for `agent_id` to take a session. Fails if the agent
    /// is busy, already holds an active session, or has another claim in
    /// flight. The claim is released on drop unless committed.
    pub fn reserve_agent(&self, agent_id: &AgentId) -> Result<AgentReservation<'_>, RelayError> {
        let mut index = self.index.lock();
        if !index.is_available(agent_id)
            || index.engaged.contains_key(agent_id)
            || index.reserved.contains(agent_id)
        {
            return Err(RelayError::AgentUnavailable(agent_id.clone()));
        }
        let _ = index.reserved.insert(agent_id.clone());
        Ok(AgentReservation {
            registry: self,
            agent_id: agent_id.clone(),
            committed: false,
        })
    }

    /// Forget the engagement of `agent_id` if it is on `session_id`.
    pub fn release_agent(&self, agent_id: &AgentId, session_id: &SessionId) {
        let mut index = self.index.lock();
        if index.engaged.get(agent_id) == Some(session_id) {
            let _ = index.engaged.remove(agent_id);
            debug!(agent_id = %agent_id, session_id = %session_id, "agent released");
        }
    }

    /// Seed engagements from persisted assignments at startup.
    pub fn restore_engagements(&self, assignments: Vec<(AgentId, SessionId)>) {
        let mut index = self.index.lock();
        for (agent, session) in assignments {
            let _ = index.engaged.insert(agent, session);
        }
    }

    /// Unregister connections idle for longer than `timeout` and ask their
    /// writers to close.
    pub fn sweep_dead(&self, timeout: Duration) -> Vec<Arc<ClientConnection>> {
        let mut index = self.index.lock();
        let (dead, alive): (Vec<_>, Vec<_>) = index
            .connections
            .drain(..)
            .partition(|c| c.idle_for() > timeout);
        index.connections = alive;
        drop(index);
        for conn in &dead {
            conn.close();
        }
        dead
    }

    pub fn connection_count(&self) -> usize {
        self.index.lock().connections.len()
    }
}

/// An in-flight claim on an agent. See [`PresenceRegistry::reserve_agent`].
pub struct AgentReservation<'a> {
    registry: &'a PresenceRegistry,
    agent_id: AgentId,
    committed: bool,
}

impl AgentReservation<'_> {
    pub fn agent_id(&self) -> &AgentId {
        &self.agent_id
    }

    /// Record that the agent now holds `session_id`.
    pub fn commit(&mut self, session_id: &SessionId) {
        let mut index = self.registry.index.lock();
        let _ = index.reserved.remove(&self.agent_id);
        let _ = index.engaged.insert(self.agent_id.clone(), session_id.clone());
        self.committed = true;
    }
}

impl Drop for AgentReservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let _ = self.registry.index.lock().reserved.remove(&self.agent_id);
        }
    }
}
