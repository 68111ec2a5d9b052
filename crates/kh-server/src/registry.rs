//! Agent registry: the authoritative in-memory view of which agents are
//! currently connected, layered over `kh-db`'s durable `agents`/`devices`
//! tables (§2, §3, §4.1).
//!
//! Per §9's design notes ("arena-style registry... components holding ids
//! rather than direct references"), the scheduler and control-channel
//! layer never hold a reference to another agent's connection directly —
//! they look it up here by `AgentId` inside this struct's lock, which is
//! what makes it safe for many independent reader/writer tasks (one pair
//! per connected agent) to share one registry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use kh_db::agents::AgentState;
use kh_ids::AgentId;
use kh_protocol::Frame;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

/// Illegal per §4.1's invariant and §9's explicit state-machine design
/// note: an agent may not jump straight from `disconnected` to `busy`
/// without first being re-observed as `active` via a fresh heartbeat.
#[derive(Debug, thiserror::Error)]
#[error("illegal agent state transition: {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: AgentState,
    pub to: AgentState,
}

/// Guard every in-memory/DB agent state transition through this function
/// rather than assigning the new state directly (§4.1 design note).
pub fn transition(from: AgentState, to: AgentState) -> Result<(), InvalidTransition> {
    use AgentState::*;
    let allowed = matches!(
        (from, to),
        (Pending, Active)
            | (Pending, Disconnected)
            | (Active, Busy)
            | (Active, Disconnected)
            | (Active, Error)
            | (Busy, Active)
            | (Busy, Disconnected)
            | (Busy, Error)
            | (Error, Active)
            | (Error, Disconnected)
            | (Disconnected, Active)
    ) || from == to;
    if allowed {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// A connected agent's outbound frame sender, plus bookkeeping the
/// scheduler needs to pick eligible idle agents (§4.4).
#[derive(Debug)]
pub struct Connection {
    pub sender: mpsc::UnboundedSender<Frame>,
    pub connected_at: DateTime<Utc>,
    /// Set while a task is dispatched-but-not-yet-`task_accepted`, so the
    /// scheduler does not double-dispatch to an agent mid-handshake
    /// (§4.4 eligibility clause (d)).
    pub dispatching: bool,
    pub last_idle_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct AgentRegistry {
    connections: RwLock<HashMap<AgentId, Connection>>,
}

impl AgentRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn connect(&self, agent_id: AgentId, sender: mpsc::UnboundedSender<Frame>, now: DateTime<Utc>) {
        let mut connections = self.connections.write().await;
        connections.insert(
            agent_id,
            Connection {
                sender,
                connected_at: now,
                dispatching: false,
                last_idle_at: now,
            },
        );
        info!(agent_id = %agent_id, "agent connected");
    }

    pub async fn disconnect(&self, agent_id: AgentId) {
        let mut connections = self.connections.write().await;
        if connections.remove(&agent_id).is_some() {
            info!(agent_id = %agent_id, "agent disconnected");
        }
    }

    pub async fn is_connected(&self, agent_id: AgentId) -> bool {
        self.connections.read().await.contains_key(&agent_id)
    }

    pub async fn send(&self, agent_id: AgentId, frame: Frame) -> bool {
        let connections = self.connections.read().await;
        match connections.get(&agent_id) {
            Some(conn) => match conn.sender.send(frame) {
                Ok(()) => true,
                Err(_) => {
                    warn!(agent_id = %agent_id, "send to closed agent channel");
                    false
                }
            },
            None => false,
        }
    }

    pub async fn set_dispatching(&self, agent_id: AgentId, dispatching: bool) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(&agent_id) {
            conn.dispatching = dispatching;
        }
    }

    pub async fn mark_idle(&self, agent_id: AgentId, now: DateTime<Utc>) {
        let mut connections = self.connections.write().await;
        if let Some(conn) = connections.get_mut(&agent_id) {
            conn.last_idle_at = now;
            conn.dispatching = false;
        }
    }

    pub async fn is_dispatching(&self, agent_id: AgentId) -> bool {
        self.connections
            .read()
            .await
            .get(&agent_id)
            .map(|c| c.dispatching)
            .unwrap_or(false)
    }

    pub async fn last_idle_at(&self, agent_id: AgentId) -> Option<DateTime<Utc>> {
        self.connections.read().await.get(&agent_id).map(|c| c.last_idle_at)
    }

    pub async fn connected_ids(&self) -> Vec<AgentId> {
        self.connections.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnected_cannot_jump_straight_to_busy() {
        assert!(transition(AgentState::Disconnected, AgentState::Busy).is_err());
        assert!(transition(AgentState::Disconnected, AgentState::Active).is_ok());
        assert!(transition(AgentState::Active, AgentState::Busy).is_ok());
    }

    #[test]
    fn same_state_transition_is_always_allowed() {
        assert!(transition(AgentState::Busy, AgentState::Busy).is_ok());
    }

    #[tokio::test]
    async fn send_to_unknown_agent_returns_false() {
        let registry = AgentRegistry::new();
        let frame = Frame::new(kh_protocol::MessageType::Ack, serde_json::json!({}), Utc::now()).unwrap();
        assert!(!registry.send(AgentId::new(1), frame).await);
    }

    #[tokio::test]
    async fn connect_then_disconnect_clears_membership() {
        let registry = AgentRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let agent_id = AgentId::new(1);
        registry.connect(agent_id, tx, Utc::now()).await;
        assert!(registry.is_connected(agent_id).await);
        registry.disconnect(agent_id).await;
        assert!(!registry.is_connected(agent_id).await);
    }
}
