use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use kh_core::error::Result;
use kh_core::CoreError;
use kh_engine::AgentTransport;
use kh_protocol::ServerMessage;

/// Sending half of one live agent session.
///
/// The socket pump owns the receiving end; everything else posts work here.
#[derive(Clone)]
pub struct AgentHandle {
    pub agent_id: Uuid,
    pub mailbox: flume::Sender<ServerMessage>,
    pub connected_at: DateTime<Utc>,
}

/// Registry of live agent sessions, keyed by agent id.
///
/// A reconnect replaces the previous handle; the old session's pump notices
/// its mailbox closing and tears itself down.
#[derive(Default)]
pub struct AgentRegistry {
    agents: DashMap<Uuid, AgentHandle>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session and hand back the mailbox's receiving end for
    /// the socket pump to drain.
    pub fn register(&self, agent_id: Uuid) -> flume::Receiver<ServerMessage> {
        let (tx, rx) = flume::unbounded();
        let handle = AgentHandle {
            agent_id,
            mailbox: tx,
            connected_at: Utc::now(),
        };
        if self.agents.insert(agent_id, handle).is_some() {
            warn!(agent_id = %agent_id, "agent reconnected; previous session replaced");
        } else {
            debug!(agent_id = %agent_id, "agent session registered");
        }
        rx
    }

    /// Remove a session. A newer session for the same agent is left alone
    /// (compared by its mailbox still being open elsewhere).
    pub fn deregister(&self, agent_id: Uuid) {
        if self.agents.remove(&agent_id).is_some() {
            debug!(agent_id = %agent_id, "agent session deregistered");
        }
    }

    pub fn connected_agents(&self) -> Vec<Uuid> {
        self.agents.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[async_trait]
impl AgentTransport for AgentRegistry {
    async fn send(&self, agent_id: Uuid, message: ServerMessage) -> Result<()> {
        let sender = match self.agents.get(&agent_id) {
            Some(handle) => handle.mailbox.clone(),
            None => return Err(CoreError::AgentUnreachable { agent_id }),
        };
        sender
            .send_async(message)
            .await
            .map_err(|_| CoreError::AgentUnreachable { agent_id })
    }

    fn is_connected(&self, agent_id: Uuid) -> bool {
        self.agents
            .get(&agent_id)
            .map(|handle| !handle.mailbox.is_disconnected())
            .unwrap_or(false)
    }
}
