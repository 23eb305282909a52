use async_trait::async_trait;
use uuid::Uuid;

use kh_core::error::Result;
use kh_protocol::ServerMessage;

/// Sending side of an agent session, abstracted so the scheduler and the
/// engine components can run against a fake in tests.
///
/// The live implementation is the session registry: `send` posts into the
/// per-agent mailbox, and the socket pump drains it in order.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Deliver a message to the agent's session. Fails with
    /// `AgentUnreachable` when no live session exists.
    async fn send(&self, agent_id: Uuid, message: ServerMessage) -> Result<()>;

    /// Whether a live session currently exists for the agent.
    fn is_connected(&self, agent_id: Uuid) -> bool;
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------

/// Transport that records every message instead of delivering it.
#[derive(Default)]
pub struct RecordingTransport {
    sent: std::sync::Mutex<Vec<(Uuid, ServerMessage)>>,
    /// Agents that should appear disconnected.
    unreachable: std::sync::Mutex<Vec<Uuid>>,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_unreachable(&self, agent_id: Uuid) {
        self.unreachable
            .lock()
            .expect("transport lock poisoned")
            .push(agent_id);
    }

    pub fn sent_messages(&self) -> Vec<(Uuid, ServerMessage)> {
        self.sent.lock().expect("transport lock poisoned").clone()
    }

    pub fn sent_to(&self, agent_id: Uuid) -> Vec<ServerMessage> {
        self.sent
            .lock()
            .expect("transport lock poisoned")
            .iter()
            .filter(|(id, _)| *id == agent_id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }
}

#[async_trait]
impl AgentTransport for RecordingTransport {
    async fn send(&self, agent_id: Uuid, message: ServerMessage) -> Result<()> {
        if !self.is_connected(agent_id) {
            return Err(kh_core::CoreError::AgentUnreachable { agent_id });
        }
        self.sent
            .lock()
            .expect("transport lock poisoned")
            .push((agent_id, message));
        Ok(())
    }

    fn is_connected(&self, agent_id: Uuid) -> bool {
        !self
            .unreachable
            .lock()
            .expect("transport lock poisoned")
            .contains(&agent_id)
    }
}
