use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// LifecycleEvent
// ---------------------------------------------------------------------------

/// Abstract lifecycle events the core emits. Delivery (email, webhook,
/// in-app) lives outside the core; subscribers attach through [`EventBus`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LifecycleEvent {
    JobStarted { job_id: Uuid },
    JobCompleted { job_id: Uuid },
    JobFailed { job_id: Uuid, error: String },
    /// Exactly once per job.
    FirstCrack { job_id: Uuid },
    TaskCompletedWithCracks { job_id: Uuid, task_id: Uuid, crack_count: u64 },
    AgentOffline { agent_id: Uuid },
    AgentError { agent_id: Uuid, error: String },
}

impl LifecycleEvent {
    /// Stable kind label used for the once-only emission ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::JobStarted { .. } => "job_started",
            LifecycleEvent::JobCompleted { .. } => "job_completed",
            LifecycleEvent::JobFailed { .. } => "job_failed",
            LifecycleEvent::FirstCrack { .. } => "first_crack",
            LifecycleEvent::TaskCompletedWithCracks { .. } => "task_completed_with_cracks",
            LifecycleEvent::AgentOffline { .. } => "agent_offline",
            LifecycleEvent::AgentError { .. } => "agent_error",
        }
    }

    /// The entity the event is keyed on for idempotent emission.
    pub fn entity_id(&self) -> Uuid {
        match self {
            LifecycleEvent::JobStarted { job_id }
            | LifecycleEvent::JobCompleted { job_id }
            | LifecycleEvent::JobFailed { job_id, .. }
            | LifecycleEvent::FirstCrack { job_id } => *job_id,
            LifecycleEvent::TaskCompletedWithCracks { task_id, .. } => *task_id,
            LifecycleEvent::AgentOffline { agent_id }
            | LifecycleEvent::AgentError { agent_id, .. } => *agent_id,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Fan-out of lifecycle events to out-of-core subscribers.
///
/// Routing is keyed on [`LifecycleEvent::kind`]: a notifier that only cares
/// about `first_crack` attaches with [`subscribe_kind`] and never sees the
/// rest of the stream, while dashboards take everything via [`subscribe`].
/// Delivery is in-process and lossless per live receiver; the once-only
/// guarantee for events like `first_crack` is enforced upstream by the
/// emission ledger, not here.
///
/// Cloning the bus is cheap and every clone routes into the same channels.
#[derive(Clone)]
pub struct EventBus {
    routes: Arc<Mutex<Routes>>,
}

#[derive(Default)]
struct Routes {
    /// Subscribers to the full stream.
    firehose: Vec<flume::Sender<LifecycleEvent>>,
    /// Subscribers keyed by event kind.
    by_kind: std::collections::HashMap<&'static str, Vec<flume::Sender<LifecycleEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            routes: Arc::new(Mutex::new(Routes::default())),
        }
    }

    /// Receive every lifecycle event published from now on.
    pub fn subscribe(&self) -> flume::Receiver<LifecycleEvent> {
        let (tx, rx) = flume::unbounded();
        self.routes
            .lock()
            .expect("event routes poisoned")
            .firehose
            .push(tx);
        rx
    }

    /// Receive only events of one kind (a [`LifecycleEvent::kind`] label).
    pub fn subscribe_kind(&self, kind: &'static str) -> flume::Receiver<LifecycleEvent> {
        let (tx, rx) = flume::unbounded();
        self.routes
            .lock()
            .expect("event routes poisoned")
            .by_kind
            .entry(kind)
            .or_default()
            .push(tx);
        rx
    }

    /// Route an event to the firehose and to its kind's subscribers.
    /// Channels whose receivers have gone away are dropped along the way.
    /// Returns how many subscribers took delivery.
    pub fn publish(&self, event: LifecycleEvent) -> usize {
        let kind = event.kind();
        let mut routes = self.routes.lock().expect("event routes poisoned");
        let mut delivered = 0;
        routes.firehose.retain(|tx| {
            let alive = tx.send(event.clone()).is_ok();
            delivered += alive as usize;
            alive
        });
        if let Some(subscribers) = routes.by_kind.get_mut(kind) {
            subscribers.retain(|tx| {
                let alive = tx.send(event.clone()).is_ok();
                delivered += alive as usize;
                alive
            });
        }
        delivered
    }

    /// Live subscriber channels across the firehose and all kinds.
    pub fn subscriber_count(&self) -> usize {
        let routes = self.routes.lock().expect("event routes poisoned");
        routes.firehose.len() + routes.by_kind.values().map(Vec::len).sum::<usize>()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firehose_sees_every_kind() {
        let bus = EventBus::new();
        let rx = bus.subscribe();

        let job_id = Uuid::new_v4();
        let agent_id = Uuid::new_v4();
        assert_eq!(bus.publish(LifecycleEvent::JobStarted { job_id }), 1);
        assert_eq!(bus.publish(LifecycleEvent::AgentOffline { agent_id }), 1);

        assert_eq!(rx.try_recv().unwrap(), LifecycleEvent::JobStarted { job_id });
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::AgentOffline { agent_id }
        );
    }

    #[test]
    fn kind_subscribers_only_see_their_kind() {
        let bus = EventBus::new();
        let cracks = bus.subscribe_kind("first_crack");

        let job_id = Uuid::new_v4();
        bus.publish(LifecycleEvent::JobStarted { job_id });
        assert!(cracks.try_recv().is_err());

        bus.publish(LifecycleEvent::FirstCrack { job_id });
        assert_eq!(
            cracks.try_recv().unwrap(),
            LifecycleEvent::FirstCrack { job_id }
        );
    }

    #[test]
    fn dropped_receivers_fall_out_of_the_routes() {
        let bus = EventBus::new();
        let keep = bus.subscribe();
        drop(bus.subscribe());
        drop(bus.subscribe_kind("job_completed"));
        assert_eq!(bus.subscriber_count(), 3);

        let delivered = bus.publish(LifecycleEvent::JobCompleted {
            job_id: Uuid::new_v4(),
        });
        assert_eq!(delivered, 1);
        assert_eq!(bus.subscriber_count(), 1);
        assert!(keep.try_recv().is_ok());
    }
}
