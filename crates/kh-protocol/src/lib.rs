//! Wire protocol and lifecycle-event plumbing shared between the
//! coordinator and its agents.

pub mod events;
pub mod wire;

pub use events::{EventBus, LifecycleEvent};
pub use wire::{AgentMessage, ServerMessage, TaskAssignment};
