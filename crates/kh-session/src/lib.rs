//! Per-agent bidirectional sessions: the live-agent registry, the inbound
//! message dispatcher, and the WebSocket endpoint agents connect to.

pub mod registry;
pub mod session;
pub mod ws;

pub use registry::AgentRegistry;
pub use session::SessionHandler;
