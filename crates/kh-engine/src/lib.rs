//! The job-execution engine: keyspace arithmetic, task generation,
//! benchmark brokering, progress/completion tracking, crack ingest, and the
//! internal job lifecycle API.
//!
//! Components are constructor-injected collaborators around the shared
//! [`kh_core::StoreDb`]; none of them holds authoritative state in memory.

pub mod benchmarks;
pub mod cracks;
pub mod generator;
pub mod keyspace;
pub mod lifecycle;
pub mod progress;
pub mod transport;

pub use benchmarks::BenchmarkBroker;
pub use cracks::CrackIngest;
pub use generator::TaskGenerator;
pub use keyspace::{KeyspaceCalculator, KeyspacePlan};
pub use lifecycle::JobLifecycle;
pub use progress::ProgressTracker;
pub use transport::AgentTransport;
