use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use kh_core::error::Result;
use kh_core::types::TaskStatus;
use kh_core::StoreDb;
use kh_engine::{BenchmarkBroker, CrackIngest, ProgressTracker};
use kh_protocol::{AgentMessage, LifecycleEvent};

use crate::registry::AgentRegistry;

/// Dispatches inbound agent frames to the engine.
///
/// One handler instance serves every session; per-session ordering is
/// preserved because each socket pump awaits `handle_message` before
/// reading the next frame.
#[derive(Clone)]
pub struct SessionHandler {
    store: Arc<StoreDb>,
    tracker: ProgressTracker,
    ingest: CrackIngest,
    registry: Arc<AgentRegistry>,
}

impl SessionHandler {
    pub fn new(
        store: Arc<StoreDb>,
        tracker: ProgressTracker,
        ingest: CrackIngest,
        registry: Arc<AgentRegistry>,
    ) -> Self {
        Self {
            store,
            tracker,
            ingest,
            registry,
        }
    }

    pub async fn handle_message(&self, agent_id: Uuid, message: AgentMessage) -> Result<()> {
        match message {
            AgentMessage::Heartbeat { devices, .. } => {
                self.store.record_heartbeat(agent_id, Utc::now(), devices).await?;
                Ok(())
            }

            AgentMessage::TaskStarted { task_id, started_at } => {
                self.tracker.handle_task_started(task_id, started_at).await
            }

            AgentMessage::TaskProgress {
                task_id,
                keyspace_processed,
                current_speed,
                hashcat_progress_total,
            } => {
                self.tracker
                    .handle_task_progress(
                        task_id,
                        keyspace_processed,
                        current_speed,
                        hashcat_progress_total,
                    )
                    .await
            }

            AgentMessage::CrackBatch {
                task_id,
                batch_id,
                entries,
            } => {
                self.ingest.ingest_batch(task_id, &batch_id, &entries).await?;
                Ok(())
            }

            AgentMessage::TaskCrackingCompleted {
                task_id,
                expected_crack_count,
                finished_at,
            } => {
                self.tracker
                    .handle_cracking_completed(task_id, expected_crack_count, finished_at)
                    .await
            }

            AgentMessage::BatchesComplete { task_id } => {
                self.tracker.handle_batches_complete(task_id).await
            }

            AgentMessage::TaskStopped { task_id } => self.handle_task_stopped(task_id).await,

            AgentMessage::TaskFailed { task_id, error } => {
                self.tracker
                    .emit_once(
                        LifecycleEvent::AgentError {
                            agent_id,
                            error: error.clone(),
                        },
                        next_attempt(),
                    )
                    .await
                    .ok();
                self.tracker.handle_task_failed(task_id, &error).await
            }

            AgentMessage::BenchmarkResult {
                request_id,
                outcome,
            } => {
                let broker = BenchmarkBroker::new(self.store.as_ref(), self.registry.as_ref());
                broker.handle_result(request_id, outcome).await
            }

            AgentMessage::Pong => {
                debug!(agent_id = %agent_id, "pong");
                Ok(())
            }
        }
    }

    /// Ack of `job_stop`. A task parked for preemption or shutdown finishes
    /// as cancelled; a task already suspended back to pending is left alone
    /// (the stop raced the pause path).
    async fn handle_task_stopped(&self, task_id: Uuid) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            warn!(task_id = %task_id, "stop ack for unknown task");
            return Ok(());
        };
        match task.status {
            TaskStatus::ReconnectPending
            | TaskStatus::Assigned
            | TaskStatus::Running
            | TaskStatus::Processing => {
                self.store.cancel_task(task_id).await?;
                self.tracker.evaluate_job_completion(task.job_id).await?;
            }
            _ => {
                debug!(task_id = %task_id, status = %task.status, "stop ack ignored");
            }
        }
        Ok(())
    }
}

/// Agent errors recur; give each emission a fresh attempt slot so they are
/// deduplicated per occurrence rather than forever.
fn next_attempt() -> u32 {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
