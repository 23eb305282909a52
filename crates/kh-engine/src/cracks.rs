//! Crack ingest & retransmit: applies crack batches to the hash store
//! idempotently, keeps the expected/received/persisted ledger per task, and
//! chases missing batches once an agent claims it is done sending.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use kh_core::error::Result;
use kh_core::CoreError;
use kh_core::settings::SystemSettings;
use kh_core::store::IngestOutcome;
use kh_core::types::{CrackEntry, TaskStatus};
use kh_core::StoreDb;
use kh_protocol::{LifecycleEvent, ServerMessage};

use crate::progress::ProgressTracker;
use crate::transport::AgentTransport;

/// Retries against a busy store before a batch is declared rolled back.
const INGEST_RETRY_LIMIT: u32 = 3;

#[derive(Clone)]
pub struct CrackIngest {
    store: Arc<StoreDb>,
    tracker: ProgressTracker,
    /// Serializes batches per task so the crack counters cannot race;
    /// batches for distinct tasks ingest concurrently.
    task_locks: Arc<DashMap<Uuid, Arc<Mutex<()>>>>,
}

impl CrackIngest {
    pub fn new(store: Arc<StoreDb>, tracker: ProgressTracker) -> Self {
        Self {
            store,
            tracker,
            task_locks: Arc::new(DashMap::new()),
        }
    }

    /// Apply one crack batch. Batches are transactional and idempotent at
    /// the `(task_id, batch_id)` level; a duplicate is acked without
    /// touching any counter. Completing the expected count while
    /// batches-complete is already signaled finishes the task.
    pub async fn ingest_batch(
        &self,
        task_id: Uuid,
        batch_id: &str,
        entries: &[CrackEntry],
    ) -> Result<Option<IngestOutcome>> {
        let lock = self
            .task_locks
            .entry(task_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Each batch is one transaction; contention retries with bounded
        // backoff, anything else rolls the batch back for the agent to
        // retransmit.
        let mut attempts = 0u32;
        let outcome = loop {
            match self.store.ingest_crack_batch(task_id, batch_id, entries).await {
                Ok(outcome) => break outcome,
                Err(err) if err.is_transient() && attempts < INGEST_RETRY_LIMIT => {
                    attempts += 1;
                    warn!(
                        task_id = %task_id, batch_id, attempt = attempts,
                        "store contention during ingest; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(50u64 << attempts)).await;
                }
                Err(err) if err.is_transient() => {
                    return Err(CoreError::TransientStore(format!(
                        "crack batch {batch_id} exhausted {INGEST_RETRY_LIMIT} retries: {err}"
                    )));
                }
                Err(err) => {
                    return Err(CoreError::PartialIngest(format!(
                        "crack batch {batch_id} rolled back: {err}"
                    )));
                }
            }
        };
        let Some(outcome) = outcome else {
            warn!(task_id = %task_id, batch_id, "crack batch for unknown task dropped");
            return Ok(None);
        };

        if outcome.duplicate_batch {
            info!(task_id = %task_id, batch_id, "duplicate crack batch acked as no-op");
            return Ok(Some(outcome));
        }

        if outcome.inserted > 0 {
            info!(
                task_id = %task_id,
                batch_id,
                received = outcome.received,
                inserted = outcome.inserted,
                "crack batch persisted"
            );
            if outcome.first_crack_for_job {
                self.tracker
                    .emit_once(
                        LifecycleEvent::FirstCrack {
                            job_id: outcome.job_id,
                        },
                        0,
                    )
                    .await?;
            }
        }

        if outcome.task_status == TaskStatus::Processing
            && self.tracker.try_finish_processing(task_id).await?
        {
            self.release_task(task_id);
        }
        Ok(Some(outcome))
    }

    /// One retransmit sweep: for every processing task whose agent said
    /// batches-complete but whose received count still trails expected,
    /// either ask the agent to resend or, once the retransmit budget is
    /// exhausted, complete the task with a warning (the hash store is the
    /// source of truth; cracks are best-effort).
    pub async fn drive_retransmits(
        &self,
        transport: &dyn AgentTransport,
        settings: &SystemSettings,
    ) -> Result<()> {
        for task in self.store.tasks_awaiting_cracks().await? {
            if task.retransmit_count >= settings.max_retransmit_cycles {
                warn!(
                    task_id = %task.id,
                    expected = task.expected_crack_count,
                    received = task.received_crack_count,
                    "retransmit budget exhausted; completing with missing cracks"
                );
                self.tracker
                    .finish_task(
                        &task,
                        Some(format!(
                            "completed with {} of {} cracks after {} retransmits",
                            task.received_crack_count,
                            task.expected_crack_count,
                            task.retransmit_count
                        )),
                    )
                    .await?;
                continue;
            }

            // Space the cycles out; an in-flight resend gets time to land.
            if let Some(last) = task.last_retransmit_at {
                let elapsed = (Utc::now() - last).num_seconds().max(0) as u64;
                if elapsed < settings.task_heartbeat_timeout {
                    continue;
                }
            }

            let Some(agent_id) = task.agent_id else {
                continue;
            };
            match transport
                .send(agent_id, ServerMessage::CrackRetransmitRequest { task_id: task.id })
                .await
            {
                Ok(()) => {
                    self.store.record_retransmit(task.id).await?;
                    info!(
                        task_id = %task.id,
                        agent_id = %agent_id,
                        cycle = task.retransmit_count + 1,
                        "crack retransmission requested"
                    );
                }
                Err(err) => {
                    warn!(task_id = %task.id, error = %err, "retransmit request undeliverable");
                }
            }
        }
        Ok(())
    }

    /// Drop the per-task lock entry once a task is finished with.
    pub fn release_task(&self, task_id: Uuid) {
        self.task_locks.remove(&task_id);
    }
}
