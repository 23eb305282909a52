//! Progress & completion tracker: folds task-level reports into job and
//! layer counters and drives the two-phase completion state machine
//! (hashcat done -> cracks persisted -> completed).

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use kh_core::error::Result;
use kh_core::types::{Job, JobStatus, LayerStatus, Task, TaskStatus};
use kh_core::StoreDb;
use kh_protocol::{EventBus, LifecycleEvent};

#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<StoreDb>,
    events: EventBus,
}

impl ProgressTracker {
    pub fn new(store: Arc<StoreDb>, events: EventBus) -> Self {
        Self { store, events }
    }

    // -----------------------------------------------------------------------
    // Inbound task reports
    // -----------------------------------------------------------------------

    /// `task_started`: move the task to running; the first start of a
    /// pending job moves the job to running and announces it.
    pub async fn handle_task_started(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        if !self.store.record_task_started(task_id, at).await? {
            warn!(task_id = %task_id, "task_started for a task not awaiting start");
            return Ok(());
        }
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        let Some(job) = self.store.get_job(task.job_id).await? else {
            return Ok(());
        };
        if job.status == JobStatus::Pending {
            self.store.set_job_status(job.id, JobStatus::Running).await?;
            self.emit_once(LifecycleEvent::JobStarted { job_id: job.id }, 0).await?;
        }
        if let Some(layer_id) = task.increment_layer_id {
            self.store.set_layer_status(layer_id, LayerStatus::Running).await?;
        }
        Ok(())
    }

    /// `task_progress`: roll the report into task/job/layer counters and
    /// refresh the derived percentages.
    pub async fn handle_task_progress(
        &self,
        task_id: Uuid,
        reported_processed: u64,
        current_speed: Option<u64>,
        hashcat_progress_total: Option<u64>,
    ) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            warn!(task_id = %task_id, "progress for unknown task dropped");
            return Ok(());
        };
        let Some(job) = self.store.get_job(task.job_id).await? else {
            return Ok(());
        };

        let delta = self
            .store
            .apply_task_progress(
                task_id,
                reported_processed,
                current_speed,
                hashcat_progress_total,
                job.multiplication_factor,
            )
            .await?;

        if let Some(delta) = delta {
            if delta.pinned_actual {
                info!(task_id = %task_id, "actual chunk keyspace pinned by agent report");
            }
            if delta.effective_delta > 0 {
                self.refresh_job_percent(delta.job_id).await?;
                if let Some(layer_id) = delta.layer_id {
                    self.refresh_layer_percent(layer_id).await?;
                }
            }
        }
        Ok(())
    }

    /// `task_cracking_completed`: hashcat is done on the agent; the task
    /// enters processing and waits for its crack batches.
    pub async fn handle_cracking_completed(
        &self,
        task_id: Uuid,
        expected_crack_count: u64,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let Some(task) = self.store.get_task(task_id).await? else {
            warn!(task_id = %task_id, "cracking_completed for unknown task");
            return Ok(());
        };
        let Some(job) = self.store.get_job(task.job_id).await? else {
            return Ok(());
        };

        // Everything the chunk held was searched, whatever the last
        // progress report said; top the counters off while still running.
        let factor = job.multiplication_factor.max(1);
        let span = task.chunk_actual_keyspace.unwrap_or_else(|| {
            if task.is_rule_split_task {
                task.chunk_span()
            } else {
                task.chunk_span().saturating_mul(factor)
            }
        });
        self.store
            .apply_task_progress(task_id, span.max(1), None, None, factor)
            .await?;

        if !self
            .store
            .mark_cracking_completed(task_id, expected_crack_count, finished_at)
            .await?
        {
            warn!(task_id = %task_id, "cracking_completed for a task not running");
            return Ok(());
        }
        self.refresh_job_percent(task.job_id).await?;
        self.try_finish_processing(task_id).await?;
        Ok(())
    }

    /// `batches_complete`: the agent sent everything it had. Completes the
    /// task when the crack ledger already balances.
    pub async fn handle_batches_complete(&self, task_id: Uuid) -> Result<()> {
        if self.store.mark_batches_complete(task_id).await?.is_none() {
            warn!(task_id = %task_id, "batches_complete for unknown task");
            return Ok(());
        }
        self.try_finish_processing(task_id).await?;
        Ok(())
    }

    /// Complete a processing task once `received == expected` and the agent
    /// asserted batches-complete. Called after every signal that can close
    /// the gap.
    pub async fn try_finish_processing(&self, task_id: Uuid) -> Result<bool> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(false);
        };
        if task.status != TaskStatus::Processing
            || !task.batches_complete_signaled
            || task.received_crack_count < task.expected_crack_count
        {
            return Ok(false);
        }
        self.finish_task(&task, None).await?;
        Ok(true)
    }

    /// Terminal bookkeeping shared by the normal and the
    /// retransmit-exhausted completion paths.
    pub async fn finish_task(&self, task: &Task, warning: Option<String>) -> Result<()> {
        if !self.store.complete_task(task.id, warning).await? {
            return Ok(());
        }
        info!(task_id = %task.id, job_id = %task.job_id, "task completed");
        if task.crack_count > 0 {
            self.emit_once(
                LifecycleEvent::TaskCompletedWithCracks {
                    job_id: task.job_id,
                    task_id: task.id,
                    crack_count: task.crack_count,
                },
                task.retry_count,
            )
            .await?;
        }
        self.evaluate_job_completion(task.job_id).await?;
        Ok(())
    }

    pub async fn handle_task_failed(&self, task_id: Uuid, error: &str) -> Result<()> {
        if !self.store.fail_task(task_id, error).await? {
            return Ok(());
        }
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(());
        };
        warn!(task_id = %task_id, job_id = %task.job_id, error, "task failed");
        self.evaluate_job_completion(task.job_id).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Job-level evaluation
    // -----------------------------------------------------------------------

    /// Run the completion state machine for a job whose work may be done:
    /// fully dispatched and every task terminal or processing.
    pub async fn evaluate_job_completion(&self, job_id: Uuid) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if !matches!(job.status, JobStatus::Running | JobStatus::Processing) {
            return Ok(());
        }
        let Some(denominator) = job.progress_denominator() else {
            return Ok(());
        };
        if job.dispatched_keyspace < denominator {
            return Ok(());
        }

        let tasks = self.store.tasks_for_job(job_id).await?;
        if tasks.is_empty() {
            return Ok(());
        }
        let all_settled = tasks
            .iter()
            .all(|t| t.status.is_terminal() || t.status == TaskStatus::Processing);
        if !all_settled {
            return Ok(());
        }

        let any_processing = tasks.iter().any(|t| t.status == TaskStatus::Processing);
        if any_processing {
            // Hashcat is done everywhere; crack persistence still drains.
            if job.status == JobStatus::Running {
                self.store.set_job_status(job_id, JobStatus::Processing).await?;
                info!(job_id = %job_id, "job entered processing");
            }
            return Ok(());
        }

        let all_done = tasks
            .iter()
            .all(|t| matches!(t.status, TaskStatus::Completed | TaskStatus::Cancelled));
        if all_done {
            self.store.set_job_status(job_id, JobStatus::Completed).await?;
            self.store.set_job_progress_percent(job_id, 100.0).await?;
            for layer in self.store.layers_for_job(job_id).await? {
                self.store
                    .set_layer_status(layer.id, LayerStatus::Completed)
                    .await?;
            }
            self.emit_once(LifecycleEvent::JobCompleted { job_id }, 0).await?;
            info!(job_id = %job_id, "job completed");
            return Ok(());
        }

        let all_failed = tasks.iter().all(|t| t.status == TaskStatus::Failed);
        if all_failed {
            self.store.set_job_status(job_id, JobStatus::Failed).await?;
            self.store
                .set_job_error(job_id, Some("all tasks failed".into()))
                .await?;
            self.emit_once(
                LifecycleEvent::JobFailed {
                    job_id,
                    error: "all tasks failed".into(),
                },
                0,
            )
            .await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Derived percentages
    // -----------------------------------------------------------------------

    /// Recompute a job's display percentage, capped at 100. An exceedance
    /// is a consistency bug worth logging but never propagates upward.
    pub async fn refresh_job_percent(&self, job_id: Uuid) -> Result<()> {
        let Some(job) = self.store.get_job(job_id).await? else {
            return Ok(());
        };
        if let Some(percent) = compute_percent(&job) {
            self.store.set_job_progress_percent(job_id, percent).await?;
        }
        Ok(())
    }

    async fn refresh_layer_percent(&self, layer_id: Uuid) -> Result<()> {
        let Some(layer) = self.store.get_layer(layer_id).await? else {
            return Ok(());
        };
        if layer.effective_keyspace == 0 {
            return Ok(());
        }
        let raw = layer.processed_keyspace as f64 / layer.effective_keyspace as f64 * 100.0;
        if raw > 100.0 {
            warn!(
                layer_id = %layer_id,
                processed = layer.processed_keyspace,
                effective = layer.effective_keyspace,
                "layer progress exceeded 100%; capping"
            );
        }
        self.store
            .set_layer_progress_percent(layer_id, raw.min(100.0))
            .await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Publish an event at most once per (kind, entity, attempt).
    pub async fn emit_once(&self, event: LifecycleEvent, attempt: u32) -> Result<()> {
        let fresh = self
            .store
            .try_mark_emitted(event.kind(), &event.entity_id().to_string(), attempt)
            .await?;
        if fresh {
            self.events.publish(event);
        }
        Ok(())
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<StoreDb> {
        &self.store
    }
}

/// Processed over the progress denominator, capped at 100; `None` when the
/// denominator is unknown.
fn compute_percent(job: &Job) -> Option<f64> {
    let denominator = job.progress_denominator()?;
    let raw = job.processed_keyspace as f64 / denominator as f64 * 100.0;
    if raw > 100.0 {
        warn!(
            job_id = %job.id,
            processed = job.processed_keyspace,
            denominator,
            "job progress exceeded 100%; capping"
        );
    }
    Some(raw.min(100.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kh_core::attack::AttackConfig;
    use kh_core::types::Hashlist;

    async fn harness() -> (Arc<StoreDb>, ProgressTracker, Job, Task) {
        let store = Arc::new(StoreDb::new_in_memory().await.unwrap());
        let tracker = ProgressTracker::new(store.clone(), EventBus::new());

        let hashlist = Hashlist::new("hl", 0);
        store.upsert_hashlist(&hashlist).await.unwrap();
        let mut job = Job::new(
            "job",
            hashlist.id,
            AttackConfig::Dictionary {
                wordlist_id: Uuid::new_v4(),
                rule_ids: vec![],
            },
            "tester",
        );
        job.effective_keyspace = Some(1_000_000);
        job.base_keyspace = Some(1_000_000);
        store.upsert_job(&job).await.unwrap();

        let task = Task::new_keyspace_chunk(job.id, 0, 1_000_000);
        store.create_task_with_dispatch(&task, 1_000_000).await.unwrap();
        let agent_id = Uuid::new_v4();
        store.try_assign_task(task.id, agent_id, None).await.unwrap();

        (store, tracker, job, task)
    }

    #[tokio::test]
    async fn start_moves_pending_job_to_running_and_emits_once() {
        let (store, tracker, job, task) = harness().await;
        let rx = tracker.events().subscribe();

        tracker.handle_task_started(task.id, Utc::now()).await.unwrap();
        let job_now = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_now.status, JobStatus::Running);
        assert_eq!(
            rx.try_recv().unwrap(),
            LifecycleEvent::JobStarted { job_id: job.id }
        );

        // A second started report (retry path) does not re-announce.
        tracker.emit_once(LifecycleEvent::JobStarted { job_id: job.id }, 0).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn progress_rolls_up_and_percent_caps() {
        let (store, tracker, job, task) = harness().await;
        tracker.handle_task_started(task.id, Utc::now()).await.unwrap();

        tracker
            .handle_task_progress(task.id, 250_000, Some(100_000), Some(1_000_000))
            .await
            .unwrap();
        let job_now = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_now.processed_keyspace, 250_000);
        assert!((job_now.overall_progress_percent - 25.0).abs() < 1e-9);

        let task_now = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task_now.chunk_actual_keyspace, Some(1_000_000));

        // Reports past the chunk span clamp instead of overflowing.
        tracker
            .handle_task_progress(task.id, 2_000_000, None, None)
            .await
            .unwrap();
        let job_now = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_now.processed_keyspace, 1_000_000);
        assert!(job_now.overall_progress_percent <= 100.0);
    }

    #[tokio::test]
    async fn two_phase_completion() {
        let (store, tracker, job, task) = harness().await;
        tracker.handle_task_started(task.id, Utc::now()).await.unwrap();
        tracker
            .handle_task_progress(task.id, 1_000_000, None, Some(1_000_000))
            .await
            .unwrap();

        tracker
            .handle_cracking_completed(task.id, 5, Utc::now())
            .await
            .unwrap();
        let task_now = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task_now.status, TaskStatus::Processing);

        // Job is fully dispatched with its only task processing.
        tracker.evaluate_job_completion(job.id).await.unwrap();
        let job_now = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_now.status, JobStatus::Processing);
        assert!(job_now.cracking_completed_at.is_some());

        // Cracks arrive, then the batches-complete assertion closes it out.
        store
            .ingest_crack_batch(
                task.id,
                "batch-1",
                &(0..5)
                    .map(|i| kh_core::types::CrackEntry {
                        hash_value: format!("hash-{i}"),
                        plaintext: format!("pw-{i}"),
                        metadata: None,
                    })
                    .collect::<Vec<_>>(),
            )
            .await
            .unwrap();
        tracker.handle_batches_complete(task.id).await.unwrap();

        let task_now = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task_now.status, TaskStatus::Completed);
        let job_now = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_now.status, JobStatus::Completed);
        assert!(job_now.completed_at.is_some());
    }

    #[tokio::test]
    async fn zero_crack_task_completes_on_batches_complete() {
        let (store, tracker, job, task) = harness().await;
        tracker.handle_task_started(task.id, Utc::now()).await.unwrap();
        tracker
            .handle_cracking_completed(task.id, 0, Utc::now())
            .await
            .unwrap();
        tracker.handle_batches_complete(task.id).await.unwrap();

        let task_now = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task_now.status, TaskStatus::Completed);
        let job_now = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job_now.status, JobStatus::Completed);
    }
}
