//! Internal job lifecycle API consumed by the thin external surface.
//! Authentication and authorization happen upstream; callers arrive here as
//! an opaque principal string.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use kh_core::artifacts::ArtifactStore;
use kh_core::attack::AttackConfig;
use kh_core::error::{CoreError, Result};
use kh_core::store::JobFilter;
use kh_core::types::{IncrementLayer, Job, JobStatus, Task, TaskStatus};
use kh_core::StoreDb;
use kh_protocol::ServerMessage;

use crate::keyspace::{KeyspaceCalculator, KeyspacePolicy};
use crate::transport::AgentTransport;

pub const MIN_CHUNK_SECONDS: u32 = 5;
pub const MAX_CHUNK_SECONDS: u32 = 86_400;

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Inputs for `create_job`; everything else derives from the keyspace plan.
#[derive(Debug, Clone)]
pub struct CreateJobRequest {
    pub name: String,
    pub hashlist_id: Uuid,
    pub attack: AttackConfig,
    pub priority: u32,
    pub max_agents: u32,
    pub chunk_size_seconds: Option<u32>,
    pub allow_high_priority_override: bool,
}

// ---------------------------------------------------------------------------
// JobLifecycle
// ---------------------------------------------------------------------------

pub struct JobLifecycle {
    store: Arc<StoreDb>,
    artifacts: Arc<dyn ArtifactStore>,
    transport: Arc<dyn AgentTransport>,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<StoreDb>,
        artifacts: Arc<dyn ArtifactStore>,
        transport: Arc<dyn AgentTransport>,
    ) -> Self {
        Self {
            store,
            artifacts,
            transport,
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Validate and persist a new job with its keyspace estimate and
    /// increment layers. The forced benchmark is issued lazily on first
    /// scheduling.
    pub async fn create_job(&self, request: CreateJobRequest, caller: &str) -> Result<Job> {
        let settings = self.store.load_system_settings().await?;

        if request.priority > settings.max_job_priority {
            return Err(CoreError::validation(format!(
                "priority {} exceeds the maximum of {}",
                request.priority, settings.max_job_priority
            )));
        }
        let chunk_size = request
            .chunk_size_seconds
            .unwrap_or(settings.default_chunk_size_seconds);
        validate_chunk_size(chunk_size)?;

        let hashlist = self
            .store
            .get_hashlist(request.hashlist_id)
            .await?
            .ok_or_else(|| CoreError::not_found("hashlist", request.hashlist_id))?;
        if hashlist.total_hashes == 0 {
            return Err(CoreError::validation("hashlist is empty"));
        }

        // Also verifies wordlists/rules exist and mode-9 preconditions.
        let calculator =
            KeyspaceCalculator::new(self.artifacts.as_ref(), KeyspacePolicy::from_settings(&settings));
        let plan = calculator.compute(&request.attack, &hashlist).await?;

        let mut job = Job::new(request.name, hashlist.id, request.attack, caller);
        job.priority = request.priority;
        job.max_agents = request.max_agents;
        job.chunk_size_seconds = chunk_size;
        job.base_keyspace = Some(plan.base_keyspace);
        job.effective_keyspace = Some(plan.effective_keyspace);
        job.total_keyspace = Some(plan.effective_keyspace);
        job.multiplication_factor = plan.multiplication_factor;
        job.uses_rule_splitting = plan.uses_rule_splitting;
        job.allow_high_priority_override = request.allow_high_priority_override;

        self.store.upsert_job(&job).await?;
        for layer_plan in &plan.layers {
            let mut layer = IncrementLayer::new(
                job.id,
                layer_plan.layer_index,
                layer_plan.mask.clone(),
                layer_plan.base_keyspace,
            );
            layer.effective_keyspace = layer_plan.base_keyspace;
            self.store.insert_layer(&layer).await?;
        }

        info!(
            job_id = %job.id,
            effective_keyspace = plan.effective_keyspace,
            rule_split = plan.uses_rule_splitting,
            layers = plan.layers.len(),
            "job created"
        );
        Ok(job)
    }

    /// Materialize a job from a preset template.
    pub async fn create_job_from_preset(
        &self,
        preset_id: Uuid,
        hashlist_id: Uuid,
        name: Option<String>,
        caller: &str,
    ) -> Result<Job> {
        let preset = self
            .store
            .get_preset(preset_id)
            .await?
            .ok_or_else(|| CoreError::not_found("preset", preset_id))?;

        if let Some(binary_id) = preset.binary_id {
            if !self.artifacts.binary_exists(binary_id).await {
                return Err(CoreError::not_found("binary", binary_id));
            }
        }

        let mut job = self
            .create_job(
                CreateJobRequest {
                    name: name.unwrap_or_else(|| preset.name.clone()),
                    hashlist_id,
                    attack: preset.attack.clone(),
                    priority: preset.priority,
                    max_agents: preset.max_agents,
                    chunk_size_seconds: Some(preset.chunk_size_seconds),
                    allow_high_priority_override: preset.allow_high_priority_override,
                },
                caller,
            )
            .await?;
        job.preset_id = Some(preset_id);
        self.store.upsert_job(&job).await?;
        Ok(job)
    }

    /// Materialize one job per workflow step, in step order.
    pub async fn create_workflow_jobs(
        &self,
        workflow_id: Uuid,
        hashlist_id: Uuid,
        caller: &str,
    ) -> Result<Vec<Job>> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| CoreError::not_found("workflow", workflow_id))?;
        let steps = self.store.workflow_steps(workflow_id).await?;
        if steps.is_empty() {
            return Err(CoreError::validation("workflow has no steps"));
        }

        let mut jobs = Vec::with_capacity(steps.len());
        for step in steps {
            let name = format!("{} #{}", workflow.name, step.step_order);
            jobs.push(
                self.create_job_from_preset(step.preset_id, hashlist_id, Some(name), caller)
                    .await?,
            );
        }
        Ok(jobs)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| CoreError::not_found("job", id))
    }

    /// Filtered page of jobs plus the unpaged total.
    pub async fn list_jobs(&self, filter: JobFilter) -> Result<(Vec<Job>, u64)> {
        let total = self
            .store
            .count_jobs(JobFilter {
                offset: 0,
                limit: None,
                ..filter.clone()
            })
            .await?;
        let page = self.store.list_jobs(filter).await?;
        Ok((page, total))
    }

    pub async fn get_job_layers(&self, job_id: Uuid) -> Result<Vec<IncrementLayer>> {
        self.get_job(job_id).await?;
        Ok(self.store.layers_for_job(job_id).await?)
    }

    pub async fn get_job_layer_tasks(&self, job_id: Uuid, layer_id: Uuid) -> Result<Vec<Task>> {
        let layer = self
            .store
            .get_layer(layer_id)
            .await?
            .ok_or_else(|| CoreError::not_found("layer", layer_id))?;
        if layer.job_id != job_id {
            return Err(CoreError::conflict("layer does not belong to this job"));
        }
        Ok(self.store.tasks_for_layer(layer_id).await?)
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    pub async fn set_priority(&self, job_id: Uuid, priority: u32) -> Result<()> {
        let settings = self.store.load_system_settings().await?;
        if priority > settings.max_job_priority {
            return Err(CoreError::validation(format!(
                "priority {} exceeds the maximum of {}",
                priority, settings.max_job_priority
            )));
        }
        if !self.store.set_job_priority(job_id, priority).await? {
            return Err(CoreError::not_found("job", job_id));
        }
        Ok(())
    }

    /// Excess assignments drain on the next scheduler tick.
    pub async fn set_max_agents(&self, job_id: Uuid, max_agents: u32) -> Result<()> {
        if !self.store.set_job_max_agents(job_id, max_agents).await? {
            return Err(CoreError::not_found("job", job_id));
        }
        Ok(())
    }

    /// Applies to future tasks only.
    pub async fn set_chunk_size(&self, job_id: Uuid, seconds: u32) -> Result<()> {
        validate_chunk_size(seconds)?;
        if !self.store.set_job_chunk_size(job_id, seconds).await? {
            return Err(CoreError::not_found("job", job_id));
        }
        Ok(())
    }

    /// Stop a job: halt its agents, cancel its tasks, and mark it
    /// cancelled with the operator's reason.
    pub async fn stop_job(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let job = self.get_job(job_id).await?;
        if !job.status.is_stoppable() {
            return Err(CoreError::conflict(format!(
                "cannot stop a {} job",
                job.status
            )));
        }

        self.halt_active_tasks(job_id, true).await?;
        self.store.set_job_status(job_id, JobStatus::Cancelled).await?;
        self.store.set_job_error(job_id, Some(reason.to_string())).await?;
        info!(job_id = %job_id, reason, "job stopped");
        Ok(())
    }

    /// Pause: agents are told to stop, tasks return to the pending pool
    /// with their ranges intact, counters survive for resume.
    pub async fn pause_job(&self, job_id: Uuid) -> Result<()> {
        let job = self.get_job(job_id).await?;
        if !job.status.can_transition_to(JobStatus::Paused) {
            return Err(CoreError::conflict(format!(
                "cannot pause a {} job",
                job.status
            )));
        }
        self.halt_active_tasks(job_id, false).await?;
        self.store.set_job_status(job_id, JobStatus::Paused).await?;
        info!(job_id = %job_id, "job paused");
        Ok(())
    }

    pub async fn resume_job(&self, job_id: Uuid) -> Result<()> {
        let job = self.get_job(job_id).await?;
        if job.status != JobStatus::Paused {
            return Err(CoreError::conflict(format!(
                "cannot resume a {} job",
                job.status
            )));
        }
        self.store.set_job_status(job_id, JobStatus::Pending).await?;
        info!(job_id = %job_id, "job resumed");
        Ok(())
    }

    /// Retry a failed/cancelled job: eligible tasks reset to pending and
    /// the keyspace ledger is re-accounted in the same transaction.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<()> {
        let job = self.get_job(job_id).await?;
        if !matches!(job.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(CoreError::conflict(format!(
                "cannot retry a {} job",
                job.status
            )));
        }
        let reset = self.store.reset_tasks_for_job_retry(job_id).await?;
        self.store.set_job_error(job_id, None).await?;
        self.store.clear_job_interruption(job_id).await?;
        self.store.set_job_status(job_id, JobStatus::Pending).await?;
        info!(job_id = %job_id, tasks_reset = reset, "job queued for retry");
        Ok(())
    }

    /// Retry a single failed task.
    pub async fn retry_task(&self, task_id: Uuid) -> Result<()> {
        let task = self
            .store
            .get_task(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id))?;
        if task.status != TaskStatus::Failed {
            return Err(CoreError::conflict(format!(
                "cannot retry a {} task",
                task.status
            )));
        }
        self.store.reset_task_for_retry(task_id).await?;
        info!(task_id = %task_id, "task queued for retry");
        Ok(())
    }

    /// Delete a job outright: agents stopped, rows cascade away.
    pub async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.get_job(job_id).await?;
        self.halt_active_tasks(job_id, true).await.ok();
        if !self.store.delete_job(job_id).await? {
            return Err(CoreError::not_found("job", job_id));
        }
        info!(job_id = %job_id, "job deleted");
        Ok(())
    }

    /// Administrative escape hatch for stuck jobs: every non-terminal task
    /// is marked completed without keyspace reconciliation.
    pub async fn force_complete(&self, job_id: Uuid) -> Result<()> {
        self.get_job(job_id).await?;
        let forced = self.store.force_complete_tasks(job_id).await?;
        self.store.set_job_status(job_id, JobStatus::Completed).await?;
        self.store.set_job_progress_percent(job_id, 100.0).await?;
        info!(job_id = %job_id, tasks_forced = forced, "job force-completed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Send `job_stop` to every agent-held task, then either cancel the
    /// tasks or park them back in the pending pool.
    async fn halt_active_tasks(&self, job_id: Uuid, cancel: bool) -> Result<()> {
        for task in self.store.tasks_for_job(job_id).await? {
            if !task.status.holds_agent() {
                continue;
            }
            if let Some(agent_id) = task.agent_id {
                // Best effort; an unreachable agent's task is reconciled by
                // the heartbeat sweep.
                self.transport
                    .send(agent_id, ServerMessage::JobStop { task_id: task.id })
                    .await
                    .ok();
            }
            if cancel {
                self.store.cancel_task(task.id).await?;
            } else {
                // Park for resume: range preserved, progress re-accounted.
                self.store.suspend_task(task.id).await?;
            }
        }
        Ok(())
    }
}

fn validate_chunk_size(seconds: u32) -> Result<()> {
    if !(MIN_CHUNK_SECONDS..=MAX_CHUNK_SECONDS).contains(&seconds) {
        return Err(CoreError::validation(format!(
            "chunk size {seconds}s outside {MIN_CHUNK_SECONDS}..{MAX_CHUNK_SECONDS}"
        )));
    }
    Ok(())
}
