//! The scheduler: a single cooperative control loop that is the only
//! writer of task assignment.
//!
//! Each tick walks eight phases in order: agent reconciliation (rate
//! limited to the configured heartbeat sweep interval), runnable job
//! enumeration, forced-benchmark gating, agent allocation, preemption,
//! task issuance, completion evaluation, and housekeeping. Every phase
//! handles its own errors; nothing crosses the tick boundary.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use kh_core::artifacts::ArtifactStore;
use kh_core::error::Result;
use kh_core::settings::SystemSettings;
use kh_core::types::{Agent, Job, JobStatus, OverflowMode};
use kh_core::StoreDb;
use kh_engine::benchmarks::ForcedState;
use kh_engine::{AgentTransport, BenchmarkBroker, CrackIngest, ProgressTracker, TaskGenerator};
use kh_protocol::{LifecycleEvent, ServerMessage, TaskAssignment};

pub struct Scheduler {
    store: Arc<StoreDb>,
    artifacts: Arc<dyn ArtifactStore>,
    transport: Arc<dyn AgentTransport>,
    tracker: ProgressTracker,
    ingest: CrackIngest,
    /// Minimum spacing between agent-liveness sweeps; ticks in between
    /// skip phase 1.
    heartbeat_interval: Duration,
    last_sweep: Mutex<Option<Instant>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<StoreDb>,
        artifacts: Arc<dyn ArtifactStore>,
        transport: Arc<dyn AgentTransport>,
        tracker: ProgressTracker,
        ingest: CrackIngest,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            store,
            artifacts,
            transport,
            tracker,
            ingest,
            heartbeat_interval,
            last_sweep: Mutex::new(None),
        }
    }

    /// One full scheduling pass. Settings are re-read from the store every
    /// tick; nothing process-wide caches them.
    pub async fn tick(&self) -> Result<()> {
        let settings = self.store.load_system_settings().await?;
        let broker = BenchmarkBroker::new(self.store.as_ref(), self.transport.as_ref());

        if self.sweep_due() {
            if let Err(err) = self.reconcile_agents(&settings).await {
                warn!(error = %err, "agent reconciliation failed this tick");
            }
        }
        if let Err(err) = broker.expire_overdue(&settings).await {
            warn!(error = %err, "benchmark expiry failed this tick");
        }

        let jobs = self.store.runnable_jobs().await?;
        let mut free_agents = self.free_agents().await?;

        for job in &jobs {
            if let Err(err) = self
                .schedule_job(job, &mut free_agents, &broker, &settings)
                .await
            {
                warn!(job_id = %job.id, error = %err, "scheduling failed for job");
                self.store
                    .set_job_error(job.id, Some(err.to_string()))
                    .await
                    .ok();
            }
        }

        if !free_agents.is_empty() {
            if let Err(err) = self
                .overflow_pass(&jobs, &mut free_agents, &broker, &settings)
                .await
            {
                warn!(error = %err, "overflow allocation failed this tick");
            }
        }

        if let Err(err) = self.preempt_for_starved_jobs(&jobs, &free_agents).await {
            warn!(error = %err, "preemption pass failed this tick");
        }

        for job in &jobs {
            if let Err(err) = self.tracker.evaluate_job_completion(job.id).await {
                warn!(job_id = %job.id, error = %err, "completion evaluation failed");
            }
        }
        if let Err(err) = self.resume_interrupted_jobs().await {
            warn!(error = %err, "resume pass failed this tick");
        }

        if let Err(err) = self
            .ingest
            .drive_retransmits(self.transport.as_ref(), &settings)
            .await
        {
            warn!(error = %err, "retransmit pass failed this tick");
        }
        // Settled request rows linger one probe budget for inspection,
        // then drop; a reaped failure makes room for a fresh probe.
        broker.reap(settings.hashcat_speedtest_timeout).await.ok();
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase 1: agent reconciliation
    // -----------------------------------------------------------------------

    /// Liveness sweeps run at their own cadence
    /// (`scheduler.heartbeat_interval_secs`), not on every tick.
    fn sweep_due(&self) -> bool {
        let mut last = self.last_sweep.lock().expect("sweep clock poisoned");
        match *last {
            Some(at) if at.elapsed() < self.heartbeat_interval => false,
            _ => {
                *last = Some(Instant::now());
                true
            }
        }
    }

    /// Park tasks of agents whose heartbeat aged past the timeout, and
    /// re-issue parked tasks that outlived the reconnect grace period.
    async fn reconcile_agents(&self, settings: &SystemSettings) -> Result<()> {
        for agent in self.store.stale_agents(settings.task_heartbeat_timeout).await? {
            let parked = self.store.park_tasks_for_agent(agent.id).await?;
            self.store
                .set_agent_status(agent.id, kh_core::types::AgentStatus::Offline)
                .await?;
            // One emission per offline occurrence, keyed by the heartbeat
            // that went stale.
            let attempt = agent
                .last_heartbeat
                .map(|t| (t.timestamp() & u32::MAX as i64) as u32)
                .unwrap_or(0);
            self.tracker
                .emit_once(LifecycleEvent::AgentOffline { agent_id: agent.id }, attempt)
                .await
                .ok();
            if !parked.is_empty() {
                warn!(
                    agent_id = %agent.id,
                    tasks = parked.len(),
                    "agent heartbeat lost; tasks parked for reconnect"
                );
            }
        }

        for task in self
            .store
            .reconnect_pending_tasks_older_than(settings.reconnect_grace_seconds)
            .await?
        {
            if self.store.reissue_task(task.id).await? {
                info!(task_id = %task.id, "reconnect grace expired; task re-issued");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phases 3-6 per job
    // -----------------------------------------------------------------------

    async fn schedule_job(
        &self,
        job: &Job,
        free_agents: &mut Vec<Agent>,
        broker: &BenchmarkBroker<'_>,
        settings: &SystemSettings,
    ) -> Result<()> {
        // Preset gating: a missing binary keeps the job out of rotation.
        if let Some(preset_id) = job.preset_id {
            if let Some(preset) = self.store.get_preset(preset_id).await? {
                if let Some(binary_id) = preset.binary_id {
                    if !self.artifacts.binary_exists(binary_id).await {
                        debug!(job_id = %job.id, "required binary missing; job skipped");
                        return Ok(());
                    }
                }
            }
        }

        let Some(hashlist) = self.store.get_hashlist(job.hashlist_id).await? else {
            return Ok(());
        };

        // Forced benchmark gate: estimates never drive dispatch.
        let probe_agent = free_agents.first().map(|a| a.id);
        match broker
            .ensure_forced_benchmark(job, probe_agent, hashlist.hash_type_id)
            .await?
        {
            ForcedState::Ready | ForcedState::Applied => {}
            ForcedState::InFlight { probing_agent } => {
                // An agent running the probe is occupied; it must not be
                // allocated to another job (or overflow) this tick.
                if let Some(agent_id) = probing_agent {
                    free_agents.retain(|a| a.id != agent_id);
                }
                return Ok(());
            }
            ForcedState::Failed(error) => {
                // The job stays pending with the error recorded; an
                // operator retry (or the probe record reaping) unblocks it.
                let err = kh_core::CoreError::BenchmarkFailed(error);
                self.store.set_job_error(job.id, Some(err.to_string())).await?;
                return Ok(());
            }
        }
        // The applied path rewrote the keyspace columns.
        let Some(job) = self.store.get_job(job.id).await? else {
            return Ok(());
        };

        // Allocation for this job under max_agents.
        let assigned = self.store.active_agent_count_for_job(job.id).await?;
        let capacity = match job.max_agents {
            0 => free_agents.len(),
            max => (max as u64).saturating_sub(assigned) as usize,
        };
        let take = capacity.min(free_agents.len());
        let allocated: Vec<Agent> = free_agents.drain(..take).collect();

        let mut current = job;
        for agent in allocated {
            let Some(speed) = broker
                .ensure_speed_benchmark(agent.id, &current, hashlist.hash_type_id, settings)
                .await?
            else {
                // Probe in flight; the agent stays out of the pool this tick.
                continue;
            };
            if !self.issue_task(&current, &agent, speed, settings).await? {
                break;
            }
            let Some(refreshed) = self.store.get_job(current.id).await? else {
                break;
            };
            current = refreshed;
        }
        Ok(())
    }

    /// Generate, persist, assign, and deliver one task. Returns false when
    /// the job has no more work to hand out.
    async fn issue_task(
        &self,
        job: &Job,
        agent: &Agent,
        speed: u64,
        settings: &SystemSettings,
    ) -> Result<bool> {
        let generator = TaskGenerator::new(self.store.as_ref(), self.artifacts.as_ref());
        let Some(task) = generator.next_task(job, speed, settings).await? else {
            return Ok(false);
        };
        if !self.store.try_assign_task(task.id, agent.id, Some(speed)).await? {
            return Ok(true);
        }

        let mask_override = match task.increment_layer_id {
            Some(layer_id) => self.store.get_layer(layer_id).await?.map(|l| l.mask),
            None => None,
        };
        let Some(hashlist) = self.store.get_hashlist(job.hashlist_id).await? else {
            return Ok(false);
        };

        let assignment = TaskAssignment {
            task_id: task.id,
            job_id: job.id,
            hashlist_id: job.hashlist_id,
            hash_type_id: hashlist.hash_type_id,
            attack: job.attack.clone(),
            keyspace_start: task.keyspace_start,
            keyspace_end: task.keyspace_end,
            is_rule_split: task.is_rule_split_task,
            rule_start_index: task.rule_start_index,
            rule_end_index: task.rule_end_index,
            mask_override,
            chunk_actual_keyspace: task.chunk_actual_keyspace,
        };

        match self
            .transport
            .send(agent.id, ServerMessage::TaskAssign(assignment))
            .await
        {
            Ok(()) => {
                info!(
                    task_id = %task.id, job_id = %job.id, agent_id = %agent.id,
                    "task assigned"
                );
                Ok(true)
            }
            Err(err) => {
                warn!(
                    task_id = %task.id, agent_id = %agent.id, error = %err,
                    "assignment undeliverable; task re-queued"
                );
                self.store.park_tasks_for_agent(agent.id).await?;
                Ok(true)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase 4b: overflow
    // -----------------------------------------------------------------------

    /// Agents left over after every job's `max_agents` was honored go to
    /// same-priority jobs that still have work, per the configured mode.
    async fn overflow_pass(
        &self,
        jobs: &[Job],
        free_agents: &mut Vec<Agent>,
        broker: &BenchmarkBroker<'_>,
        settings: &SystemSettings,
    ) -> Result<()> {
        // Candidates still hungry for agents beyond their cap, freshest
        // counters, queue order preserved.
        let mut candidates = Vec::new();
        for job in jobs {
            let Some(current) = self.store.get_job(job.id).await? else {
                continue;
            };
            if current.max_agents == 0 || !current.is_accurate_keyspace {
                continue;
            }
            let has_work = current
                .effective_keyspace
                .map(|eff| current.dispatched_keyspace < eff)
                .unwrap_or(false)
                || !self.store.pending_tasks_for_job(current.id).await?.is_empty();
            if has_work {
                candidates.push(current);
            }
        }
        let Some(top_priority) = candidates.first().map(|j| j.priority) else {
            return Ok(());
        };
        let group: Vec<&Job> = candidates
            .iter()
            .filter(|j| j.priority == top_priority)
            .collect();
        let ids: Vec<Uuid> = group.iter().map(|j| j.id).collect();

        let shares = distribute_overflow(
            &ids,
            free_agents.len(),
            settings.agent_overflow_allocation_mode,
        );
        for job in group {
            let share = shares.get(&job.id).copied().unwrap_or(0);
            let Some(hashlist) = self.store.get_hashlist(job.hashlist_id).await? else {
                continue;
            };
            let mut current = job.clone();
            for _ in 0..share {
                if free_agents.is_empty() {
                    break;
                }
                let agent = free_agents.remove(0);
                let Some(speed) = broker
                    .ensure_speed_benchmark(agent.id, &current, hashlist.hash_type_id, settings)
                    .await?
                else {
                    continue;
                };
                if !self.issue_task(&current, &agent, speed, settings).await? {
                    break;
                }
                if let Some(refreshed) = self.store.get_job(current.id).await? {
                    current = refreshed;
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Phase 5: preemption
    // -----------------------------------------------------------------------

    /// A starved higher-priority job may take agents from a running
    /// lower-priority job that opted into preemption.
    async fn preempt_for_starved_jobs(
        &self,
        jobs: &[Job],
        free_agents: &[Agent],
    ) -> Result<()> {
        if !free_agents.is_empty() {
            return Ok(());
        }
        // Highest-priority job still waiting on work with no agents.
        let Some(starved) = first_starved(jobs, &self.store).await? else {
            return Ok(());
        };

        for victim in jobs.iter().rev() {
            if victim.priority >= starved.priority || !victim.allow_high_priority_override {
                continue;
            }
            if victim.status != JobStatus::Running {
                continue;
            }
            let victim_tasks = self.store.tasks_for_job(victim.id).await?;
            let active: Vec<_> = victim_tasks
                .iter()
                .filter(|t| t.status.holds_agent())
                .collect();
            if active.is_empty() {
                continue;
            }

            info!(
                preempted = %victim.id,
                preemptor = %starved.id,
                tasks = active.len(),
                "preempting lower-priority job"
            );
            for task in active {
                if let Some(agent_id) = task.agent_id {
                    self.transport
                        .send(agent_id, ServerMessage::JobStop { task_id: task.id })
                        .await
                        .ok();
                }
            }
            for task in victim_tasks.iter().filter(|t| t.agent_id.is_some()) {
                if let Some(agent_id) = task.agent_id {
                    self.store.park_tasks_for_agent(agent_id).await?;
                }
            }
            self.store.mark_job_interrupted(victim.id, starved.id).await?;
            self.store.set_job_status(victim.id, JobStatus::Paused).await?;
            // One victim per tick is enough; freed agents allocate next tick.
            break;
        }
        Ok(())
    }

    /// Preempted jobs come back once their preemptor reaches a terminal
    /// state: cancelled tasks reset to pending (ranges intact, keyspace
    /// re-accounted) and the job rejoins the queue.
    async fn resume_interrupted_jobs(&self) -> Result<()> {
        for job in self.store.interrupted_jobs().await? {
            let Some(interruptor_id) = job.interrupted_by else {
                continue;
            };
            let done = match self.store.get_job(interruptor_id).await? {
                Some(interruptor) => interruptor.status.is_terminal(),
                None => true,
            };
            if !done {
                continue;
            }
            self.store.reset_tasks_for_job_retry(job.id).await?;
            self.store.clear_job_interruption(job.id).await?;
            self.store.set_job_status(job.id, JobStatus::Pending).await?;
            info!(job_id = %job.id, "preempted job resumed");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Agent pool
    // -----------------------------------------------------------------------

    /// Online, enabled, inside their schedule, session live, and not
    /// already holding a task.
    async fn free_agents(&self) -> Result<Vec<Agent>> {
        let now = chrono::Utc::now();
        let mut free = Vec::new();
        for agent in self.store.list_agents().await? {
            if !agent.is_schedulable_at(now) {
                continue;
            }
            if !self.transport.is_connected(agent.id) {
                continue;
            }
            if self.store.active_task_for_agent(agent.id).await?.is_some() {
                continue;
            }
            free.push(agent);
        }
        Ok(free)
    }
}

/// Highest-priority runnable job that has undispatched work (or undone
/// pending tasks) and no agents on it.
async fn first_starved(jobs: &[Job], store: &StoreDb) -> Result<Option<Job>> {
    for job in jobs {
        let has_work = match (job.effective_keyspace, job.dispatched_keyspace) {
            (Some(eff), dispatched) => dispatched < eff,
            (None, _) => true,
        } || !store.pending_tasks_for_job(job.id).await?.is_empty();
        if !has_work {
            continue;
        }
        if store.active_agent_count_for_job(job.id).await? == 0 {
            return Ok(Some(job.clone()));
        }
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Overflow allocation
// ---------------------------------------------------------------------------

/// Distribute agents beyond the summed `max_agents` of same-priority jobs.
/// FIFO hands all overflow to the oldest job; round-robin cycles.
///
/// Pure so both modes are testable without a store.
pub fn distribute_overflow(
    job_ids: &[Uuid],
    overflow_agents: usize,
    mode: OverflowMode,
) -> HashMap<Uuid, usize> {
    let mut allocation: HashMap<Uuid, usize> = HashMap::new();
    if job_ids.is_empty() || overflow_agents == 0 {
        return allocation;
    }
    match mode {
        OverflowMode::Fifo => {
            allocation.insert(job_ids[0], overflow_agents);
        }
        OverflowMode::RoundRobin => {
            for slot in 0..overflow_agents {
                *allocation.entry(job_ids[slot % job_ids.len()]).or_default() += 1;
            }
        }
    }
    allocation
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_overflow_goes_to_the_oldest_job() {
        let jobs = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let allocation = distribute_overflow(&jobs, 5, OverflowMode::Fifo);
        assert_eq!(allocation.get(&jobs[0]), Some(&5));
        assert_eq!(allocation.get(&jobs[1]), None);
    }

    #[test]
    fn round_robin_overflow_cycles() {
        let jobs = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let allocation = distribute_overflow(&jobs, 5, OverflowMode::RoundRobin);
        assert_eq!(allocation.get(&jobs[0]), Some(&2));
        assert_eq!(allocation.get(&jobs[1]), Some(&2));
        assert_eq!(allocation.get(&jobs[2]), Some(&1));
    }

    #[test]
    fn no_jobs_means_no_allocation() {
        assert!(distribute_overflow(&[], 5, OverflowMode::Fifo).is_empty());
    }
}
