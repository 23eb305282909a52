//! Task generator: sizes and allocates the next chunk of a job for one
//! agent, on whichever axis the job is split.
//!
//! Chunk size is `benchmark_speed x chunk_size_seconds` candidates on the
//! effective axis. The store advances the job's (and layer's) dispatched
//! keyspace in the same transaction that persists the task, so two agents
//! can never be handed overlapping ranges.

use tracing::debug;

use kh_core::artifacts::ArtifactStore;
use kh_core::attack::AttackConfig;
use kh_core::error::{CoreError, Result};
use kh_core::settings::SystemSettings;
use kh_core::types::{Job, Task};
use kh_core::StoreDb;

pub struct TaskGenerator<'a> {
    store: &'a StoreDb,
    artifacts: &'a dyn ArtifactStore,
}

impl<'a> TaskGenerator<'a> {
    pub fn new(store: &'a StoreDb, artifacts: &'a dyn ArtifactStore) -> Self {
        Self { store, artifacts }
    }

    /// Produce the next task for `job`, ready to assign, or `None` when the
    /// job has no work left to hand out.
    ///
    /// Re-issued tasks (pending with a range already carved out) are
    /// returned before any new range is allocated.
    pub async fn next_task(
        &self,
        job: &Job,
        benchmark_speed: u64,
        settings: &SystemSettings,
    ) -> Result<Option<Task>> {
        // Re-issue before extending the frontier.
        if let Some(pending) = self.store.pending_tasks_for_job(job.id).await?.into_iter().next()
        {
            debug!(task_id = %pending.id, job_id = %job.id, "re-issuing pending task");
            return Ok(Some(pending));
        }

        let Some(effective) = job.effective_keyspace else {
            // No estimate yet; the scheduler gates on the forced benchmark.
            return Ok(None);
        };

        let target = benchmark_speed
            .saturating_mul(job.chunk_size_seconds as u64)
            .max(1);

        if job.uses_rule_splitting {
            self.next_rule_chunk(job, effective, target, settings, benchmark_speed)
                .await
        } else if job.attack.is_incremental() {
            self.next_layer_chunk(job, target, settings, benchmark_speed).await
        } else {
            self.next_keyspace_chunk(job, effective, target, settings, benchmark_speed)
                .await
        }
    }

    // -----------------------------------------------------------------------
    // Keyspace-split allocation
    // -----------------------------------------------------------------------

    async fn next_keyspace_chunk(
        &self,
        job: &Job,
        effective: u64,
        target: u64,
        settings: &SystemSettings,
        benchmark_speed: u64,
    ) -> Result<Option<Task>> {
        let factor = job.multiplication_factor.max(1);
        let total_raw = effective / factor;
        let start_raw = job.dispatched_keyspace / factor;
        if start_raw >= total_raw {
            return Ok(None);
        }

        let chunk_raw = (target / factor).max(1);
        let mut end_raw = start_raw.saturating_add(chunk_raw).min(total_raw);

        // Absorb a tail residue too small to be worth its own task.
        let min_residue = residue_floor(chunk_raw, settings);
        if total_raw - end_raw < min_residue {
            end_raw = total_raw;
        }

        let advance = (end_raw - start_raw).saturating_mul(factor);
        let mut task = Task::new_keyspace_chunk(job.id, start_raw, end_raw);
        task.benchmark_speed = Some(benchmark_speed);
        if factor > 1 {
            task.effective_keyspace_start = Some(start_raw * factor);
            task.effective_keyspace_end = Some(end_raw * factor);
            task.effective_keyspace_processed = Some(0);
        }

        self.store.create_task_with_dispatch(&task, advance).await?;
        debug!(
            task_id = %task.id, job_id = %job.id,
            start = start_raw, end = end_raw, "keyspace chunk allocated"
        );
        Ok(Some(task))
    }

    // -----------------------------------------------------------------------
    // Rule-split allocation
    // -----------------------------------------------------------------------

    async fn next_rule_chunk(
        &self,
        job: &Job,
        effective: u64,
        target: u64,
        settings: &SystemSettings,
        benchmark_speed: u64,
    ) -> Result<Option<Task>> {
        let AttackConfig::Dictionary { wordlist_id, .. } = &job.attack else {
            return Err(CoreError::validation(
                "rule splitting applies to dictionary attacks only",
            ));
        };
        let wordlist = self.artifacts.wordlist(*wordlist_id).await?;
        let lines = wordlist.line_count.max(1);
        let total_rules = job.multiplication_factor.max(1);

        let dispatched_rules = job.dispatched_keyspace / lines;
        if dispatched_rules >= total_rules {
            return Ok(None);
        }

        // Chunk size measured in whole rules, at least one.
        let target_rules = (target / lines).max(1);
        let mut rule_end = dispatched_rules.saturating_add(target_rules).min(total_rules);
        if total_rules - rule_end < residue_floor(target_rules, settings) {
            rule_end = total_rules;
        }

        let effective_start = dispatched_rules * lines;
        let effective_end = rule_end * lines;
        debug_assert!(effective_end <= effective);

        let mut task = Task::new_rule_chunk(
            job.id,
            dispatched_rules,
            rule_end,
            effective_start,
            effective_end,
        );
        task.benchmark_speed = Some(benchmark_speed);

        self.store
            .create_task_with_dispatch(&task, effective_end - effective_start)
            .await?;
        debug!(
            task_id = %task.id, job_id = %job.id,
            rule_start = dispatched_rules, rule_end, "rule chunk allocated"
        );
        Ok(Some(task))
    }

    // -----------------------------------------------------------------------
    // Increment-layer allocation
    // -----------------------------------------------------------------------

    /// Allocate within the lowest-indexed layer that still has undispatched
    /// keyspace; later layers stay untouched until earlier ones are fully
    /// handed out.
    async fn next_layer_chunk(
        &self,
        job: &Job,
        target: u64,
        settings: &SystemSettings,
        benchmark_speed: u64,
    ) -> Result<Option<Task>> {
        let layers = self.store.layers_for_job(job.id).await?;
        let Some(layer) = layers
            .iter()
            .find(|l| l.dispatched_keyspace < l.effective_keyspace)
        else {
            return Ok(None);
        };

        let start = layer.dispatched_keyspace;
        let chunk = target.max(1);
        let mut end = start.saturating_add(chunk).min(layer.effective_keyspace);
        if layer.effective_keyspace - end < residue_floor(chunk, settings) {
            end = layer.effective_keyspace;
        }

        let mut task = Task::new_keyspace_chunk(job.id, start, end);
        task.increment_layer_id = Some(layer.id);
        task.benchmark_speed = Some(benchmark_speed);

        self.store.create_task_with_dispatch(&task, end - start).await?;
        debug!(
            task_id = %task.id, job_id = %job.id, layer_index = layer.layer_index,
            start, end, "layer chunk allocated"
        );
        Ok(Some(task))
    }
}

/// Residues smaller than this many units get absorbed rather than becoming
/// their own task.
fn residue_floor(chunk: u64, settings: &SystemSettings) -> u64 {
    (chunk * settings.chunk_fluctuation_percentage as u64 / 100).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kh_core::artifacts::MemoryArtifactStore;
    use kh_core::types::{Hashlist, IncrementLayer};
    use uuid::Uuid;

    async fn seeded_job(
        store: &StoreDb,
        attack: AttackConfig,
        effective: u64,
        factor: u64,
        rule_split: bool,
    ) -> Job {
        let hashlist = Hashlist::new("hl", 0);
        store.upsert_hashlist(&hashlist).await.unwrap();
        let mut job = Job::new("job", hashlist.id, attack, "tester");
        job.chunk_size_seconds = 10;
        job.effective_keyspace = Some(effective);
        job.base_keyspace = Some(effective / factor.max(1));
        job.multiplication_factor = factor;
        job.uses_rule_splitting = rule_split;
        store.upsert_job(&job).await.unwrap();
        job
    }

    #[tokio::test]
    async fn single_chunk_covers_small_wordlist() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let artifacts = MemoryArtifactStore::new();
        let wordlist_id = artifacts.add_wordlist(1_000_000);
        let job = seeded_job(
            &store,
            AttackConfig::Dictionary {
                wordlist_id,
                rule_ids: vec![],
            },
            1_000_000,
            1,
            false,
        )
        .await;

        let generator = TaskGenerator::new(&store, &artifacts);
        let settings = SystemSettings::default();

        // 100k h/s x 10 s = exactly the whole wordlist.
        let task = generator
            .next_task(&job, 100_000, &settings)
            .await
            .unwrap()
            .expect("one task");
        assert_eq!(task.keyspace_start, 0);
        assert_eq!(task.keyspace_end, 1_000_000);
        store
            .try_assign_task(task.id, Uuid::new_v4(), None)
            .await
            .unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.dispatched_keyspace, 1_000_000);
        assert!(generator
            .next_task(&job, 100_000, &settings)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn chunks_advance_the_frontier_without_overlap() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let artifacts = MemoryArtifactStore::new();
        let wordlist_id = artifacts.add_wordlist(10_000_000);
        let mut job = seeded_job(
            &store,
            AttackConfig::Dictionary {
                wordlist_id,
                rule_ids: vec![],
            },
            10_000_000,
            1,
            false,
        )
        .await;

        let generator = TaskGenerator::new(&store, &artifacts);
        let settings = SystemSettings::default();

        let first = generator
            .next_task(&job, 100_000, &settings)
            .await
            .unwrap()
            .expect("task");
        // Mark assigned so the next call does not just re-issue it.
        store
            .try_assign_task(first.id, Uuid::new_v4(), None)
            .await
            .unwrap();
        job = store.get_job(job.id).await.unwrap().unwrap();

        let second = generator
            .next_task(&job, 100_000, &settings)
            .await
            .unwrap()
            .expect("task");
        assert_eq!(first.keyspace_end, second.keyspace_start);
        assert_eq!(second.keyspace_end - second.keyspace_start, 1_000_000);
    }

    #[tokio::test]
    async fn pending_task_is_reissued_before_new_allocation() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let artifacts = MemoryArtifactStore::new();
        let wordlist_id = artifacts.add_wordlist(10_000_000);
        let job = seeded_job(
            &store,
            AttackConfig::Dictionary {
                wordlist_id,
                rule_ids: vec![],
            },
            10_000_000,
            1,
            false,
        )
        .await;

        let generator = TaskGenerator::new(&store, &artifacts);
        let settings = SystemSettings::default();

        let first = generator
            .next_task(&job, 100_000, &settings)
            .await
            .unwrap()
            .expect("task");
        // Not assigned; a second call must hand back the same task.
        let again = generator
            .next_task(&job, 100_000, &settings)
            .await
            .unwrap()
            .expect("task");
        assert_eq!(first.id, again.id);
    }

    #[tokio::test]
    async fn rule_chunks_partition_the_rule_range() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let artifacts = MemoryArtifactStore::new();
        let wordlist_id = artifacts.add_wordlist(1_000_000);
        // 50 rules, effective 50M.
        let mut job = seeded_job(
            &store,
            AttackConfig::Dictionary {
                wordlist_id,
                rule_ids: vec![],
            },
            50_000_000,
            50,
            true,
        )
        .await;

        let generator = TaskGenerator::new(&store, &artifacts);
        let settings = SystemSettings::default();

        // 100k h/s x 10 s = 1M candidates = exactly 1 rule per chunk.
        let mut covered = Vec::new();
        loop {
            let Some(task) = generator.next_task(&job, 100_000, &settings).await.unwrap() else {
                break;
            };
            assert!(task.is_rule_split_task);
            store
                .try_assign_task(task.id, Uuid::new_v4(), None)
                .await
                .unwrap();
            covered.push((task.rule_start_index.unwrap(), task.rule_end_index.unwrap()));
            job = store.get_job(job.id).await.unwrap().unwrap();
        }

        // Contiguous, non-overlapping cover of [0, 50).
        let mut expected_start = 0;
        for (start, end) in &covered {
            assert_eq!(*start, expected_start);
            assert!(end > start);
            expected_start = *end;
        }
        assert_eq!(expected_start, 50);
    }

    #[tokio::test]
    async fn small_tail_is_absorbed_into_the_last_chunk() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let artifacts = MemoryArtifactStore::new();
        // 1.05M words with 1M-word chunks: the 50k tail is under the 20%
        // fluctuation floor and must not become its own task.
        let wordlist_id = artifacts.add_wordlist(1_050_000);
        let job = seeded_job(
            &store,
            AttackConfig::Dictionary {
                wordlist_id,
                rule_ids: vec![],
            },
            1_050_000,
            1,
            false,
        )
        .await;

        let generator = TaskGenerator::new(&store, &artifacts);
        let settings = SystemSettings::default();

        let task = generator
            .next_task(&job, 100_000, &settings)
            .await
            .unwrap()
            .expect("task");
        assert_eq!(task.keyspace_end, 1_050_000);

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.dispatched_keyspace, 1_050_000);
    }

    #[tokio::test]
    async fn layers_dispatch_in_order() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let artifacts = MemoryArtifactStore::new();
        let hashlist = Hashlist::new("hl", 0);
        store.upsert_hashlist(&hashlist).await.unwrap();

        let mut job = Job::new(
            "masks",
            hashlist.id,
            AttackConfig::Mask {
                mask: kh_core::attack::MaskSpec::new("?l?l?l?l"),
                increment_mode: kh_core::attack::IncrementMode::Increment,
                increment_min: Some(2),
                increment_max: Some(4),
            },
            "tester",
        );
        job.chunk_size_seconds = 10;
        job.effective_keyspace = Some(475_228);
        job.base_keyspace = Some(475_228);
        store.upsert_job(&job).await.unwrap();

        for (index, mask, size) in [
            (1u32, "?l?l", 676u64),
            (2, "?l?l?l", 17_576),
            (3, "?l?l?l?l", 456_976),
        ] {
            store
                .insert_layer(&IncrementLayer::new(job.id, index, mask, size))
                .await
                .unwrap();
        }

        let generator = TaskGenerator::new(&store, &artifacts);
        let settings = SystemSettings::default();
        let layers = store.layers_for_job(job.id).await.unwrap();

        // A slow agent: 50 h/s x 10 s = 500-candidate chunks. Layer 1 has
        // 676 candidates, so the first chunk stays inside layer 1.
        let first = generator
            .next_task(&job, 50, &settings)
            .await
            .unwrap()
            .expect("task");
        assert_eq!(first.increment_layer_id, Some(layers[0].id));
        store
            .try_assign_task(first.id, Uuid::new_v4(), None)
            .await
            .unwrap();

        // Second chunk finishes layer 1 (tail absorbed) before layer 2 opens.
        job = store.get_job(job.id).await.unwrap().unwrap();
        let second = generator
            .next_task(&job, 50, &settings)
            .await
            .unwrap()
            .expect("task");
        assert_eq!(second.increment_layer_id, Some(layers[0].id));
        assert_eq!(second.keyspace_end, 676);
        store
            .try_assign_task(second.id, Uuid::new_v4(), None)
            .await
            .unwrap();

        job = store.get_job(job.id).await.unwrap().unwrap();
        let third = generator
            .next_task(&job, 50, &settings)
            .await
            .unwrap()
            .expect("task");
        assert_eq!(third.increment_layer_id, Some(layers[1].id));
        assert_eq!(third.keyspace_start, 0);
    }
}
