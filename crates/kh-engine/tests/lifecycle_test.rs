use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use kh_core::artifacts::MemoryArtifactStore;
use kh_core::attack::{AttackConfig, IncrementMode, MaskSpec};
use kh_core::store::JobFilter;
use kh_core::types::{Hashlist, JobStatus, PresetJob, Task, TaskStatus};
use kh_core::{CoreError, StoreDb};
use kh_engine::lifecycle::CreateJobRequest;
use kh_engine::transport::RecordingTransport;
use kh_engine::JobLifecycle;

struct Harness {
    store: Arc<StoreDb>,
    artifacts: Arc<MemoryArtifactStore>,
    transport: Arc<RecordingTransport>,
    lifecycle: JobLifecycle,
}

async fn harness() -> Harness {
    let store = Arc::new(StoreDb::new_in_memory().await.expect("store"));
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let lifecycle = JobLifecycle::new(store.clone(), artifacts.clone(), transport.clone());
    Harness {
        store,
        artifacts,
        transport,
        lifecycle,
    }
}

async fn hashlist_with(store: &StoreDb, total: u64) -> Hashlist {
    let mut hashlist = Hashlist::new("hl", 1000);
    hashlist.total_hashes = total;
    hashlist.is_ready = true;
    store.upsert_hashlist(&hashlist).await.unwrap();
    hashlist
}

fn dictionary_request(hashlist_id: Uuid, wordlist_id: Uuid) -> CreateJobRequest {
    CreateJobRequest {
        name: "test job".into(),
        hashlist_id,
        attack: AttackConfig::Dictionary {
            wordlist_id,
            rule_ids: vec![],
        },
        priority: 10,
        max_agents: 0,
        chunk_size_seconds: Some(600),
        allow_high_priority_override: false,
    }
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_job_persists_plan_and_layers() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;

    let job = h
        .lifecycle
        .create_job(
            CreateJobRequest {
                name: "increment masks".into(),
                hashlist_id: hashlist.id,
                attack: AttackConfig::Mask {
                    mask: MaskSpec::new("?l?l?l?l"),
                    increment_mode: IncrementMode::Increment,
                    increment_min: Some(2),
                    increment_max: Some(4),
                },
                priority: 0,
                max_agents: 2,
                chunk_size_seconds: None,
                allow_high_priority_override: false,
            },
            "user-7",
        )
        .await
        .expect("job created");

    assert_eq!(job.base_keyspace, Some(475_228));
    assert_eq!(job.status, JobStatus::Pending);
    assert!(!job.is_accurate_keyspace);
    assert_eq!(job.created_by, "user-7");

    let layers = h.lifecycle.get_job_layers(job.id).await.unwrap();
    assert_eq!(layers.len(), 3);
    assert_eq!(layers[0].mask, "?l?l");
    assert_eq!(layers[2].base_keyspace, 456_976);
}

#[tokio::test]
async fn create_job_rejects_bad_inputs() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000);

    // Priority beyond the system maximum.
    let mut request = dictionary_request(hashlist.id, wordlist_id);
    request.priority = 100_000;
    assert!(matches!(
        h.lifecycle.create_job(request, "u").await,
        Err(CoreError::Validation(_))
    ));

    // Chunk size outside 5..86400.
    let mut request = dictionary_request(hashlist.id, wordlist_id);
    request.chunk_size_seconds = Some(2);
    assert!(matches!(
        h.lifecycle.create_job(request, "u").await,
        Err(CoreError::Validation(_))
    ));

    // Empty hashlist.
    let empty = hashlist_with(&h.store, 0).await;
    assert!(matches!(
        h.lifecycle
            .create_job(dictionary_request(empty.id, wordlist_id), "u")
            .await,
        Err(CoreError::Validation(_))
    ));

    // Unknown hashlist.
    assert!(matches!(
        h.lifecycle
            .create_job(dictionary_request(Uuid::new_v4(), wordlist_id), "u")
            .await,
        Err(CoreError::NotFound { .. })
    ));

    // Unknown wordlist.
    assert!(matches!(
        h.lifecycle
            .create_job(dictionary_request(hashlist.id, Uuid::new_v4()), "u")
            .await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn association_mode_enforces_one_to_one() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 100).await;
    let wordlist_id = h.artifacts.add_wordlist(99);

    let result = h
        .lifecycle
        .create_job(
            CreateJobRequest {
                name: "assoc".into(),
                hashlist_id: hashlist.id,
                attack: AttackConfig::Association { wordlist_id },
                priority: 0,
                max_agents: 0,
                chunk_size_seconds: None,
                allow_high_priority_override: false,
            },
            "u",
        )
        .await;
    assert!(matches!(result, Err(CoreError::Validation(_))));
}

#[tokio::test]
async fn preset_and_workflow_materialize_jobs() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(10_000);

    let mut preset = PresetJob {
        id: Uuid::new_v4(),
        name: "quick dictionary".into(),
        attack: AttackConfig::Dictionary {
            wordlist_id,
            rule_ids: vec![],
        },
        priority: 3,
        max_agents: 2,
        chunk_size_seconds: 900,
        binary_id: None,
        allow_high_priority_override: true,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    h.store.upsert_preset(&preset).await.unwrap();

    let job = h
        .lifecycle
        .create_job_from_preset(preset.id, hashlist.id, None, "u")
        .await
        .expect("materialized");
    assert_eq!(job.preset_id, Some(preset.id));
    assert_eq!(job.priority, 3);
    assert!(job.allow_high_priority_override);

    // A preset demanding a missing binary is rejected.
    preset.id = Uuid::new_v4();
    preset.name = "needs binary".into();
    preset.binary_id = Some(Uuid::new_v4());
    h.store.upsert_preset(&preset).await.unwrap();
    assert!(matches!(
        h.lifecycle
            .create_job_from_preset(preset.id, hashlist.id, None, "u")
            .await,
        Err(CoreError::NotFound { .. })
    ));

    // Workflows materialize one job per step, in order.
    let workflow = kh_core::types::JobWorkflow {
        id: Uuid::new_v4(),
        name: "full run".into(),
        created_at: Utc::now(),
    };
    let step = |order, preset_id| kh_core::types::JobWorkflowStep {
        id: Uuid::new_v4(),
        workflow_id: workflow.id,
        preset_id,
        step_order: order,
    };
    let first_preset = PresetJob {
        id: Uuid::new_v4(),
        name: "step one".into(),
        binary_id: None,
        ..preset.clone()
    };
    h.store.upsert_preset(&first_preset).await.unwrap();
    h.store
        .insert_workflow(&workflow, &[step(1, first_preset.id), step(2, first_preset.id)])
        .await
        .unwrap();

    let jobs = h
        .lifecycle
        .create_workflow_jobs(workflow.id, hashlist.id, "u")
        .await
        .expect("workflow jobs");
    assert_eq!(jobs.len(), 2);
    assert!(jobs[0].name.ends_with("#1"));
    assert!(jobs[1].name.ends_with("#2"));
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listing_filters_and_pages() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000);

    for i in 0..5 {
        let mut request = dictionary_request(hashlist.id, wordlist_id);
        request.name = format!("job {i}");
        request.priority = i;
        h.lifecycle.create_job(request, "alice").await.unwrap();
    }
    let mut request = dictionary_request(hashlist.id, wordlist_id);
    request.name = "other".into();
    h.lifecycle.create_job(request, "bob").await.unwrap();

    let (page, total) = h
        .lifecycle
        .list_jobs(JobFilter {
            created_by: Some("alice".into()),
            offset: 0,
            limit: Some(3),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 5);
    assert_eq!(page.len(), 3);

    let (search, total) = h
        .lifecycle
        .list_jobs(JobFilter {
            search: Some("other".into()),
            ..JobFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(search[0].created_by, "bob");
}

#[tokio::test]
async fn stop_sends_job_stop_and_cancels() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000_000);
    let job = h
        .lifecycle
        .create_job(dictionary_request(hashlist.id, wordlist_id), "u")
        .await
        .unwrap();

    let agent_id = Uuid::new_v4();
    let task = Task::new_keyspace_chunk(job.id, 0, 500_000);
    h.store.create_task_with_dispatch(&task, 500_000).await.unwrap();
    h.store.try_assign_task(task.id, agent_id, None).await.unwrap();
    h.store.record_task_started(task.id, Utc::now()).await.unwrap();
    h.store.set_job_status(job.id, JobStatus::Running).await.unwrap();

    h.lifecycle.stop_job(job.id, "operator says no").await.unwrap();

    assert!(h
        .transport
        .sent_to(agent_id)
        .iter()
        .any(|m| matches!(m, kh_protocol::ServerMessage::JobStop { .. })));
    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Cancelled);
    assert_eq!(job_now.error_message.as_deref(), Some("operator says no"));
    let task_now = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_now.status, TaskStatus::Cancelled);

    // Stopping twice is a conflict.
    assert!(matches!(
        h.lifecycle.stop_job(job.id, "again").await,
        Err(CoreError::Conflict(_))
    ));
}

#[tokio::test]
async fn retry_resets_tasks_and_reaccounts_keyspace() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000_000);
    let job = h
        .lifecycle
        .create_job(dictionary_request(hashlist.id, wordlist_id), "u")
        .await
        .unwrap();

    let agent_id = Uuid::new_v4();
    let task = Task::new_keyspace_chunk(job.id, 0, 400_000);
    h.store.create_task_with_dispatch(&task, 400_000).await.unwrap();
    h.store.try_assign_task(task.id, agent_id, None).await.unwrap();
    h.store.record_task_started(task.id, Utc::now()).await.unwrap();
    h.store
        .apply_task_progress(task.id, 100_000, None, None, 1)
        .await
        .unwrap();
    h.store.set_job_status(job.id, JobStatus::Running).await.unwrap();

    // Retry before failure is a conflict.
    assert!(matches!(
        h.lifecycle.retry_job(job.id).await,
        Err(CoreError::Conflict(_))
    ));

    h.store.fail_task(task.id, "gpu on fire").await.unwrap();
    h.store.set_job_status(job.id, JobStatus::Failed).await.unwrap();

    h.lifecycle.retry_job(job.id).await.unwrap();
    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Pending);
    assert_eq!(job_now.error_message, None);
    // Processed contribution was rolled back; the range stays dispatched.
    assert_eq!(job_now.processed_keyspace, 0);
    assert_eq!(job_now.dispatched_keyspace, 400_000);

    let task_now = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_now.status, TaskStatus::Pending);
    assert_eq!(task_now.retry_count, 1);
    assert_eq!(task_now.keyspace_processed, 0);
}

#[tokio::test]
async fn pause_parks_and_resume_requeues() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000_000);
    let job = h
        .lifecycle
        .create_job(dictionary_request(hashlist.id, wordlist_id), "u")
        .await
        .unwrap();

    let agent_id = Uuid::new_v4();
    let task = Task::new_keyspace_chunk(job.id, 0, 500_000);
    h.store.create_task_with_dispatch(&task, 500_000).await.unwrap();
    h.store.try_assign_task(task.id, agent_id, None).await.unwrap();
    h.store.set_job_status(job.id, JobStatus::Running).await.unwrap();

    h.lifecycle.pause_job(job.id).await.unwrap();
    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Paused);
    let task_now = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_now.status, TaskStatus::Pending);

    h.lifecycle.resume_job(job.id).await.unwrap();
    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Pending);
}

#[tokio::test]
async fn force_complete_is_an_unconditional_escape() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000_000);
    let job = h
        .lifecycle
        .create_job(dictionary_request(hashlist.id, wordlist_id), "u")
        .await
        .unwrap();

    let task = Task::new_keyspace_chunk(job.id, 0, 100_000);
    h.store.create_task_with_dispatch(&task, 100_000).await.unwrap();
    h.store
        .try_assign_task(task.id, Uuid::new_v4(), None)
        .await
        .unwrap();
    h.store.set_job_status(job.id, JobStatus::Running).await.unwrap();

    h.lifecycle.force_complete(job.id).await.unwrap();
    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Completed);
    assert_eq!(job_now.overall_progress_percent, 100.0);
    let task_now = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_now.status, TaskStatus::Completed);
}

#[tokio::test]
async fn delete_cascades_tasks_and_layers() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let job = h
        .lifecycle
        .create_job(
            CreateJobRequest {
                name: "masks".into(),
                hashlist_id: hashlist.id,
                attack: AttackConfig::Mask {
                    mask: MaskSpec::new("?d?d?d"),
                    increment_mode: IncrementMode::Increment,
                    increment_min: Some(1),
                    increment_max: Some(3),
                },
                priority: 0,
                max_agents: 0,
                chunk_size_seconds: None,
                allow_high_priority_override: false,
            },
            "u",
        )
        .await
        .unwrap();
    let task = Task::new_keyspace_chunk(job.id, 0, 10);
    h.store.create_task_with_dispatch(&task, 10).await.unwrap();

    h.lifecycle.delete_job(job.id).await.unwrap();
    assert!(h.store.get_job(job.id).await.unwrap().is_none());
    assert!(h.store.get_task(task.id).await.unwrap().is_none());
    assert!(h.store.layers_for_job(job.id).await.unwrap().is_empty());

    assert!(matches!(
        h.lifecycle.delete_job(job.id).await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn single_column_mutations_validate() {
    let h = harness().await;
    let hashlist = hashlist_with(&h.store, 5).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000);
    let job = h
        .lifecycle
        .create_job(dictionary_request(hashlist.id, wordlist_id), "u")
        .await
        .unwrap();

    h.lifecycle.set_priority(job.id, 500).await.unwrap();
    h.lifecycle.set_max_agents(job.id, 4).await.unwrap();
    h.lifecycle.set_chunk_size(job.id, 3600).await.unwrap();

    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.priority, 500);
    assert_eq!(job_now.max_agents, 4);
    assert_eq!(job_now.chunk_size_seconds, 3600);

    assert!(matches!(
        h.lifecycle.set_priority(job.id, 99_999).await,
        Err(CoreError::Validation(_))
    ));
    assert!(matches!(
        h.lifecycle.set_chunk_size(job.id, 1).await,
        Err(CoreError::Validation(_))
    ));
    assert!(matches!(
        h.lifecycle.set_priority(Uuid::new_v4(), 1).await,
        Err(CoreError::NotFound { .. })
    ));
}
