use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use uuid::Uuid;

use kh_core::artifacts::MemoryArtifactStore;
use kh_core::attack::AttackConfig;
use kh_core::types::{Agent, AgentStatus, Hashlist, Job, JobStatus, Task, TaskStatus};
use kh_core::StoreDb;
use kh_daemon::Scheduler;
use kh_engine::transport::RecordingTransport;
use kh_engine::{BenchmarkBroker, CrackIngest, ProgressTracker};
use kh_protocol::{EventBus, ServerMessage};

struct Harness {
    store: Arc<StoreDb>,
    artifacts: Arc<MemoryArtifactStore>,
    transport: Arc<RecordingTransport>,
    tracker: ProgressTracker,
    scheduler: Scheduler,
}

async fn harness() -> Harness {
    let store = Arc::new(StoreDb::new_in_memory().await.expect("in-memory store"));
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let transport = Arc::new(RecordingTransport::new());
    let tracker = ProgressTracker::new(store.clone(), EventBus::new());
    let ingest = CrackIngest::new(store.clone(), tracker.clone());
    // Zero sweep interval: every test tick reconciles agent liveness.
    let scheduler = Scheduler::new(
        store.clone(),
        artifacts.clone(),
        transport.clone(),
        tracker.clone(),
        ingest,
        std::time::Duration::ZERO,
    );
    Harness {
        store,
        artifacts,
        transport,
        tracker,
        scheduler,
    }
}

async fn ready_hashlist(store: &StoreDb, total: u64) -> Hashlist {
    let mut hashlist = Hashlist::new("hl", 0);
    hashlist.total_hashes = total;
    store.upsert_hashlist(&hashlist).await.unwrap();
    store.mark_hashlist_ready(hashlist.id).await.unwrap();
    hashlist.is_ready = true;
    hashlist
}

async fn online_agent(store: &StoreDb, name: &str) -> Agent {
    let mut agent = Agent::new(name);
    agent.status = AgentStatus::Active;
    agent.last_heartbeat = Some(Utc::now());
    store.upsert_agent(&agent).await.unwrap();
    agent
}

fn dictionary_job(hashlist_id: Uuid, wordlist_id: Uuid, keyspace: u64) -> Job {
    let mut job = Job::new(
        "dictionary",
        hashlist_id,
        AttackConfig::Dictionary {
            wordlist_id,
            rule_ids: vec![],
        },
        "tester",
    );
    job.chunk_size_seconds = 10;
    job.base_keyspace = Some(keyspace);
    job.effective_keyspace = Some(keyspace);
    job.total_keyspace = Some(keyspace);
    job
}

fn find_benchmark_request(messages: &[ServerMessage]) -> Option<Uuid> {
    messages.iter().find_map(|m| match m {
        ServerMessage::BenchmarkRequest { request_id, .. } => Some(*request_id),
        _ => None,
    })
}

// ---------------------------------------------------------------------------
// S1: dictionary keyspace-split, single agent
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_agent_dictionary_runs_to_completion() {
    let h = harness().await;
    let hashlist = ready_hashlist(&h.store, 2).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000_000);
    let agent = online_agent(&h.store, "agent-1").await;

    let job = dictionary_job(hashlist.id, wordlist_id, 1_000_000);
    h.store.upsert_job(&job).await.unwrap();

    // Tick 1: the forced benchmark gate issues a probe and defers the job.
    h.scheduler.tick().await.unwrap();
    let forced_id =
        find_benchmark_request(&h.transport.sent_to(agent.id)).expect("forced probe sent");
    assert!(h
        .store
        .tasks_for_job(job.id)
        .await
        .unwrap()
        .is_empty());

    let broker = BenchmarkBroker::new(h.store.as_ref(), h.transport.as_ref());
    broker
        .handle_result(
            forced_id,
            kh_core::types::BenchmarkOutcome {
                keyspace: Some(1_000_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Tick 2: keyspace pinned; the agent still needs a speed benchmark.
    h.scheduler.tick().await.unwrap();
    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert!(job_now.is_accurate_keyspace);

    let speed_id = h
        .transport
        .sent_to(agent.id)
        .iter()
        .skip(1)
        .find_map(|m| match m {
            ServerMessage::BenchmarkRequest { request_id, .. } => Some(*request_id),
            _ => None,
        })
        .expect("speed probe sent");
    broker
        .handle_result(
            speed_id,
            kh_core::types::BenchmarkOutcome {
                speed: Some(100_000),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Tick 3: 100k h/s x 10 s chunks cover the whole 1M wordlist in one task.
    h.scheduler.tick().await.unwrap();
    let tasks = h.store.tasks_for_job(job.id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.keyspace_start, 0);
    assert_eq!(task.keyspace_end, 1_000_000);
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.agent_id, Some(agent.id));
    assert!(h
        .transport
        .sent_to(agent.id)
        .iter()
        .any(|m| matches!(m, ServerMessage::TaskAssign(a) if a.task_id == task.id)));

    // The agent works the chunk to completion.
    h.tracker.handle_task_started(task.id, Utc::now()).await.unwrap();
    h.tracker
        .handle_task_progress(task.id, 1_000_000, Some(100_000), Some(1_000_000))
        .await
        .unwrap();
    h.tracker
        .handle_cracking_completed(task.id, 0, Utc::now())
        .await
        .unwrap();
    h.tracker.handle_batches_complete(task.id).await.unwrap();

    let job_now = h.store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.status, JobStatus::Completed);
    assert_eq!(job_now.processed_keyspace, 1_000_000);
    assert!(job_now.completed_at.is_some());
    assert!(job_now.completed_at >= job_now.cracking_completed_at);

    // No further work is generated.
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.store.tasks_for_job(job.id).await.unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// S4: preemption & resume
// ---------------------------------------------------------------------------

#[tokio::test]
async fn higher_priority_job_preempts_and_victim_resumes() {
    let h = harness().await;
    let hashlist = ready_hashlist(&h.store, 2).await;
    let wordlist_id = h.artifacts.add_wordlist(10_000_000);
    let agent = online_agent(&h.store, "agent-1").await;

    // Job A: running at priority 5, preemptible, with the only agent.
    let mut job_a = dictionary_job(hashlist.id, wordlist_id, 10_000_000);
    job_a.priority = 5;
    job_a.allow_high_priority_override = true;
    job_a.is_accurate_keyspace = true;
    h.store.upsert_job(&job_a).await.unwrap();

    let task_a = Task::new_keyspace_chunk(job_a.id, 0, 1_000_000);
    h.store.create_task_with_dispatch(&task_a, 1_000_000).await.unwrap();
    h.store.try_assign_task(task_a.id, agent.id, Some(100_000)).await.unwrap();
    h.store.record_task_started(task_a.id, Utc::now()).await.unwrap();
    h.store.set_job_status(job_a.id, JobStatus::Running).await.unwrap();

    // Job B: enqueued at priority 8.
    let mut job_b = dictionary_job(hashlist.id, wordlist_id, 10_000_000);
    job_b.name = "urgent".into();
    job_b.priority = 8;
    job_b.is_accurate_keyspace = true;
    h.store.upsert_job(&job_b).await.unwrap();

    h.scheduler.tick().await.unwrap();

    // A's task got a stop command and is parked; A is marked interrupted.
    assert!(h
        .transport
        .sent_to(agent.id)
        .iter()
        .any(|m| matches!(m, ServerMessage::JobStop { task_id } if *task_id == task_a.id)));
    let task_now = h.store.get_task(task_a.id).await.unwrap().unwrap();
    assert_eq!(task_now.status, TaskStatus::ReconnectPending);
    let a_now = h.store.get_job(job_a.id).await.unwrap().unwrap();
    assert_eq!(a_now.interrupted_by, Some(job_b.id));
    assert_eq!(a_now.status, JobStatus::Paused);

    // The agent acknowledges the stop: the parked task finishes cancelled.
    h.store.cancel_task(task_a.id).await.unwrap();

    // B finishes; the next tick resumes A with its keyspace re-accounted.
    h.store.set_job_status(job_b.id, JobStatus::Running).await.unwrap();
    h.store.set_job_status(job_b.id, JobStatus::Completed).await.unwrap();
    h.scheduler.tick().await.unwrap();

    let a_now = h.store.get_job(job_a.id).await.unwrap().unwrap();
    assert_eq!(a_now.status, JobStatus::Pending);
    assert_eq!(a_now.interrupted_by, None);
    let task_now = h.store.get_task(task_a.id).await.unwrap().unwrap();
    assert_eq!(task_now.status, TaskStatus::Pending);
    assert_eq!(task_now.agent_id, None);
    // The re-issued range still covers the same span.
    assert_eq!(task_now.keyspace_start, 0);
    assert_eq!(task_now.keyspace_end, 1_000_000);
}

// ---------------------------------------------------------------------------
// Heartbeat reconciliation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_agent_tasks_park_then_reissue() {
    let h = harness().await;
    let hashlist = ready_hashlist(&h.store, 2).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000_000);

    let mut agent = Agent::new("flaky");
    agent.status = AgentStatus::Active;
    agent.last_heartbeat = Some(Utc::now() - ChronoDuration::seconds(600));
    h.store.upsert_agent(&agent).await.unwrap();

    let mut job = dictionary_job(hashlist.id, wordlist_id, 1_000_000);
    job.is_accurate_keyspace = true;
    h.store.upsert_job(&job).await.unwrap();
    let task = Task::new_keyspace_chunk(job.id, 0, 1_000_000);
    h.store.create_task_with_dispatch(&task, 1_000_000).await.unwrap();
    h.store.try_assign_task(task.id, agent.id, None).await.unwrap();
    h.store.record_task_started(task.id, Utc::now()).await.unwrap();

    // Immediate re-issue once parked past the grace period.
    h.store.set_setting("reconnect_grace_seconds", "0").await.unwrap();

    h.scheduler.tick().await.unwrap();
    let agent_now = h.store.get_agent(agent.id).await.unwrap().unwrap();
    assert_eq!(agent_now.status, AgentStatus::Offline);

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    h.scheduler.tick().await.unwrap();

    let task_now = h.store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_now.status, TaskStatus::Pending);
    assert_eq!(task_now.agent_id, None);
}

// ---------------------------------------------------------------------------
// Estimate gating
// ---------------------------------------------------------------------------

#[tokio::test]
async fn no_tasks_dispatch_before_the_forced_benchmark_lands() {
    let h = harness().await;
    let hashlist = ready_hashlist(&h.store, 2).await;
    let wordlist_id = h.artifacts.add_wordlist(1_000_000);
    let _agent = online_agent(&h.store, "agent-1").await;

    let job = dictionary_job(hashlist.id, wordlist_id, 1_000_000);
    h.store.upsert_job(&job).await.unwrap();

    for _ in 0..3 {
        h.scheduler.tick().await.unwrap();
        assert!(h.store.tasks_for_job(job.id).await.unwrap().is_empty());
    }
    // Exactly one forced probe despite repeated ticks.
    let probes = h
        .store
        .forced_request_for_job(job.id)
        .await
        .unwrap()
        .expect("one probe exists");
    assert_eq!(probes.job_id, Some(job.id));
}
