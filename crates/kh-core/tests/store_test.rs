use chrono::Utc;
use uuid::Uuid;

use kh_core::attack::AttackConfig;
use kh_core::settings::keys;
use kh_core::types::{
    Agent, AttackMode, BenchmarkKind, BenchmarkRecord, BenchmarkRequest, CrackEntry, Hashlist,
    IncrementLayer, Job, OverflowMode, Task,
};
use kh_core::StoreDb;

fn dictionary_job(hashlist_id: Uuid) -> Job {
    Job::new(
        "job",
        hashlist_id,
        AttackConfig::Dictionary {
            wordlist_id: Uuid::new_v4(),
            rule_ids: vec![],
        },
        "tester",
    )
}

#[tokio::test]
async fn hashlist_delete_cascades_to_jobs_tasks_and_layers() {
    let store = StoreDb::new_in_memory().await.unwrap();

    let hashlist = Hashlist::new("hl", 0);
    store.upsert_hashlist(&hashlist).await.unwrap();
    let job = dictionary_job(hashlist.id);
    store.upsert_job(&job).await.unwrap();
    let layer = IncrementLayer::new(job.id, 1, "?l?l", 676);
    store.insert_layer(&layer).await.unwrap();
    let task = Task::new_keyspace_chunk(job.id, 0, 100);
    store.create_task_with_dispatch(&task, 100).await.unwrap();

    let agent = Agent::new("agent");
    store.upsert_agent(&agent).await.unwrap();
    let request = BenchmarkRequest::new(
        agent.id,
        Some(job.id),
        BenchmarkKind::Forced,
        AttackMode::Dictionary,
        0,
    );
    store.insert_benchmark_request(&request).await.unwrap();

    store.delete_hashlist(hashlist.id).await.unwrap();

    assert!(store.get_job(job.id).await.unwrap().is_none());
    assert!(store.get_task(task.id).await.unwrap().is_none());
    assert!(store.get_layer(layer.id).await.unwrap().is_none());
    assert!(store
        .get_benchmark_request(request.id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn benchmark_records_stay_unique_per_tuple() {
    let store = StoreDb::new_in_memory().await.unwrap();
    let agent = Agent::new("agent");
    store.upsert_agent(&agent).await.unwrap();

    for speed in [100, 200] {
        store
            .upsert_benchmark(&BenchmarkRecord {
                agent_id: agent.id,
                attack_mode: AttackMode::Mask,
                hash_type_id: 1000,
                speed,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
    }
    let record = store
        .get_benchmark(agent.id, AttackMode::Mask, 1000)
        .await
        .unwrap()
        .expect("record exists");
    assert_eq!(record.speed, 200);
}

#[tokio::test]
async fn system_settings_round_trip() {
    let store = StoreDb::new_in_memory().await.unwrap();

    let defaults = store.load_system_settings().await.unwrap();
    assert_eq!(defaults.max_job_priority, 1000);
    assert_eq!(defaults.agent_overflow_allocation_mode, OverflowMode::Fifo);

    store.set_setting(keys::MAX_JOB_PRIORITY, "42").await.unwrap();
    store
        .set_setting(keys::AGENT_OVERFLOW_ALLOCATION_MODE, "round_robin")
        .await
        .unwrap();
    store.set_setting(keys::MAX_RETRANSMIT_CYCLES, "7").await.unwrap();

    let loaded = store.load_system_settings().await.unwrap();
    assert_eq!(loaded.max_job_priority, 42);
    assert_eq!(loaded.agent_overflow_allocation_mode, OverflowMode::RoundRobin);
    assert_eq!(loaded.max_retransmit_cycles, 7);

    // Overwrite, not duplicate.
    store.set_setting(keys::MAX_JOB_PRIORITY, "43").await.unwrap();
    assert_eq!(
        store.get_setting(keys::MAX_JOB_PRIORITY).await.unwrap().as_deref(),
        Some("43")
    );
}

#[tokio::test]
async fn task_creation_advances_job_and_layer_dispatch_atomically() {
    let store = StoreDb::new_in_memory().await.unwrap();
    let hashlist = Hashlist::new("hl", 0);
    store.upsert_hashlist(&hashlist).await.unwrap();
    let job = dictionary_job(hashlist.id);
    store.upsert_job(&job).await.unwrap();
    let layer = IncrementLayer::new(job.id, 1, "?l?l?l", 17_576);
    store.insert_layer(&layer).await.unwrap();

    let mut task = Task::new_keyspace_chunk(job.id, 0, 5_000);
    task.increment_layer_id = Some(layer.id);
    store.create_task_with_dispatch(&task, 5_000).await.unwrap();

    let job_now = store.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(job_now.dispatched_keyspace, 5_000);
    let layer_now = store.get_layer(layer.id).await.unwrap().unwrap();
    assert_eq!(layer_now.dispatched_keyspace, 5_000);
}

#[tokio::test]
async fn crack_counters_are_monotone_under_replays() {
    let store = StoreDb::new_in_memory().await.unwrap();
    let hashlist = Hashlist::new("hl", 0);
    store.upsert_hashlist(&hashlist).await.unwrap();
    for i in 0..4 {
        store
            .add_hash(hashlist.id, &format!("h{i}"), None)
            .await
            .unwrap();
    }
    let job = dictionary_job(hashlist.id);
    store.upsert_job(&job).await.unwrap();
    let task = Task::new_keyspace_chunk(job.id, 0, 10);
    store.create_task_with_dispatch(&task, 10).await.unwrap();
    store
        .try_assign_task(task.id, Uuid::new_v4(), None)
        .await
        .unwrap();

    let entries: Vec<CrackEntry> = (0..4)
        .map(|i| CrackEntry {
            hash_value: format!("h{i}"),
            plaintext: format!("p{i}"),
            metadata: None,
        })
        .collect();

    let mut last_received = 0;
    let mut last_cracked = 0;
    for batch in ["b1", "b1", "b2"] {
        let outcome = store
            .ingest_crack_batch(task.id, batch, &entries)
            .await
            .unwrap()
            .unwrap();
        assert!(outcome.received_crack_count >= last_received);
        last_received = outcome.received_crack_count;

        let cracked = store.cracked_hash_count(hashlist.id).await.unwrap();
        assert!(cracked >= last_cracked);
        last_cracked = cracked;
    }

    // Replays and re-deliveries never inflate the persisted count.
    assert_eq!(last_cracked, 4);
    let hashlist_now = store.get_hashlist(hashlist.id).await.unwrap().unwrap();
    assert_eq!(hashlist_now.cracked_hashes, 4);
    assert!(hashlist_now.cracked_hashes <= hashlist_now.total_hashes);

    let task_now = store.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(task_now.received_crack_count, 8);
    assert_eq!(task_now.crack_count, 4);
}

#[tokio::test]
async fn duplicate_hashes_share_one_row_across_lists() {
    let store = StoreDb::new_in_memory().await.unwrap();
    let first = Hashlist::new("first", 0);
    let second = Hashlist::new("second", 0);
    store.upsert_hashlist(&first).await.unwrap();
    store.upsert_hashlist(&second).await.unwrap();

    let id_a = store.add_hash(first.id, "deadbeef", None).await.unwrap();
    let id_b = store.add_hash(second.id, "deadbeef", None).await.unwrap();
    assert_eq!(id_a, id_b);

    assert_eq!(
        store.get_hashlist(first.id).await.unwrap().unwrap().total_hashes,
        1
    );
    assert_eq!(
        store.get_hashlist(second.id).await.unwrap().unwrap().total_hashes,
        1
    );
}
