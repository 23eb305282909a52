//! Benchmark broker: coordinates `agent_speed` and `forced` probes through
//! the benchmark-request table so parallel probes across agents stay
//! discoverable by polling, and the scheduler survives restarts mid-probe.

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use kh_core::error::Result;
use kh_core::settings::SystemSettings;
use kh_core::types::{
    BenchmarkKind, BenchmarkOutcome, BenchmarkRecord, BenchmarkRequest, BenchmarkRequestStatus,
    Job,
};
use kh_core::StoreDb;
use kh_protocol::ServerMessage;

use crate::transport::AgentTransport;

/// Where a job's forced benchmark stands, from the scheduler's viewpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForcedState {
    /// Authoritative keyspace already pinned.
    Ready,
    /// A probe is out; check again next tick. When this call issued the
    /// probe, `probing_agent` names the agent now occupied by it so the
    /// caller can take that agent out of the allocatable pool.
    InFlight { probing_agent: Option<Uuid> },
    /// This call consumed a completed probe and updated the job.
    Applied,
    /// The probe failed; the job carries the error.
    Failed(String),
}

pub struct BenchmarkBroker<'a> {
    store: &'a StoreDb,
    transport: &'a dyn AgentTransport,
}

impl<'a> BenchmarkBroker<'a> {
    pub fn new(store: &'a StoreDb, transport: &'a dyn AgentTransport) -> Self {
        Self { store, transport }
    }

    // -----------------------------------------------------------------------
    // agent_speed
    // -----------------------------------------------------------------------

    /// Return the agent's speed for this config when a fresh benchmark
    /// exists; otherwise make sure exactly one probe is in flight and
    /// return `None`.
    pub async fn ensure_speed_benchmark(
        &self,
        agent_id: Uuid,
        job: &Job,
        hash_type_id: u32,
        settings: &SystemSettings,
    ) -> Result<Option<u64>> {
        let mode = job.attack_mode();
        if let Some(record) = self.store.get_benchmark(agent_id, mode, hash_type_id).await? {
            let age = (Utc::now() - record.updated_at).num_seconds().max(0) as u64;
            if age <= settings.benchmark_max_age_seconds {
                return Ok(Some(record.speed));
            }
        }

        if self
            .store
            .has_pending_speed_request(agent_id, mode, hash_type_id)
            .await?
        {
            return Ok(None);
        }

        let request =
            BenchmarkRequest::new(agent_id, None, BenchmarkKind::AgentSpeed, mode, hash_type_id);
        self.store.insert_benchmark_request(&request).await?;
        self.transport
            .send(
                agent_id,
                ServerMessage::BenchmarkRequest {
                    request_id: request.id,
                    kind: BenchmarkKind::AgentSpeed,
                    hash_type_id,
                    attack: job.attack.clone(),
                },
            )
            .await?;
        info!(agent_id = %agent_id, job_id = %job.id, "speed benchmark requested");
        Ok(None)
    }

    // -----------------------------------------------------------------------
    // forced
    // -----------------------------------------------------------------------

    /// Drive the forced-benchmark state machine for a job. At most one
    /// forced probe exists per job; a completed probe is consumed here,
    /// pinning the authoritative keyspace.
    pub async fn ensure_forced_benchmark(
        &self,
        job: &Job,
        probe_agent: Option<Uuid>,
        hash_type_id: u32,
    ) -> Result<ForcedState> {
        if job.is_accurate_keyspace {
            return Ok(ForcedState::Ready);
        }

        match self.store.forced_request_for_job(job.id).await? {
            None => {
                let Some(agent_id) = probe_agent else {
                    // Nobody available to probe; try again next tick.
                    return Ok(ForcedState::InFlight {
                        probing_agent: None,
                    });
                };
                let request = BenchmarkRequest::new(
                    agent_id,
                    Some(job.id),
                    BenchmarkKind::Forced,
                    job.attack_mode(),
                    hash_type_id,
                );
                self.store.insert_benchmark_request(&request).await?;
                self.transport
                    .send(
                        agent_id,
                        ServerMessage::BenchmarkRequest {
                            request_id: request.id,
                            kind: BenchmarkKind::Forced,
                            hash_type_id,
                            attack: job.attack.clone(),
                        },
                    )
                    .await?;
                info!(job_id = %job.id, agent_id = %agent_id, "forced benchmark requested");
                Ok(ForcedState::InFlight {
                    probing_agent: Some(agent_id),
                })
            }
            Some(request) => match request.status {
                BenchmarkRequestStatus::Pending => Ok(ForcedState::InFlight {
                    probing_agent: None,
                }),
                BenchmarkRequestStatus::Completed => {
                    let outcome = request.outcome.unwrap_or_default();
                    let Some(keyspace) = outcome.keyspace else {
                        warn!(job_id = %job.id, "forced benchmark completed without a keyspace");
                        return Ok(ForcedState::Failed(
                            "forced benchmark returned no keyspace".into(),
                        ));
                    };
                    self.store
                        .apply_forced_keyspace(job.id, keyspace, outcome.layer_keyspaces)
                        .await?;
                    info!(job_id = %job.id, keyspace, "authoritative keyspace pinned");
                    Ok(ForcedState::Applied)
                }
                BenchmarkRequestStatus::Failed => Ok(ForcedState::Failed(
                    request
                        .error_message
                        .unwrap_or_else(|| "benchmark failed".into()),
                )),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Results & housekeeping
    // -----------------------------------------------------------------------

    /// Settle an agent's benchmark result against its request record.
    /// Results for reaped/unknown requests are discarded.
    pub async fn handle_result(
        &self,
        request_id: Uuid,
        outcome: BenchmarkOutcome,
    ) -> Result<()> {
        let Some(request) = self.store.get_benchmark_request(request_id).await? else {
            warn!(request_id = %request_id, "benchmark result for unknown request discarded");
            return Ok(());
        };

        // A result with no usable measurement is a failed probe.
        let usable = match request.kind {
            BenchmarkKind::AgentSpeed => outcome.speed.is_some(),
            BenchmarkKind::Forced => outcome.keyspace.is_some(),
        };
        if !usable {
            self.store
                .fail_benchmark_request(request_id, "agent returned an empty benchmark result")
                .await?;
            return Ok(());
        }

        if !self.store.complete_benchmark_request(request_id, &outcome).await? {
            // Already settled (timeout raced the result); keep the record.
            return Ok(());
        }

        if request.kind == BenchmarkKind::AgentSpeed {
            if let Some(speed) = outcome.speed {
                self.store
                    .upsert_benchmark(&BenchmarkRecord {
                        agent_id: request.agent_id,
                        attack_mode: request.attack_mode,
                        hash_type_id: request.hash_type_id,
                        speed,
                        updated_at: Utc::now(),
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Fail probes that exhausted `hashcat_speedtest_timeout`.
    pub async fn expire_overdue(&self, settings: &SystemSettings) -> Result<Vec<Uuid>> {
        let expired = self
            .store
            .fail_timed_out_benchmark_requests(settings.hashcat_speedtest_timeout)
            .await?;
        for id in &expired {
            warn!(request_id = %id, "benchmark probe exceeded its budget");
        }
        Ok(expired)
    }

    /// Drop settled request records once the scheduler consumed them.
    pub async fn reap(&self, max_age_seconds: u64) -> Result<u64> {
        Ok(self.store.reap_benchmark_requests(max_age_seconds).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingTransport;
    use kh_core::attack::AttackConfig;
    use kh_core::types::Hashlist;

    async fn seeded(store: &StoreDb) -> (Job, kh_core::types::Agent) {
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
        job.dispatched_keyspace = 250_000;
        store.upsert_job(&job).await.unwrap();

        let agent = kh_core::types::Agent::new("agent-1");
        store.upsert_agent(&agent).await.unwrap();
        (job, agent)
    }

    #[tokio::test]
    async fn speed_probe_issued_once_and_settles_into_record() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let transport = RecordingTransport::new();
        let broker = BenchmarkBroker::new(&store, &transport);
        let settings = SystemSettings::default();
        let (job, agent) = seeded(&store).await;

        assert!(broker
            .ensure_speed_benchmark(agent.id, &job, 0, &settings)
            .await
            .unwrap()
            .is_none());
        // Second ask does not duplicate the probe.
        assert!(broker
            .ensure_speed_benchmark(agent.id, &job, 0, &settings)
            .await
            .unwrap()
            .is_none());
        let sent = transport.sent_to(agent.id);
        assert_eq!(sent.len(), 1);
        let ServerMessage::BenchmarkRequest { request_id, .. } = sent[0].clone() else {
            panic!("expected benchmark request");
        };

        broker
            .handle_result(
                request_id,
                BenchmarkOutcome {
                    speed: Some(123_456),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            broker
                .ensure_speed_benchmark(agent.id, &job, 0, &settings)
                .await
                .unwrap(),
            Some(123_456)
        );
    }

    #[tokio::test]
    async fn forced_result_pins_keyspace_and_preserves_dispatch() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let transport = RecordingTransport::new();
        let broker = BenchmarkBroker::new(&store, &transport);
        let (job, agent) = seeded(&store).await;

        assert_eq!(
            broker
                .ensure_forced_benchmark(&job, Some(agent.id), 0)
                .await
                .unwrap(),
            ForcedState::InFlight {
                probing_agent: Some(agent.id)
            }
        );
        // While the probe is pending, no new agent is occupied by it.
        assert_eq!(
            broker
                .ensure_forced_benchmark(&job, Some(agent.id), 0)
                .await
                .unwrap(),
            ForcedState::InFlight {
                probing_agent: None
            }
        );
        let sent = transport.sent_to(agent.id);
        let ServerMessage::BenchmarkRequest { request_id, kind, .. } = sent[0].clone() else {
            panic!("expected benchmark request");
        };
        assert_eq!(kind, BenchmarkKind::Forced);

        broker
            .handle_result(
                request_id,
                BenchmarkOutcome {
                    keyspace: Some(999_999),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            broker
                .ensure_forced_benchmark(&job, Some(agent.id), 0)
                .await
                .unwrap(),
            ForcedState::Applied
        );

        let updated = store.get_job(job.id).await.unwrap().unwrap();
        assert!(updated.is_accurate_keyspace);
        assert_eq!(updated.effective_keyspace, Some(999_999));
        // Already-dispatched work is untouched.
        assert_eq!(updated.dispatched_keyspace, 250_000);
    }

    #[tokio::test]
    async fn late_result_against_reaped_request_is_discarded() {
        let store = StoreDb::new_in_memory().await.unwrap();
        let transport = RecordingTransport::new();
        let broker = BenchmarkBroker::new(&store, &transport);

        broker
            .handle_result(
                Uuid::new_v4(),
                BenchmarkOutcome {
                    speed: Some(1),
                    ..Default::default()
                },
            )
            .await
            .expect("discarded silently");
    }
}
