use crate::types::OverflowMode;

// ---------------------------------------------------------------------------
// Setting keys
// ---------------------------------------------------------------------------

/// Canonical keys in the `system_settings` table. The scheduler re-reads
/// them every tick; nothing caches them across ticks.
pub mod keys {
    pub const MAX_JOB_PRIORITY: &str = "max_job_priority";
    pub const AGENT_OVERFLOW_ALLOCATION_MODE: &str = "agent_overflow_allocation_mode";
    pub const TASK_HEARTBEAT_TIMEOUT: &str = "task_heartbeat_timeout";
    pub const HASHCAT_SPEEDTEST_TIMEOUT: &str = "hashcat_speedtest_timeout";
    pub const RECONNECT_GRACE_SECONDS: &str = "reconnect_grace_seconds";
    pub const DEFAULT_CHUNK_SIZE_SECONDS: &str = "default_chunk_size_seconds";
    pub const MIN_CHUNK_SIZE_SECONDS: &str = "min_chunk_size_seconds";
    pub const CHUNK_FLUCTUATION_PERCENTAGE: &str = "chunk_fluctuation_percentage";
    pub const RULE_SPLIT_THRESHOLD: &str = "rule_split_threshold";
    pub const RULE_SPLIT_MIN_WORDLIST_LINES: &str = "rule_split_min_wordlist_lines";
    pub const MAX_RETRANSMIT_CYCLES: &str = "max_retransmit_cycles";
    pub const BENCHMARK_MAX_AGE_SECONDS: &str = "benchmark_max_age_seconds";
    pub const MAX_TASK_RETRIES: &str = "max_task_retries";
    pub const MAX_KEYSPACE: &str = "max_keyspace";
}

// ---------------------------------------------------------------------------
// SystemSettings
// ---------------------------------------------------------------------------

/// Typed snapshot of the system-settings table, taken once per scheduler
/// tick. Unknown or unparseable values fall back to the defaults below.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSettings {
    /// Upper bound for job priority validation.
    pub max_job_priority: u32,
    /// How overflow agents are distributed across same-priority jobs.
    pub agent_overflow_allocation_mode: OverflowMode,
    /// Seconds without task progress before an agent's task is considered stale.
    pub task_heartbeat_timeout: u64,
    /// Per-benchmark time budget in seconds.
    pub hashcat_speedtest_timeout: u64,
    /// Seconds a reconnect-pending task waits before re-issue.
    pub reconnect_grace_seconds: u64,
    pub default_chunk_size_seconds: u32,
    pub min_chunk_size_seconds: u32,
    /// Residual chunks below this percentage of the target merge into the
    /// previous pending task.
    pub chunk_fluctuation_percentage: u32,
    /// Rule count at or above which a dictionary job may switch to rule
    /// splitting.
    pub rule_split_threshold: u64,
    /// Minimum wordlist size for rule splitting to beat word splitting.
    pub rule_split_min_wordlist_lines: u64,
    /// Retransmit cycles before a processing task completes with a warning.
    pub max_retransmit_cycles: u32,
    /// Speed benchmarks older than this are refreshed.
    pub benchmark_max_age_seconds: u64,
    pub max_task_retries: u32,
    /// Largest representable keyspace; products beyond it are rejected.
    pub max_keyspace: u64,
}

impl Default for SystemSettings {
    fn default() -> Self {
        Self {
            max_job_priority: 1000,
            agent_overflow_allocation_mode: OverflowMode::Fifo,
            task_heartbeat_timeout: 30,
            hashcat_speedtest_timeout: 300,
            reconnect_grace_seconds: 60,
            default_chunk_size_seconds: 1200,
            min_chunk_size_seconds: 5,
            chunk_fluctuation_percentage: 20,
            rule_split_threshold: 10_000,
            rule_split_min_wordlist_lines: 1_000_000,
            max_retransmit_cycles: 3,
            benchmark_max_age_seconds: 7 * 24 * 3600,
            max_task_retries: 3,
            max_keyspace: u64::MAX / 2,
        }
    }
}

impl SystemSettings {
    /// Build a snapshot from raw key/value pairs, falling back to defaults
    /// for missing or malformed entries.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut settings = Self::default();
        for (key, value) in pairs {
            match key {
                keys::MAX_JOB_PRIORITY => parse_into(value, &mut settings.max_job_priority),
                keys::AGENT_OVERFLOW_ALLOCATION_MODE => {
                    if let Some(mode) = OverflowMode::parse(value) {
                        settings.agent_overflow_allocation_mode = mode;
                    }
                }
                keys::TASK_HEARTBEAT_TIMEOUT => {
                    parse_into(value, &mut settings.task_heartbeat_timeout)
                }
                keys::HASHCAT_SPEEDTEST_TIMEOUT => {
                    parse_into(value, &mut settings.hashcat_speedtest_timeout)
                }
                keys::RECONNECT_GRACE_SECONDS => {
                    parse_into(value, &mut settings.reconnect_grace_seconds)
                }
                keys::DEFAULT_CHUNK_SIZE_SECONDS => {
                    parse_into(value, &mut settings.default_chunk_size_seconds)
                }
                keys::MIN_CHUNK_SIZE_SECONDS => {
                    parse_into(value, &mut settings.min_chunk_size_seconds)
                }
                keys::CHUNK_FLUCTUATION_PERCENTAGE => {
                    parse_into(value, &mut settings.chunk_fluctuation_percentage)
                }
                keys::RULE_SPLIT_THRESHOLD => parse_into(value, &mut settings.rule_split_threshold),
                keys::RULE_SPLIT_MIN_WORDLIST_LINES => {
                    parse_into(value, &mut settings.rule_split_min_wordlist_lines)
                }
                keys::MAX_RETRANSMIT_CYCLES => {
                    parse_into(value, &mut settings.max_retransmit_cycles)
                }
                keys::BENCHMARK_MAX_AGE_SECONDS => {
                    parse_into(value, &mut settings.benchmark_max_age_seconds)
                }
                keys::MAX_TASK_RETRIES => parse_into(value, &mut settings.max_task_retries),
                keys::MAX_KEYSPACE => parse_into(value, &mut settings.max_keyspace),
                _ => {}
            }
        }
        settings
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) {
    if let Ok(parsed) = value.parse::<T>() {
        *slot = parsed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_empty() {
        let settings = SystemSettings::from_pairs(std::iter::empty());
        assert_eq!(settings, SystemSettings::default());
    }

    #[test]
    fn overrides_apply() {
        let settings = SystemSettings::from_pairs([
            (keys::MAX_JOB_PRIORITY, "500"),
            (keys::AGENT_OVERFLOW_ALLOCATION_MODE, "round_robin"),
            (keys::TASK_HEARTBEAT_TIMEOUT, "90"),
        ]);
        assert_eq!(settings.max_job_priority, 500);
        assert_eq!(
            settings.agent_overflow_allocation_mode,
            OverflowMode::RoundRobin
        );
        assert_eq!(settings.task_heartbeat_timeout, 90);
    }

    #[test]
    fn malformed_values_fall_back() {
        let settings = SystemSettings::from_pairs([
            (keys::MAX_JOB_PRIORITY, "not-a-number"),
            (keys::AGENT_OVERFLOW_ALLOCATION_MODE, "lottery"),
        ]);
        assert_eq!(settings.max_job_priority, 1000);
        assert_eq!(settings.agent_overflow_allocation_mode, OverflowMode::Fifo);
    }
}
