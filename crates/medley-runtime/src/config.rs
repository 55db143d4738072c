//! Environment-driven configuration.
//!
//! Every knob has a default suitable for a single-node deployment;
//! configuration is read once at boot and treated as immutable afterwards.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use medley_analytics::AppenderConfig;
use medley_broker::StreamConfig;
use medley_detect::{DetectorConfig, NotifierConfig};
use medley_router::HandlerPolicy;
use medley_supervisor::SupervisorConfig;
use medley_wal::consumer::ConsumerWalConfig;
use medley_wal::producer::ProducerWalConfig;

/// Full runtime configuration.
#[derive(Debug, Clone)]
pub struct MedleyConfig {
    /// Producer WAL directory
    pub producer_wal_path: PathBuf,
    /// Consumer WAL directory
    pub consumer_wal_path: PathBuf,
    /// Embedded broker storage directory
    pub broker_path: PathBuf,
    /// Analytics sqlite database file
    pub analytics_db_path: PathBuf,
    /// Stream retention and delivery tuning
    pub stream: StreamConfig,
    /// How often retention enforcement runs
    pub retention_interval: Duration,
    /// Appender batching
    pub appender: AppenderConfig,
    /// Producer WAL tuning
    pub producer_wal: ProducerWalConfig,
    /// Consumer WAL tuning
    pub consumer_wal: ConsumerWalConfig,
    /// Middleware policy shared by the consumer handlers
    pub handler_policy: HandlerPolicy,
    /// Supervisor restart/shutdown tuning
    pub supervisor: SupervisorConfig,
    /// Detector catalog
    pub detectors: Vec<DetectorConfig>,
    /// Notifier sinks
    pub notifiers: Vec<NotifierConfig>,
    /// Notifications per minute per notifier
    pub notifier_rate_per_min: f64,
    /// Daily trust-score decrement
    pub trust_decay: i64,
    /// Cadence of the trust-score recovery ticker
    pub trust_recovery_interval: Duration,
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(text) => text.parse().with_context(|| format!("invalid {key}")),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default_secs: u64) -> Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default_secs)?))
}

impl MedleyConfig {
    /// Read the full configuration from the environment.
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(env_string("MEDLEY_DATA_DIR", "./data"));

        let stream = StreamConfig {
            retention_max_age: env_secs("MEDLEY_STREAM_MAX_AGE_SECS", 7 * 24 * 3600)?,
            retention_max_bytes: env_parse("MEDLEY_STREAM_MAX_BYTES", 1024 * 1024 * 1024u64)?,
            ack_wait: env_secs("MEDLEY_ACK_WAIT_SECS", 30)?,
            max_deliver: env_parse("MEDLEY_MAX_DELIVER", 5u32)?,
            max_in_flight: env_parse("MEDLEY_MAX_IN_FLIGHT", 64usize)?,
        };

        let appender = AppenderConfig {
            batch_size: env_parse("MEDLEY_BATCH_SIZE", 1000usize)?,
            flush_interval: env_secs("MEDLEY_FLUSH_INTERVAL_SECS", 5)?,
        };

        let producer_wal = ProducerWalConfig {
            max_retries: env_parse("MEDLEY_PRODUCER_MAX_RETRIES", 10u32)?,
            retry_base: env_secs("MEDLEY_PRODUCER_RETRY_BASE_SECS", 2)?,
            retry_interval: env_secs("MEDLEY_PRODUCER_RETRY_INTERVAL_SECS", 10)?,
            compaction_interval: env_secs("MEDLEY_COMPACTION_INTERVAL_SECS", 300)?,
            lease_ttl: env_secs("MEDLEY_LEASE_TTL_SECS", 60)?,
        };

        let consumer_wal = ConsumerWalConfig {
            max_retries: env_parse("MEDLEY_CONSUMER_MAX_RETRIES", 10u32)?,
            retry_base: env_secs("MEDLEY_CONSUMER_RETRY_BASE_SECS", 5)?,
            retry_interval: env_secs("MEDLEY_CONSUMER_RETRY_INTERVAL_SECS", 10)?,
            lease_ttl: env_secs("MEDLEY_LEASE_TTL_SECS", 60)?,
        };

        let throttle: f64 = env_parse("MEDLEY_THROTTLE_PER_SEC", 0.0f64)?;
        let handler_policy = HandlerPolicy {
            throttle_per_sec: (throttle > 0.0).then_some(throttle),
            dedup_ttl: env_secs("MEDLEY_DEDUP_TTL_SECS", 600)?,
            max_retries: env_parse("MEDLEY_HANDLER_MAX_RETRIES", 5u32)?,
            retry_base: Duration::from_millis(env_parse("MEDLEY_HANDLER_RETRY_BASE_MS", 250u64)?),
            poison_enabled: env_parse("MEDLEY_POISON_ENABLED", true)?,
        };

        let supervisor = SupervisorConfig {
            failure_threshold: env_parse("MEDLEY_FAILURE_THRESHOLD", 5u32)?,
            failure_backoff: env_secs("MEDLEY_FAILURE_BACKOFF_SECS", 60)?,
            restart_delay: env_secs("MEDLEY_RESTART_DELAY_SECS", 1)?,
            shutdown_deadline: env_secs("MEDLEY_SHUTDOWN_DEADLINE_SECS", 10)?,
        };

        let detectors = match env::var("MEDLEY_DETECTORS") {
            Ok(json) => serde_json::from_str(&json).context("invalid MEDLEY_DETECTORS")?,
            Err(_) => Self::default_detectors(),
        };
        let notifiers = match env::var("MEDLEY_NOTIFIERS") {
            Ok(json) => serde_json::from_str(&json).context("invalid MEDLEY_NOTIFIERS")?,
            Err(_) => Vec::new(),
        };

        let config = Self {
            producer_wal_path: PathBuf::from(env_string(
                "MEDLEY_PRODUCER_WAL_PATH",
                data_dir.join("producer-wal").to_string_lossy().as_ref(),
            )),
            consumer_wal_path: PathBuf::from(env_string(
                "MEDLEY_CONSUMER_WAL_PATH",
                data_dir.join("consumer-wal").to_string_lossy().as_ref(),
            )),
            broker_path: PathBuf::from(env_string(
                "MEDLEY_BROKER_PATH",
                data_dir.join("broker").to_string_lossy().as_ref(),
            )),
            analytics_db_path: PathBuf::from(env_string(
                "MEDLEY_ANALYTICS_DB",
                data_dir.join("analytics.db").to_string_lossy().as_ref(),
            )),
            stream,
            retention_interval: env_secs("MEDLEY_RETENTION_INTERVAL_SECS", 3600)?,
            appender,
            producer_wal,
            consumer_wal,
            handler_policy,
            supervisor,
            detectors,
            notifiers,
            notifier_rate_per_min: env_parse("MEDLEY_NOTIFIER_RATE_PER_MIN", 10.0f64)?,
            trust_decay: env_parse("MEDLEY_TRUST_DECAY", 1i64)?,
            trust_recovery_interval: env_secs("MEDLEY_TRUST_RECOVERY_SECS", 24 * 3600)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Catalog used when `MEDLEY_DETECTORS` is unset.
    pub fn default_detectors() -> Vec<DetectorConfig> {
        vec![
            DetectorConfig::ImpossibleTravel { max_speed_kmh: 900.0 },
            DetectorConfig::ConcurrentStreams { max_streams: 4 },
            DetectorConfig::IpVelocity { max_ips: 5 },
            DetectorConfig::SimultaneousLocations { max_locations: 2 },
            DetectorConfig::UserAgentAnomaly,
            DetectorConfig::VpnUsage,
        ]
    }

    /// Reject configurations that cannot run.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.appender.batch_size > 0, "batch size must be positive");
        anyhow::ensure!(
            !self.appender.flush_interval.is_zero(),
            "flush interval must be positive"
        );
        anyhow::ensure!(self.stream.max_deliver > 0, "max deliver must be positive");
        anyhow::ensure!(
            self.producer_wal_path != self.consumer_wal_path,
            "producer and consumer WALs need separate directories"
        );
        anyhow::ensure!(self.trust_decay >= 0, "trust decay cannot be negative");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_form_a_runnable_config() {
        let config = MedleyConfig::from_env().unwrap();
        assert_eq!(config.appender.batch_size, 1000);
        assert_eq!(config.appender.flush_interval, Duration::from_secs(5));
        assert_eq!(config.stream.retention_max_age, Duration::from_secs(604_800));
        assert_eq!(config.supervisor.shutdown_deadline, Duration::from_secs(10));
        assert!(config.handler_policy.poison_enabled);
        assert!(config.handler_policy.throttle_per_sec.is_none());
        assert!(!config.detectors.is_empty());
    }

    #[test]
    fn wal_directories_must_differ() {
        let mut config = MedleyConfig::from_env().unwrap();
        config.consumer_wal_path = config.producer_wal_path.clone();
        assert!(config.validate().is_err());
    }
}
