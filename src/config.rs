use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use rand::Rng;
use url::Url;

/// RetryPolicy: exponential backoff with jitter, shared by every component
/// that retries transient failures locally.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub base: Duration,
    pub factor: u32,
    pub cap: Duration,
    /// Jitter applied to each delay, as a ratio (0.2 means +/-20%).
    pub jitter_ratio: f64,
    pub max_attempts: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base: Duration::from_millis(500),
            factor: 2,
            cap: Duration::from_secs(30),
            jitter_ratio: 0.2,
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), capped, without jitter.
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = self.factor.saturating_pow(attempt.min(u32::MAX as usize) as u32);
        self.base.saturating_mul(factor).min(self.cap)
    }

    /// Jittered delay, the one actually slept.
    pub fn jittered_delay(&self, attempt: usize) -> Duration {
        let delay = self.delay(attempt);
        let jitter = rand::rng().random_range(-self.jitter_ratio..=self.jitter_ratio);
        delay.mul_f64((1.0 + jitter).max(0.0))
    }
}

/// EngineConfig: every resource cap and external endpoint, built once at
/// startup from environment variables. No other code reads the environment.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub ingress_bind: SocketAddr,
    pub ops_bind: SocketAddr,

    pub broker_url: Url,
    pub temp_bucket: String,
    pub registry_url: String,
    pub builder_image: String,
    pub sidecar_image: String,

    pub s3_region: String,
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: String,
    pub s3_secret_access_key: String,

    pub queue_capacity: usize,
    pub worker_count: usize,
    pub jobs_per_second: u32,
    pub max_concurrent_builds_per_namespace: usize,

    pub idempotency_lru_size: usize,
    pub correlation_lock_shards: usize,
    pub correlation_locks_per_shard: usize,

    pub command_deadline: Duration,
    pub build_timeout: Duration,
    pub slot_retention: Duration,
    pub reconcile_interval: Duration,
    pub presign_ttl: Duration,

    pub max_archive_bytes: u64,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ingress_bind: "0.0.0.0:8080".parse().expect("static bind addr"),
            ops_bind: "0.0.0.0:9090".parse().expect("static bind addr"),
            broker_url: Url::parse("http://broker-ingress.knative-eventing.svc.cluster.local/default/default")
                .expect("static broker url"),
            temp_bucket: "lambda-build-contexts".to_string(),
            registry_url: "registry.local:5000".to_string(),
            builder_image: "ghcr.io/lambda-engine/builder:latest".to_string(),
            sidecar_image: "ghcr.io/lambda-engine/sidecar:latest".to_string(),
            s3_region: "us-east-1".to_string(),
            s3_endpoint: None,
            s3_access_key_id: String::new(),
            s3_secret_access_key: String::new(),
            queue_capacity: 64,
            worker_count: 8,
            jobs_per_second: 10,
            max_concurrent_builds_per_namespace: 10,
            idempotency_lru_size: 10_000,
            correlation_lock_shards: 16,
            correlation_locks_per_shard: 1024,
            command_deadline: Duration::from_secs(60),
            build_timeout: Duration::from_secs(30 * 60),
            slot_retention: Duration::from_secs(15 * 60),
            reconcile_interval: Duration::from_secs(60),
            presign_ttl: Duration::from_secs(60 * 60),
            max_archive_bytes: 50 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

fn env_parsed<T: FromStr>(key: &str, default: T) -> Result<T, String> {
    match env::var(key) {
        Ok(raw) => raw.parse::<T>().map_err(|_| format!("invalid value for {key}: `{raw}`")),
        Err(_) => Ok(default),
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration(key: &str, default: Duration) -> Result<Duration, String> {
    match env::var(key) {
        Ok(raw) => duration_str::parse(&raw).map_err(|err| format!("invalid duration for {key}: `{raw}` ({err})")),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Reads `LAMBDA_*` environment variables, falling back to defaults.
    /// Durations accept human form (`60s`, `15m`, `24h`).
    pub fn from_env() -> Result<Self, String> {
        let defaults = EngineConfig::default();

        let broker_url = match env::var("LAMBDA_BROKER_URL") {
            Ok(raw) => Url::parse(&raw).map_err(|err| format!("invalid LAMBDA_BROKER_URL `{raw}`: {err}"))?,
            Err(_) => defaults.broker_url.clone(),
        };

        Ok(EngineConfig {
            ingress_bind: env_parsed("LAMBDA_INGRESS_BIND", defaults.ingress_bind)?,
            ops_bind: env_parsed("LAMBDA_OPS_BIND", defaults.ops_bind)?,
            broker_url,
            temp_bucket: env_string("LAMBDA_TEMP_BUCKET", &defaults.temp_bucket),
            registry_url: env_string("LAMBDA_REGISTRY_URL", &defaults.registry_url),
            builder_image: env_string("LAMBDA_BUILDER_IMAGE", &defaults.builder_image),
            sidecar_image: env_string("LAMBDA_SIDECAR_IMAGE", &defaults.sidecar_image),
            s3_region: env_string("LAMBDA_S3_REGION", &defaults.s3_region),
            s3_endpoint: env::var("LAMBDA_S3_ENDPOINT").ok(),
            s3_access_key_id: env_string("LAMBDA_S3_ACCESS_KEY_ID", ""),
            s3_secret_access_key: env_string("LAMBDA_S3_SECRET_ACCESS_KEY", ""),
            queue_capacity: env_parsed("LAMBDA_QUEUE_CAPACITY", defaults.queue_capacity)?,
            worker_count: env_parsed("LAMBDA_WORKER_COUNT", defaults.worker_count)?,
            jobs_per_second: env_parsed("LAMBDA_JOBS_PER_SECOND", defaults.jobs_per_second)?,
            max_concurrent_builds_per_namespace: env_parsed(
                "LAMBDA_MAX_CONCURRENT_BUILDS_PER_NAMESPACE",
                defaults.max_concurrent_builds_per_namespace,
            )?,
            idempotency_lru_size: env_parsed("LAMBDA_IDEMPOTENCY_LRU_SIZE", defaults.idempotency_lru_size)?,
            correlation_lock_shards: env_parsed("LAMBDA_CORRELATION_LOCK_SHARDS", defaults.correlation_lock_shards)?,
            correlation_locks_per_shard: env_parsed(
                "LAMBDA_CORRELATION_LOCKS_PER_SHARD",
                defaults.correlation_locks_per_shard,
            )?,
            command_deadline: env_duration("LAMBDA_COMMAND_DEADLINE", defaults.command_deadline)?,
            build_timeout: env_duration("LAMBDA_BUILD_TIMEOUT", defaults.build_timeout)?,
            slot_retention: env_duration("LAMBDA_SLOT_RETENTION", defaults.slot_retention)?,
            reconcile_interval: env_duration("LAMBDA_RECONCILE_INTERVAL", defaults.reconcile_interval)?,
            presign_ttl: env_duration("LAMBDA_PRESIGN_TTL", defaults.presign_ttl)?,
            max_archive_bytes: env_parsed("LAMBDA_MAX_ARCHIVE_BYTES", defaults.max_archive_bytes)?,
            retry: RetryPolicy::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_delays_grow_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        // factor 2 from 500ms exceeds the 30s cap at attempt 7
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_ratio() {
        let policy = RetryPolicy::default();
        for attempt in 0..5 {
            let nominal = policy.delay(attempt);
            for _ in 0..50 {
                let jittered = policy.jittered_delay(attempt);
                assert!(jittered >= nominal.mul_f64(0.8).saturating_sub(Duration::from_millis(1)));
                assert!(jittered <= nominal.mul_f64(1.2) + Duration::from_millis(1));
            }
        }
    }

    #[test]
    fn test_defaults_are_bounded() {
        let config = EngineConfig::default();
        assert!(config.queue_capacity > 0);
        assert!(config.worker_count > 0);
        // the reconcile interval must stay under the sidecar publish budget
        assert!(config.reconcile_interval <= Duration::from_secs(5 * 60));
    }
}
