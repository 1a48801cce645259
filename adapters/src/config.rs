//! Layered adapter configuration
//!
//! Every adapter instance resolves its options from three scopes, narrowest
//! first: instance, connector-type global, system default. A key no scope
//! defines falls back to the hard-coded default documented on the matching
//! [`EffectiveConfig`] field. Resolution is a pure function; the resulting
//! struct is immutable for the activation's lifetime.

use crate::error::{Error, Result};
use serde_json::Value;
use std::time::Duration;

/// Configuration scope, narrowest to widest
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfigScope {
    /// Options set on one adapter instance
    Instance,
    /// Options shared by all adapters of one connector type
    TypeGlobal,
    /// Platform-wide defaults
    SystemDefault,
}

/// How an outbound batch is cut
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BatchStrategy {
    /// Flush when the open batch reaches the flush size
    SizeBased,
    /// Flush on the flush interval regardless of size
    TimeBased,
    /// Flush at whichever bound is hit first
    Mixed,
}

/// How a record's dedup identity is derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum DedupStrategy {
    /// Natural name (filename, message id)
    Name,
    /// Checksum of the payload
    Checksum,
    /// Checksum over name plus payload
    Content,
}

/// Refill tier for the token-bucket rate limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RateTier {
    /// Tokens per second
    PerSecond,
    /// Tokens per minute
    PerMinute,
    /// Tokens per hour
    PerHour,
}

impl RateTier {
    /// Length of the refill period
    pub fn period(&self) -> Duration {
        match self {
            RateTier::PerSecond => Duration::from_secs(1),
            RateTier::PerMinute => Duration::from_secs(60),
            RateTier::PerHour => Duration::from_secs(3600),
        }
    }
}

/// One configuration layer: an ordered, named mapping of option key to value
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AdapterConfig {
    /// Layer name (for diagnostics)
    pub name: String,
    /// Scope this layer was loaded at
    pub scope: ConfigScope,
    /// Options in declaration order; first occurrence of a key wins
    pub options: Vec<(String, Value)>,
}

impl AdapterConfig {
    /// Create an empty layer
    pub fn new(name: impl Into<String>, scope: ConfigScope) -> Self {
        Self {
            name: name.into(),
            scope,
            options: Vec::new(),
        }
    }

    /// Add an option (builder style)
    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.options.push((key.into(), value));
        self
    }

    /// First value declared for `key`, if any
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

/// Effective, typed configuration consumed by the rest of the pipeline.
///
/// Documented defaults apply when no scope defines the key.
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    /// `polling.interval.ms` — inbound tick interval (default 30000)
    pub polling_interval: Duration,
    /// `fetch.timeout.ms` — deadline per transport call (default 30000)
    pub fetch_timeout: Duration,
    /// `max.batch.size` — upper bound per fetch (default 100)
    pub max_batch_size: usize,
    /// `retry.max.attempts` — total attempt cap, initial attempt included (default 3)
    pub max_retry_attempts: u32,
    /// `retry.delay.ms` — first retry delay (default 1000)
    pub retry_delay: Duration,
    /// `retry.backoff.multiplier` — exponential factor (default 2.0)
    pub backoff_multiplier: f64,
    /// `retry.max.delay.ms` — backoff cap (default 60000)
    pub max_retry_delay: Duration,
    /// `error.threshold.max` — failures tolerated per window (default 25)
    pub max_error_threshold: u64,
    /// `error.window.secs` — sliding budget window (default 300)
    pub error_window: Duration,
    /// `error.disable.on.exceed` — disable instance on budget trip (default true)
    pub disable_on_exceed: bool,
    /// `dedup.enabled` — duplicate suppression (default false)
    pub dedup_enabled: bool,
    /// `dedup.strategy` — name | checksum | content (default name)
    pub dedup_strategy: DedupStrategy,
    /// `batch.strategy` — size_based | time_based | mixed (default size_based)
    pub batch_strategy: BatchStrategy,
    /// `batch.flush.size` — size bound for outbound batches (default 100)
    pub batch_flush_size: usize,
    /// `batch.flush.interval.ms` — time bound for outbound batches (default 5000)
    pub batch_flush_interval: Duration,
    /// `pool.min.size` — sessions kept warm (default 1)
    pub pool_min_size: usize,
    /// `pool.max.size` — outstanding-lease bound (default 8)
    pub pool_max_size: usize,
    /// `pool.idle.timeout.ms` — idle session eviction (default 60000)
    pub pool_idle_timeout: Duration,
    /// `pool.acquire.timeout.ms` — acquire deadline (default 10000)
    pub pool_acquire_timeout: Duration,
    /// `rate.limit.enabled` — outbound token gate (default false)
    pub rate_limit_enabled: bool,
    /// `rate.limit.capacity` — bucket capacity (default 100)
    pub rate_limit_capacity: u64,
    /// `rate.limit.refill` — tokens added per tier period (default 100)
    pub rate_limit_refill: u64,
    /// `rate.limit.tier` — per_second | per_minute | per_hour (default per_second)
    pub rate_limit_tier: RateTier,
}

/// Resolve the three scopes into one effective configuration.
///
/// For every recognized key, the first non-absent value in order
/// instance -> type-global -> system-default wins. Missing keys never
/// error; a present value that cannot be coerced to the declared type is
/// [`Error::ConfigTypeMismatch`].
pub fn resolve(
    instance: &AdapterConfig,
    type_global: &AdapterConfig,
    system_defaults: &AdapterConfig,
) -> Result<EffectiveConfig> {
    let layers = [instance, type_global, system_defaults];

    Ok(EffectiveConfig {
        polling_interval: millis(&layers, "polling.interval.ms", 30_000)?,
        fetch_timeout: millis(&layers, "fetch.timeout.ms", 30_000)?,
        max_batch_size: u64_opt(&layers, "max.batch.size", 100)? as usize,
        max_retry_attempts: u64_opt(&layers, "retry.max.attempts", 3)? as u32,
        retry_delay: millis(&layers, "retry.delay.ms", 1_000)?,
        backoff_multiplier: f64_opt(&layers, "retry.backoff.multiplier", 2.0)?,
        max_retry_delay: millis(&layers, "retry.max.delay.ms", 60_000)?,
        max_error_threshold: u64_opt(&layers, "error.threshold.max", 25)?,
        error_window: Duration::from_secs(u64_opt(&layers, "error.window.secs", 300)?),
        disable_on_exceed: bool_opt(&layers, "error.disable.on.exceed", true)?,
        dedup_enabled: bool_opt(&layers, "dedup.enabled", false)?,
        dedup_strategy: enum_opt(&layers, "dedup.strategy", DedupStrategy::Name, |s| match s {
            "name" => Some(DedupStrategy::Name),
            "checksum" => Some(DedupStrategy::Checksum),
            "content" => Some(DedupStrategy::Content),
            _ => None,
        })?,
        batch_strategy: enum_opt(&layers, "batch.strategy", BatchStrategy::SizeBased, |s| {
            match s {
                "size_based" => Some(BatchStrategy::SizeBased),
                "time_based" => Some(BatchStrategy::TimeBased),
                "mixed" => Some(BatchStrategy::Mixed),
                _ => None,
            }
        })?,
        batch_flush_size: u64_opt(&layers, "batch.flush.size", 100)? as usize,
        batch_flush_interval: millis(&layers, "batch.flush.interval.ms", 5_000)?,
        pool_min_size: u64_opt(&layers, "pool.min.size", 1)? as usize,
        pool_max_size: u64_opt(&layers, "pool.max.size", 8)? as usize,
        pool_idle_timeout: millis(&layers, "pool.idle.timeout.ms", 60_000)?,
        pool_acquire_timeout: millis(&layers, "pool.acquire.timeout.ms", 10_000)?,
        rate_limit_enabled: bool_opt(&layers, "rate.limit.enabled", false)?,
        rate_limit_capacity: u64_opt(&layers, "rate.limit.capacity", 100)?,
        rate_limit_refill: u64_opt(&layers, "rate.limit.refill", 100)?,
        rate_limit_tier: enum_opt(&layers, "rate.limit.tier", RateTier::PerSecond, |s| match s {
            "per_second" => Some(RateTier::PerSecond),
            "per_minute" => Some(RateTier::PerMinute),
            "per_hour" => Some(RateTier::PerHour),
            _ => None,
        })?,
    })
}

fn lookup<'a>(layers: &[&'a AdapterConfig], key: &str) -> Option<&'a Value> {
    layers.iter().find_map(|layer| layer.get(key))
}

fn mismatch(key: &str, expected: &'static str, value: &Value) -> Error {
    Error::ConfigTypeMismatch {
        key: key.to_string(),
        expected,
        value: value.to_string(),
    }
}

fn u64_opt(layers: &[&AdapterConfig], key: &str, default: u64) -> Result<u64> {
    match lookup(layers, key) {
        None => Ok(default),
        Some(v) => match v {
            Value::Number(n) => n.as_u64().ok_or_else(|| mismatch(key, "u64", v)),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch(key, "u64", v)),
            _ => Err(mismatch(key, "u64", v)),
        },
    }
}

fn f64_opt(layers: &[&AdapterConfig], key: &str, default: f64) -> Result<f64> {
    match lookup(layers, key) {
        None => Ok(default),
        Some(v) => match v {
            Value::Number(n) => n.as_f64().ok_or_else(|| mismatch(key, "f64", v)),
            Value::String(s) => s.trim().parse().map_err(|_| mismatch(key, "f64", v)),
            _ => Err(mismatch(key, "f64", v)),
        },
    }
}

fn bool_opt(layers: &[&AdapterConfig], key: &str, default: bool) -> Result<bool> {
    match lookup(layers, key) {
        None => Ok(default),
        Some(v) => match v {
            Value::Bool(b) => Ok(*b),
            Value::String(s) => match s.trim() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(mismatch(key, "bool", v)),
            },
            _ => Err(mismatch(key, "bool", v)),
        },
    }
}

fn enum_opt<T>(
    layers: &[&AdapterConfig],
    key: &str,
    default: T,
    parse: impl Fn(&str) -> Option<T>,
) -> Result<T> {
    match lookup(layers, key) {
        None => Ok(default),
        Some(v) => match v {
            Value::String(s) => parse(s.trim()).ok_or_else(|| mismatch(key, "enum variant", v)),
            _ => Err(mismatch(key, "enum variant", v)),
        },
    }
}

fn millis(layers: &[&AdapterConfig], key: &str, default: u64) -> Result<Duration> {
    Ok(Duration::from_millis(u64_opt(layers, key, default)?))
}
