//! Rate engine: per-(namespace, resource) request-rate limiting.
//!
//! Two algorithms are supported. `token-bucket` refills continuously and
//! answers every admissible request with the time the caller must wait for
//! its tokens; `fixed-window` admits up to `capacity` tokens per interval
//! and rejects the rest with the time until the window rolls over.
//!
//! All time arithmetic goes through the injected [`Clock`]; the engine never
//! consults the wall clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::debug;

use crate::clock::Clock;
use crate::config::{RateConfig, RateStrategyConfig, TimeUnit};
use crate::error::{ConfigError, StorageError};
use crate::metrics::RATE_ALLOW_TOTAL;

pub const TOKEN_BUCKET_ALGORITHM: &str = "token-bucket";
pub const FIXED_WINDOW_ALGORITHM: &str = "fixed-window";

const NANOS_PER_SECOND: i64 = 1_000_000_000;

// ── Token bucket ──────────────────────────────────────────────────────────────

/// Continuous-refill token bucket.
///
/// Tokens are drawn from the accumulated pool first; any remainder is
/// scheduled into the future by advancing `tokens_next_available_nanos`.
/// The returned wait is the lag accrued by earlier scheduling, measured
/// before this request's own remainder is pushed out.
#[derive(Debug)]
struct TokenBucket {
    nanos_between_tokens: i64,
    tokens_next_available_nanos: i64,
    accumulated_tokens: i64,
    capacity: i64,
}

impl TokenBucket {
    fn new(refill_rate_per_second: i64, capacity: i64) -> Self {
        debug_assert!(refill_rate_per_second > 0);
        debug_assert!(capacity > 0);

        Self {
            nanos_between_tokens: NANOS_PER_SECOND / refill_rate_per_second,
            tokens_next_available_nanos: 0,
            accumulated_tokens: capacity,
            capacity,
        }
    }

    fn allow(&mut self, tokens: i64, now_nanos: i64) -> Result<(Duration, bool), StorageError> {
        if tokens > self.capacity {
            return Err(StorageError::TokensExceedCapacity);
        }

        if now_nanos > self.tokens_next_available_nanos {
            let fresh =
                (now_nanos - self.tokens_next_available_nanos) / self.nanos_between_tokens;
            self.accumulated_tokens = self.capacity.min(self.accumulated_tokens + fresh);
            self.tokens_next_available_nanos = now_nanos;
        }

        let wait_nanos = self.tokens_next_available_nanos - now_nanos;

        let from_pool = self.accumulated_tokens.min(tokens);
        let scheduled = tokens - from_pool;
        self.accumulated_tokens -= from_pool;
        self.tokens_next_available_nanos += scheduled * self.nanos_between_tokens;

        Ok((Duration::from_nanos(wait_nanos as u64), true))
    }
}

// ── Fixed window ──────────────────────────────────────────────────────────────

/// Fixed-window counter. The window start is truncated to the interval so
/// windows align across restarts; a call landing exactly on the boundary
/// belongs to the new window.
#[derive(Debug)]
struct FixedWindow {
    window_start_nanos: i64,
    interval_nanos: i64,
    allocated: i64,
    capacity: i64,
}

impl FixedWindow {
    fn new(interval: Duration, capacity: i64) -> Self {
        debug_assert!(!interval.is_zero());
        debug_assert!(capacity > 0);

        Self {
            window_start_nanos: 0,
            interval_nanos: interval.as_nanos() as i64,
            allocated: 0,
            capacity,
        }
    }

    fn allow(&mut self, tokens: i64, now_nanos: i64) -> Result<(Duration, bool), StorageError> {
        if now_nanos >= self.window_start_nanos + self.interval_nanos {
            self.window_start_nanos = now_nanos - now_nanos % self.interval_nanos;
            self.allocated = 0;
        }

        if self.allocated + tokens > self.capacity {
            let window_end = self.window_start_nanos + self.interval_nanos;
            return Ok((Duration::from_nanos((window_end - now_nanos) as u64), false));
        }

        self.allocated += tokens;

        Ok((Duration::ZERO, true))
    }
}

// ── Storage ───────────────────────────────────────────────────────────────────

enum Limiter {
    TokenBucket(Mutex<TokenBucket>),
    FixedWindow(Mutex<FixedWindow>),
}

impl Limiter {
    fn from_config(cfg: &RateStrategyConfig) -> Result<Self, ConfigError> {
        let unit = TimeUnit::parse(&cfg.unit)?;
        if cfg.requests_per_unit <= 0 {
            return Err(ConfigError::Validation(format!(
                "requests_per_unit must be greater than 0, got {}",
                cfg.requests_per_unit
            )));
        }

        match cfg.algorithm.as_str() {
            TOKEN_BUCKET_ALGORITHM => {
                // Normalise to a per-second refill; burst capacity equals one
                // unit's worth of requests.
                let refill = (cfg.requests_per_unit / unit.seconds()).max(1);
                Ok(Limiter::TokenBucket(Mutex::new(TokenBucket::new(
                    refill,
                    cfg.requests_per_unit,
                ))))
            }
            FIXED_WINDOW_ALGORITHM => {
                let interval = Duration::from_secs(unit.seconds() as u64);
                Ok(Limiter::FixedWindow(Mutex::new(FixedWindow::new(
                    interval,
                    cfg.requests_per_unit,
                ))))
            }
            other => Err(ConfigError::UnsupportedAlgorithm(other.to_string())),
        }
    }

    fn allow(&self, tokens: i64, now_nanos: i64) -> Result<(Duration, bool), StorageError> {
        match self {
            Limiter::TokenBucket(b) => b.lock().unwrap().allow(tokens, now_nanos),
            Limiter::FixedWindow(w) => w.lock().unwrap().allow(tokens, now_nanos),
        }
    }
}

/// In-memory rate storage: a map of independently-locked limiters guarded by
/// a reader/writer lock that separates registration from the allow path.
pub struct RateStorage {
    clock: Arc<dyn Clock>,
    limiters: RwLock<HashMap<String, Limiter>>,
}

impl RateStorage {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            limiters: RwLock::new(HashMap::new()),
        }
    }

    pub fn register_quota(
        &self,
        namespace: &str,
        resource: &str,
        cfg: &RateStrategyConfig,
    ) -> Result<(), ConfigError> {
        let id = quota_id(namespace, resource);
        let limiter = Limiter::from_config(cfg)?;

        let mut limiters = self.limiters.write().unwrap();
        // Re-registration keeps the existing bucket and its accrued state.
        limiters.entry(id).or_insert(limiter);

        Ok(())
    }

    pub fn allow(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
    ) -> Result<(Duration, bool), StorageError> {
        let id = quota_id(namespace, resource);
        let now = self.clock.now_nanos();

        let limiters = self.limiters.read().unwrap();
        let limiter = limiters.get(&id).ok_or(StorageError::NotFound)?;

        limiter.allow(tokens, now)
    }
}

/// The routing and storage key for a quota.
pub fn quota_id(namespace: &str, resource: &str) -> String {
    format!("{}_{}", namespace, resource)
}

// ── Service ───────────────────────────────────────────────────────────────────

/// The rate engine service: storage plus startup quota registration.
pub struct RateService {
    storage: RateStorage,
}

impl RateService {
    pub fn new(cfg: &RateConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        if cfg.backend != "memory" {
            return Err(ConfigError::UnsupportedBackend(cfg.backend.clone()));
        }

        let storage = RateStorage::new(clock);
        for quota in &cfg.quotas {
            storage.register_quota(&quota.namespace, &quota.resource, &quota.strategy)?;
        }

        Ok(Self { storage })
    }

    pub fn allow(
        &self,
        namespace: &str,
        resource: &str,
        tokens: i64,
    ) -> Result<(Duration, bool), StorageError> {
        debug!(namespace = %namespace, resource = %resource, tokens = tokens, "allow called");

        let result = self.storage.allow(namespace, resource, tokens);
        if let Ok((_, ok)) = &result {
            RATE_ALLOW_TOTAL
                .with_label_values(&[if *ok { "true" } else { "false" }])
                .inc();
        }

        result
    }
}
