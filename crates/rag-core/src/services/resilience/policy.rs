use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::init_cache::InitCache;
use super::memory::MemoryGuard;
use crate::utils::error::{ClassifiedError, ErrorKind};

/// Default per-attempt timeout in seconds.
pub const DEFAULT_TIMEOUT_SECONDS: f64 = 10.0;
/// Default maximum retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;
/// Default base delay for exponential backoff in seconds.
pub const DEFAULT_BACKOFF_BASE_SECONDS: f64 = 0.5;
/// Default cap on a single backoff delay in seconds.
pub const DEFAULT_BACKOFF_MAX_SECONDS: f64 = 8.0;

/// Per call-site policy parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_seconds")]
    pub backoff_base_seconds: f64,
    #[serde(default = "default_backoff_max_seconds")]
    pub backoff_max_seconds: f64,
    /// Kinds worth another attempt. Fatal kinds are never retried even if listed.
    #[serde(default = "default_retryable")]
    pub retryable: Vec<ErrorKind>,
}

fn default_timeout_seconds() -> f64 {
    DEFAULT_TIMEOUT_SECONDS
}
fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}
fn default_backoff_base_seconds() -> f64 {
    DEFAULT_BACKOFF_BASE_SECONDS
}
fn default_backoff_max_seconds() -> f64 {
    DEFAULT_BACKOFF_MAX_SECONDS
}
fn default_retryable() -> Vec<ErrorKind> {
    vec![
        ErrorKind::Timeout,
        ErrorKind::DependencyFailure,
        ErrorKind::RateLimited,
    ]
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_retries: DEFAULT_MAX_RETRIES,
            backoff_base_seconds: DEFAULT_BACKOFF_BASE_SECONDS,
            backoff_max_seconds: DEFAULT_BACKOFF_MAX_SECONDS,
            retryable: default_retryable(),
        }
    }
}

impl PolicyConfig {
    pub fn new(timeout_seconds: f64, max_retries: u32) -> Self {
        Self {
            timeout_seconds,
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_backoff(mut self, base_seconds: f64, max_seconds: f64) -> Self {
        self.backoff_base_seconds = base_seconds;
        self.backoff_max_seconds = max_seconds;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_seconds)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_TIMEOUT_SECONDS))
    }

    pub fn base_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.backoff_base_seconds).unwrap_or(Duration::ZERO)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.backoff_max_seconds).unwrap_or(Duration::ZERO)
    }

    /// `min(base * 2^retry, max)` where `retry` is zero-based.
    pub fn backoff_delay(&self, retry: u32) -> Duration {
        self.base_delay()
            .saturating_mul(2u32.saturating_pow(retry.min(31)))
            .min(self.max_delay())
    }

    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        !kind.is_fatal() && self.retryable.contains(&kind)
    }
}

/// Runs one external call under a fixed pipeline: memory guard, timeout,
/// retry, degradation.
///
/// Holds no per-session or per-key data; the only shared state is the
/// process-wide [`InitCache`].
#[derive(Clone)]
pub struct ResiliencePolicy {
    config: PolicyConfig,
    memory_guard: Option<Arc<MemoryGuard>>,
    init_cache: Arc<InitCache>,
}

impl ResiliencePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self {
            config,
            memory_guard: None,
            init_cache: InitCache::global(),
        }
    }

    pub fn with_memory_guard(mut self, guard: Arc<MemoryGuard>) -> Self {
        self.memory_guard = Some(guard);
        self
    }

    pub fn with_init_cache(mut self, init_cache: Arc<InitCache>) -> Self {
        self.init_cache = init_cache;
        self
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Run `op`, propagating the final classified error.
    pub async fn run<T, F, Fut>(&self, operation: &str, op: F) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.execute(operation, op, None::<fn(&ClassifiedError) -> T>)
            .await
    }

    /// Run `op`, answering with `fallback` once retries are exhausted.
    ///
    /// Fatal kinds (`AUTH_FAILURE`, `INVALID_INPUT`) and a tripped memory guard
    /// still propagate.
    pub async fn run_with_fallback<T, F, Fut, G>(
        &self,
        operation: &str,
        op: F,
        fallback: G,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce(&ClassifiedError) -> T,
    {
        self.execute(operation, op, Some(fallback)).await
    }

    /// Build (once per process) an expensive shared resource under `key`,
    /// guarded by the memory check and the timeout of this policy.
    pub async fn init_once<T, F, Fut>(&self, key: &str, init: F) -> Result<Arc<T>, ClassifiedError>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let timeout = self.config.timeout();
        self.init_cache
            .get_or_try_init(key, || async move {
                if let Some(guard) = &self.memory_guard {
                    guard.check(key)?;
                }
                match tokio::time::timeout(timeout, init()).await {
                    Ok(result) => result.map_err(|e| ClassifiedError::classify(&e)),
                    Err(_) => Err(ClassifiedError::timeout(format!(
                        "initializing '{}' exceeded {:?}",
                        key, timeout
                    ))),
                }
            })
            .await
    }

    async fn execute<T, F, Fut, G>(
        &self,
        operation: &str,
        mut op: F,
        fallback: Option<G>,
    ) -> Result<T, ClassifiedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce(&ClassifiedError) -> T,
    {
        let started = Instant::now();

        // 1. resource guard
        if let Some(guard) = &self.memory_guard {
            if let Err(err) = guard.check(operation) {
                return Err(err.enriched(operation, 0, started.elapsed()));
            }
        }

        let timeout = self.config.timeout();
        let mut attempts: u32 = 0;

        // 2. timeout inside 3. retry
        let last_error = loop {
            attempts += 1;

            let err = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => {
                    debug!(
                        "{} succeeded on attempt {} in {:?}",
                        operation,
                        attempts,
                        started.elapsed()
                    );
                    return Ok(value);
                }
                Ok(Err(e)) => ClassifiedError::classify(&e),
                // Dropping the future cancels it; a late result never surfaces.
                Err(_) => ClassifiedError::timeout(format!(
                    "{} did not complete within {:?}",
                    operation, timeout
                )),
            };

            let retries_used = attempts - 1;
            if !self.config.is_retryable(err.kind()) || retries_used >= self.config.max_retries {
                break err;
            }

            let mut delay = self.config.backoff_delay(retries_used);
            if let Some(hint) = err.retry_after() {
                delay = delay.max(hint).min(self.config.max_delay());
            }

            warn!(
                "{} attempt {} failed ({}), retrying in {:?}",
                operation, attempts, err, delay
            );
            tokio::time::sleep(delay).await;
        };

        let err = last_error.enriched(operation, attempts, started.elapsed());

        // 4. degradation
        match fallback {
            Some(fallback) if !err.kind().is_fatal() => {
                warn!(
                    "{} failed after {} attempt(s) ({}), using fallback",
                    operation, attempts, err
                );
                Ok(fallback(&err))
            }
            _ => {
                error!(
                    "{} failed after {} attempt(s) in {:?}: {}",
                    operation,
                    attempts,
                    err.elapsed(),
                    err
                );
                Err(err)
            }
        }
    }
}
