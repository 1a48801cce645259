//! Connection lease pool
//!
//! Sessions to the external system are pooled per adapter instance. The
//! pool grows lazily up to `max_size`, evicts idle sessions past their
//! timeout, and bounds concurrently outstanding leases with a semaphore.
//! A lease is an owned guard; dropping it returns the session, so a failing
//! operation can never leak one. Leases are never pooled across distinct
//! effective configurations: `reconfigure` bumps the pool generation and
//! drains gracefully, in-flight leases finish and stale sessions close.

use crate::config::EffectiveConfig;
use crate::error::{Error, Result};
use crate::transport::Transport;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Pool sizing and lifecycle options
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Idle sessions kept warm through eviction
    pub min_size: usize,
    /// Bound on concurrently outstanding leases
    pub max_size: usize,
    /// Idle sessions past this age are closed
    pub idle_timeout: Duration,
    /// How long `acquire` waits before `PoolExhausted`
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    /// Build from an effective configuration
    pub fn from_config(config: &EffectiveConfig) -> Self {
        Self {
            min_size: config.pool_min_size,
            max_size: config.pool_max_size.max(1),
            idle_timeout: config.pool_idle_timeout,
            acquire_timeout: config.pool_acquire_timeout,
        }
    }
}

struct IdleSession<S> {
    session: S,
    generation: u64,
    idle_since: Instant,
}

struct PoolInner<T: Transport> {
    transport: Arc<T>,
    config: RwLock<PoolConfig>,
    idle: Mutex<VecDeque<IdleSession<T::Session>>>,
    semaphore: Arc<Semaphore>,
    generation: AtomicU64,
}

/// Pooled session manager for one adapter instance
pub struct ConnectionLeaseManager<T: Transport> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Transport> Clone for ConnectionLeaseManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> ConnectionLeaseManager<T> {
    /// Create a pool over `transport` sessions
    pub fn new(transport: Arc<T>, config: PoolConfig) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_size));
        Self {
            inner: Arc::new(PoolInner {
                transport,
                config: RwLock::new(config),
                idle: Mutex::new(VecDeque::new()),
                semaphore,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire a lease, blocking up to the configured acquire timeout.
    ///
    /// On timeout returns [`Error::PoolExhausted`], retryable by the
    /// caller's retry policy; the pool never retries internally.
    pub async fn acquire(&self) -> Result<ConnectionLease<T>> {
        let acquire_timeout = self.inner.config.read().acquire_timeout;
        let start = Instant::now();

        let permit = match tokio::time::timeout(
            acquire_timeout,
            self.inner.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Error::Generic("connection pool closed".into())),
            Err(_) => {
                return Err(Error::PoolExhausted {
                    waited_ms: start.elapsed().as_millis() as u64,
                })
            }
        };

        let generation = self.inner.generation.load(Ordering::Acquire);
        let reused = self.pop_idle(generation);

        let session = match reused {
            Some(session) => session,
            // Lazy growth: connect only when no idle session matches
            None => self.inner.transport.connect().await?,
        };

        Ok(ConnectionLease {
            session: Some(session),
            generation,
            inner: self.inner.clone(),
            _permit: permit,
        })
    }

    fn pop_idle(&self, generation: u64) -> Option<T::Session> {
        let mut idle = self.inner.idle.lock();
        while let Some(candidate) = idle.pop_front() {
            if candidate.generation == generation {
                return Some(candidate.session);
            }
            // Stale generation: session closes on drop
            debug!("Closing stale pooled session");
        }
        None
    }

    /// Close idle sessions past the idle timeout, keeping `min_size` warm.
    /// Stale-generation sessions are always closed.
    pub fn evict_idle(&self) {
        let (min_size, idle_timeout) = {
            let config = self.inner.config.read();
            (config.min_size, config.idle_timeout)
        };
        let generation = self.inner.generation.load(Ordering::Acquire);
        let now = Instant::now();

        let mut idle = self.inner.idle.lock();
        idle.retain(|s| s.generation == generation);
        while idle.len() > min_size {
            match idle.front() {
                Some(oldest) if now.duration_since(oldest.idle_since) > idle_timeout => {
                    idle.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Background reaper driving [`evict_idle`](Self::evict_idle)
    pub async fn run_reaper(&self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let period = {
            let idle_timeout = self.inner.config.read().idle_timeout;
            (idle_timeout / 2).max(Duration::from_millis(100))
        };
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => self.evict_idle(),
                _ = shutdown.changed() => break,
            }
        }
    }

    /// Apply a new effective configuration.
    ///
    /// Bumps the pool generation: idle sessions close now, in-flight leases
    /// stay usable until dropped and are then discarded instead of pooled.
    pub fn reconfigure(&self, config: &EffectiveConfig) {
        let new = PoolConfig::from_config(config);
        let old_max = {
            let mut current = self.inner.config.write();
            let old_max = current.max_size;
            *current = new.clone();
            old_max
        };

        self.inner.generation.fetch_add(1, Ordering::AcqRel);
        let drained = {
            let mut idle = self.inner.idle.lock();
            idle.drain(..).count()
        };
        info!(
            "Connection pool reconfigured: {} idle sessions closed, draining in-flight leases",
            drained
        );

        if new.max_size > old_max {
            self.inner.semaphore.add_permits(new.max_size - old_max);
        } else {
            // Shrink by swallowing permits as current holders release them
            for _ in 0..(old_max - new.max_size) {
                let semaphore = self.inner.semaphore.clone();
                tokio::spawn(async move {
                    if let Ok(permit) = semaphore.acquire_owned().await {
                        permit.forget();
                    }
                });
            }
        }
    }

    /// Idle sessions currently pooled
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Leases that could still be handed out right now
    pub fn available_permits(&self) -> usize {
        self.inner.semaphore.available_permits()
    }

    /// Current pool generation (bumped by `reconfigure`)
    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }
}

/// Exclusive handle to one pooled transport session.
///
/// Owned by the acquiring caller until dropped; never shared across
/// concurrent operations.
pub struct ConnectionLease<T: Transport> {
    session: Option<T::Session>,
    generation: u64,
    inner: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Transport> ConnectionLease<T> {
    /// The leased session
    pub fn session_mut(&mut self) -> &mut T::Session {
        self.session.as_mut().expect("session present until drop")
    }

    /// Generation this lease was issued under
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl<T: Transport> Drop for ConnectionLease<T> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if self.generation == self.inner.generation.load(Ordering::Acquire) {
                self.inner.idle.lock().push_back(IdleSession {
                    session,
                    generation: self.generation,
                    idle_since: Instant::now(),
                });
            }
            // Stale generation: session dropped here, closing it
        }
    }
}
