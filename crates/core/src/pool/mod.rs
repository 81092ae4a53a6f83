//! C5 — Connection Pool. Bounded pool of size N for the vector-store
//! client: `tokio::sync::Semaphore` for bounded capacity,
//! `parking_lot::Mutex` for the idle-connection queue, and the Circuit
//! Breaker (C4) wrapping every acquire attempt, backing off retries on
//! transient factory failures.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};

use crate::circuit_breaker::{CallOutcome, CircuitBreakerRegistry};

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("pool acquire timed out")]
    Timeout,
    #[error("pool circuit open")]
    CircuitOpen,
    #[error("factory failed to create connection: {0}")]
    Factory(String),
}

const BREAKER_KEY: &str = "connection-pool";

#[async_trait::async_trait]
pub trait ConnectionFactory<C>: Send + Sync {
    async fn create(&self) -> Result<C, String>;
}

pub struct PooledConnection<'p, C> {
    conn: Option<C>,
    pool: &'p ConnectionPool<C>,
    _permit: SemaphorePermit<'p>,
}

impl<'p, C> std::ops::Deref for PooledConnection<'p, C> {
    type Target = C;
    fn deref(&self) -> &C {
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl<'p, C> std::ops::DerefMut for PooledConnection<'p, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl<'p, C> Drop for PooledConnection<'p, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.idle.lock().push_back(conn);
        }
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct PoolSettings {
    pub size: usize,
    pub acquire_timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
}

/// Release is guaranteed on every exit path through `PooledConnection`'s
/// `Drop` impl, so callers cannot leak a permit by panicking or returning
/// early.
pub struct ConnectionPool<C> {
    factory: Arc<dyn ConnectionFactory<C>>,
    idle: parking_lot::Mutex<VecDeque<C>>,
    semaphore: Semaphore,
    breaker: CircuitBreakerRegistry,
    settings: PoolSettings,
    in_use: AtomicUsize,
    waiting: AtomicUsize,
}

impl<C: Send + 'static> ConnectionPool<C> {
    pub fn new(factory: Arc<dyn ConnectionFactory<C>>, breaker: CircuitBreakerRegistry, settings: PoolSettings) -> Self {
        let size = settings.size;
        Self {
            factory,
            idle: parking_lot::Mutex::new(VecDeque::with_capacity(size)),
            semaphore: Semaphore::new(size),
            breaker,
            settings,
            in_use: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub async fn acquire(&self) -> Result<PooledConnection<'_, C>, PoolError> {
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = tokio::time::timeout(self.settings.acquire_timeout, self.semaphore.acquire())
            .await
            .map_err(|_| PoolError::Timeout)?
            .expect("semaphore not closed");
        self.waiting.fetch_sub(1, Ordering::SeqCst);

        let existing = self.idle.lock().pop_front();
        let conn = match existing {
            Some(c) => c,
            None => self.create_with_retry().await?,
        };

        self.in_use.fetch_add(1, Ordering::SeqCst);
        Ok(PooledConnection { conn: Some(conn), pool: self, _permit: permit })
    }

    async fn create_with_retry(&self) -> Result<C, PoolError> {
        let mut attempt = 0;
        loop {
            let factory = self.factory.clone();
            let result = self.breaker.call(BREAKER_KEY, || async move { factory.create().await }).await;
            match result {
                Ok(conn) => return Ok(conn),
                Err(CallOutcome::Open(_)) => return Err(PoolError::CircuitOpen),
                Err(CallOutcome::Inner(msg)) => {
                    attempt += 1;
                    if attempt > self.settings.max_retries {
                        return Err(PoolError::Factory(msg));
                    }
                    let backoff = self.settings.base_backoff * 2u32.pow(attempt.min(10));
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct CountingFactory {
        created: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait::async_trait]
    impl ConnectionFactory<u32> for CountingFactory {
        async fn create(&self) -> Result<u32, String> {
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err("not yet".into())
            } else {
                Ok(n)
            }
        }
    }

    fn breaker() -> CircuitBreakerRegistry {
        CircuitBreakerRegistry::new(crate::circuit_breaker::BreakerSettings {
            fail_threshold: 10,
            window: Duration::from_secs(10),
            cooldown: Duration::from_millis(10),
        })
    }

    #[tokio::test]
    async fn acquire_and_release_round_trips() {
        let factory = Arc::new(CountingFactory { created: AtomicU32::new(0), fail_first_n: 0 });
        let pool = ConnectionPool::new(
            factory,
            breaker(),
            PoolSettings { size: 2, acquire_timeout: Duration::from_secs(1), max_retries: 1, base_backoff: Duration::from_millis(1) },
        );
        {
            let conn = pool.acquire().await.unwrap();
            assert_eq!(pool.in_use(), 1);
            drop(conn);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn retries_on_transient_factory_failure() {
        let factory = Arc::new(CountingFactory { created: AtomicU32::new(0), fail_first_n: 2 });
        let pool = ConnectionPool::new(
            factory,
            breaker(),
            PoolSettings { size: 1, acquire_timeout: Duration::from_secs(1), max_retries: 5, base_backoff: Duration::from_millis(1) },
        );
        let conn = pool.acquire().await.unwrap();
        assert_eq!(*conn, 2);
    }

    #[tokio::test]
    async fn acquire_times_out_when_saturated() {
        let factory = Arc::new(CountingFactory { created: AtomicU32::new(0), fail_first_n: 0 });
        let pool = Arc::new(ConnectionPool::new(
            factory,
            breaker(),
            PoolSettings { size: 1, acquire_timeout: Duration::from_millis(20), max_retries: 1, base_backoff: Duration::from_millis(1) },
        ));
        let _held = pool.acquire().await.unwrap();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::Timeout)));
    }
}
