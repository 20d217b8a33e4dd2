use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::LoadError;

/// Bounded set of warehouse connections shared by every worker.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

/// A checked-out connection. Dropping it returns the slot to the pool, whether
/// the load succeeded, failed or was cancelled.
#[derive(Debug)]
pub struct PooledConnection {
    _permit: OwnedSemaphorePermit,
    acquired_at: Instant,
}

impl PooledConnection {
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }
}

impl ConnectionPool {
    pub fn new(size: usize, acquire_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub async fn acquire(&self) -> Result<PooledConnection, LoadError> {
        let started = Instant::now();
        match tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned()).await
        {
            Ok(Ok(permit)) => Ok(PooledConnection {
                _permit: permit,
                acquired_at: Instant::now(),
            }),
            Ok(Err(_closed)) => Err(LoadError::Unreachable("connection pool closed".to_string())),
            Err(_elapsed) => Err(LoadError::PoolExhausted {
                waited_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Refuse all further checkouts.
    pub fn close(&self) {
        self.permits.close();
    }
}
