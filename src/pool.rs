//! Bounded connection pools
//!
//! A connection is a semaphore permit. Callers hold the returned guard for
//! the duration of one store call; dropping it on any exit path returns the
//! slot.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StoreSide;
use crate::{Error, Result};

/// Fixed-size pool guarding one store.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    store: StoreSide,
    size: usize,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
}

/// Checked-out connection; released on drop.
#[derive(Debug)]
pub struct PooledConnection {
    store: StoreSide,
    _permit: OwnedSemaphorePermit,
}

impl PooledConnection {
    /// Store this connection belongs to.
    #[must_use]
    pub const fn store(&self) -> StoreSide {
        self.store
    }
}

impl ConnectionPool {
    /// Create a pool of `size` connections.
    #[must_use]
    pub fn new(store: StoreSide, size: usize, acquire_timeout: Duration) -> Self {
        Self {
            store,
            size,
            permits: Arc::new(Semaphore::new(size)),
            acquire_timeout,
        }
    }

    /// Wait for a free connection.
    ///
    /// # Errors
    ///
    /// Pool exhaustion past the acquire timeout is a transient store error.
    pub async fn acquire(&self) -> Result<PooledConnection> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        .map_err(|_| Error::transient(self.store, "connection pool exhausted"))?
        .map_err(|_| Error::transient(self.store, "connection pool closed"))?;

        Ok(PooledConnection {
            store: self.store,
            _permit: permit,
        })
    }

    /// Free connections right now.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Configured size.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}
