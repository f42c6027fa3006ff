//! Process-wide memory budget for in-flight messages.
//!
//! The limit is owned by the client and borrowed by every producer:
//! uncompressed payload bytes are reserved on send and released when the
//! broker acks, the message times out, or the send fails. A limit of zero
//! disables accounting entirely.

use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::error::{Error, Result};

/// Byte-granular admission control shared by all producers of a client.
#[derive(Debug)]
pub struct MemoryLimitController {
    semaphore: Option<Arc<Semaphore>>,
    limit: usize,
}

impl MemoryLimitController {
    /// Create a controller with a total budget of `limit` bytes. Zero
    /// means unlimited.
    pub fn new(limit: usize) -> Self {
        let semaphore = if limit == 0 {
            None
        } else {
            Some(Arc::new(Semaphore::new(limit)))
        };
        MemoryLimitController { semaphore, limit }
    }

    /// Requests larger than the whole budget are clamped so a single
    /// oversized message cannot block forever; the same clamp is applied
    /// on release so accounting stays balanced.
    fn clamp(&self, bytes: usize) -> u32 {
        bytes.min(self.limit).min(u32::MAX as usize) as u32
    }

    /// Reserve `bytes`, waiting until the budget allows it.
    ///
    /// Fails with [`Error::Interrupted`] when the controller is closed
    /// while waiting.
    pub async fn reserve(&self, bytes: usize) -> Result<()> {
        if let Some(semaphore) = &self.semaphore {
            let permits = self.clamp(bytes);
            let permit = semaphore
                .acquire_many(permits)
                .await
                .map_err(|_| Error::Interrupted)?;
            permit.forget();
        }
        Ok(())
    }

    /// Try to reserve `bytes` without waiting.
    pub fn try_reserve(&self, bytes: usize) -> bool {
        match &self.semaphore {
            Some(semaphore) => match semaphore.try_acquire_many(self.clamp(bytes)) {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            },
            None => true,
        }
    }

    /// Return `bytes` to the budget.
    pub fn release(&self, bytes: usize) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.add_permits(self.clamp(bytes) as usize);
        }
    }

    /// Unblock all waiters with [`Error::Interrupted`]. Called on client
    /// shutdown.
    pub fn close(&self) {
        if let Some(semaphore) = &self.semaphore {
            semaphore.close();
        }
    }

    /// Bytes currently available, or `None` when unlimited.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}
