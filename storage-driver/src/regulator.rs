//! A concurrency limiter which drivers hold and enter around every call.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::StorageError;

/// Bounds the number of driver calls which may run at once.
///
/// Cloning a regulator shares the limit.
#[derive(Debug, Clone)]
pub struct Regulator {
    permits: Arc<Semaphore>,
    limit: usize,
}

/// Held for the duration of one regulated call.
#[derive(Debug)]
pub struct RegulatorGuard {
    _permit: OwnedSemaphorePermit,
}

impl Regulator {
    /// Create a regulator allowing `limit` concurrent calls. A limit of zero is raised to one.
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            permits: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Wait for a slot.
    pub async fn enter(&self) -> Result<RegulatorGuard, StorageError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| StorageError::precondition("regulator", "regulator is closed"))?;
        Ok(RegulatorGuard { _permit: permit })
    }

    /// The configured limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of calls currently inside the regulator.
    pub fn in_flight(&self) -> usize {
        self.limit - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn limits_concurrent_entries() {
        let regulator = Regulator::new(2);
        let a = regulator.enter().await.unwrap();
        let _b = regulator.enter().await.unwrap();
        assert_eq!(regulator.in_flight(), 2);

        let blocked = tokio::time::timeout(Duration::from_millis(20), regulator.enter()).await;
        assert!(blocked.is_err());

        drop(a);
        let _c = regulator.enter().await.unwrap();
        assert_eq!(regulator.in_flight(), 2);
    }

    #[test]
    fn zero_limit_is_raised() {
        assert_eq!(Regulator::new(0).limit(), 1);
    }
}
