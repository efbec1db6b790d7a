use std::fmt;

use storage_driver::StorageError;

/// The outcome of a backend health check, as reported to readiness probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// The backend answered the check.
    Healthy,

    /// The check failed.
    Unhealthy,
}

impl HealthStatus {
    /// The status string readiness checks report.
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    /// Whether the backend is healthy.
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<T> From<&Result<T, StorageError>> for HealthStatus {
    fn from(result: &Result<T, StorageError>) -> Self {
        match result {
            Ok(_) => HealthStatus::Healthy,
            Err(error) => {
                tracing::warn!(%error, "health check failed");
                HealthStatus::Unhealthy
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings() {
        assert_eq!(HealthStatus::Healthy.as_str(), "healthy");
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }

    #[test]
    fn from_result() {
        let ok: Result<(), StorageError> = Ok(());
        assert!(HealthStatus::from(&ok).is_healthy());

        let err: Result<(), StorageError> = Err(StorageError::precondition("test", "down"));
        assert_eq!(HealthStatus::from(&err), HealthStatus::Unhealthy);
    }
}
