//! Error taxonomy for the reading-processing core.
//!
//! Pure components (AQI conversion, rule matching) return these as values so
//! a batch over many rules can isolate a single bad one. Stateful components
//! log them with context and keep going. A missing pollutant is deliberately
//! absent from this enum: it is a non-match, not a failure.

use std::time::Duration;

use thiserror::Error;

// ---

/// Errors produced by the core and its collaborator adapters.
#[derive(Debug, Error)]
pub enum CoreError {
    // ---
    /// Malformed rule, unknown pollutant/operator/channel, or a concentration
    /// outside the accepted domain. Rejected before entering the pipeline.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A lookup by id found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write clashes with stored state: a duplicate id, or a sensor
    /// that still owns readings.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Persistence or fan-out failed or timed out.
    #[error("{dependency} unavailable: {reason}")]
    DependencyUnavailable {
        dependency: &'static str,
        reason: String,
    },

    /// Static configuration is broken (e.g. a breakpoint table with gaps).
    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),
}

impl CoreError {
    // ---
    pub fn invalid(msg: impl Into<String>) -> Self {
        CoreError::InvalidInput(msg.into())
    }

    pub fn unavailable(dependency: &'static str, reason: impl ToString) -> Self {
        CoreError::DependencyUnavailable {
            dependency,
            reason: reason.to_string(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db)
                if db.is_unique_violation() || db.is_foreign_key_violation() =>
            {
                CoreError::Conflict(db.message().to_string())
            }
            other => CoreError::unavailable("database", other),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(e: reqwest::Error) -> Self {
        CoreError::unavailable("sensor api", e)
    }
}

/// Run `fut` with a caller-supplied deadline, mapping the elapsed case to
/// `DependencyUnavailable` for `dependency`.
pub async fn with_timeout<T, F>(
    dependency: &'static str,
    limit: Duration,
    fut: F,
) -> Result<T, CoreError>
where
    F: std::future::Future<Output = Result<T, CoreError>>,
{
    // ---
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(CoreError::unavailable(
            dependency,
            format!("timed out after {} ms", limit.as_millis()),
        )),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_timeout_maps_to_dependency_unavailable() {
        // ---
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, CoreError>(1)
        };
        let err = with_timeout("database", Duration::from_millis(10), slow)
            .await
            .unwrap_err();

        match err {
            CoreError::DependencyUnavailable { dependency, reason } => {
                assert_eq!(dependency, "database");
                assert!(reason.contains("timed out"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_timeout_passes_through_result() {
        // ---
        let fast = async { Ok::<_, CoreError>(7) };
        let value = with_timeout("sink", Duration::from_millis(100), fast).await;
        assert_eq!(value.unwrap(), 7);
    }
}
