use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Failure from [`with_deadline`]: either the timer won the race or the
/// operation itself failed first. Keeping these distinct lets retry
/// policies treat timeouts specially.
#[derive(Debug)]
pub enum DeadlineError {
    /// The deadline elapsed before the operation settled.
    Elapsed { limit: Duration },
    /// The operation failed on its own before the deadline.
    Inner(anyhow::Error),
}

impl DeadlineError {
    pub fn is_elapsed(&self) -> bool {
        matches!(self, DeadlineError::Elapsed { .. })
    }
}

impl fmt::Display for DeadlineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeadlineError::Elapsed { limit } => {
                write!(f, "deadline of {:.1}s exceeded", limit.as_secs_f64())
            }
            DeadlineError::Inner(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for DeadlineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DeadlineError::Elapsed { .. } => None,
            DeadlineError::Inner(err) => Some(&**err),
        }
    }
}

/// Race `operation` against a timer. Whichever settles first wins.
///
/// Built on `tokio::time::timeout`, so the timer is dropped as soon as
/// either side settles — including when the operation fails before the
/// deadline. A zero `limit` is treated as already expired: the
/// operation is never polled.
pub async fn with_deadline<T, F>(limit: Duration, operation: F) -> Result<T, DeadlineError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    if limit.is_zero() {
        return Err(DeadlineError::Elapsed { limit });
    }
    match tokio::time::timeout(limit, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(DeadlineError::Inner(err)),
        Err(_) => Err(DeadlineError::Elapsed { limit }),
    }
}
