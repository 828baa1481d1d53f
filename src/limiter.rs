use std::fmt;
use std::future::Future;

use futures::stream::{self, StreamExt};

/// Default cap on concurrently running tasks when the caller does not
/// specify one.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// One or more tasks in a [`run_limited`] batch failed. Every task was
/// still driven to completion; the per-task errors are attached with
/// their input indices for inspection.
#[derive(Debug)]
pub struct AggregateTaskError {
    pub failed: usize,
    pub total: usize,
    pub errors: Vec<(usize, anyhow::Error)>,
}

impl fmt::Display for AggregateTaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} tasks failed", self.failed, self.total)?;
        if let Some((index, first)) = self.errors.first() {
            write!(f, " (task {}: {})", index, first)?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateTaskError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self.errors.first() {
            Some((_, err)) => Some(&**err),
            None => None,
        }
    }
}

/// Run a batch of independent tasks with at most `limit` in flight.
///
/// Tasks are admitted in input order as slots free up, and the output
/// is index-aligned with the input regardless of completion order. A
/// failing task never cancels its siblings: the whole batch runs to
/// completion, and partial failure is reported as one
/// [`AggregateTaskError`] afterwards.
pub async fn run_limited<T, F, Fut>(
    tasks: Vec<F>,
    limit: usize,
) -> Result<Vec<T>, AggregateTaskError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    if tasks.is_empty() {
        return Ok(Vec::new());
    }
    let total = tasks.len();
    let limit = limit.max(1);

    // `iter` is lazy and `buffered` pulls a new future only when a slot
    // frees, so task closures run at most `limit` at a time, in input
    // order. `buffered` (not `buffer_unordered`) yields results in
    // input order.
    let results: Vec<anyhow::Result<T>> = stream::iter(tasks.into_iter().map(|task| task()))
        .buffered(limit)
        .collect()
        .await;

    let mut values = Vec::with_capacity(total);
    let mut errors = Vec::new();
    for (index, result) in results.into_iter().enumerate() {
        match result {
            Ok(value) => values.push(value),
            Err(err) => errors.push((index, err)),
        }
    }

    if errors.is_empty() {
        Ok(values)
    } else {
        Err(AggregateTaskError {
            failed: errors.len(),
            total,
            errors,
        })
    }
}

/// [`run_limited`] with the default concurrency cap.
pub async fn run_limited_default<T, F, Fut>(tasks: Vec<F>) -> Result<Vec<T>, AggregateTaskError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    run_limited(tasks, DEFAULT_CONCURRENCY).await
}
