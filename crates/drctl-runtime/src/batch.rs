use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use drctl_core::protocol::BatchReport;
use drctl_core::{DrError, Result};

/// Default concurrency limit for batch stages.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Run `work` for every item with at most `concurrency` in flight.
///
/// Each item is keyed by `key` and gets its own outcome in the report; a
/// failing or panicking item never stops its siblings. Items complete in
/// any order, and the report is sorted by key. A key seen twice runs once,
/// for its first item.
pub async fn run_batch<I, T, K, W, Fut>(
    stage: &'static str,
    items: Vec<I>,
    concurrency: usize,
    key: K,
    work: W,
) -> BatchReport<T>
where
    I: Send + 'static,
    T: Send + 'static,
    K: Fn(&I) -> String,
    W: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let concurrency = concurrency.max(1);
    let mut report = BatchReport::default();

    info!(stage, count = items.len(), concurrency, "Starting batch");

    let permits = Arc::new(Semaphore::new(concurrency));
    let mut tasks = JoinSet::new();
    let mut keys = HashMap::new();

    let mut seen = HashSet::new();
    for item in items {
        let item_key = key(&item);
        if !seen.insert(item_key.clone()) {
            debug!(stage, key = %item_key, "Skipping repeated batch item");
            continue;
        }
        let permits = permits.clone();
        let fut = work(item);
        let handle = tasks.spawn(async move {
            // The semaphore is never closed, so this always holds a permit.
            let _permit = permits.acquire_owned().await;
            fut.await
        });
        keys.insert(handle.id(), item_key);
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        match joined {
            Ok((id, result)) => {
                let item_key = keys.remove(&id).unwrap_or_default();
                if let Err(e) = &result {
                    warn!(stage, key = %item_key, error = %e, "Batch item failed");
                }
                report.push(item_key, result);
            }
            Err(join_err) => {
                let item_key = keys.remove(&join_err.id()).unwrap_or_default();
                warn!(stage, key = %item_key, "Batch item panicked");
                report.push_err(
                    item_key,
                    &DrError::Internal(format!("{} task aborted: {}", stage, join_err)),
                );
            }
        }
    }

    info!(
        stage,
        succeeded = report.success_count(),
        failed = report.failure_count(),
        "Batch complete"
    );

    report.sorted()
}
