//! Concurrent bulk transfer: walks paginated listings (or a seeded item
//! list), runs items through a bounded in-flight window, re-enqueues
//! retry-marked failures, and aggregates a partial-success summary.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio_util::sync::CancellationToken;

use dxsync_adapters::PageCursor;
use dxsync_core::{ItemFailure, SyncError};

pub type BoxFut<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub concurrency: usize,
    /// How many times one item may be re-enqueued per run.
    pub item_retry_limit: u32,
    pub retry_delay: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            item_retry_limit: 1,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Result of one bulk run. Item errors live here; only setup failures
/// (cannot list) fail the run itself.
#[derive(Debug, Default)]
pub struct Summary {
    pub succeeded: Vec<String>,
    pub failed: Vec<ItemFailure>,
}

impl Summary {
    pub fn clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, mut other: Summary) {
        self.succeeded.append(&mut other.succeeded);
        self.failed.append(&mut other.failed);
    }
}

enum Work<T> {
    Page(PageCursor),
    Item { item: T, attempt: u32 },
}

enum Done<T> {
    Page(Result<(Vec<T>, Option<PageCursor>), SyncError>),
    Item {
        item: T,
        attempt: u32,
        result: Result<String, ItemFailure>,
    },
}

/// Drive a run to completion. `fetch_page` expands a cursor into items and
/// the next cursor; `run_item` performs one transfer and resolves to the
/// item's path. A failure with `retry = true` is re-enqueued (after
/// `retry_delay`) while the per-run budget lasts.
///
/// Cancellation stops intake of new work; in-flight items run to their
/// terminal outcome and stay in the summary.
pub async fn run<T, PF, IF>(
    config: &DriverConfig,
    cancel: &CancellationToken,
    first_page: Option<PageCursor>,
    seed_items: Vec<T>,
    fetch_page: PF,
    run_item: IF,
) -> Result<Summary, SyncError>
where
    T: Clone + Send + 'static,
    PF: Fn(PageCursor) -> BoxFut<Result<(Vec<T>, Option<PageCursor>), SyncError>>,
    IF: Fn(T) -> BoxFut<Result<String, ItemFailure>>,
{
    let mut queue: VecDeque<Work<T>> = VecDeque::new();
    if let Some(cursor) = first_page {
        queue.push_back(Work::Page(cursor));
    }
    for item in seed_items {
        queue.push_back(Work::Item { item, attempt: 0 });
    }

    let mut inflight: FuturesUnordered<BoxFut<Done<T>>> = FuturesUnordered::new();
    let mut summary = Summary::default();
    let width = config.concurrency.max(1);

    loop {
        if cancel.is_cancelled() {
            queue.clear();
        }

        while inflight.len() < width {
            let Some(work) = queue.pop_front() else { break };
            match work {
                Work::Page(cursor) => {
                    let fut = fetch_page(cursor);
                    inflight.push(Box::pin(async move { Done::Page(fut.await) }));
                }
                Work::Item { item, attempt } => {
                    let fut = run_item(item.clone());
                    let delay = (attempt > 0).then_some(config.retry_delay);
                    inflight.push(Box::pin(async move {
                        if let Some(delay) = delay {
                            tokio::time::sleep(delay).await;
                        }
                        Done::Item {
                            item,
                            attempt,
                            result: fut.await,
                        }
                    }));
                }
            }
        }

        let Some(done) = inflight.next().await else { break };
        match done {
            Done::Page(Ok((items, next))) => {
                if !cancel.is_cancelled() {
                    for item in items {
                        queue.push_back(Work::Item { item, attempt: 0 });
                    }
                    if let Some(cursor) = next {
                        queue.push_back(Work::Page(cursor));
                    }
                }
            }
            Done::Page(Err(err)) => {
                // Cannot list: the run itself fails. Let in-flight items
                // finish so their side effects are not torn.
                while inflight.next().await.is_some() {}
                return Err(err);
            }
            Done::Item {
                result: Ok(path), ..
            } => summary.succeeded.push(path),
            Done::Item {
                item,
                attempt,
                result: Err(failure),
            } => {
                if failure.retry && attempt < config.item_retry_limit && !cancel.is_cancelled() {
                    queue.push_back(Work::Item {
                        item,
                        attempt: attempt + 1,
                    });
                } else {
                    summary.failed.push(failure);
                }
            }
        }
    }

    Ok(summary)
}
