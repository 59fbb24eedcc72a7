use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Default ceiling on concurrently running operations. Callers that know the
/// acceptable request rate of their source should pass an explicit limit.
pub const DEFAULT_LIMIT: usize = 100;

/// Runs a batch of keyed async operations with a bounded number in flight,
/// yielding `(key, result)` pairs in completion order.
///
/// Operations beyond the limit are queued behind a semaphore; their futures are
/// not polled until a permit frees up. Results are consumed with [`Gather::next`]
/// while other operations are still running. Dropping the `Gather` aborts all
/// outstanding work; [`Gather::shutdown`] additionally awaits every aborted task
/// so nothing is left running when the caller bails out mid-consumption.
pub struct Gather<K, T> {
    set: JoinSet<(K, T)>,
    sem: Arc<Semaphore>,
}

impl<K, T> Gather<K, T>
where
    K: Send + 'static,
    T: Send + 'static,
{
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            set: JoinSet::new(),
            sem: Arc::new(Semaphore::new(limit.unwrap_or(DEFAULT_LIMIT))),
        }
    }

    /// Submit one operation. `key` is handed back with the operation's result
    /// so the caller can tell which submission produced it.
    pub fn spawn<F>(&mut self, key: K, op: F)
    where
        F: Future<Output = T> + Send + 'static,
    {
        let sem = Arc::clone(&self.sem);
        self.set.spawn(async move {
            let _permit = sem.acquire_owned().await.expect("semaphore closed");
            (key, op.await)
        });
    }

    /// Next completed operation, or `None` once all have been consumed.
    /// Completion order is arbitrary; submission order does not bound it.
    /// A panicking operation resumes its panic here.
    pub async fn next(&mut self) -> Option<(K, T)> {
        loop {
            match self.set.join_next().await? {
                Ok(pair) => return Some(pair),
                Err(err) if err.is_cancelled() => continue,
                Err(err) => std::panic::resume_unwind(err.into_panic()),
            }
        }
    }

    /// Abort everything still queued or in flight and wait for each task to
    /// finish cancelling. Used when the consumer fails partway through; the
    /// caller propagates its own error after this returns.
    pub async fn shutdown(&mut self) {
        self.set.abort_all();
        while self.set.join_next().await.is_some() {}
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }
}
