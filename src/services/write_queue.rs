//! Single FIFO gate for every mutation against the local store.
//!
//! Callers hand in a unit of work; one worker task runs the jobs strictly in
//! the order they were enqueued and hands each caller back its own result.
//! A job that fails, or panics, only affects its own caller.

use std::future::Future;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Clone)]
pub struct WriteQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl WriteQueue {
    /// Spawn the worker on the current tokio runtime.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_loop(rx));
        Self { tx }
    }

    /// Queue `op` behind every previously enqueued job and wait for its result.
    pub async fn enqueue<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            async move {
                let _ = reply.send(op().await);
            }
            .boxed()
        });

        self.tx
            .send(job)
            .map_err(|_| anyhow!("Write queue is closed"))?;

        rx.await
            .map_err(|_| anyhow!("Write operation aborted before completing"))?
    }

    async fn run_loop(mut rx: mpsc::UnboundedReceiver<Job>) {
        while let Some(job) = rx.recv().await {
            // Each job runs in its own task so a panic is contained to it;
            // awaiting it before the next keeps the order total.
            if let Err(e) = tokio::spawn(job()).await {
                tracing::error!("Write job panicked: {}", e);
            }
        }
        tracing::debug!("Write queue worker exiting");
    }
}

impl Default for WriteQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_runs_in_enqueue_order() {
        let queue = WriteQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut pending = Vec::new();
        for i in 0..10u64 {
            let log = log.clone();
            // Earlier jobs sleep longer; ordering must still follow enqueue order.
            pending.push(queue.enqueue(move || async move {
                tokio::time::sleep(Duration::from_millis(10 - i)).await;
                log.lock().push(i);
                Ok(i)
            }));
        }

        // join_all polls in order, so the jobs are enqueued 0..10.
        let results: Vec<u64> = futures::future::join_all(pending)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_queue() {
        let queue = WriteQueue::new();

        let failed: Result<()> = queue
            .enqueue(|| async { Err(anyhow!("storage rejected transaction")) })
            .await;
        assert!(failed.unwrap_err().to_string().contains("rejected"));

        let ok = queue.enqueue(|| async { Ok(7) }).await.unwrap();
        assert_eq!(ok, 7);
    }

    #[tokio::test]
    async fn test_panicking_job_is_isolated() {
        let queue = WriteQueue::new();

        let result: Result<()> = queue
            .enqueue(|| async { panic!("boom") })
            .await;
        assert!(result.is_err());

        let ok = queue.enqueue(|| async { Ok("still running") }).await.unwrap();
        assert_eq!(ok, "still running");
    }
}
