//! The write serializer — a single FIFO of labeled mutation closures.
//!
//! Operations run one at a time in submission order on a dedicated worker
//! task, which gives single-writer serializability while reads stay on the
//! pool. Closures always run to completion: a caller timing out (or
//! disconnecting) never cancels a submitted write. Labels exist only for
//! diagnostics.

use crest_common::error::{CrestError, CrestResult};
use futures_util::future::BoxFuture;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

struct QueuedOp {
    label: &'static str,
    run: Box<dyn FnOnce(SqlitePool) -> BoxFuture<'static, ()> + Send>,
}

/// Outcome of a soft-deadline submission.
#[derive(Debug)]
pub enum Submit<T> {
    /// The closure finished within the deadline.
    Completed(CrestResult<T>),
    /// The deadline elapsed first. The closure is still queued or running
    /// and will complete; callers should acknowledge and move on.
    Accepted,
}

/// Handle to the single-writer FIFO. Cheap to clone.
#[derive(Clone)]
pub struct WriteSerializer {
    tx: mpsc::UnboundedSender<QueuedOp>,
    depth: Arc<AtomicUsize>,
    default_deadline: Duration,
}

impl WriteSerializer {
    /// Spawn the worker task and return the handle.
    pub fn spawn(pool: SqlitePool, default_deadline: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedOp>();
        let depth = Arc::new(AtomicUsize::new(0));
        let worker_depth = depth.clone();

        tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let started = Instant::now();
                (op.run)(pool.clone()).await;
                worker_depth.fetch_sub(1, Ordering::Relaxed);
                let elapsed = started.elapsed();
                if elapsed > Duration::from_millis(500) {
                    tracing::warn!(label = op.label, ?elapsed, "slow write operation");
                } else {
                    tracing::trace!(label = op.label, ?elapsed, "write operation complete");
                }
            }
            tracing::debug!("write serializer channel closed; worker exiting");
        });

        Self {
            tx,
            depth,
            default_deadline,
        }
    }

    /// Number of operations queued or running. Backpressure surface.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    fn submit<T, F, Fut>(&self, label: &'static str, op: F) -> oneshot::Receiver<CrestResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = CrestResult<T>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedOp {
            label,
            run: Box::new(move |pool| {
                Box::pin(async move {
                    let result = op(pool).await;
                    // The caller may have timed out and dropped the receiver;
                    // the write has still happened.
                    let _ = done_tx.send(result);
                })
            }),
        };
        self.depth.fetch_add(1, Ordering::Relaxed);
        if self.tx.send(queued).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            tracing::error!(label, "write serializer worker is gone");
        }
        done_rx
    }

    /// Enqueue a mutation and wait for it, bounded by the default deadline.
    /// A deadline hit surfaces as [`CrestError::WriteTimeout`]; the closure
    /// itself keeps running to completion.
    pub async fn enqueue<T, F, Fut>(&self, label: &'static str, op: F) -> CrestResult<T>
    where
        T: Send + 'static,
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = CrestResult<T>> + Send + 'static,
    {
        let rx = self.submit(label, op);
        match tokio::time::timeout(self.default_deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_recv)) => Err(CrestError::Internal(anyhow::anyhow!(
                "write serializer dropped operation `{label}`"
            ))),
            Err(_elapsed) => Err(CrestError::WriteTimeout { label }),
        }
    }

    /// Enqueue a mutation without waiting for it. The operation is still
    /// ordered in the FIFO; used for side-effect bumps (e.g. `last_used`)
    /// where the caller has nothing to do with the result.
    pub fn enqueue_detached<F, Fut>(&self, label: &'static str, op: F)
    where
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = CrestResult<()>> + Send + 'static,
    {
        let _ = self.submit(label, op);
    }

    /// Enqueue a mutation with a soft deadline. If the deadline elapses the
    /// caller gets [`Submit::Accepted`] while the closure continues in the
    /// background, still ordered with respect to later submissions.
    pub async fn enqueue_soft<T, F, Fut>(
        &self,
        label: &'static str,
        soft_deadline: Duration,
        op: F,
    ) -> Submit<T>
    where
        T: Send + 'static,
        F: FnOnce(SqlitePool) -> Fut + Send + 'static,
        Fut: Future<Output = CrestResult<T>> + Send + 'static,
    {
        let rx = self.submit(label, op);
        match tokio::time::timeout(soft_deadline, rx).await {
            Ok(Ok(result)) => Submit::Completed(result),
            Ok(Err(_recv)) => Submit::Completed(Err(CrestError::Internal(anyhow::anyhow!(
                "write serializer dropped operation `{label}`"
            )))),
            Err(_elapsed) => {
                tracing::debug!(label, "soft deadline elapsed; returning Accepted");
                Submit::Accepted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::sync::atomic::AtomicU64;

    async fn test_pool() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn operations_run_in_submission_order() {
        let pool = test_pool().await;
        let ser = WriteSerializer::spawn(pool, Duration::from_secs(5));
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..10u64 {
            let order = order.clone();
            handles.push(ser.enqueue("test-order", move |_pool| async move {
                order.lock().unwrap().push(i);
                Ok(i)
            }));
        }
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.await.unwrap(), i as u64);
        }
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn soft_deadline_returns_accepted_but_completes() {
        let pool = test_pool().await;
        let ser = WriteSerializer::spawn(pool, Duration::from_secs(5));
        let counter = Arc::new(AtomicU64::new(0));

        let c = counter.clone();
        let outcome = ser
            .enqueue_soft("slow-op", Duration::from_millis(20), move |_pool| async move {
                tokio::time::sleep(Duration::from_millis(120)).await;
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(outcome, Submit::Accepted));

        // A later submission is ordered after the slow closure, so once it
        // resolves the slow write must have landed.
        ser.enqueue("fence", |_pool| async { Ok(()) }).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn default_deadline_surfaces_timeout() {
        let pool = test_pool().await;
        let ser = WriteSerializer::spawn(pool, Duration::from_millis(20));
        let err = ser
            .enqueue("too-slow", |_pool| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CrestError::WriteTimeout { label: "too-slow" }));
    }
}
