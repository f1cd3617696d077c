//! Per-connection FIFO work queue.
//!
//! Provider work for a connection (transcribe, translate, broadcast) runs on
//! one worker task, one job at a time, so results leave in the order the
//! requests arrived. Cancelling the connection's token stops the worker and
//! drops the job in flight.

use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Boxed unit of work.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Handle to a connection's worker.
pub struct Pipeline {
    tx: mpsc::Sender<Job>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl Pipeline {
    /// Spawn a worker that stops when `cancel` fires.
    pub fn spawn(capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(rx, cancel.clone()));
        Self { tx, cancel, worker }
    }

    /// Queue a job, waiting for room. Returns `false` once the worker has
    /// stopped.
    pub async fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => false,
            sent = self.tx.send(Box::pin(job)) => sent.is_ok(),
        }
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        drop(self.tx);
        let _ = self.worker.await;
    }
}

async fn run_worker(mut rx: mpsc::Receiver<Job>, cancel: CancellationToken) {
    loop {
        let job = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("pipeline job cancelled");
                break;
            }
            () = job => {}
        }
    }
    rx.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    #[tokio::test]
    async fn jobs_complete_in_submission_order() {
        let pipeline = Pipeline::spawn(8, CancellationToken::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        for (i, delay) in [30_u64, 5, 15].into_iter().enumerate() {
            let log = Arc::clone(&log);
            assert!(
                pipeline
                    .submit(async move {
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        log.lock().push(i);
                    })
                    .await
            );
        }
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        assert!(
            pipeline
                .submit(async move {
                    let _ = done_tx.send(());
                })
                .await
        );
        done_rx.await.unwrap();
        assert_eq!(*log.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drops_in_flight_job() {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::spawn(8, cancel.clone());
        let finished = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&finished);
        assert!(
            pipeline
                .submit(async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    *flag.lock() = true;
                })
                .await
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        pipeline.shutdown().await;
        assert!(!*finished.lock());
    }

    #[tokio::test]
    async fn submit_after_cancel_is_rejected() {
        let cancel = CancellationToken::new();
        let pipeline = Pipeline::spawn(8, cancel.clone());
        cancel.cancel();
        assert!(!pipeline.submit(async {}).await);
    }
}
