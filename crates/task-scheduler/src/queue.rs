//! Single-flight task queue
//!
//! One worker task drains an mpsc channel and runs jobs strictly one at a time
//! in submission order. Each submitter awaits its own result over a oneshot
//! channel.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use common::error::{Error, Result};
use config::ConfigManager;

use crate::task::ProcessingTask;

struct QueuedJob<T> {
    task: ProcessingTask,
    job: BoxFuture<'static, T>,
    reply: oneshot::Sender<T>,
}

/// Strict FIFO queue that runs one job at a time
pub struct SingleFlightQueue<T> {
    /// Queue name for logs
    name: String,
    /// Job channel to the worker
    sender: mpsc::Sender<QueuedJob<T>>,
    /// Last sequence number handed out
    sequence: AtomicU64,
    /// Jobs submitted but not yet finished
    pending: Arc<AtomicUsize>,
    /// Jobs the worker has finished
    completed: Arc<AtomicU64>,
    /// Maximum jobs waiting behind the running one
    max_pending: usize,
    /// Stops the worker
    shutdown: CancellationToken,
    /// Worker task
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T> std::fmt::Debug for SingleFlightQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SingleFlightQueue")
            .field("name", &self.name)
            .field("pending", &self.pending.load(Ordering::SeqCst))
            .field("max_pending", &self.max_pending)
            .finish()
    }
}

impl<T: Send + 'static> SingleFlightQueue<T> {
    /// Creates the queue and spawns its worker
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(name: impl Into<String>, max_pending: usize) -> Self {
        let name = name.into();
        let max_pending = max_pending.max(1);
        let (sender, receiver) = mpsc::channel(max_pending);
        let pending = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let worker = tokio::spawn(run_worker(
            name.clone(),
            receiver,
            pending.clone(),
            completed.clone(),
            shutdown.clone(),
        ));

        info!("Started '{}' queue with up to {} pending tasks", name, max_pending);

        Self {
            name,
            sender,
            sequence: AtomicU64::new(0),
            pending,
            completed,
            max_pending,
            shutdown,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Creates the queue with `queue.max_pending` from configuration
    pub fn from_config(name: impl Into<String>, config_manager: &ConfigManager) -> Self {
        let max_pending = config_manager.get_usize("queue.max_pending").unwrap_or(64);
        Self::new(name, max_pending)
    }

    /// Enqueues a job and waits for its result
    ///
    /// `make_job` receives the task record so the job can log against it. Fails
    /// with `QueueFull` when `max_pending` jobs are already waiting, and with
    /// `Cancelled` if the queue shuts down before the job finishes.
    pub async fn submit<F, Fut>(&self, style_id: &str, make_job: F) -> Result<T>
    where
        F: FnOnce(ProcessingTask) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled(format!("'{}' queue is shut down", self.name)));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let task = ProcessingTask::new(sequence, style_id);
        let (reply, result) = oneshot::channel();
        let job = QueuedJob {
            task: task.clone(),
            job: Box::pin(make_job(task.clone())),
            reply,
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = self.sender.try_send(job) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => Error::QueueFull(format!(
                    "'{}' queue already holds {} pending tasks",
                    self.name, self.max_pending
                )),
                mpsc::error::TrySendError::Closed(_) => {
                    Error::Cancelled(format!("'{}' queue is shut down", self.name))
                }
            });
        }
        debug!("Queued {} on '{}'", task, self.name);

        result
            .await
            .map_err(|_| Error::Cancelled(format!("{} dropped before it finished", task)))
    }

    /// Jobs submitted but not yet finished, including the running one
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn max_pending(&self) -> usize {
        self.max_pending
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stops the worker; queued and running jobs are dropped
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("'{}' queue worker ended abnormally: {}", self.name, e);
            }
            info!("Stopped '{}' queue", self.name);
        }
    }
}

impl<T> Drop for SingleFlightQueue<T> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_worker<T>(
    name: String,
    mut receiver: mpsc::Receiver<QueuedJob<T>>,
    pending: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        let queued = tokio::select! {
            _ = shutdown.cancelled() => break,
            queued = receiver.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };

        let QueuedJob { task, job, reply } = queued;
        debug!("Running {} on '{}'", task, name);

        let output = tokio::select! {
            _ = shutdown.cancelled() => {
                pending.fetch_sub(1, Ordering::SeqCst);
                break;
            }
            output = job => output,
        };

        pending.fetch_sub(1, Ordering::SeqCst);
        completed.fetch_add(1, Ordering::SeqCst);
        if reply.send(output).is_err() {
            debug!("Submitter of {} went away before the result", task);
        }
    }

    receiver.close();
    let dropped = std::iter::from_fn(|| receiver.try_recv().ok()).count();
    if dropped > 0 {
        pending.fetch_sub(dropped, Ordering::SeqCst);
        warn!("'{}' queue dropped {} waiting tasks on shutdown", name, dropped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let queue = Arc::new(SingleFlightQueue::new("test", 16));
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit("pencil", move |task| async move {
                        // Earlier jobs sleep longer; FIFO must still hold.
                        tokio::time::sleep(Duration::from_millis(25 - i * 5)).await;
                        order.lock().push(task.sequence);
                        task.sequence
                    })
                    .await
            }));
            // Submissions are ordered by the time they reach the queue.
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(results, vec![1, 2, 3, 4, 5]);
        assert_eq!(*order.lock(), vec![1, 2, 3, 4, 5]);
        assert_eq!(queue.completed(), 5);
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_at_most_one_job_runs() {
        let queue = Arc::new(SingleFlightQueue::new("test", 16));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let queue = queue.clone();
            let running = running.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit("outline", move |_| async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = Arc::new(SingleFlightQueue::new("tiny", 1));
        let (release, gate) = oneshot::channel::<()>();

        let blocker = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("pencil", move |_| async move {
                        let _ = gate.await;
                    })
                    .await
            })
        };
        // Let the worker pick up the blocking job.
        while queue.pending() == 0 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiting = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.submit("pencil", |_| async {}).await })
        };
        while queue.pending() < 2 {
            tokio::task::yield_now().await;
        }

        let rejected = queue.submit("pencil", |_| async {}).await;
        assert!(matches!(rejected, Err(Error::QueueFull(_))));

        release.send(()).unwrap();
        blocker.await.unwrap().unwrap();
        waiting.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_waiters() {
        let queue = Arc::new(SingleFlightQueue::new("test", 4));
        let stuck = {
            let queue = queue.clone();
            tokio::spawn(async move {
                queue
                    .submit("pencil", |_| async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                    })
                    .await
            })
        };
        while queue.pending() == 0 {
            tokio::task::yield_now().await;
        }

        queue.shutdown().await;
        assert!(matches!(stuck.await.unwrap(), Err(Error::Cancelled(_))));
        assert!(queue.is_shut_down());
        assert!(matches!(
            queue.submit("pencil", |_| async {}).await,
            Err(Error::Cancelled(_))
        ));
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_from_config() {
        let config = ConfigManager::with_overrides([("queue.max_pending", "3")]).unwrap();
        let queue: SingleFlightQueue<()> = SingleFlightQueue::from_config("cfg", &config);
        assert_eq!(queue.max_pending(), 3);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_debug_reports_pending() {
        let queue: SingleFlightQueue<u32> = SingleFlightQueue::new("debug", 2);
        let rendered = format!("{:?}", queue);
        assert!(rendered.contains("\"debug\""));
        assert!(rendered.contains("pending: 0"));
        assert!(rendered.contains("max_pending: 2"));
        queue.shutdown().await;
    }
}
