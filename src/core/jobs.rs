use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info};
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Job failed: {0:#}")]
    Failed(#[from] anyhow::Error),

    #[error("Job panicked: {0}")]
    Panicked(String),
}

type Handler<I, T> = Box<dyn FnOnce(I) -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// A unit of work for the [`JobQueue`]. Jobs are not persisted.
pub struct Job<I, T> {
    pub name: String,
    pub input: I,
    handle: Handler<I, T>,
    on_success: Option<Box<dyn FnOnce(T) + Send>>,
    on_error: Option<Box<dyn FnOnce(JobError) + Send>>,
}

impl<I, T> Job<I, T>
where
    I: Send + 'static,
    T: Send + 'static,
{
    pub fn new<F, Fut>(name: impl Into<String>, input: I, handle: F) -> Self
    where
        F: FnOnce(I) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            name: name.into(),
            input,
            handle: Box::new(move |input| handle(input).boxed()),
            on_success: None,
            on_error: None,
        }
    }

    pub fn on_success(mut self, callback: impl FnOnce(T) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    pub fn on_error(mut self, callback: impl FnOnce(JobError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    fn into_queued(self) -> QueuedJob {
        let Job {
            name,
            input,
            handle,
            on_success,
            on_error,
        } = self;

        let job_name = name.clone();
        let run = async move {
            // The handler is invoked inside the guarded future so a panic
            // while building its future is caught too.
            let outcome = AssertUnwindSafe(async move { handle(input).await })
                .catch_unwind()
                .await;

            let result = match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(JobError::Failed(e)),
                Err(payload) => Err(JobError::Panicked(panic_message(payload))),
            };

            match result {
                Ok(value) => {
                    debug!("Job {} finished", job_name);
                    if let Some(callback) = on_success {
                        callback(value);
                    }
                }
                Err(e) => {
                    error!("Job {} failed: {}", job_name, e);
                    if let Some(callback) = on_error {
                        callback(e);
                    }
                }
            }
        }
        .boxed();

        QueuedJob { name, run }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct QueuedJob {
    name: String,
    run: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct State {
    jobs: VecDeque<QueuedJob>,
    active: bool,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    idle: Notify,
}

/// Runs jobs one at a time in enqueue order on a single tokio task.
///
/// A failing or panicking job is reported through its `on_error` callback
/// and never stops the queue. Cloning yields another handle to the same queue.
#[derive(Clone, Default)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a job and start a worker if none is draining. Must be called
    /// from within a tokio runtime.
    pub fn enqueue<I, T>(&self, job: Job<I, T>)
    where
        I: Send + 'static,
        T: Send + 'static,
    {
        let job = job.into_queued();
        debug!("Job {} queued", job.name);

        let start_worker = {
            let mut state = self.state();
            state.jobs.push_back(job);
            !std::mem::replace(&mut state.active, true)
        };

        if start_worker {
            tokio::spawn(self.clone().drain());
        }
    }

    /// Jobs waiting to start, not counting the one running.
    pub fn pending(&self) -> usize {
        self.state().jobs.len()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state();
        !state.active && state.jobs.is_empty()
    }

    /// Resolve once no job is running or waiting.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    async fn drain(self) {
        loop {
            let next = {
                let mut state = self.state();
                match state.jobs.pop_front() {
                    Some(job) => job,
                    None => {
                        state.active = false;
                        break;
                    }
                }
            };

            info!("Job {} started", next.name);
            if AssertUnwindSafe(next.run).catch_unwind().await.is_err() {
                error!("Job {} panicked in a callback", next.name);
            }
        }

        self.inner.idle.notify_waiters();
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Log = Arc<Mutex<Vec<String>>>;

    fn record(log: &Log, entry: impl Into<String>) {
        log.lock().unwrap().push(entry.into());
    }

    fn tracked(log: &Log, name: &'static str, fail: bool) -> Job<&'static str, &'static str> {
        let handler_log = log.clone();
        let ok_log = log.clone();
        let err_log = log.clone();

        Job::new(name, name, move |name| async move {
            record(&handler_log, format!("{}:start", name));
            tokio::time::sleep(Duration::from_millis(10)).await;
            if fail {
                anyhow::bail!("{} exploded", name);
            }
            record(&handler_log, format!("{}:end", name));
            Ok(name)
        })
        .on_success(move |name| record(&ok_log, format!("{}:ok", name)))
        .on_error(move |_| record(&err_log, format!("{}:err", name)))
    }

    #[tokio::test]
    async fn test_failure_is_isolated_and_order_kept() {
        let queue = JobQueue::new();
        let log: Log = Arc::default();

        queue.enqueue(tracked(&log, "A", false));
        queue.enqueue(tracked(&log, "B", true));
        queue.enqueue(tracked(&log, "C", false));
        queue.wait_idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["A:start", "A:end", "A:ok", "B:start", "B:err", "C:start", "C:end", "C:ok"]
        );
    }

    #[tokio::test]
    async fn test_panicking_job_reports_error() {
        let queue = JobQueue::new();
        let log: Log = Arc::default();
        let err_log = log.clone();

        queue.enqueue(
            Job::new("boom", (), |_: ()| async move {
                if true {
                    panic!("handler blew up");
                }
                Ok(())
            })
            .on_error(move |e| {
                assert!(matches!(e, JobError::Panicked(ref m) if m == "handler blew up"));
                record(&err_log, "boom:err");
            }),
        );
        queue.enqueue(tracked(&log, "after", false));
        queue.wait_idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["boom:err", "after:start", "after:end", "after:ok"]
        );
    }

    #[tokio::test]
    async fn test_jobs_never_overlap() {
        let queue = JobQueue::new();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..5 {
            let running = running.clone();
            let peak = peak.clone();
            queue.enqueue(Job::new(format!("job-{}", i), i, move |i| async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                running.fetch_sub(1, Ordering::SeqCst);
                Ok(i)
            }));
        }
        queue.wait_idle().await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(queue.is_idle());
        assert_eq!(queue.pending(), 0);
    }

    #[tokio::test]
    async fn test_job_enqueued_from_callback_runs() {
        let queue = JobQueue::new();
        let log: Log = Arc::default();
        let follow_up = tracked(&log, "second", false);
        let handle = queue.clone();

        queue.enqueue(
            Job::new("first", (), |_: ()| async { Ok(()) })
                .on_success(move |_| handle.enqueue(follow_up)),
        );
        queue.wait_idle().await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["second:start", "second:end", "second:ok"]
        );
    }

    #[tokio::test]
    async fn test_wait_idle_on_empty_queue() {
        let queue = JobQueue::new();
        assert!(queue.is_idle());
        queue.wait_idle().await;
    }
}
