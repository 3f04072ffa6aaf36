//! Concurrency Lane (spec C3): a bounded FIFO queue of jobs with at most `N`
//! concurrently executing. Dispatch order matches enqueue order; a bound on
//! `N` is enforced by a semaphore, never by blocking `enqueue` itself.

use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

pub type BoxedJob = Pin<Box<dyn Future<Output = String> + Send>>;

/// Snapshot of the lane's state — `active + queued` is the total outstanding work.
#[derive(Clone, Debug)]
pub struct LaneStatus {
    pub max: usize,
    pub active: usize,
    pub queued: usize,
    pub running_ids: Vec<String>,
}

/// Resolves to the job's output, a "cancelled" marker, or a "backpressure"
/// marker — the three terminal outcomes spec §4.3 names.
pub type JobOutcome = Result<String, JobFailure>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobFailure {
    Cancelled,
    Backpressure,
    Panicked(String),
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobFailure::Cancelled => write!(f, "cancelled"),
            JobFailure::Backpressure => write!(f, "backpressure"),
            JobFailure::Panicked(msg) => write!(f, "panicked: {msg}"),
        }
    }
}

struct QueuedJob {
    id: String,
    operation: BoxedJob,
    result_tx: oneshot::Sender<JobOutcome>,
}

enum JobState {
    Queued,
    Running(CancellationToken),
}

/// A bounded-concurrency FIFO lane. `enqueue`/`cancel`/`status` never block
/// beyond O(1)/O(N) bookkeeping; the actual work runs on tasks spawned by an
/// internal dispatcher loop that owns the semaphore permits. The pending
/// queue is a plain `VecDeque` guarded by the same lock as the state map, so
/// cancelling a queued (not yet running) job can remove it before dispatch —
/// not just mark it, which an mpsc-channel-backed queue can't do.
pub struct ConcurrencyLane {
    max: usize,
    bound: Option<usize>,
    inner: Arc<Mutex<Inner>>,
    notify: Arc<Notify>,
}

struct Inner {
    queue: VecDeque<QueuedJob>,
    states: HashMap<String, JobState>,
}

/// A handle returned by `enqueue`. Awaiting it yields the job's outcome.
pub struct CompletionHandle {
    rx: oneshot::Receiver<JobOutcome>,
}

impl CompletionHandle {
    pub async fn wait(self) -> JobOutcome {
        self.rx
            .await
            .unwrap_or_else(|_| Err(JobFailure::Panicked("lane dropped the job".into())))
    }
}

impl ConcurrencyLane {
    /// `bound`, if set, caps the number of jobs that may sit queued before
    /// `enqueue` fails fast with `JobFailure::Backpressure`.
    pub fn new(max: usize) -> Arc<Self> {
        Self::with_bound(max, None)
    }

    pub fn with_bound(max: usize, bound: Option<usize>) -> Arc<Self> {
        let inner = Arc::new(Mutex::new(Inner {
            queue: VecDeque::new(),
            states: HashMap::new(),
        }));
        let notify = Arc::new(Notify::new());
        let lane = Arc::new(Self {
            max,
            bound,
            inner,
            notify,
        });
        lane.clone().spawn_dispatcher();
        lane
    }

    fn spawn_dispatcher(self: Arc<Self>) {
        let semaphore = Arc::new(Semaphore::new(self.max));
        tokio::spawn(async move {
            loop {
                let job = loop {
                    let mut guard = self.inner.lock().await;
                    if let Some(job) = guard.queue.pop_front() {
                        break job;
                    }
                    drop(guard);
                    self.notify.notified().await;
                };

                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };

                let cancel = CancellationToken::new();
                {
                    let mut guard = self.inner.lock().await;
                    // The job may have been cancelled between pop and lock
                    // acquisition — but cancellation only removes from the
                    // queue, and we've already popped it, so this always
                    // finds a fresh slot to mark running.
                    guard
                        .states
                        .insert(job.id.clone(), JobState::Running(cancel.clone()));
                }

                let QueuedJob {
                    id,
                    operation,
                    result_tx,
                } = job;
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let outcome = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Err(JobFailure::Cancelled),
                        res = catch_panic(operation) => res,
                    };
                    {
                        let mut guard = inner.lock().await;
                        guard.states.remove(&id);
                    }
                    let _ = result_tx.send(outcome);
                    drop(permit);
                });
            }
        });
    }

    /// Atomically appends a job to the queue. Never blocks beyond bookkeeping.
    pub async fn enqueue(&self, job_id: impl Into<String>, operation: BoxedJob) -> CompletionHandle {
        let job_id = job_id.into();
        let (result_tx, rx) = oneshot::channel();

        let mut guard = self.inner.lock().await;
        if let Some(bound) = self.bound {
            if guard.states.len() >= bound {
                drop(guard);
                let _ = result_tx.send(Err(JobFailure::Backpressure));
                return CompletionHandle { rx };
            }
        }

        guard.states.insert(job_id.clone(), JobState::Queued);
        guard.queue.push_back(QueuedJob {
            id: job_id,
            operation,
            result_tx,
        });
        drop(guard);
        self.notify.notify_one();
        CompletionHandle { rx }
    }

    /// If queued, removes it and fails its handle with `Cancelled`. If
    /// running, asserts its cancellation token. Returns `false` if unknown.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let mut guard = self.inner.lock().await;
        match guard.states.get(job_id) {
            Some(JobState::Running(token)) => {
                token.cancel();
                true
            }
            Some(JobState::Queued) => {
                guard.states.remove(job_id);
                if let Some(pos) = guard.queue.iter().position(|j| j.id == job_id) {
                    let job = guard.queue.remove(pos).unwrap();
                    drop(guard);
                    let _ = job.result_tx.send(Err(JobFailure::Cancelled));
                }
                true
            }
            None => false,
        }
    }

    pub async fn status(&self) -> LaneStatus {
        let guard = self.inner.lock().await;
        let mut active = 0;
        let mut queued = 0;
        let mut running_ids = Vec::new();
        for (id, state) in guard.states.iter() {
            match state {
                JobState::Running(_) => {
                    active += 1;
                    running_ids.push(id.clone());
                }
                JobState::Queued => queued += 1,
            }
        }
        LaneStatus {
            max: self.max,
            active,
            queued,
            running_ids,
        }
    }
}

async fn catch_panic(operation: BoxedJob) -> JobOutcome {
    match std::panic::AssertUnwindSafe(operation).catch_unwind().await {
        Ok(output) => Ok(output),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(JobFailure::Panicked(message))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn respects_max_concurrency() {
        let lane = ConcurrencyLane::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let active = active.clone();
            let max_seen = max_seen.clone();
            let op: BoxedJob = Box::pin(async move {
                let cur = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(cur, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                format!("job-{i}")
            });
            handles.push(lane.enqueue(format!("job-{i}"), op).await);
        }

        for h in handles {
            h.wait().await.unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancel_running_job_asserts_token() {
        let lane = ConcurrencyLane::new(1);
        let cancelled = Arc::new(tokio::sync::Notify::new());
        let cancelled2 = cancelled.clone();
        let op: BoxedJob = Box::pin(async move {
            cancelled2.notified().await;
            "done".to_string()
        });
        let handle = lane.enqueue("job-1", op).await;
        // Give the dispatcher a beat to mark it running.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(lane.cancel("job-1").await);
        // The op never observes cancellation directly in this test (it's
        // waiting on a Notify that never fires); the lane's select! races
        // the cancel signal against the operation and wins.
        let outcome = handle.wait().await;
        assert_eq!(outcome, Err(JobFailure::Cancelled));
    }

    #[tokio::test]
    async fn cancel_queued_job_removes_it_before_dispatch() {
        let lane = ConcurrencyLane::new(1);
        // Occupy the sole slot so the next job sits queued.
        let blocker_gate = Arc::new(tokio::sync::Notify::new());
        let gate2 = blocker_gate.clone();
        let blocker: BoxedJob = Box::pin(async move {
            gate2.notified().await;
            "blocker".to_string()
        });
        let blocker_handle = lane.enqueue("blocker", blocker).await;

        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let queued_op: BoxedJob = Box::pin(async move {
            ran2.fetch_add(1, Ordering::SeqCst);
            "should-not-run".to_string()
        });
        let queued_handle = lane.enqueue("queued-1", queued_op).await;

        tokio::time::sleep(Duration::from_millis(10)).await;
        let status = lane.status().await;
        assert_eq!(status.queued, 1);

        assert!(lane.cancel("queued-1").await);
        assert_eq!(lane.status().await.queued, 0);
        assert_eq!(queued_handle.wait().await, Err(JobFailure::Cancelled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        blocker_gate.notify_one();
        assert_eq!(blocker_handle.wait().await, Ok("blocker".to_string()));
    }

    #[tokio::test]
    async fn unknown_job_cancel_returns_false() {
        let lane = ConcurrencyLane::new(1);
        assert!(!lane.cancel("nope").await);
    }

    #[tokio::test]
    async fn backpressure_when_bound_exceeded() {
        let lane = ConcurrencyLane::with_bound(1, Some(1));
        let op: BoxedJob = Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            "a".to_string()
        });
        let _first = lane.enqueue("a", op).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let op2: BoxedJob = Box::pin(async move { "b".to_string() });
        let second = lane.enqueue("b", op2).await;
        assert_eq!(second.wait().await, Err(JobFailure::Backpressure));
    }

    #[tokio::test]
    async fn panic_inside_job_becomes_failure_not_crash() {
        let lane = ConcurrencyLane::new(1);
        let op: BoxedJob = Box::pin(async move { panic!("boom") });
        let handle = lane.enqueue("job-1", op).await;
        match handle.wait().await {
            Err(JobFailure::Panicked(_)) => {}
            other => panic!("expected panicked outcome, got {other:?}"),
        }
        // The lane itself is still usable.
        let op2: BoxedJob = Box::pin(async move { "ok".to_string() });
        let handle2 = lane.enqueue("job-2", op2).await;
        assert_eq!(handle2.wait().await, Ok("ok".to_string()));
    }
}
