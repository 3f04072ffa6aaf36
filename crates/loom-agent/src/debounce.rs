//! Debounce Session (spec C6): coalesces bursts of user input on one
//! `session_id` into a single planner invocation, sharing the result
//! across every caller whose message landed in the same burst.
//!
//! Each burst gets its own `Shared<BoxFuture<...>>` (cloned out to every
//! coalesced caller) that is never reused once the burst has fired — a
//! message arriving mid-planning starts a fresh burst with a fresh future,
//! per spec §4.6(3). Ordering across bursts of the same session (§4.6(5))
//! is enforced by a per-session FIFO `tokio::sync::Mutex` the planner call
//! must acquire before running.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use loom_core::types::SessionKey;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DebounceError {
    Cancelled,
}

impl std::fmt::Display for DebounceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DebounceError::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub type DebounceOutcome = Result<String, DebounceError>;

/// Runs one planner turn for a coalesced burst. Takes the burst's joined
/// text and the cancellation token for the owning session.
pub type PlannerFn = Arc<
    dyn Fn(SessionKey, String, CancellationToken) -> Pin<Box<dyn Future<Output = DebounceOutcome> + Send>>
        + Send
        + Sync,
>;

/// A handle shared by every caller whose message coalesced into the same
/// burst. Dropping one caller's handle never cancels the computation —
/// only session-level cancellation does that (spec §4.6(4)).
#[derive(Clone)]
pub struct DebounceHandle {
    inner: Shared<BoxFuture<'static, DebounceOutcome>>,
}

impl DebounceHandle {
    pub async fn wait(self) -> DebounceOutcome {
        self.inner.await
    }
}

struct Burst {
    buffer: Arc<StdMutex<Vec<String>>>,
    last_arrival: Arc<StdMutex<Instant>>,
    shared: Shared<BoxFuture<'static, DebounceOutcome>>,
}

struct SessionState {
    active: Option<Burst>,
    cancel: CancellationToken,
}

pub struct DebounceCoordinator {
    debounce_ms: u64,
    planner: PlannerFn,
    sessions: dashmap::DashMap<SessionKey, Arc<Mutex<SessionState>>>,
    planning_locks: dashmap::DashMap<SessionKey, Arc<Mutex<()>>>,
}

impl DebounceCoordinator {
    pub fn new(debounce_ms: u64, planner: PlannerFn) -> Arc<Self> {
        Arc::new(Self {
            debounce_ms,
            planner,
            sessions: dashmap::DashMap::new(),
            planning_locks: dashmap::DashMap::new(),
        })
    }

    fn session_state(&self, session_id: &SessionKey) -> Arc<Mutex<SessionState>> {
        self.sessions
            .entry(session_id.clone())
            .or_insert_with(|| {
                Arc::new(Mutex::new(SessionState {
                    active: None,
                    cancel: CancellationToken::new(),
                }))
            })
            .clone()
    }

    fn planning_lock(&self, session_id: &SessionKey) -> Arc<Mutex<()>> {
        self.planning_locks
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Appends `text` to the session's current burst (or opens a new one)
    /// and returns a handle resolving to that burst's final response.
    pub async fn handle_message(
        self: &Arc<Self>,
        session_id: SessionKey,
        text: impl Into<String>,
    ) -> DebounceHandle {
        let text = text.into();
        let state_arc = self.session_state(&session_id);
        let mut state = state_arc.lock().await;

        if let Some(burst) = &state.active {
            burst.buffer.lock().unwrap().push(text);
            *burst.last_arrival.lock().unwrap() = Instant::now();
            return DebounceHandle {
                inner: burst.shared.clone(),
            };
        }

        let buffer = Arc::new(StdMutex::new(vec![text]));
        let last_arrival = Arc::new(StdMutex::new(Instant::now()));
        let cancel = state.cancel.clone();

        let this = self.clone();
        let sid = session_id.clone();
        let buffer_for_fut = buffer.clone();
        let last_arrival_for_fut = last_arrival.clone();
        let debounce_ms = self.debounce_ms;

        let fut: BoxFuture<'static, DebounceOutcome> = Box::pin(async move {
            wait_for_quiet(&last_arrival_for_fut, debounce_ms, &cancel).await;
            if cancel.is_cancelled() {
                return Err(DebounceError::Cancelled);
            }

            // Fire: detach this burst from the session so the next arrival
            // opens a fresh one instead of joining an in-flight computation.
            {
                let state_arc = this.session_state(&sid);
                let mut st = state_arc.lock().await;
                st.active = None;
            }

            let combined = buffer_for_fut.lock().unwrap().join("\n\n");

            // Enforce strict per-session sequencing: the k+1-th burst's
            // planner call cannot start until the k-th's has returned.
            let lock = this.planning_lock(&sid);
            let _guard = lock.lock().await;
            if cancel.is_cancelled() {
                return Err(DebounceError::Cancelled);
            }
            (this.planner)(sid.clone(), combined, cancel.clone()).await
        });

        let shared = fut.shared();
        state.active = Some(Burst {
            buffer,
            last_arrival,
            shared: shared.clone(),
        });
        drop(state);

        DebounceHandle { inner: shared }
    }

    /// Cancels the session's in-flight burst (if any) and every future
    /// burst queued behind it, then rearms a fresh token so the session can
    /// be used again on the next message.
    pub async fn cancel_session(&self, session_id: &SessionKey) {
        let state_arc = self.session_state(session_id);
        let mut state = state_arc.lock().await;
        state.cancel.cancel();
        state.active = None;
        state.cancel = CancellationToken::new();
    }
}

async fn wait_for_quiet(last_arrival: &Arc<StdMutex<Instant>>, debounce_ms: u64, cancel: &CancellationToken) {
    loop {
        let target = *last_arrival.lock().unwrap() + Duration::from_millis(debounce_ms);
        let now = Instant::now();
        if now >= target {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(target)) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_planner(
        order: Arc<StdMutex<Vec<String>>>,
        delay_ms: u64,
    ) -> PlannerFn {
        Arc::new(move |_session, text, _cancel| {
            let order = order.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                order.lock().unwrap().push(text.clone());
                Ok(text)
            })
        })
    }

    #[tokio::test]
    async fn coalesces_burst_into_one_joined_call() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let coordinator = DebounceCoordinator::new(30, counting_planner(order.clone(), 0));
        let session = SessionKey::new("s1");

        let h1 = coordinator.handle_message(session.clone(), "a").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let h2 = coordinator.handle_message(session.clone(), "b").await;

        let r1 = h1.wait().await.unwrap();
        let r2 = h2.wait().await.unwrap();
        assert_eq!(r1, "a\n\nb");
        assert_eq!(r2, "a\n\nb");
        assert_eq!(order.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn arrival_after_fire_starts_fresh_burst() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let coordinator = DebounceCoordinator::new(15, counting_planner(order.clone(), 0));
        let session = SessionKey::new("s1");

        let h1 = coordinator.handle_message(session.clone(), "a").await;
        let r1 = h1.wait().await.unwrap();
        assert_eq!(r1, "a");

        let h2 = coordinator.handle_message(session.clone(), "b").await;
        let r2 = h2.wait().await.unwrap();
        assert_eq!(r2, "b");
        assert_eq!(order.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn bursts_are_processed_strictly_sequentially() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let coordinator = DebounceCoordinator::new(10, counting_planner(order.clone(), 40));
        let session = SessionKey::new("s1");

        let h1 = coordinator.handle_message(session.clone(), "first").await;
        // Wait past the first burst's debounce window but while its planner
        // call (40ms) is still running, then start a second burst.
        tokio::time::sleep(Duration::from_millis(15)).await;
        let h2 = coordinator.handle_message(session.clone(), "second").await;

        let (r1, r2) = tokio::join!(h1.wait(), h2.wait());
        assert_eq!(r1.unwrap(), "first");
        assert_eq!(r2.unwrap(), "second");
        let seen = order.lock().unwrap().clone();
        assert_eq!(seen, vec!["first".to_string(), "second".to_string()]);
    }

    #[tokio::test]
    async fn dropping_one_callers_handle_does_not_cancel_others() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let coordinator = DebounceCoordinator::new(10, counting_planner(order.clone(), 0));
        let session = SessionKey::new("s1");

        let h1 = coordinator.handle_message(session.clone(), "a").await;
        let h2 = coordinator.handle_message(session.clone(), "b").await;
        drop(h1);
        let r2 = h2.wait().await.unwrap();
        assert_eq!(r2, "a\n\nb");
    }

    #[tokio::test]
    async fn session_cancel_fails_outstanding_handle() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let coordinator = DebounceCoordinator::new(50, counting_planner(order.clone(), 0));
        let session = SessionKey::new("s1");

        let h1 = coordinator.handle_message(session.clone(), "a").await;
        coordinator.cancel_session(&session).await;
        let r1 = h1.wait().await;
        assert_eq!(r1, Err(DebounceError::Cancelled));
    }

    #[tokio::test]
    async fn session_reusable_after_cancellation() {
        let order = Arc::new(StdMutex::new(Vec::new()));
        let coordinator = DebounceCoordinator::new(10, counting_planner(order.clone(), 0));
        let session = SessionKey::new("s1");

        let h1 = coordinator.handle_message(session.clone(), "a").await;
        coordinator.cancel_session(&session).await;
        let _ = h1.wait().await;

        let h2 = coordinator.handle_message(session.clone(), "b").await;
        assert_eq!(h2.wait().await.unwrap(), "b");
    }
}
