//! Subagent Registry (spec C4): the durable record of every `SubAgentRun`.
//!
//! Persists as one JSON file per run under `<data_dir>/runs/<run_id>.json`
//! (atomic temp+rename, per SPEC_FULL.md §6). The session->run_id index is
//! rebuilt in memory from those files at startup, so `list_by_session` never
//! needs to scan the directory at request time. Writes for a given `run_id`
//! are serialized by a per-run entry in an internal mutex map; persistence
//! failure returns the error without touching the in-memory copy, so the two
//! stores never diverge.

use crate::hub::PubSubHub;
use dashmap::DashMap;
use loom_core::types::{Event, EventKind, RunStatus, SessionKey, SubAgentRun};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Clone, Debug, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub result: Option<String>,
    pub error: Option<String>,
}

pub struct SubagentRegistry {
    runs: DashMap<String, SubAgentRun>,
    by_session: DashMap<SessionKey, Vec<String>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    data_dir: PathBuf,
    hub: Arc<PubSubHub>,
}

impl SubagentRegistry {
    /// Loads any persisted non-terminal runs into memory (spec §4.4
    /// "on startup, runs in non-terminal states are loaded"). Long-stranded
    /// RUNNING entries are marked ERROR with reason "orphaned" — the
    /// recovery policy SPEC_FULL.md §9(open questions) elects to apply,
    /// since a process restart means no in-flight task can still be running.
    pub async fn load(data_dir: impl AsRef<Path>, hub: Arc<PubSubHub>) -> loom_core::Result<Arc<Self>> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let runs_dir = data_dir.join("runs");
        tokio::fs::create_dir_all(&runs_dir).await?;

        let registry = Arc::new(Self {
            runs: DashMap::new(),
            by_session: DashMap::new(),
            write_locks: DashMap::new(),
            data_dir,
            hub,
        });

        let mut read_dir = tokio::fs::read_dir(&runs_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read persisted run");
                    continue;
                }
            };
            let mut run: SubAgentRun = match serde_json::from_str(&content) {
                Ok(r) => r,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to parse persisted run");
                    continue;
                }
            };
            if matches!(run.status, RunStatus::Running) {
                run.status = RunStatus::Error;
                run.error = Some("orphaned".to_string());
                run.completed_at = Some(chrono::Utc::now());
                info!(run_id = %run.run_id, "recovered orphaned RUNNING run as ERROR");
                registry.write_to_disk(&run).await.ok();
            }
            registry
                .by_session
                .entry(SessionKey::new(run.parent_session_id.clone()))
                .or_default()
                .push(run.run_id.clone());
            registry.runs.insert(run.run_id.clone(), run);
        }

        Ok(registry)
    }

    fn path_for(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(format!("{run_id}.json"))
    }

    async fn write_to_disk(&self, run: &SubAgentRun) -> loom_core::Result<()> {
        let path = self.path_for(&run.run_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_vec_pretty(run)?;
        tokio::fs::write(&tmp, &content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    fn lock_for(&self, run_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(run_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Registers a run, persists it, and emits `agent.registered` to the
    /// parent session. Assigns a `run_id` if the caller left it empty.
    pub async fn register(&self, mut run: SubAgentRun) -> loom_core::Result<SubAgentRun> {
        if run.run_id.is_empty() {
            run.run_id = uuid::Uuid::new_v4().to_string();
        }
        let lock = self.lock_for(&run.run_id);
        let _guard = lock.lock().await;

        self.write_to_disk(&run).await?;
        self.runs.insert(run.run_id.clone(), run.clone());
        self.by_session
            .entry(SessionKey::new(run.parent_session_id.clone()))
            .or_default()
            .push(run.run_id.clone());

        self.hub.publish(
            &SessionKey::new(run.parent_session_id.clone()),
            Event::new(
                run.parent_session_id.clone(),
                EventKind::AgentRegistered,
                json!({ "run": run }),
            ),
        );
        info!(run_id = %run.run_id, session = %run.parent_session_id, "subagent run registered");
        Ok(run)
    }

    /// Applies a status transition, persisting and emitting `agent.updated`.
    /// Rejects transitions that violate the state-machine invariants.
    pub async fn update(&self, run_id: &str, update: RunUpdate) -> loom_core::Result<SubAgentRun> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut run = self
            .runs
            .get(run_id)
            .map(|r| r.clone())
            .ok_or_else(|| loom_core::Error::Internal(format!("run not found: {run_id}")))?;

        if let Some(next) = update.status {
            if !run.status.can_transition_to(next) {
                return Err(loom_core::Error::InvalidTransition {
                    run_id: run_id.to_string(),
                    from: format!("{:?}", run.status),
                    to: format!("{next:?}"),
                });
            }
            if matches!(next, RunStatus::Running) {
                run.started_at.get_or_insert(chrono::Utc::now());
            }
            if next.is_terminal() {
                run.completed_at = Some(chrono::Utc::now());
            }
            run.status = next;
        }
        if let Some(result) = update.result {
            run.result = Some(result);
            run.error = None;
        }
        if let Some(error) = update.error {
            run.error = Some(error);
            run.result = None;
        }

        // Persist first; on failure roll the in-memory copy back to what
        // was last durable rather than leaving the two diverged.
        if let Err(e) = self.write_to_disk(&run).await {
            warn!(run_id, error = %e, "persistence failed, rolling back in-memory state");
            return Err(e);
        }
        self.runs.insert(run_id.to_string(), run.clone());

        self.hub.publish(
            &SessionKey::new(run.parent_session_id.clone()),
            Event::new(
                run.parent_session_id.clone(),
                EventKind::AgentUpdated,
                json!({ "run": run }),
            ),
        );
        Ok(run)
    }

    pub fn get(&self, run_id: &str) -> Option<SubAgentRun> {
        self.runs.get(run_id).map(|r| r.clone())
    }

    pub fn list_by_session(&self, session_id: &SessionKey) -> Vec<SubAgentRun> {
        self.by_session
            .get(session_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.runs.get(id).map(|r| r.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn list_active(&self) -> Vec<SubAgentRun> {
        self.runs
            .iter()
            .filter(|e| !e.status.is_terminal())
            .map(|e| e.clone())
            .collect()
    }

    /// Thin pass-through to the Hub — kept as a Registry-level operation
    /// per spec §4.4's operation list, even though the Hub owns the actual
    /// subscriber bookkeeping (spec §3: "Hub owns subscriber sets").
    pub fn subscribe(&self, session_id: &SessionKey) -> tokio::sync::broadcast::Receiver<Event> {
        self.hub.attach(session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry() -> (Arc<SubagentRegistry>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(PubSubHub::new());
        let reg = SubagentRegistry::load(dir.path(), hub).await.unwrap();
        (reg, dir)
    }

    #[tokio::test]
    async fn register_then_get_roundtrips() {
        let (reg, _dir) = registry().await;
        let run = SubAgentRun::new("", "s1", "do a thing", "thing");
        let registered = reg.register(run).await.unwrap();
        let fetched = reg.get(&registered.run_id).unwrap();
        assert_eq!(fetched.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn invalid_transition_rejected() {
        let (reg, _dir) = registry().await;
        let run = SubAgentRun::new("r1", "s1", "t", "l");
        reg.register(run).await.unwrap();
        let err = reg
            .update(
                "r1",
                RunUpdate {
                    status: Some(RunStatus::Completed),
                    ..Default::default()
                },
            )
            .await;
        // Pending -> Completed is legal per the DAG; Running -> Pending is not.
        assert!(err.is_ok());
        let err2 = reg
            .update(
                "r1",
                RunUpdate {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            )
            .await;
        assert!(err2.is_err());
    }

    #[tokio::test]
    async fn monotonic_path_pending_running_completed() {
        let (reg, _dir) = registry().await;
        reg.register(SubAgentRun::new("r1", "s1", "t", "l"))
            .await
            .unwrap();
        reg.update(
            "r1",
            RunUpdate {
                status: Some(RunStatus::Running),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        let run = reg
            .update(
                "r1",
                RunUpdate {
                    status: Some(RunStatus::Completed),
                    result: Some("done".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(run.started_at.is_some());
        assert!(run.completed_at.is_some());
        assert_eq!(run.result.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn list_by_session_filters_correctly() {
        let (reg, _dir) = registry().await;
        reg.register(SubAgentRun::new("r1", "s1", "t", "l"))
            .await
            .unwrap();
        reg.register(SubAgentRun::new("r2", "s2", "t", "l"))
            .await
            .unwrap();
        let runs = reg.list_by_session(&SessionKey::new("s1"));
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, "r1");
    }

    #[tokio::test]
    async fn recovery_marks_orphaned_running_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Arc::new(PubSubHub::new());
        {
            let reg = SubagentRegistry::load(dir.path(), hub.clone()).await.unwrap();
            reg.register(SubAgentRun::new("r1", "s1", "t", "l"))
                .await
                .unwrap();
            reg.update(
                "r1",
                RunUpdate {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        }
        // Simulate a process restart against the same data dir.
        let reg2 = SubagentRegistry::load(dir.path(), hub).await.unwrap();
        let run = reg2.get("r1").unwrap();
        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.error.as_deref(), Some("orphaned"));
    }
}
