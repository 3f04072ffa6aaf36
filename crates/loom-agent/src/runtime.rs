//! The facade that wires every other module in this crate together: Tool
//! Registry, Subagent Registry, Concurrency Lane, Pub/Sub Hub, Debounce
//! Session, Persona Table, Access Control, Trace Sink and Cron Scheduler.
//! `AgentRuntime` is also the `SubagentSpawner` that `spawn_subagent` calls
//! into — see `loom_tools::tools::spawn` for the other half of that contract.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use loom_core::config::Config;
use loom_core::types::{Event, Message, RunStatus, SessionKey, SubAgentRun};
use loom_llm::client::LlmClient;
use loom_tools::{SubagentSpawner, ToolRegistry};
use tokio::sync::{broadcast, Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cron::{CronExecutor, CronScheduler};
use crate::debounce::{DebounceCoordinator, DebounceError, DebounceHandle, PlannerFn};
use crate::hub::PubSubHub;
use crate::lane::{BoxedJob, ConcurrencyLane, LaneStatus};
use crate::persona::{CapabilitySet, PersonaSpec, PersonaTable};
use crate::planner::{Planner, PlannerConfig, PlannerMode, TurnRequest};
use crate::registry::{RunUpdate, SubagentRegistry};
use crate::security::AccessControl;
use crate::session_store::SessionStore;

/// Prefix used to thread a timeout outcome back from a subagent's job
/// through the lane's plain-`String` job output, since `BoxedJob` has no
/// side channel of its own. Never shown to a user; stripped before storing
/// the run's `error` field.
const SUBAGENT_TIMEOUT_MARKER: &str = "\u{0}subagent-timeout\u{0}";

/// Everything `AgentRuntime::new` needs that can't be derived from
/// `Config` alone — the resolved LLM clients and the persona prompt text,
/// both of which are assembled by the binary that owns process startup.
pub struct RuntimeDeps {
    pub config: Config,
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub llm_clients: HashMap<String, Arc<dyn LlmClient>>,
    pub default_provider: String,
    pub persona_specs: Vec<PersonaSpec>,
    pub default_persona: String,
    pub subagent_persona: String,
    pub cron_tick_interval: Duration,
}

#[derive(Debug)]
pub enum ChatError {
    UnknownProvider(String),
}

impl std::fmt::Display for ChatError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChatError::UnknownProvider(p) => write!(f, "unknown provider '{p}'"),
        }
    }
}

impl std::error::Error for ChatError {}

struct SessionData {
    history: Vec<Message>,
    role: Option<String>,
    provider: Option<String>,
    persona: Option<String>,
}

pub struct AgentRuntime {
    config: Config,
    default_provider: String,
    llm_clients: HashMap<String, Arc<dyn LlmClient>>,
    tools: Arc<ToolRegistry>,
    access: Arc<AccessControl>,
    hub: Arc<PubSubHub>,
    trace: Arc<crate::trace::TraceSink>,
    registry: Arc<SubagentRegistry>,
    lane: Arc<ConcurrencyLane>,
    debounce: Arc<DebounceCoordinator>,
    personas: Arc<PersonaTable>,
    planner: Arc<Planner>,
    planner_config: PlannerConfig,
    provider_planners: DashMap<String, Arc<Planner>>,
    sessions: DashMap<SessionKey, Arc<Mutex<SessionData>>>,
    session_store: Arc<SessionStore>,
    subagent_persona: String,
    cron: OnceCell<Arc<CronScheduler>>,
}

impl AgentRuntime {
    pub async fn new(deps: RuntimeDeps) -> loom_core::Result<Arc<Self>> {
        let data_dir = deps.data_dir.clone();
        tokio::fs::create_dir_all(&data_dir).await?;

        let hub = Arc::new(PubSubHub::new());
        let trace = crate::trace::TraceSink::new(data_dir.clone());
        let registry = SubagentRegistry::load(&data_dir, hub.clone()).await?;
        let lane = ConcurrencyLane::new(deps.config.agent.max_concurrent_subagents);
        let access = Arc::new(AccessControl::new(&deps.config.security)?);
        let session_store = SessionStore::load(data_dir.clone()).await?;

        let spawner_handle = loom_tools::new_spawner_handle();
        let tools = Arc::new(loom_tools::create_default_registry(&deps.workspace_root, spawner_handle.clone()));

        let capabilities = CapabilitySet::new(
            deps.config.plugins.enabled.iter().cloned(),
            tools.list().into_iter().map(String::from),
            Vec::new(),
        );
        let personas = Arc::new(PersonaTable::build(
            deps.persona_specs,
            &deps.config.personas,
            &capabilities,
            deps.default_persona.clone(),
        ));

        let default_client = deps.llm_clients.get(&deps.default_provider).cloned().ok_or_else(|| {
            loom_core::Error::ConfigError(format!(
                "default provider '{}' has no configured client",
                deps.default_provider
            ))
        })?;

        let planner_config = PlannerConfig {
            max_iterations: deps.config.agent.max_iterations,
            max_tool_calls_per_turn: deps.config.agent.max_tool_calls_per_turn,
            max_history_messages: deps.config.agent.max_history_messages,
            subagent_timeout_seconds: deps.config.agent.subagent_timeout_seconds,
            enable_thinking: deps.config.agent.enable_thinking,
            ..PlannerConfig::default()
        };
        let planner = Arc::new(Planner::new(
            default_client,
            tools.clone(),
            access.clone(),
            hub.clone(),
            trace.clone(),
            planner_config.clone(),
        ));

        let config = deps.config.clone();
        let debounce_ms = config.agent.debounce_ms;
        let cron_tick_interval = deps.cron_tick_interval;

        let this = Arc::new_cyclic(move |weak: &Weak<AgentRuntime>| {
            let weak_for_planner = weak.clone();
            let planner_fn: PlannerFn = Arc::new(move |session_id, text, cancel| {
                let weak = weak_for_planner.clone();
                Box::pin(async move {
                    match weak.upgrade() {
                        Some(this) => Ok(this.run_turn_for_session(session_id, text, cancel).await),
                        None => Err(DebounceError::Cancelled),
                    }
                })
            });
            let debounce = DebounceCoordinator::new(debounce_ms, planner_fn);

            Self {
                config,
                default_provider: deps.default_provider,
                llm_clients: deps.llm_clients,
                tools,
                access,
                hub,
                trace,
                registry,
                lane,
                debounce,
                personas,
                planner,
                planner_config,
                provider_planners: DashMap::new(),
                sessions: DashMap::new(),
                session_store,
                subagent_persona: deps.subagent_persona,
                cron: OnceCell::new(),
            }
        });

        *spawner_handle.write().await = Some(this.clone() as Arc<dyn SubagentSpawner>);

        let weak_for_cron = Arc::downgrade(&this);
        let cron_executor: CronExecutor = Arc::new(move |task, session_id| {
            let weak = weak_for_cron.clone();
            Box::pin(async move {
                if let Some(this) = weak.upgrade() {
                    let handle = this.debounce.handle_message(SessionKey::new(session_id), task).await;
                    let _ = handle.wait().await;
                }
            })
        });
        let cron = CronScheduler::load(data_dir, cron_executor).await?;
        cron.clone().spawn_ticker(cron_tick_interval, CancellationToken::new());
        let _ = this.cron.set(cron);

        Ok(this)
    }

    fn planner_for(&self, provider: &str) -> Arc<Planner> {
        if provider == self.default_provider {
            return self.planner.clone();
        }
        if let Some(existing) = self.provider_planners.get(provider) {
            return existing.clone();
        }
        let Some(client) = self.llm_clients.get(provider).cloned() else {
            return self.planner.clone();
        };
        let planner = Arc::new(Planner::new(
            client,
            self.tools.clone(),
            self.access.clone(),
            self.hub.clone(),
            self.trace.clone(),
            self.planner_config.clone(),
        ));
        self.provider_planners.entry(provider.to_string()).or_insert(planner).clone()
    }

    async fn session_state(&self, session_id: &SessionKey) -> Arc<Mutex<SessionData>> {
        if let Some(existing) = self.sessions.get(session_id) {
            return existing.clone();
        }
        let history = self.session_store.load_history(session_id).await;
        if let Err(e) = self.session_store.touch(session_id).await {
            warn!(session = session_id.as_str(), error = %e, "failed to record session touch");
        }
        let data = Arc::new(Mutex::new(SessionData {
            history,
            role: None,
            provider: None,
            persona: None,
        }));
        self.sessions.entry(session_id.clone()).or_insert(data).clone()
    }

    /// The `PlannerFn` the debounce coordinator invokes once per coalesced
    /// burst. Runs one planner turn for `session_id` and persists any
    /// messages the turn appended to history.
    async fn run_turn_for_session(&self, session_id: SessionKey, text: String, cancel: CancellationToken) -> String {
        let state = self.session_state(&session_id).await;
        let mut guard = state.lock().await;

        let provider = guard.provider.clone().unwrap_or_else(|| self.default_provider.clone());
        let role_owned = guard.role.clone();
        let persona_name = guard.persona.clone();
        let persona = self.personas.resolve(persona_name.as_deref());
        let system_prompt = persona.map(|p| p.system_prompt.clone()).unwrap_or_default();
        let model = self.config.agent.default_model.clone();
        let planner = self.planner_for(&provider);

        let prev_len = guard.history.len();
        let req = TurnRequest {
            session_id: session_id.clone(),
            role: role_owned.as_deref(),
            system_prompt: &system_prompt,
            model: &model,
            mode: PlannerMode::Normal,
            cancel,
        };
        let reply = planner.run_turn(req, &mut guard.history, text).await;
        let new_messages: Vec<Message> = guard.history[prev_len..].to_vec();
        drop(guard);

        for message in &new_messages {
            if let Err(e) = self.session_store.append_message(&session_id, message).await {
                warn!(session = session_id.as_str(), error = %e, "failed to persist session message");
            }
        }
        if let Err(e) = self.session_store.touch(&session_id).await {
            warn!(session = session_id.as_str(), error = %e, "failed to record session touch");
        }
        reply
    }

    /// Routes a chat message through the debounce coordinator. If `provider`
    /// is set, it's validated and recorded on the session before the burst
    /// is allowed to coalesce.
    pub async fn handle_chat(
        self: &Arc<Self>,
        session_id: SessionKey,
        message: String,
        provider: Option<String>,
    ) -> Result<DebounceHandle, ChatError> {
        if let Some(p) = &provider {
            if !self.llm_clients.contains_key(p) {
                return Err(ChatError::UnknownProvider(p.clone()));
            }
        }
        let state = self.session_state(&session_id).await;
        if let Some(p) = provider {
            state.lock().await.provider = Some(p);
        }
        Ok(self.debounce.handle_message(session_id, message).await)
    }

    pub async fn set_provider(&self, session_id: &SessionKey, provider: &str) -> bool {
        if !self.llm_clients.contains_key(provider) {
            return false;
        }
        let state = self.session_state(session_id).await;
        state.lock().await.provider = Some(provider.to_string());
        true
    }

    pub async fn set_persona(&self, session_id: &SessionKey, persona: &str) {
        let state = self.session_state(session_id).await;
        state.lock().await.persona = Some(persona.to_string());
    }

    pub async fn clear_session(&self, session_id: &SessionKey) {
        let state = self.session_state(session_id).await;
        state.lock().await.history.clear();
        if let Err(e) = self.session_store.clear(session_id).await {
            warn!(session = session_id.as_str(), error = %e, "failed to clear persisted session history");
        }
    }

    /// Cancels any in-flight debounce burst for this session and fails every
    /// non-terminal subagent run it spawned (spec §9(c)).
    pub async fn cancel_session(&self, session_id: &SessionKey) {
        self.debounce.cancel_session(session_id).await;
        for run in self.registry.list_by_session(session_id) {
            if run.status.is_terminal() {
                continue;
            }
            self.lane.cancel(&run.run_id).await;
            let update = RunUpdate {
                status: Some(RunStatus::Error),
                error: Some("cancelled".to_string()),
                ..Default::default()
            };
            if let Err(e) = self.registry.update(&run.run_id, update).await {
                warn!(run_id = %run.run_id, error = %e, "failed to record cancellation");
            }
        }
    }

    pub fn subscribe(&self, session_id: &SessionKey) -> broadcast::Receiver<Event> {
        self.hub.attach(session_id)
    }

    pub fn subagents_for(&self, session_id: &SessionKey) -> Vec<SubAgentRun> {
        self.registry.list_by_session(session_id)
    }

    pub fn active_subagents(&self) -> Vec<SubAgentRun> {
        self.registry.list_active()
    }

    pub async fn lane_status(&self) -> LaneStatus {
        self.lane.status().await
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|e| e.key().as_str().to_string()).collect()
    }

    pub fn cron(&self) -> Option<&Arc<CronScheduler>> {
        self.cron.get()
    }

    pub fn config_view(&self) -> serde_json::Value {
        serde_json::json!({
            "llm": {
                "default_provider": self.default_provider,
                "providers": self.llm_clients.keys().collect::<Vec<_>>(),
            },
            "agent": {
                "max_concurrent_subagents": self.config.agent.max_concurrent_subagents,
                "max_tool_calls_per_turn": self.config.agent.max_tool_calls_per_turn,
                "max_history_messages": self.config.agent.max_history_messages,
                "enable_thinking": self.config.agent.enable_thinking,
                "subagent_timeout_seconds": self.config.agent.subagent_timeout_seconds,
                "debounce_ms": self.config.agent.debounce_ms,
                "max_iterations": self.config.agent.max_iterations,
                "default_model": self.config.agent.default_model,
            },
            "personas": self.personas.list().iter().map(|p| serde_json::json!({
                "name": p.name,
                "eligible": p.eligible,
            })).collect::<Vec<_>>(),
            "security_enabled": self.config.security.enabled,
        })
    }

    #[cfg(test)]
    async fn history_len(&self, session_id: &SessionKey) -> usize {
        self.session_state(session_id).await.lock().await.history.len()
    }
}

#[async_trait::async_trait]
impl SubagentSpawner for AgentRuntime {
    /// Registers a `PENDING` run, enqueues its planner turn on the
    /// Concurrency Lane, and returns the run id immediately — the turn
    /// itself, and the registry update once it finishes, happen in the
    /// background (spec §4.7: spawning never blocks the parent turn).
    async fn spawn(&self, parent_session_id: &str, task: &str, label: &str) -> String {
        let run = SubAgentRun::new(String::new(), parent_session_id, task, label);
        let run = match self.registry.register(run).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "failed to register subagent run");
                return String::new();
            }
        };
        let run_id = run.run_id.clone();

        let planner = self.planner.clone();
        let persona = self.personas.resolve(Some(&self.subagent_persona)).cloned();
        let model = self.config.agent.default_model.clone();
        let timeout_secs = self.config.agent.subagent_timeout_seconds;
        let parent = parent_session_id.to_string();
        let task_owned = task.to_string();
        let registry_for_start = self.registry.clone();
        let run_id_for_job = run_id.clone();

        let op: BoxedJob = Box::pin(async move {
            let started = RunUpdate {
                status: Some(RunStatus::Running),
                ..Default::default()
            };
            if let Err(e) = registry_for_start.update(&run_id_for_job, started).await {
                warn!(run_id = %run_id_for_job, error = %e, "failed to mark subagent running");
            }

            let system_prompt = persona.map(|p| p.system_prompt).unwrap_or_default();
            let mut history = Vec::new();
            let req = TurnRequest {
                session_id: SessionKey::new(parent),
                role: None,
                system_prompt: &system_prompt,
                model: &model,
                mode: PlannerMode::Subagent,
                cancel: CancellationToken::new(),
            };
            let run_future = planner.run_turn(req, &mut history, task_owned);
            match tokio::time::timeout(Duration::from_secs(timeout_secs), run_future).await {
                Ok(reply) => reply,
                Err(_) => format!("{SUBAGENT_TIMEOUT_MARKER}timed out after {timeout_secs}s"),
            }
        });

        let handle = self.lane.enqueue(run_id.clone(), op).await;
        let registry_for_finish = self.registry.clone();
        let run_id_for_finish = run_id.clone();
        tokio::spawn(async move {
            let update = match handle.wait().await {
                Ok(result) if result.starts_with(SUBAGENT_TIMEOUT_MARKER) => RunUpdate {
                    status: Some(RunStatus::Timeout),
                    error: Some(result.trim_start_matches(SUBAGENT_TIMEOUT_MARKER).to_string()),
                    ..Default::default()
                },
                Ok(result) => RunUpdate {
                    status: Some(RunStatus::Completed),
                    result: Some(result),
                    ..Default::default()
                },
                Err(failure) => RunUpdate {
                    status: Some(RunStatus::Error),
                    error: Some(failure.to_string()),
                    ..Default::default()
                },
            };
            if let Err(e) = registry_for_finish.update(&run_id_for_finish, update).await {
                warn!(run_id = %run_id_for_finish, error = %e, "failed to record subagent completion");
            }
        });

        run_id
    }
}
