//! Multi-agent orchestration runtime: the Planner Loop, Subagent Registry,
//! Concurrency Lane, Debounce Session, Pub/Sub Hub, Persona/Plugin Wiring,
//! Trace Sink and Cron Scheduler, wired together behind the `AgentRuntime`
//! facade.

pub mod cron;
pub mod debounce;
pub mod hub;
pub mod lane;
pub mod persona;
pub mod planner;
pub mod registry;
pub mod runtime;
pub mod security;
pub mod session_store;
pub mod trace;

pub use cron::{CronExecutor, CronScheduler};
pub use debounce::{DebounceCoordinator, DebounceError, DebounceHandle, DebounceOutcome, PlannerFn};
pub use hub::PubSubHub;
pub use lane::{BoxedJob, CompletionHandle, ConcurrencyLane, JobFailure, JobOutcome, LaneStatus};
pub use persona::{CapabilitySet, PersonaSpec, PersonaTable};
pub use planner::{Planner, PlannerConfig, PlannerMode, TurnRequest, SPAWN_SUBAGENT_TOOL};
pub use registry::{RunUpdate, SubagentRegistry};
pub use runtime::{AgentRuntime, ChatError, RuntimeDeps};
pub use security::AccessControl;
pub use session_store::{SessionMeta, SessionStore};
pub use trace::TraceSink;
