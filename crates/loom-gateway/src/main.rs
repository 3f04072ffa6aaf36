//! `loom` — the orchestration server's binary: `serve` runs the gateway,
//! `chat` is a one-shot WebSocket client for smoke-testing it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::{SinkExt, StreamExt};
use loom_agent::{AgentRuntime, PersonaSpec, RuntimeDeps};
use loom_core::config::Config;
use loom_core::types::BindMode;
use loom_gateway::auth::ResolvedAuth;
use loom_gateway::{start_gateway, GatewayState};
use loom_llm::{AnthropicClient, AnthropicProvider, AttemptSink, FallbackClient, LlmClient};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "loom", version, about = "Multi-agent orchestration server")]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the JSON-RPC gateway.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        bind: Option<String>,
        #[arg(long, default_value = "./workspace")]
        workspace: PathBuf,
        #[arg(long, default_value = "./data")]
        data_dir: PathBuf,
    },
    /// Send one message over `/ws/{session_id}` and print the reply.
    Chat {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value = "cli")]
        session: String,
        message: String,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

/// Persona prompts bundled with this binary — loading them from a
/// plugin-supplied path is left as a config/file concern per spec §1.
fn bundled_personas() -> Vec<PersonaSpec> {
    vec![
        PersonaSpec {
            name: "default".to_string(),
            system_prompt: DEFAULT_PERSONA_PROMPT.to_string(),
            requires: Default::default(),
        },
        PersonaSpec {
            name: "subagent".to_string(),
            system_prompt: SUBAGENT_PERSONA_PROMPT.to_string(),
            requires: Default::default(),
        },
        PersonaSpec {
            name: "coder".to_string(),
            system_prompt: CODER_PERSONA_PROMPT.to_string(),
            requires: Default::default(),
        },
    ]
}

const DEFAULT_PERSONA_PROMPT: &str = r#"You are a powerful AI assistant with the ability to spawn subagents for parallel work.

## Core Capabilities
1. **Direct Response**: Answer questions directly when appropriate
2. **Task Delegation**: Use spawn_subagent to delegate subtasks for parallel processing

## Guidelines
- For complex tasks, break them down and spawn subagents for parallel execution
- Each subagent works independently on its assigned task
- Subagent results are automatically reported back to you
- Synthesize subagent results into a coherent response for the user

## When to Spawn Subagents
- Research tasks that can be parallelized
- Multi-step tasks where steps can run concurrently
- Tasks requiring different types of analysis

## When NOT to Spawn Subagents
- Simple questions you can answer directly
- Tasks that must be sequential

## Thinking Process
Wrap planning thoughts in <thinking> tags before acting on complex tasks.

Be helpful, thorough, and efficient."#;

const SUBAGENT_PERSONA_PROMPT: &str = r#"You are a focused subagent spawned to complete a specific task.

## Your Role
- Complete ONLY the assigned task
- Be thorough but concise in your response
- Your entire response will be reported back to the main agent

## Rules
1. Stay focused on your specific task
2. Do not try to spawn other subagents
3. Do not ask questions - work with what you have
4. Provide a complete, self-contained response

Complete your task now."#;

const CODER_PERSONA_PROMPT: &str = r#"You are an expert software engineer. Your goal is to help with coding tasks, implementation, and repository analysis with precision and technical excellence.

## Core Principles
1. **Best Practices**: Follow industry standards for clean code, DRY principles, and documentation.
2. **Plan Before Action**: Think through architectural implications before making changes. Wrap your plan in <thinking> tags.
3. **Verification**: After proposing changes, suggest how to verify them (e.g., running tests).

## Tool Usage
- **read/glob/grep**: Inspect the repository before proposing changes.
- **write/edit**: Apply changes directly in the workspace.
- **spawn_subagent**: Delegate independent coding subtasks for parallel execution.

## Tone and Style
- Be direct, technical, and concise.
- Provide complete code snippets when helpful.

Embody the role of a senior engineer: build robust, scalable software."#;

struct NoopAttemptSink;

#[async_trait::async_trait]
impl AttemptSink for NoopAttemptSink {
    async fn record_attempt(&self, _provider: &str, _outcome: &str) {}
}

/// Builds the provider map `RuntimeDeps` needs. A second
/// `ANTHROPIC_FALLBACK_API_KEY` wraps the primary client in a
/// `FallbackClient` (spec §9 "Provider fallback") rather than registering a
/// second named provider — clients never see the fallback, only its effect.
fn build_llm_clients() -> (HashMap<String, Arc<dyn LlmClient>>, String) {
    let mut clients: HashMap<String, Arc<dyn LlmClient>> = HashMap::new();

    let primary_key = std::env::var("ANTHROPIC_API_KEY").unwrap_or_default();
    let primary: Arc<dyn LlmClient> = Arc::new(AnthropicClient::new(AnthropicProvider::new(primary_key)));

    let resolved: Arc<dyn LlmClient> = if let Ok(fallback_key) = std::env::var("ANTHROPIC_FALLBACK_API_KEY") {
        let fallback: Arc<dyn LlmClient> = Arc::new(AnthropicClient::new(AnthropicProvider::new(fallback_key)));
        Arc::new(FallbackClient::new(vec![primary, fallback]).with_sink(Arc::new(NoopAttemptSink)))
    } else {
        primary
    };
    clients.insert("anthropic".to_string(), resolved);

    (clients, "anthropic".to_string())
}

async fn run_serve(
    cli_config: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
    workspace: PathBuf,
    data_dir: PathBuf,
) -> anyhow::Result<()> {
    let mut config = Config::load(cli_config.as_deref())?;
    if let Some(port) = port {
        config.gateway.port = port;
    }
    if let Some(bind) = bind {
        config.gateway.bind = match bind.as_str() {
            "loopback" | "127.0.0.1" => BindMode::Loopback,
            _ => BindMode::Lan,
        };
    }

    let (llm_clients, default_provider) = build_llm_clients();
    let env_token = std::env::var("LOOM_AUTH_TOKEN").ok();
    let auth = ResolvedAuth::from_config(&config.gateway.auth, env_token);

    let deps = RuntimeDeps {
        config: config.clone(),
        workspace_root: workspace,
        data_dir,
        llm_clients,
        default_provider,
        persona_specs: bundled_personas(),
        default_persona: "default".to_string(),
        subagent_persona: "subagent".to_string(),
        cron_tick_interval: Duration::from_secs(30),
    };
    let runtime = AgentRuntime::new(deps).await?;

    let state = GatewayState {
        runtime,
        auth: Arc::new(auth),
    };
    let bind_addr: SocketAddr = format!("{}:{}", config.gateway.bind.to_addr(), config.gateway.port).parse()?;
    start_gateway(state, bind_addr).await
}

async fn run_chat(port: Option<u16>, host: String, session: String, message: String) -> anyhow::Result<()> {
    let port = port.unwrap_or(8787);
    let url = format!("ws://{host}:{port}/ws/{session}");
    let mut request = url.into_client_request()?;
    if let Ok(token) = std::env::var("LOOM_AUTH_TOKEN") {
        request
            .headers_mut()
            .insert("authorization", format!("Bearer {token}").parse()?);
    }
    let (mut socket, _) = tokio_tungstenite::connect_async(request).await?;

    let request = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "chat.send",
        "params": { "message": message },
        "id": 1,
    });
    socket.send(TungsteniteMessage::Text(request.to_string())).await?;

    while let Some(frame) = socket.next().await {
        let frame = frame?;
        let TungsteniteMessage::Text(text) = frame else { continue };
        let value: serde_json::Value = serde_json::from_str(&text)?;
        if value.get("id").is_some() {
            if let Some(result) = value.get("result") {
                let text = result.as_str().map(str::to_string).unwrap_or_else(|| result.to_string());
                println!("{text}");
            } else if let Some(error) = value.get("error") {
                eprintln!("error: {error}");
            }
            break;
        }
        // server-originated agent.* notifications are informational only here
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Command::Serve { port, bind, workspace, data_dir } => {
            run_serve(cli.config, port, bind, workspace, data_dir).await
        }
        Command::Chat { port, host, session, message } => run_chat(port, host, session, message).await,
    }
}
