//! Troupe CLI - agent coordination runtime
//!
//! Usage:
//!   troupe init                 Write .troupe/config.toml with defaults
//!   troupe config               Show the effective configuration
//!   troupe states <agent>       Print an agent's state table
//!   troupe inspect [agent]      Show persisted agent snapshots
//!   troupe limits               Show configured per-model rate limits
//!   troupe simulate <title>     Run one story against scripted collaborators
//!   troupe ask <prompt>         Send one prompt through the rate limiter

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use troupe_agent::{AnthropicClient, CompletionRequest, LlmClient, RateLimitedClient, RateLimiter};
use troupe_core::{AgentId, LoggingConfig, Story, TroupeConfig};
use troupe_orchestrator::coder::tools;
use troupe_orchestrator::scripted::{
    tool, InMemoryContainer, InMemoryWorkspace, ScriptedLlm, ScriptedReviewer,
};
use troupe_orchestrator::{
    spawn_worker, AgentState, ArchitectAgent, ArchitectState, CoderAgent, CoderConfig,
    CoderServices, CoderState, DefaultPromptRenderer, Dispatcher, StateStore, Supervisor,
};

#[derive(Parser)]
#[command(name = "troupe")]
#[command(author, version, about = "Coordination runtime for autonomous coding agents")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Repository root holding .troupe/
    #[arg(long, global = true, default_value = ".")]
    repo: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Print the state table of an agent type
    States {
        #[arg(value_enum, default_value = "coder")]
        agent: CliAgent,
    },

    /// Show persisted agent snapshots
    Inspect {
        /// Agent id; lists every snapshot when omitted
        agent: Option<String>,
    },

    /// Show configured per-model rate limits
    Limits,

    /// Send one prompt to a model through the rate limiter
    Ask {
        /// Prompt text
        prompt: String,

        /// Model name; defaults to the coder model
        #[arg(long)]
        model: Option<String>,

        /// Maximum output tokens
        #[arg(long, default_value = "1024")]
        max_tokens: u64,
    },

    /// Drive one story through a coder and an architect with scripted collaborators
    Simulate {
        /// Story title
        title: String,

        /// Idle planning iterations before the plan is submitted
        #[arg(long, default_value = "0")]
        stall: usize,

        /// Do not write snapshots to the state directory
        #[arg(long)]
        no_persist: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliAgent {
    Coder,
    Architect,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TroupeConfig::load_or_default(&cli.repo).context("Failed to load configuration")?;
    init_logging(&config.logging, cli.verbose)?;

    match cli.command {
        Commands::Init { force } => cmd_init(&cli.repo, force),
        Commands::Config => cmd_config(&config),
        Commands::States { agent } => {
            match agent {
                CliAgent::Coder => print_states::<CoderState>(),
                CliAgent::Architect => print_states::<ArchitectState>(),
            }
            Ok(())
        }
        Commands::Inspect { agent } => cmd_inspect(&cli.repo, &config, agent).await,
        Commands::Limits => cmd_limits(&config),
        Commands::Ask {
            prompt,
            model,
            max_tokens,
        } => cmd_ask(&config, prompt, model, max_tokens).await,
        Commands::Simulate {
            title,
            stall,
            no_persist,
        } => cmd_simulate(&cli.repo, &config, title, stall, !no_persist).await,
    }
}

/// Install the global subscriber; `RUST_LOG` wins over the configured level
fn init_logging(logging: &LoggingConfig, verbose: bool) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => {
            let directive = if verbose { "debug" } else { logging.level.as_str() };
            EnvFilter::try_new(directive)
                .with_context(|| format!("Invalid log level '{}'", directive))?
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(logging.with_target)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {}", e))
}

fn cmd_init(repo: &Path, force: bool) -> Result<()> {
    let existing = repo.join(".troupe/config.toml");
    if existing.exists() && !force {
        println!("{} already exists (use --force to overwrite)", existing.display());
        return Ok(());
    }

    let path = TroupeConfig::write_default(repo)?;
    let config = TroupeConfig::default();
    std::fs::create_dir_all(repo.join(&config.state_dir))
        .context("Failed to create state directory")?;

    println!("Initialized Troupe in {}", repo.display());
    println!("Created:");
    println!("  {}", path.display());
    println!("  {}/", config.state_dir.display());
    Ok(())
}

fn cmd_config(config: &TroupeConfig) -> Result<()> {
    let rendered = toml::to_string_pretty(config).context("Failed to render configuration")?;
    println!("{}", rendered);
    Ok(())
}

fn print_states<S: AgentState + Display>() {
    println!("{} states (initial {})", S::AGENT_TYPE, S::initial());
    println!("{}", "=".repeat(40));
    for state in S::all() {
        let next: Vec<String> = state.successors().iter().map(|s| s.to_string()).collect();
        if next.is_empty() {
            println!("  {:<14} (terminal)", state.as_str());
        } else {
            println!("  {:<14} -> {}", state.as_str(), next.join(", "));
        }
    }
}

async fn cmd_inspect(repo: &Path, config: &TroupeConfig, agent: Option<String>) -> Result<()> {
    let store = StateStore::new(repo.join(&config.state_dir));

    if let Some(agent) = agent {
        let id: AgentId = agent.parse().map_err(|e: String| anyhow!(e))?;
        let snapshot = store
            .load(&id)
            .await?
            .with_context(|| format!("No snapshot for {} in {}", id, store.dir().display()))?;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    let snapshots = store.list().await?;
    if snapshots.is_empty() {
        println!("No snapshots in {}", store.dir().display());
        return Ok(());
    }

    println!("{:<16} {:<10} {:<14} SAVED", "AGENT", "TYPE", "STATE");
    for snapshot in snapshots {
        println!(
            "{:<16} {:<10} {:<14} {}",
            snapshot.agent_id,
            snapshot.agent_type,
            snapshot.state,
            snapshot.saved_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

fn cmd_limits(config: &TroupeConfig) -> Result<()> {
    println!(
        "{:<20} {:>10} {:>8} {:>12} {:>12}",
        "MODEL", "MAX TPM", "CONNS", "BUDGET/DAY", "USD/1K TOK"
    );
    for model in &config.models {
        println!(
            "{:<20} {:>10} {:>8} {:>12.2} {:>12.4}",
            model.name,
            model.max_tpm,
            model.max_connections,
            model.daily_budget_usd,
            model.usd_per_1k_tokens
        );
    }
    println!();
    println!("Usage is tracked per process; `simulate` and `ask` print it on exit.");
    Ok(())
}

/// Limiter usage of every configured model
fn print_usage(limiter: &RateLimiter) -> Result<()> {
    println!(
        "{:<20} {:>12} {:>8} {:>10} {:>10}",
        "MODEL", "WINDOW/TPM", "CONNS", "SPENT", "RESERVED"
    );
    for model in limiter.models() {
        let usage = limiter.usage(&model)?;
        println!(
            "{:<20} {:>12} {:>3}/{:<4} {:>10.4} {:>10.4}",
            usage.model,
            format!("{}/{}", usage.window_tokens, usage.max_tpm),
            usage.in_flight,
            usage.max_connections,
            usage.spent_usd,
            usage.reserved_usd
        );
    }
    Ok(())
}

fn limiter_for(config: &TroupeConfig, model: &str) -> Result<Arc<RateLimiter>> {
    let limiter = Arc::new(RateLimiter::new(config.models.clone()));
    if let Err(e) = limiter.usage(model) {
        limiter.close();
        return Err(anyhow!("{} (add it to [[models]] in .troupe/config.toml)", e));
    }
    Ok(limiter)
}

async fn cmd_ask(
    config: &TroupeConfig,
    prompt: String,
    model: Option<String>,
    max_tokens: u64,
) -> Result<()> {
    let model = model.unwrap_or_else(|| config.agents.coder_model.clone());
    let limiter = limiter_for(config, &model)?;
    let anthropic = Arc::new(AnthropicClient::from_env().context("No API key available")?);
    let client = RateLimitedClient::new(anthropic.clone(), Arc::clone(&limiter));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let request = CompletionRequest::new(model.clone(), prompt).with_max_tokens(max_tokens);
    let result = client.complete(request, &cancel).await;
    info!(
        "{}: circuit {:?} after the call",
        model,
        anthropic.circuit_breaker().state()
    );

    match result {
        Ok(response) => {
            println!("{}", response.text.trim());
            println!();
            println!(
                "{} input + {} output tokens",
                response.usage.input_tokens, response.usage.output_tokens
            );
        }
        Err(e) => {
            limiter.close();
            return Err(anyhow!("{} call failed: {}", model, e));
        }
    }
    print_usage(&limiter)?;
    limiter.close();
    Ok(())
}

async fn cmd_simulate(
    repo: &Path,
    config: &TroupeConfig,
    title: String,
    stall: usize,
    persist: bool,
) -> Result<()> {
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling simulation");
                cancel.cancel();
            }
        });
    }

    let store = persist.then(|| StateStore::new(repo.join(&config.state_dir)));
    let dispatcher = Dispatcher::from_config(config);
    let reviewer = ScriptedReviewer::approve_all();
    let workspace = InMemoryWorkspace::new();
    let mut supervisor = Supervisor::new(dispatcher.clone());

    let architect_id = AgentId::new("architect");
    let mut architect = ArchitectAgent::new(architect_id.clone(), Arc::new(reviewer.clone()))
        .with_workspace(Arc::new(workspace.clone()));
    dispatcher.attach(&mut architect)?;

    let coder_config = CoderConfig::from_config(config).with_architect(architect_id.clone());
    let limiter = limiter_for(config, &coder_config.model)?;

    let plan = format!("Implement: {}", title);
    let summary = format!("Implemented: {}", title);
    let llm = ScriptedLlm::new()
        .with_usage(1_200, 300)
        .then_tool(tool(tools::SHELL, &[("command", "ls")]))
        .then_idle(stall)
        .then_tool(tool(
            tools::SUBMIT_PLAN,
            &[("plan", plan.as_str()), ("confidence", "high")],
        ))
        .then_tool(tool(tools::DONE, &[("summary", summary.as_str())]));
    let services = CoderServices {
        llm: Arc::new(RateLimitedClient::new(
            Arc::new(llm.clone()),
            Arc::clone(&limiter),
        )),
        prompts: Arc::new(DefaultPromptRenderer),
        container: Arc::new(InMemoryContainer::new()),
        workspace: Arc::new(workspace.clone()),
    };
    let mut coder = CoderAgent::new(AgentId::coder(1), coder_config, services);
    coder.assign(Story::new("sim-1", title.clone(), title))?;
    dispatcher.attach(&mut coder)?;

    dispatcher.start(&cancel).await?;
    let architect_task = spawn_worker(architect, store.clone(), cancel.clone());
    let coder_task = spawn_worker(coder, store, cancel.clone());

    let report = supervisor.run_until(1, &cancel).await?;
    let outcome = coder_task.await??;
    dispatcher.detach(&architect_id);
    architect_task.await??;
    dispatcher.stop(&cancel).await?;
    info!("Simulation finished after {} LLM calls", llm.calls());

    println!("Coder {} finished in {}", outcome.agent_id, outcome.final_state);
    if let Some(summary) = &outcome.summary {
        println!("  summary: {}", summary);
    }
    if let Some(cause) = &outcome.cause {
        println!("  cause: {}", cause);
    }
    println!("Architect reviewed:");
    for request_type in reviewer.reviewed() {
        println!("  - {}", request_type);
    }
    for (branch, target) in workspace.merges() {
        println!("Merged {} into {}", branch, target);
    }
    println!(
        "{} state changes observed, {} dropped",
        report.observed, report.dropped
    );
    println!();
    print_usage(&limiter)?;
    limiter.close();
    Ok(())
}
