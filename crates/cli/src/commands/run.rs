//! `toolweave run`: Single-request or interactive mode.
//!
//! Streams assistant text as it arrives and prints a line per tool call.
//! Ctrl-C cancels the run in progress; in interactive mode the session
//! stays open for the next request.

use anyhow::{anyhow, Context};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use toolweave_agent::{HistorySummary, RunOutcome, SessionRegistry, SharedServices};
use toolweave_config::AppConfig;
use toolweave_core::event::{EngineEvent, EventBus};
use toolweave_core::message::SessionId;
use toolweave_core::LoopState;
use toolweave_memory::{ReflectionEngine, RewardEngine};
use toolweave_tools::{DispatchSettings, ToolDispatchRouter, Workspace};

pub async fn run(explicit: Option<&Path>, message: Option<String>) -> anyhow::Result<()> {
    let config = super::load_config(explicit)?;

    if !config.has_api_key() {
        eprintln!();
        eprintln!("  ERROR: No API key configured!");
        eprintln!();
        eprintln!("  Set one of these environment variables:");
        eprintln!("    TOOLWEAVE_API_KEY, OPENROUTER_API_KEY, OPENAI_API_KEY, ANTHROPIC_API_KEY");
        eprintln!();
        eprintln!("  Or add it to your config file:");
        eprintln!("    {}", super::config_file(explicit).display());
        eprintln!();
        return Err(anyhow!("No API key found. See above for setup instructions."));
    }

    let services = build_services(&config).await?;
    let events = services.events.clone();
    let tools = services.router.registry().names().join(", ");
    let registry = SessionRegistry::new(services);
    let session = registry.create().await;
    let printer = tokio::spawn(print_events(events));

    let result = match message {
        Some(msg) => single(&registry, &session, msg).await,
        None => interactive(&config, &registry, &session, &tools).await,
    };
    printer.abort();
    result
}

/// Wire provider, memory, reflection and dispatch from the config.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<SharedServices> {
    let providers = toolweave_providers::build_from_config(config);
    let provider = providers.default_provider().ok_or_else(|| {
        anyhow!("Provider '{}' is not configured", config.default_provider)
    })?;

    let memory = super::memory::open_shared(config, &providers).await?;
    let reward = Arc::new(RewardEngine::new(memory.clone(), config.reward.clone()));
    let reflection = ReflectionEngine::new(reward, config.reflection.clone(), &config.memory)
        .with_provider(provider.clone(), config.default_model.clone());

    let registry = toolweave_tools::default_registry(&config.dispatch, Workspace::new(), Some(memory.clone()))
        .context("Failed to register built-in tools")?;
    let router = Arc::new(ToolDispatchRouter::new(
        registry,
        DispatchSettings::from(&config.dispatch),
    ));

    let mut services = SharedServices::new(provider, config.default_model.clone(), router);
    services.temperature = config.default_temperature;
    services.max_tokens = Some(config.default_max_tokens);
    services.memory = Some(memory);
    services.reflection = Some(Arc::new(reflection));
    services.pricing = Arc::new(toolweave_telemetry::pricing_from_config(&config.telemetry));
    services.agent = config.agent.clone();
    Ok(services)
}

async fn single(registry: &SessionRegistry, session: &SessionId, msg: String) -> anyhow::Result<()> {
    let outcome = run_interruptible(registry, session, msg).await?;
    report(&outcome);
    match outcome.state {
        LoopState::Error => Err(anyhow!("Run ended in error")),
        _ => Ok(()),
    }
}

async fn interactive(
    config: &AppConfig,
    registry: &SessionRegistry,
    session: &SessionId,
    tools: &str,
) -> anyhow::Result<()> {
    println!();
    println!("  ╔══════════════════════════════════════════════╗");
    println!("  ║        toolweave — Interactive Mode          ║");
    println!("  ╚══════════════════════════════════════════════╝");
    println!();
    println!("  Provider:  {}", config.default_provider);
    println!("  Model:     {}", config.default_model);
    println!("  Tools:     {tools}");
    println!("  Session:   {session}");
    println!();
    println!("  Type your message and press Enter.");
    println!("  Ctrl+C cancels a running request; /history and /usage inspect the");
    println!("  session; 'exit' quits.");
    println!();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("  You > ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        match input {
            "" => continue,
            "exit" | "quit" => break,
            "/history" => {
                let summary = session_summary(registry, session).await?;
                println!(
                    "  {} messages, {} rounds, {} collapsed tool outputs",
                    summary.messages, summary.rounds, summary.collapsed_tool_messages
                );
                continue;
            }
            "/usage" => {
                let handle = registry
                    .get(session)
                    .await
                    .ok_or_else(|| anyhow!("session {session} is gone"))?;
                let totals = handle.engine().await.ledger().totals();
                println!(
                    "  {} calls, {} in / {} out tokens, {:.0}% cache hits, ${:.4}",
                    totals.calls,
                    totals.usage.input_tokens,
                    totals.usage.output_tokens,
                    totals.cache_hit_rate() * 100.0,
                    totals.cost_usd
                );
                continue;
            }
            _ => {}
        }

        println!();
        print!("  Assistant > ");
        std::io::stdout().flush()?;
        match run_interruptible(registry, session, input.to_string()).await {
            Ok(outcome) => report(&outcome),
            Err(e) => eprintln!("  [Error] {e}"),
        }
        println!();
    }

    println!();
    println!("  Goodbye! 👋");
    println!();
    Ok(())
}

/// Run a request, cancelling it on Ctrl-C. The run always completes so its
/// history stays consistent.
async fn run_interruptible(
    registry: &SessionRegistry,
    session: &SessionId,
    text: String,
) -> anyhow::Result<RunOutcome> {
    let run = registry.run(session, text);
    tokio::pin!(run);
    let mut interrupted = false;
    loop {
        tokio::select! {
            outcome = &mut run => return Ok(outcome?),
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("Failed to listen for Ctrl-C")?;
                interrupted = true;
                eprintln!();
                eprintln!("  ^C cancelling...");
                registry.cancel(session).await;
            }
        }
    }
}

/// Text was already streamed; only non-normal endings need printing.
fn report(outcome: &RunOutcome) {
    println!();
    match (outcome.state, &outcome.error) {
        (LoopState::Done, _) => {}
        (_, Some(error)) => eprintln!("  [{}] {}", outcome.state, error.user_message()),
        (_, None) => eprintln!("  [{}] {}", outcome.state, outcome.text()),
    }
    tracing::debug!(
        state = %outcome.state,
        iterations = outcome.iterations,
        tool_calls = outcome.tool_calls,
        cost_usd = outcome.usage.cost_usd,
        "Run finished"
    );
}

async fn session_summary(registry: &SessionRegistry, session: &SessionId) -> anyhow::Result<HistorySummary> {
    let handle = registry
        .get(session)
        .await
        .ok_or_else(|| anyhow!("session {session} is gone"))?;
    let engine = handle.engine().await;
    Ok(HistorySummary::of(engine.history()))
}

async fn print_events(events: EventBus) {
    let mut rx = events.subscribe();
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(line) = render_event(&event) {
                    eprintln!("{line}");
                } else if let EngineEvent::TokenDelta { text, .. } = event.as_ref() {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event printer lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Status line for an event; `None` for events printed inline or not at all.
fn render_event(event: &EngineEvent) -> Option<String> {
    match event {
        EngineEvent::ToolStart {
            tool_name, arguments, ..
        } => Some(format!("\n  ⚙ {tool_name} {arguments}")),
        EngineEvent::ToolEnd {
            tool_name,
            success,
            deduplicated,
            duration_ms,
            ..
        } => {
            let mark = if *success { "✓" } else { "✗" };
            let note = if *deduplicated { " (reused)" } else { "" };
            Some(format!("  {mark} {tool_name} {duration_ms}ms{note}"))
        }
        EngineEvent::BudgetCompacted {
            level,
            tokens_before,
            tokens_after,
            ..
        } => Some(format!(
            "  ⧉ context compacted (level {level}): {tokens_before} → {tokens_after} tokens"
        )),
        _ => None,
    }
}
