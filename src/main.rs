//! Chatcoach CLI
//!
//! Runs the coaching monitor against a JSON-lines transcript and exposes the
//! knowledge-bridge and memory-store actions as subcommands.

use anyhow::Context;
use chatcoach::identity::FileIdentity;
use chatcoach::monitor::{ChangeSource, TranscriptSource};
use chatcoach::protocol::EventSink;
use chatcoach::{CoachBackend, CoachConfig, HttpBackend, KnowledgeBridge, Monitor, PromptScoring};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Chatcoach - live coaching for chat conversations
#[derive(Parser, Debug)]
#[command(name = "chatcoach")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Analysis backend base URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Path to config.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Model label reported to the context estimator
    #[arg(long, global = true)]
    model: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Monitor a transcript; stdin lines are draft prompt text
    Watch {
        /// JSON-lines transcript file
        transcript: PathBuf,

        /// Score drafts locally instead of with the remote service
        #[arg(long)]
        local: bool,

        /// Goal passed to the follow-up generator
        #[arg(long)]
        goal: Option<String>,
    },

    /// List memories from the knowledge graph
    Memories {
        /// Client-side filter on title, summary and topics
        #[arg(short, long)]
        query: Option<String>,
    },

    /// Compress selected memories into a context bridge
    Bridge {
        /// JSON-lines transcript of the current conversation
        transcript: PathBuf,

        /// Memory ids to include
        #[arg(short, long = "select", required = true, num_args = 1..)]
        select: Vec<String>,

        /// Token budget for the compressed context
        #[arg(short, long)]
        budget: Option<u32>,
    },

    /// Save a transcript to the memory store
    Save {
        transcript: PathBuf,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long, default_value = "")]
        url: String,
    },

    /// Search the memory store
    Search {
        query: String,

        #[arg(short, long, default_value_t = 5)]
        limit: u32,
    },

    /// Check the analysis backend
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = CoachConfig::load(cli.config.as_deref()).await?;
    if let Some(url) = cli.api_url.clone() {
        config = config.with_api_url(url);
    }
    if let Some(model) = cli.model.clone() {
        config = config.with_model(model);
    }

    let identity = FileIdentity::load_or_create(&config.identity_file)
        .await
        .context("Could not resolve user identity")?;
    let backend: Arc<dyn CoachBackend> = Arc::new(HttpBackend::new(&config, &identity)?);

    match cli.command {
        Command::Watch {
            transcript,
            local,
            goal,
        } => {
            if local {
                config = config.with_prompt_scoring(PromptScoring::Local);
            }
            if goal.is_some() {
                config = config.with_user_goal(goal);
            }
            run_watch(config, backend, transcript).await
        }
        Command::Memories { query } => run_memories(&config, backend, query).await,
        Command::Bridge {
            transcript,
            select,
            budget,
        } => run_bridge(&config, backend, transcript, select, budget).await,
        Command::Save {
            transcript,
            title,
            url,
        } => run_save(&config, backend, transcript, title, url).await,
        Command::Search { query, limit } => run_search(&config, backend, &query, limit).await,
        Command::Status => run_status(&config, backend).await,
    }
}

/// Logs go to stderr; stdout carries only command output and events.
fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

async fn run_watch(
    config: CoachConfig,
    backend: Arc<dyn CoachBackend>,
    transcript: PathBuf,
) -> anyhow::Result<()> {
    info!("Starting Chatcoach");
    info!("Transcript: {:?}", transcript);

    let source = Arc::new(TranscriptSource::new(transcript));
    if let Err(e) = source.watch() {
        warn!("{}. Falling back to polling only.", e);
    }

    let (events, mut events_rx) = EventSink::channel(config.event_capacity);
    let (draft_tx, draft_rx) = mpsc::channel::<String>(32);

    // Blocking stdin reader
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if draft_tx.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    eprintln!("Error reading stdin: {}", e);
                    break;
                }
            }
        }
    });

    // Events as JSON lines on stdout
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Err(e) = writeln!(io::stdout(), "{}", event.to_notification()) {
                error!("Error writing stdout: {}", e);
                break;
            }
            let _ = io::stdout().flush();
        }
    });

    let handle = Monitor::new(config, backend, source, events).start(draft_rx);
    info!("Session {}", handle.session_id().await);

    tokio::signal::ctrl_c().await?;

    let metrics = handle.metrics().await;
    info!(
        "Analyzed {} turns, average flow {:.1}, {} recent issues",
        metrics.turn_count(),
        metrics.average_flow_score(),
        metrics.issue_count()
    );
    handle.shutdown().await;
    printer.abort();

    Ok(())
}

async fn run_memories(
    config: &CoachConfig,
    backend: Arc<dyn CoachBackend>,
    query: Option<String>,
) -> anyhow::Result<()> {
    let mut knowledge = KnowledgeBridge::new(backend, config);
    knowledge.reload().await?;

    let items = knowledge.filter(query.as_deref().unwrap_or(""));
    if items.is_empty() {
        info!("No memories found");
    }
    let mut out = io::stdout().lock();
    for item in items {
        let tags = item.topic_tags.iter().cloned().collect::<Vec<_>>().join(", ");
        writeln!(out, "{}\t{}\t[{}]", item.id, item.title, tags)?;
    }
    Ok(())
}

async fn run_bridge(
    config: &CoachConfig,
    backend: Arc<dyn CoachBackend>,
    transcript: PathBuf,
    select: Vec<String>,
    budget: Option<u32>,
) -> anyhow::Result<()> {
    let source = TranscriptSource::new(transcript);
    let turns = source.read_turns().await.context("Could not read transcript")?;

    let mut knowledge = KnowledgeBridge::new(backend, config);
    // Titles make a better search query, but ids alone still work
    if let Err(e) = knowledge.reload().await {
        warn!("Could not load knowledge graph: {}", e);
    }
    for id in &select {
        if !knowledge.selection().contains(id) {
            knowledge.toggle_selection(id);
        }
    }

    let bridge = knowledge
        .build_bridge(&turns, budget.unwrap_or(config.bridge_token_budget))
        .await?;
    info!(
        "Bridge from {} memories, {:.0}% compression",
        bridge.selected_ids.len(),
        bridge.compression_ratio_percent
    );
    writeln!(io::stdout(), "{}", bridge.compressed_text)?;
    Ok(())
}

async fn run_save(
    config: &CoachConfig,
    backend: Arc<dyn CoachBackend>,
    transcript: PathBuf,
    title: Option<String>,
    url: String,
) -> anyhow::Result<()> {
    let title = title.unwrap_or_else(|| {
        transcript
            .file_stem()
            .and_then(|n| n.to_str())
            .unwrap_or("conversation")
            .to_string()
    });
    let source = TranscriptSource::new(transcript);
    let knowledge = KnowledgeBridge::new(backend, config);

    let saved = knowledge.capture_conversation(&source, &url, &title).await?;
    writeln!(io::stdout(), "{}", serde_json::to_string_pretty(&saved)?)?;
    Ok(())
}

async fn run_search(
    config: &CoachConfig,
    backend: Arc<dyn CoachBackend>,
    query: &str,
    limit: u32,
) -> anyhow::Result<()> {
    let knowledge = KnowledgeBridge::new(backend, config);
    let hits = knowledge.search(query, limit).await?;

    let mut out = io::stdout().lock();
    for hit in hits {
        writeln!(
            out,
            "{:.2}\t{}\t{}",
            hit.relevance,
            hit.title.as_deref().unwrap_or("-"),
            hit.content.lines().next().unwrap_or("")
        )?;
    }
    Ok(())
}

async fn run_status(config: &CoachConfig, backend: Arc<dyn CoachBackend>) -> anyhow::Result<()> {
    writeln!(io::stdout(), "Backend:  {}", config.api_url)?;
    writeln!(io::stdout(), "Model:    {}", config.model)?;
    writeln!(io::stdout(), "Scoring:  {:?}", config.prompt_scoring)?;
    match backend.health().await {
        Ok(health) => writeln!(io::stdout(), "Status:   {}", health.status)?,
        Err(e) => {
            writeln!(io::stdout(), "Status:   unreachable")?;
            return Err(e.into());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_bridge_selection() {
        let cli = Cli::parse_from([
            "chatcoach",
            "--api-url",
            "http://coach.test",
            "bridge",
            "chat.jsonl",
            "--select",
            "m1",
            "m2",
            "--budget",
            "800",
        ]);
        assert_eq!(cli.api_url.as_deref(), Some("http://coach.test"));
        match cli.command {
            Command::Bridge { select, budget, .. } => {
                assert_eq!(select, vec!["m1", "m2"]);
                assert_eq!(budget, Some(800));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}
