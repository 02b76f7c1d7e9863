use crate::bridge::EventBridge;
use crate::config::ConsoleConfig;
use crate::dispatcher::CommandDispatcher;
use crate::engine::{sim, EngineClient};
use crate::events::{parse_event_log, EngineEvent};
use crate::model::{MaintenanceOptions, ServerProfile};
use crate::orchestrator::{run_controller, ControllerCtx, RunRequest, UiCommand};
use crate::projection::RunStore;
use crate::storage::{
    self, HistoryStore, JsonHistoryStore, JsonProfileStore, JsonSettingsStore, ProfileStore,
    SettingsStore, DEFAULT_HISTORY_LIMIT,
};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

/// Output line routing for stdout/stderr writer.
pub(crate) enum OutputLine {
    Stdout(String),
    Stderr(String),
}

/// Spawn a blocking writer for stdout/stderr to avoid blocking async tasks.
fn spawn_output_writer() -> (
    mpsc::UnboundedSender<OutputLine>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, mut rx) = mpsc::unbounded_channel::<OutputLine>();
    let handle = tokio::task::spawn_blocking(move || {
        let stdout = std::io::stdout();
        let stderr = std::io::stderr();
        let mut out = std::io::LineWriter::new(stdout.lock());
        let mut err = std::io::LineWriter::new(stderr.lock());

        while let Some(line) = rx.blocking_recv() {
            match line {
                OutputLine::Stdout(msg) => {
                    let _ = writeln!(out, "{}", msg);
                }
                OutputLine::Stderr(msg) => {
                    let _ = writeln!(err, "{}", msg);
                }
            }
        }

        let _ = out.flush();
        let _ = err.flush();
    });
    (tx, handle)
}

#[derive(Debug, Parser, Clone)]
#[command(
    name = "idxmaint-console",
    version,
    about = "Operator console for an index maintenance engine"
)]
pub struct Cli {
    /// Directory holding history and profile files (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    /// Maximum number of history records to load
    #[arg(long, global = true, default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    /// How often live progress is redrawn
    #[arg(long, global = true, default_value = "500ms")]
    pub refresh: humantime::Duration,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run maintenance against the scripted engine and follow it live.
    ///
    /// Type p (pause/resume), s (skip database), x (stop) or q (stop and quit)
    /// followed by Enter while the run is in progress.
    Demo(DemoArgs),
    /// Fold a JSON-lines event log and print the resulting runs
    Replay(ReplayArgs),
    /// Inspect or clear run history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
    /// Manage saved connection profiles
    Profiles {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Debug, Args, Clone)]
pub struct DemoArgs {
    /// Scripted plan file (JSON); a built-in plan is used otherwise
    #[arg(long)]
    pub plan: Option<PathBuf>,

    /// Saved profile to run against; a demo profile is used otherwise
    #[arg(long)]
    pub profile: Option<String>,

    /// Databases to maintain (comma separated); defaults to every database the engine lists
    #[arg(long, value_delimiter = ',')]
    pub databases: Vec<String>,

    /// Process databases in parallel (`--parallel false` turns a saved setting off)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub parallel: Option<bool>,

    /// Maximum databases processed at once in parallel mode
    #[arg(long)]
    pub max_parallel: Option<u32>,

    /// Fragmentation percentage at or above which indexes are rebuilt
    #[arg(long)]
    pub rebuild_threshold: Option<f64>,

    /// Fragmentation percentage at or above which indexes are reorganized
    #[arg(long)]
    pub reorganize_threshold: Option<f64>,

    /// Override the plan's time per index operation
    #[arg(long)]
    pub index_duration: Option<humantime::Duration>,

    /// Stop the run automatically after this long
    #[arg(long)]
    pub stop_after: Option<humantime::Duration>,

    /// Print the final run snapshot as JSON
    #[arg(long)]
    pub json: bool,

    /// Do not record the run in history
    #[arg(long)]
    pub no_history: bool,
}

impl DemoArgs {
    /// Flags given on the command line win over the profile's saved settings.
    fn apply_overrides(&self, options: &mut MaintenanceOptions) {
        if let Some(parallel) = self.parallel {
            options.parallel_databases = parallel;
        }
        if let Some(max) = self.max_parallel {
            options.max_parallel_databases = max;
        }
        if let Some(threshold) = self.rebuild_threshold {
            options.rebuild_threshold = threshold;
        }
        if let Some(threshold) = self.reorganize_threshold {
            options.reorganize_threshold = threshold;
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct ReplayArgs {
    /// Event log with one `{"topic": ..., "payload": ...}` object per line
    pub file: PathBuf,

    /// Only print this profile's run
    #[arg(long)]
    pub profile: Option<String>,

    /// Print snapshots as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Subcommand, Clone)]
pub enum HistoryAction {
    /// List recorded runs, newest first
    List {
        #[arg(long)]
        profile: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Remove recorded runs
    Clear {
        #[arg(long)]
        profile: Option<String>,
    },
}

#[derive(Debug, Subcommand, Clone)]
pub enum ProfileAction {
    List {
        #[arg(long)]
        json: bool,
    },
    /// Create or replace a profile (passwords are never stored)
    Save {
        #[arg(long)]
        id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        server: String,
        #[arg(long, default_value_t = 1433)]
        port: u16,
        #[arg(long, default_value = "")]
        username: String,
        /// Use --encrypt false to disable transport encryption
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        encrypt: bool,
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        trust_server_certificate: bool,
    },
    Delete {
        id: String,
    },
    /// Show the maintenance options a profile runs with
    Settings {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Change one maintenance option for a profile, e.g. `set prod rebuild_threshold 40`
    Set {
        id: String,
        key: String,
        /// JSON value; anything that is not valid JSON is taken as a string
        value: String,
    },
}

/// Build a `ConsoleConfig` from CLI arguments.
pub fn build_config(args: &Cli) -> Result<ConsoleConfig> {
    let data_dir = match &args.data_dir {
        Some(dir) => dir.clone(),
        None => storage::default_data_dir()
            .context("cannot locate a data directory; pass --data-dir")?,
    };
    Ok(ConsoleConfig {
        data_dir,
        history_limit: args.history_limit,
        refresh_interval: Duration::from(args.refresh),
        log_level: args.log_level.clone(),
    })
}

pub async fn run(args: Cli, cfg: ConsoleConfig) -> Result<()> {
    match &args.command {
        Command::Demo(demo) => run_demo(demo, cfg).await,
        Command::Replay(replay) => run_replay(replay).await,
        Command::History { action } => run_history(action, &cfg).await,
        Command::Profiles { action } => run_profiles(action, &cfg).await,
    }
}

fn demo_profile() -> ServerProfile {
    ServerProfile {
        id: "demo".into(),
        name: "Demo server".into(),
        server: "demo-sql".into(),
        ..ServerProfile::default()
    }
}

async fn resolve_profile(profiles: &dyn ProfileStore, id: Option<&str>) -> Result<ServerProfile> {
    let Some(id) = id else {
        return Ok(demo_profile());
    };
    profiles
        .list()
        .await
        .context("failed to load profiles")?
        .into_iter()
        .find(|p| p.id == id)
        .with_context(|| format!("no saved profile with id {id:?}"))
}

/// Forward operator input lines as commands until stdin closes.
fn spawn_input_reader(cmd_tx: mpsc::UnboundedSender<UiCommand>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match UiCommand::parse(&line) {
                Some(cmd) => {
                    if cmd_tx.send(cmd).is_err() {
                        break;
                    }
                }
                None if line.trim().is_empty() => {}
                None => tracing::info!("unknown command {line:?}; use p, s, x or q"),
            }
        }
    });
}

async fn run_demo(args: &DemoArgs, cfg: ConsoleConfig) -> Result<()> {
    let mut plan = match &args.plan {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read plan {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("invalid plan {}", path.display()))?
        }
        None => sim::SimPlan::demo(),
    };
    if let Some(d) = args.index_duration {
        plan.index_duration = Duration::from(d);
    }

    let history: Arc<dyn HistoryStore> = Arc::new(JsonHistoryStore::new(&cfg.data_dir));
    let profiles = JsonProfileStore::new(&cfg.data_dir);
    let profile = resolve_profile(&profiles, args.profile.as_deref()).await?;

    let store = RunStore::new();
    let (event_tx, event_rx) = mpsc::unbounded_channel::<EngineEvent>();
    let (finished_tx, finished_rx) = mpsc::unbounded_channel::<String>();
    let bridge = EventBridge::new(store.clone()).with_finished_observer(finished_tx);
    let listener = bridge.register(event_rx)?;

    let engine_history = if args.no_history {
        None
    } else {
        Some(history.clone())
    };
    let (engine, engine_task) = sim::spawn(plan, event_tx, engine_history);

    engine
        .test_connection(&profile)
        .await
        .with_context(|| format!("cannot connect to {}", profile.server))?;
    let databases = if args.databases.is_empty() {
        engine
            .list_databases(&profile)
            .await
            .context("failed to list databases")?
    } else {
        args.databases.clone()
    };

    let mut options = JsonSettingsStore::new(&cfg.data_dir)
        .get(&profile.id)
        .await
        .with_context(|| format!("failed to load settings for profile {}", profile.id))?;
    args.apply_overrides(&mut options);

    let (out_tx, out_handle) = spawn_output_writer();
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<UiCommand>();
    spawn_input_reader(cmd_tx);

    let ctx = ControllerCtx {
        dispatcher: CommandDispatcher::new(store, Arc::new(engine)),
        history,
        cfg,
        out: out_tx.clone(),
    };
    let request = RunRequest {
        profile,
        databases,
        options,
        stop_after: args.stop_after.map(Duration::from),
    };
    let processed = match run_controller(&ctx, request, cmd_rx, finished_rx).await {
        Ok(processed) => processed,
        Err(e) => {
            let _ = listener.shutdown().await;
            return Err(e);
        }
    };

    if let Some(run) = processed.run.as_ref() {
        if args.json {
            let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(run)?));
        } else {
            let summary = crate::text_summary::build_run_summary(run, Instant::now());
            for line in summary.lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
        }
    }
    for msg in processed.messages {
        let _ = out_tx.send(OutputLine::Stderr(msg));
    }

    // Dropping the dispatcher releases the engine; its task then drains and the
    // event channel closes, which ends the listener.
    drop(ctx);
    engine_task.await.context("engine task failed")?;
    let stats = listener.join().await.context("event listener failed")?;
    tracing::debug!(folded = stats.folded, advisories = stats.advisories, "demo finished");

    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_replay(args: &ReplayArgs) -> Result<()> {
    let raw = tokio::fs::read_to_string(&args.file)
        .await
        .with_context(|| format!("failed to read event log {}", args.file.display()))?;
    let events = parse_event_log(&raw)
        .with_context(|| format!("invalid event log {}", args.file.display()))?;

    let store = RunStore::new();
    for ev in &events {
        store.apply(ev);
    }
    if let Some(id) = args.profile.as_deref() {
        if !store.contains(id) {
            anyhow::bail!(
                "no events for profile {id} in {} (profiles seen: {})",
                args.file.display(),
                store.profile_ids().join(", ")
            );
        }
    }
    let runs: Vec<_> = store
        .snapshots()
        .into_iter()
        .filter(|r| args.profile.as_deref().map_or(true, |id| r.profile_id == id))
        .collect();

    let (out_tx, out_handle) = spawn_output_writer();
    if args.json {
        let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&runs)?));
    } else {
        let now = Instant::now();
        for (i, run) in runs.iter().enumerate() {
            if i > 0 {
                let _ = out_tx.send(OutputLine::Stdout(String::new()));
            }
            for line in crate::text_summary::build_run_summary(run, now).lines {
                let _ = out_tx.send(OutputLine::Stdout(line));
            }
        }
        let _ = out_tx.send(OutputLine::Stderr(format!(
            "Replayed {} events into {} run(s)",
            events.len(),
            runs.len()
        )));
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_history(action: &HistoryAction, cfg: &ConsoleConfig) -> Result<()> {
    let history = JsonHistoryStore::new(&cfg.data_dir);
    let (out_tx, out_handle) = spawn_output_writer();
    match action {
        HistoryAction::List {
            profile,
            limit,
            json,
        } => {
            let records = history
                .list(profile.as_deref(), Some(limit.unwrap_or(cfg.history_limit)))
                .await
                .context("failed to load history")?;
            if *json {
                let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&records)?));
            } else {
                for line in crate::text_summary::build_history_lines(&records).lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
            }
        }
        HistoryAction::Clear { profile } => {
            let removed = history
                .clear(profile.as_deref())
                .await
                .context("failed to clear history")?;
            let _ = out_tx.send(OutputLine::Stderr(format!("Removed {removed} run(s)")));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

async fn run_profiles(action: &ProfileAction, cfg: &ConsoleConfig) -> Result<()> {
    let profiles = JsonProfileStore::new(&cfg.data_dir);
    let (out_tx, out_handle) = spawn_output_writer();
    match action {
        ProfileAction::List { json } => {
            let list = profiles.list().await.context("failed to load profiles")?;
            if *json {
                let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&list)?));
            } else {
                for line in crate::text_summary::build_profile_lines(&list).lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
            }
        }
        ProfileAction::Save {
            id,
            name,
            server,
            port,
            username,
            encrypt,
            trust_server_certificate,
        } => {
            let profile = ServerProfile {
                id: id.clone(),
                name: name.clone(),
                server: server.clone(),
                port: *port,
                username: username.clone(),
                password: String::new(),
                encrypt: *encrypt,
                trust_server_certificate: *trust_server_certificate,
            };
            profiles.save(profile).await.context("failed to save profile")?;
            let _ = out_tx.send(OutputLine::Stderr(format!("Saved profile {id}")));
        }
        ProfileAction::Delete { id } => {
            let removed = profiles.delete(id).await.context("failed to delete profile")?;
            let msg = if removed {
                format!("Deleted profile {id}")
            } else {
                format!("No profile with id {id}")
            };
            let _ = out_tx.send(OutputLine::Stderr(msg));
        }
        ProfileAction::Settings { id, json } => {
            let options = JsonSettingsStore::new(&cfg.data_dir)
                .get(id)
                .await
                .with_context(|| format!("failed to load settings for profile {id}"))?;
            if *json {
                let _ = out_tx.send(OutputLine::Stdout(serde_json::to_string_pretty(&options)?));
            } else {
                for line in crate::text_summary::build_settings_lines(&options).lines {
                    let _ = out_tx.send(OutputLine::Stdout(line));
                }
            }
        }
        ProfileAction::Set { id, key, value } => {
            JsonSettingsStore::new(&cfg.data_dir)
                .update(id, key, parse_setting_value(value))
                .await
                .with_context(|| format!("failed to update {key} for profile {id}"))?;
            let _ = out_tx.send(OutputLine::Stderr(format!("Set {key} = {value} for {id}")));
        }
    }
    drop(out_tx);
    let _ = out_handle.await;
    Ok(())
}

fn parse_setting_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}
