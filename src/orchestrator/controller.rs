//! Run lifecycle controller.
//!
//! Starts a run through the dispatcher, forwards operator commands, redraws
//! progress on a timer and hands over to post-processing once the run's
//! finished event has been folded into the store.

use super::post_process::{latest_history_id, process_run_completion, ProcessedRun};
use crate::cli::OutputLine;
use crate::config::ConsoleConfig;
use crate::dispatcher::CommandDispatcher;
use crate::model::{MaintenanceOptions, ServerProfile};
use crate::storage::HistoryStore;
use crate::text_summary;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::time::{Duration, Instant};

/// Commands emitted by the operator to control the running maintenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UiCommand {
    TogglePause,
    Skip,
    Stop,
    /// Stop, then leave once the run has finished.
    Quit,
}

impl UiCommand {
    /// Map one line typed on stdin.
    pub(crate) fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "p" | "pause" | "resume" => Some(UiCommand::TogglePause),
            "s" | "skip" => Some(UiCommand::Skip),
            "x" | "stop" => Some(UiCommand::Stop),
            "q" | "quit" => Some(UiCommand::Quit),
            _ => None,
        }
    }
}

/// What to run.
pub(crate) struct RunRequest {
    pub profile: ServerProfile,
    pub databases: Vec<String>,
    pub options: MaintenanceOptions,
    /// Issue a stop automatically after this long.
    pub stop_after: Option<Duration>,
}

/// Shared pieces the controller works with.
pub(crate) struct ControllerCtx {
    pub dispatcher: CommandDispatcher,
    pub history: Arc<dyn HistoryStore>,
    pub cfg: ConsoleConfig,
    pub out: UnboundedSender<OutputLine>,
}

impl ControllerCtx {
    fn status(&self, msg: impl Into<String>) {
        let _ = self.out.send(OutputLine::Stderr(msg.into()));
    }

    /// Failures surface through the dispatcher's last error on the next redraw.
    async fn dispatch(&self, profile_id: &str, cmd: UiCommand) {
        let d = &self.dispatcher;
        let _ = match cmd {
            UiCommand::TogglePause => d.toggle_pause(profile_id).await,
            UiCommand::Skip => d.skip_current_database(profile_id).await,
            UiCommand::Stop | UiCommand::Quit => d.stop(profile_id).await,
        };
    }
}

/// Drive one run from start to post-processing.
pub(crate) async fn run_controller(
    ctx: &ControllerCtx,
    request: RunRequest,
    mut cmd_rx: UnboundedReceiver<UiCommand>,
    mut finished_rx: UnboundedReceiver<String>,
) -> Result<ProcessedRun> {
    let profile_id = request.profile.id.clone();
    let previous_id = latest_history_id(ctx.history.as_ref(), &profile_id).await;
    ctx.dispatcher
        .start_run(&request.profile, &request.databases, &request.options)
        .await
        .context("failed to start maintenance run")?;
    ctx.status(format!(
        "Started maintenance on {} database(s) for {}",
        request.databases.len(),
        request.profile.name
    ));

    let store = ctx.dispatcher.store().clone();
    let mut input_open = true;
    let mut stop_at = request.stop_after.map(|d| Instant::now() + d);
    // If a stop takes too long (an index operation in flight), keep the operator informed.
    let mut stop_deadline: Option<Instant> = None;
    let mut last_line = String::new();
    let mut tick = tokio::time::interval(ctx.cfg.refresh_interval);

    loop {
        tokio::select! {
            cmd = cmd_rx.recv(), if input_open => {
                match cmd {
                    Some(cmd) => {
                        if matches!(cmd, UiCommand::Stop | UiCommand::Quit) {
                            ctx.status("Stopping…");
                            stop_deadline = Some(Instant::now() + Duration::from_secs(3));
                        }
                        ctx.dispatch(&profile_id, cmd).await;
                    }
                    None => input_open = false,
                }
            }
            finished = finished_rx.recv() => {
                match finished {
                    Some(id) if id == profile_id => break,
                    Some(_) => {}
                    None => anyhow::bail!("engine event listener stopped before the run finished"),
                }
            }
            _ = async {
                match stop_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending().await,
                }
            } => {
                stop_at = None;
                ctx.status("Stop requested by --stop-after");
                stop_deadline = Some(Instant::now() + Duration::from_secs(3));
                ctx.dispatch(&profile_id, UiCommand::Stop).await;
            }
            _ = tick.tick() => {
                let now = Instant::now();
                if stop_deadline.is_some_and(|at| now >= at) {
                    ctx.status("Still stopping…");
                    stop_deadline = None;
                }
                if let Some(run) = store.snapshot(&profile_id) {
                    let mut line = text_summary::build_progress_line(&run, now.into_std());
                    if let Some(err) = ctx.dispatcher.last_error(&profile_id) {
                        line.push_str(&format!(" | error: {err}"));
                    }
                    if line != last_line {
                        ctx.status(line.clone());
                        last_line = line;
                    }
                }
            }
        }
    }

    let processed = process_run_completion(
        &store,
        ctx.history.as_ref(),
        ctx.cfg.history_limit,
        &profile_id,
        previous_id,
    )
    .await;
    Ok(processed)
}
