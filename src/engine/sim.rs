//! Scripted maintenance engine.
//!
//! Plays a [`SimPlan`] instead of talking to a server: every index takes a
//! fixed amount of time, fails if the plan says so, and the usual pause,
//! skip and stop controls apply. Used by the `demo` command and by tests.

use super::{EngineCommand, EngineControl, EngineHandle, EngineReply, EngineRequest};
use crate::error::EngineError;
use crate::events::EngineEvent;
use crate::model::{
    DatabaseResult, IndexInfo, IndexResult, MaintenanceAction, MaintenanceOptions,
    MaintenanceSummary, RunRecord, RunState, ServerProfile,
};
use crate::storage::HistoryStore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimIndex {
    pub schema_name: String,
    pub table_name: String,
    pub index_name: String,
    pub fragmentation_percent: f64,
    #[serde(default = "default_page_count")]
    pub page_count: i64,
    /// Error the operation fails with on every attempt.
    #[serde(default)]
    pub fail: Option<String>,
}

fn default_page_count() -> i64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimDatabase {
    pub name: String,
    #[serde(default)]
    pub indexes: Vec<SimIndex>,
    /// Connecting to this database fails.
    #[serde(default)]
    pub unreachable: bool,
}

/// What the scripted engine will find and how long each operation takes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimPlan {
    pub databases: Vec<SimDatabase>,
    #[serde(default = "default_index_duration", with = "humantime_serde")]
    pub index_duration: Duration,
    /// Servers that refuse every connection.
    #[serde(default)]
    pub unreachable_servers: Vec<String>,
}

fn default_index_duration() -> Duration {
    Duration::from_millis(400)
}

impl SimPlan {
    /// Small fixed plan covering every outcome: rebuilds, reorganizes, skips,
    /// a failing index and an unreachable database.
    pub fn demo() -> Self {
        let ix = |table: &str, name: &str, frag: f64| SimIndex {
            schema_name: "dbo".into(),
            table_name: table.into(),
            index_name: name.into(),
            fragmentation_percent: frag,
            page_count: default_page_count(),
            fail: None,
        };
        let mut locked = ix("Orders", "IX_Orders_Customer", 71.5);
        locked.fail = Some("Lock request time out period exceeded.".into());

        Self {
            databases: vec![
                SimDatabase {
                    name: "Sales".into(),
                    indexes: vec![
                        ix("Orders", "PK_Orders", 42.0),
                        locked,
                        ix("OrderLines", "IX_OrderLines_Product", 18.3),
                        ix("Customers", "PK_Customers", 4.1),
                    ],
                    unreachable: false,
                },
                SimDatabase {
                    name: "Inventory".into(),
                    indexes: vec![
                        ix("Stock", "PK_Stock", 33.3),
                        ix("Stock", "IX_Stock_Warehouse", 12.0),
                        ix("Movements", "IX_Movements_Date", 55.9),
                    ],
                    unreachable: false,
                },
                SimDatabase {
                    name: "Archive".into(),
                    indexes: Vec::new(),
                    unreachable: true,
                },
                SimDatabase {
                    name: "Reporting".into(),
                    indexes: vec![
                        ix("Facts", "CIX_Facts", 64.0),
                        ix("Dimensions", "PK_Dimensions", 9.9),
                    ],
                    unreachable: false,
                },
            ],
            index_duration: default_index_duration(),
            unreachable_servers: Vec::new(),
        }
    }

    fn database(&self, name: &str) -> Option<&SimDatabase> {
        self.databases.iter().find(|d| d.name == name)
    }

    fn reachable(&self, server: &str) -> bool {
        !self.unreachable_servers.iter().any(|s| s == server)
    }
}

/// Rebuild above the rebuild threshold, reorganize above the reorganize
/// threshold, otherwise leave the index alone.
pub fn determine_action(fragmentation: f64, options: &MaintenanceOptions) -> MaintenanceAction {
    let rebuild = options.rebuild_threshold.max(options.reorganize_threshold);
    if fragmentation >= rebuild {
        MaintenanceAction::Rebuild
    } else if fragmentation >= options.reorganize_threshold {
        MaintenanceAction::Reorganize
    } else {
        MaintenanceAction::Skip
    }
}

type Controls = Arc<Mutex<HashMap<String, Arc<watch::Sender<EngineControl>>>>>;

/// Spawn the scripted engine. Returns the command handle and the task serving
/// it; the task ends once every handle is dropped and all runs finished.
pub fn spawn(
    plan: SimPlan,
    events: mpsc::UnboundedSender<EngineEvent>,
    history: Option<Arc<dyn HistoryStore>>,
) -> (EngineHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let engine = SimEngine {
        plan: Arc::new(plan),
        events,
        history,
        controls: Arc::new(Mutex::new(HashMap::new())),
    };
    let handle = tokio::spawn(engine.serve(rx));
    (EngineHandle::new(tx), handle)
}

struct SimEngine {
    plan: Arc<SimPlan>,
    events: mpsc::UnboundedSender<EngineEvent>,
    history: Option<Arc<dyn HistoryStore>>,
    controls: Controls,
}

impl SimEngine {
    async fn serve(self, mut rx: mpsc::UnboundedReceiver<EngineRequest>) {
        let mut runs = JoinSet::new();
        while let Some(req) = rx.recv().await {
            let reply = self.handle(req.command, &mut runs);
            let _ = req.reply.send(reply);
        }
        while runs.join_next().await.is_some() {}
    }

    fn handle(
        &self,
        command: EngineCommand,
        runs: &mut JoinSet<()>,
    ) -> Result<EngineReply, EngineError> {
        match command {
            EngineCommand::StartRun {
                profile,
                databases,
                options,
            } => {
                if options.reorganize_threshold <= 0.0 || options.rebuild_threshold <= 0.0 {
                    return Err(EngineError::Rejected(
                        "Fragmentation thresholds must be positive".into(),
                    ));
                }
                let (ctrl_tx, _) = watch::channel(EngineControl::Running);
                let ctrl_tx = Arc::new(ctrl_tx);
                {
                    let mut controls = lock(&self.controls);
                    if controls.contains_key(&profile.id) {
                        return Err(EngineError::Rejected(
                            "Maintenance run is already active for this profile".into(),
                        ));
                    }
                    controls.insert(profile.id.clone(), ctrl_tx.clone());
                }
                tracing::info!(
                    profile_id = %profile.id,
                    databases = databases.len(),
                    "maintenance run accepted"
                );
                let ctx = Arc::new(RunCtx {
                    profile,
                    options,
                    plan: self.plan.clone(),
                    events: self.events.clone(),
                    history: self.history.clone(),
                    controls: self.controls.clone(),
                    ctrl_tx,
                });
                runs.spawn(run_maintenance(ctx, databases));
                Ok(EngineReply::Accepted)
            }
            EngineCommand::Control {
                profile_id,
                control,
            } => {
                let tx = lock(&self.controls)
                    .get(&profile_id)
                    .cloned()
                    .ok_or(EngineError::NoActiveRun)?;
                tx.send_replace(control);
                let state = match control {
                    EngineControl::Running => Some(RunState::Running),
                    EngineControl::Paused => Some(RunState::Paused),
                    EngineControl::Stop => Some(RunState::Stopped),
                    EngineControl::SkipDatabase => None,
                };
                if let Some(state) = state {
                    let _ = self.events.send(EngineEvent::RunControl { profile_id, state });
                }
                Ok(EngineReply::Accepted)
            }
            EngineCommand::TestConnection(profile) => {
                if self.plan.reachable(&profile.server) {
                    Ok(EngineReply::Accepted)
                } else {
                    Err(connection_refused(&profile.server))
                }
            }
            EngineCommand::ListDatabases(profile) => {
                if !self.plan.reachable(&profile.server) {
                    return Err(connection_refused(&profile.server));
                }
                let names = self.plan.databases.iter().map(|d| d.name.clone()).collect();
                Ok(EngineReply::Databases(names))
            }
        }
    }
}

fn connection_refused(server: &str) -> EngineError {
    EngineError::Rejected(format!("Connection failed: {server} refused the connection"))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "now".into())
}

struct RunCtx {
    profile: ServerProfile,
    options: MaintenanceOptions,
    plan: Arc<SimPlan>,
    events: mpsc::UnboundedSender<EngineEvent>,
    history: Option<Arc<dyn HistoryStore>>,
    controls: Controls,
    ctrl_tx: Arc<watch::Sender<EngineControl>>,
}

impl RunCtx {
    fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    fn emit_control(&self, state: RunState) {
        self.emit(EngineEvent::RunControl {
            profile_id: self.profile.id.clone(),
            state,
        });
    }

    /// Back to running after a skip was honoured.
    fn reset_control(&self) {
        self.ctrl_tx.send_replace(EngineControl::Running);
        self.emit_control(RunState::Running);
    }
}

/// `None` to carry on, or the stop/skip that interrupted. Waits while paused.
async fn check_ctrl(rx: &mut watch::Receiver<EngineControl>) -> Option<EngineControl> {
    loop {
        let ctrl = *rx.borrow_and_update();
        match ctrl {
            EngineControl::Running => return None,
            EngineControl::Stop | EngineControl::SkipDatabase => return Some(ctrl),
            EngineControl::Paused => {
                if rx.changed().await.is_err() {
                    return Some(EngineControl::Stop);
                }
            }
        }
    }
}

/// Resolves once a stop or skip arrives; pause does not interrupt.
async fn interrupted(rx: &mut watch::Receiver<EngineControl>) -> EngineControl {
    loop {
        if rx.changed().await.is_err() {
            return EngineControl::Stop;
        }
        let ctrl = *rx.borrow_and_update();
        if matches!(ctrl, EngineControl::Stop | EngineControl::SkipDatabase) {
            return ctrl;
        }
    }
}

async fn run_maintenance(ctx: Arc<RunCtx>, databases: Vec<String>) {
    ctx.emit(EngineEvent::RunStarted {
        profile_id: ctx.profile.id.clone(),
        databases: databases.clone(),
        is_parallel: ctx.options.parallel_databases,
        profile_name: Some(ctx.profile.name.clone()),
        profile_server: Some(ctx.profile.server.clone()),
    });
    ctx.emit_control(RunState::Running);

    let run_start = Instant::now();
    let started_at = now_rfc3339();
    let results = if ctx.options.parallel_databases {
        run_parallel(&ctx, &databases).await
    } else {
        run_sequential(&ctx, &databases).await
    };
    finish_run(&ctx, results, run_start, started_at).await;
}

async fn run_sequential(ctx: &Arc<RunCtx>, databases: &[String]) -> Vec<DatabaseResult> {
    let total = databases.len() as u32;
    let mut rx = ctx.ctrl_tx.subscribe();
    let mut results = Vec::new();

    for (idx, db_name) in databases.iter().enumerate() {
        match check_ctrl(&mut rx).await {
            Some(EngineControl::Stop) => {
                ctx.emit_control(RunState::Stopped);
                break;
            }
            Some(EngineControl::SkipDatabase) => {
                ctx.reset_control();
                let result = DatabaseResult::skipped(db_name);
                ctx.emit(EngineEvent::DbComplete {
                    profile_id: ctx.profile.id.clone(),
                    result: result.clone(),
                });
                results.push(result);
                continue;
            }
            _ => {}
        }

        ctx.emit(EngineEvent::DbStart {
            profile_id: ctx.profile.id.clone(),
            db_name: db_name.clone(),
            current: idx as u32 + 1,
            total,
        });
        let (result, stopped) = process_database(ctx, db_name, &mut rx).await;
        ctx.emit(EngineEvent::DbComplete {
            profile_id: ctx.profile.id.clone(),
            result: result.clone(),
        });
        results.push(result);

        if stopped {
            ctx.emit_control(RunState::Stopped);
            break;
        }
    }
    results
}

async fn run_parallel(ctx: &Arc<RunCtx>, databases: &[String]) -> Vec<DatabaseResult> {
    let total = databases.len() as u32;
    let max = ctx.options.max_parallel_databases.max(1) as usize;
    let semaphore = Arc::new(Semaphore::new(max));
    let mut workers = JoinSet::new();

    for (idx, db_name) in databases.iter().enumerate() {
        let ctx = ctx.clone();
        let semaphore = semaphore.clone();
        let db_name = db_name.clone();
        workers.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return (idx, None, false);
            };
            let mut rx = ctx.ctrl_tx.subscribe();
            if *rx.borrow() == EngineControl::Stop {
                return (idx, None, false);
            }
            ctx.emit(EngineEvent::DbStart {
                profile_id: ctx.profile.id.clone(),
                db_name: db_name.clone(),
                current: idx as u32 + 1,
                total,
            });
            let (result, stopped) = process_database(&ctx, &db_name, &mut rx).await;
            ctx.emit(EngineEvent::DbComplete {
                profile_id: ctx.profile.id.clone(),
                result: result.clone(),
            });
            (idx, Some(result), stopped)
        });
    }

    let mut ordered = Vec::new();
    let mut any_stopped = false;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok((idx, result, stopped)) => {
                if stopped && !any_stopped {
                    any_stopped = true;
                    ctx.ctrl_tx.send_replace(EngineControl::Stop);
                }
                if let Some(result) = result {
                    ordered.push((idx, result));
                }
            }
            Err(e) => tracing::warn!(profile_id = %ctx.profile.id, "database worker failed: {e}"),
        }
    }
    if any_stopped {
        ctx.emit_control(RunState::Stopped);
    }

    ordered.sort_by_key(|(idx, _)| *idx);
    ordered.into_iter().map(|(_, r)| r).collect()
}

/// Work one database. Returns its result and whether a stop was observed.
async fn process_database(
    ctx: &RunCtx,
    db_name: &str,
    rx: &mut watch::Receiver<EngineControl>,
) -> (DatabaseResult, bool) {
    let db_start = Instant::now();
    let mut result = DatabaseResult {
        database_name: db_name.to_string(),
        success: true,
        indexes_processed: 0,
        indexes_rebuilt: 0,
        indexes_reorganized: 0,
        indexes_skipped: 0,
        total_duration_secs: 0.0,
        errors: Vec::new(),
        critical_failure: false,
        manually_skipped: false,
        index_results: Vec::new(),
    };

    let planned = ctx.plan.database(db_name);
    if !ctx.plan.reachable(&ctx.profile.server) || planned.is_some_and(|d| d.unreachable) {
        let message = format!("{db_name}: connection refused");
        result.success = false;
        result.critical_failure = true;
        result
            .errors
            .push("Connection failed: connection refused".to_string());
        ctx.emit(EngineEvent::RunError {
            profile_id: ctx.profile.id.clone(),
            message,
        });
        result.total_duration_secs = db_start.elapsed().as_secs_f64();
        return (result, false);
    }

    let indexes: &[SimIndex] = planned.map(|d| d.indexes.as_slice()).unwrap_or_default();
    for index in indexes {
        ctx.emit(EngineEvent::IndexFound {
            profile_id: ctx.profile.id.clone(),
            index: IndexInfo {
                database_name: db_name.to_string(),
                schema_name: index.schema_name.clone(),
                table_name: index.table_name.clone(),
                index_name: index.index_name.clone(),
                fragmentation_percent: index.fragmentation_percent,
                page_count: index.page_count,
            },
        });
    }

    let mut stopped = false;
    for index in indexes {
        match check_ctrl(rx).await {
            Some(EngineControl::Stop) => {
                stopped = true;
                break;
            }
            Some(EngineControl::SkipDatabase) => {
                ctx.reset_control();
                result.manually_skipped = true;
                break;
            }
            _ => {}
        }

        result.indexes_processed += 1;
        let action = determine_action(index.fragmentation_percent, &ctx.options);
        ctx.emit(EngineEvent::IndexActionChosen {
            profile_id: ctx.profile.id.clone(),
            db_name: db_name.to_string(),
            schema_name: index.schema_name.clone(),
            table_name: index.table_name.clone(),
            index_name: index.index_name.clone(),
            action,
        });

        let outcome = if action == MaintenanceAction::Skip {
            result.indexes_skipped += 1;
            IndexResult {
                schema_name: index.schema_name.clone(),
                table_name: index.table_name.clone(),
                index_name: index.index_name.clone(),
                fragmentation_percent: index.fragmentation_percent,
                page_count: index.page_count,
                action,
                success: true,
                duration_secs: 0.0,
                retry_attempts: 0,
                error: None,
            }
        } else {
            let op_start = Instant::now();
            let interrupt = tokio::select! {
                _ = tokio::time::sleep(ctx.plan.index_duration) => None,
                ctrl = interrupted(rx) => Some(ctrl),
            };
            match interrupt {
                Some(EngineControl::SkipDatabase) => {
                    ctx.reset_control();
                    result.manually_skipped = true;
                    break;
                }
                Some(_) => {
                    stopped = true;
                    break;
                }
                None => {}
            }

            let (success, attempts) = match &index.fail {
                Some(_) => (false, ctx.options.retry_max_attempts.max(1)),
                None => (true, 1),
            };
            if let Some(err) = &index.fail {
                result.success = false;
                result.errors.push(format!(
                    "{}.{}.{}: {}",
                    index.schema_name, index.table_name, index.index_name, err
                ));
            } else {
                match action {
                    MaintenanceAction::Rebuild => result.indexes_rebuilt += 1,
                    MaintenanceAction::Reorganize => result.indexes_reorganized += 1,
                    MaintenanceAction::Skip => {}
                }
            }
            IndexResult {
                schema_name: index.schema_name.clone(),
                table_name: index.table_name.clone(),
                index_name: index.index_name.clone(),
                fragmentation_percent: index.fragmentation_percent,
                page_count: index.page_count,
                action,
                success,
                duration_secs: op_start.elapsed().as_secs_f64(),
                retry_attempts: attempts,
                error: index.fail.clone(),
            }
        };

        ctx.emit(EngineEvent::IndexComplete {
            profile_id: ctx.profile.id.clone(),
            db_name: db_name.to_string(),
            schema_name: outcome.schema_name.clone(),
            table_name: outcome.table_name.clone(),
            index_name: outcome.index_name.clone(),
            action: outcome.action,
            success: outcome.success,
            duration_secs: outcome.duration_secs,
            retry_attempts: outcome.retry_attempts,
            error: outcome.error.clone(),
        });
        result.index_results.push(outcome);
    }

    result.total_duration_secs = db_start.elapsed().as_secs_f64();
    (result, stopped)
}

/// Persist history, publish the summary and release the profile.
async fn finish_run(
    ctx: &RunCtx,
    results: Vec<DatabaseResult>,
    run_start: Instant,
    started_at: String,
) {
    let summary = MaintenanceSummary::from_results(results, run_start.elapsed().as_secs_f64());

    // Stored before the finished event so listeners reloading history see it.
    if let Some(history) = &ctx.history {
        let record = RunRecord::from_summary(&ctx.profile, started_at, now_rfc3339(), &summary);
        if let Err(e) = history.append(record).await {
            tracing::warn!(profile_id = %ctx.profile.id, "failed to persist run history: {e}");
        }
    }

    tracing::info!(
        profile_id = %ctx.profile.id,
        databases = summary.databases_processed,
        failed = summary.databases_failed,
        "maintenance run finished"
    );
    ctx.emit(EngineEvent::RunFinished {
        profile_id: ctx.profile.id.clone(),
        summary,
    });
    lock(&ctx.controls).remove(&ctx.profile.id);
}
