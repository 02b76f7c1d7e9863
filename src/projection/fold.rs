//! Event folds: one function per event kind, each turning a run snapshot into
//! the next one. Folds never fail. Events that name an unknown database
//! create it lazily; events that name an unknown index either still update
//! the card counters or are dropped, depending on the event.

use super::{DatabaseCard, IndexDetail, IndexKey, ProfileRun};
use crate::events::EngineEvent;
use crate::model::{
    DatabaseCardState, DatabaseResult, IndexInfo, IndexStatus, MaintenanceAction,
    MaintenanceSummary, RunState,
};

/// Apply one event to a run snapshot and return the next snapshot.
pub fn fold(mut run: ProfileRun, event: &EngineEvent) -> ProfileRun {
    match event {
        EngineEvent::RunStarted {
            databases,
            is_parallel,
            profile_name,
            profile_server,
            ..
        } => {
            let name = profile_name.as_deref().unwrap_or(&run.profile_name);
            let server = profile_server.as_deref().unwrap_or(&run.profile_server);
            run = ProfileRun::started(&run.profile_id, name, server, databases, *is_parallel);
        }
        EngineEvent::DbStart {
            db_name,
            current,
            total,
            ..
        } => on_db_start(&mut run, db_name, *current, *total),
        EngineEvent::IndexFound { index, .. } => on_index_found(&mut run, index),
        EngineEvent::IndexActionChosen {
            db_name,
            schema_name,
            table_name,
            index_name,
            action,
            ..
        } => {
            let key = IndexKey::new(schema_name, table_name, index_name);
            on_index_action(&mut run, db_name, &key, *action);
        }
        EngineEvent::IndexComplete {
            db_name,
            schema_name,
            table_name,
            index_name,
            action,
            success,
            duration_secs,
            retry_attempts,
            error,
            ..
        } => {
            let key = IndexKey::new(schema_name, table_name, index_name);
            let outcome = IndexOutcome {
                action: *action,
                success: *success,
                duration_secs: *duration_secs,
                retry_attempts: *retry_attempts,
                error: error.clone(),
            };
            on_index_complete(&mut run, db_name, &key, outcome);
        }
        EngineEvent::DbComplete { result, .. } => on_db_complete(&mut run, result),
        EngineEvent::RunControl { state, .. } => on_run_control(&mut run, *state),
        EngineEvent::RunFinished { summary, .. } => on_run_finished(&mut run, summary),
        EngineEvent::RunError { .. } => {}
    }
    run
}

fn on_db_start(run: &mut ProfileRun, db_name: &str, current: u32, total: u32) {
    run.card_entry(db_name).state = DatabaseCardState::Running;
    run.current_db_index = current;
    run.total_dbs = total;
    run.set_state(RunState::Running);
}

fn on_index_found(run: &mut ProfileRun, index: &IndexInfo) {
    run.card_entry(&index.database_name)
        .push_index(IndexDetail::pending(index));
}

fn on_index_action(run: &mut ProfileRun, db_name: &str, key: &IndexKey, action: MaintenanceAction) {
    if let Some(idx) = run.card_entry(db_name).index_mut(key) {
        idx.action = Some(action);
        idx.status = IndexStatus::Processing;
    }
}

struct IndexOutcome {
    action: MaintenanceAction,
    success: bool,
    duration_secs: f64,
    retry_attempts: u32,
    error: Option<String>,
}

fn on_index_complete(run: &mut ProfileRun, db_name: &str, key: &IndexKey, outcome: IndexOutcome) {
    let card = run.card_entry(db_name);
    let is_skip = outcome.action == MaintenanceAction::Skip;

    // Counters mirror what the engine reports, known index or not.
    card.indexes_processed += 1;
    match outcome.action {
        MaintenanceAction::Rebuild if outcome.success => card.indexes_rebuilt += 1,
        MaintenanceAction::Reorganize if outcome.success => card.indexes_reorganized += 1,
        MaintenanceAction::Skip => card.indexes_skipped += 1,
        _ => {}
    }

    if let Some(idx) = card.index_mut(key) {
        idx.status = if is_skip {
            IndexStatus::Skipped
        } else if outcome.success {
            IndexStatus::Done
        } else {
            IndexStatus::Error
        };
        idx.action = Some(outcome.action);
        idx.duration_secs = Some(outcome.duration_secs);
        idx.retry_attempts = Some(outcome.retry_attempts);
        idx.error = outcome.error;
    }
}

fn on_db_complete(run: &mut ProfileRun, result: &DatabaseResult) {
    apply_database_result(run.card_entry(&result.database_name), result);
}

fn apply_database_result(card: &mut DatabaseCard, result: &DatabaseResult) {
    card.state = if result.manually_skipped {
        DatabaseCardState::Skipped
    } else if result.critical_failure {
        DatabaseCardState::Error
    } else {
        DatabaseCardState::Done
    };
    card.indexes_processed = result.indexes_processed;
    card.indexes_rebuilt = result.indexes_rebuilt;
    card.indexes_reorganized = result.indexes_reorganized;
    card.indexes_skipped = result.indexes_skipped;
    card.duration_secs = result.total_duration_secs;
    card.errors = result.errors.clone();
}

fn on_run_control(run: &mut ProfileRun, state: RunState) {
    run.set_state(state);
    if state == RunState::Stopped {
        stop_running_cards(run);
    }
}

/// The summary is the engine's final word: per-database results overwrite
/// their cards even when the matching db-complete was lost, and nothing may
/// still look like it is running afterwards.
fn on_run_finished(run: &mut ProfileRun, summary: &MaintenanceSummary) {
    for result in &summary.database_results {
        on_db_complete(run, result);
    }
    stop_running_cards(run);

    let total = if run.total_dbs == 0 {
        summary.databases_processed
    } else {
        run.total_dbs
    };
    let next = if summary.databases_processed < total {
        RunState::Stopped
    } else {
        RunState::Finished
    };
    run.summary = Some(summary.clone());
    run.set_state(next);
}

fn stop_running_cards(run: &mut ProfileRun) {
    for card in run
        .databases
        .iter_mut()
        .filter(|c| c.state == DatabaseCardState::Running)
    {
        card.state = DatabaseCardState::Stopped;
    }
}
