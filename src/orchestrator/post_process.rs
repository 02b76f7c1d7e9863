//! Post-run processing.
//!
//! Runs once a profile's finished event has been folded: takes the final
//! snapshot and reloads history so the new record shows up.

use crate::model::RunRecord;
use crate::projection::{ProfileRun, RunStore};
use crate::storage::HistoryStore;

/// Result of post-run processing, ready for presentation layers.
pub(crate) struct ProcessedRun {
    pub run: Option<ProfileRun>,
    pub history: Vec<RunRecord>,
    pub messages: Vec<String>,
}

/// Newest history id for the profile, taken before a run so completion can
/// tell whether the run added a record.
pub(crate) async fn latest_history_id(
    history: &dyn HistoryStore,
    profile_id: &str,
) -> Option<i64> {
    match history.list(Some(profile_id), Some(1)).await {
        Ok(records) => records.first().map(|r| r.id),
        Err(e) => {
            tracing::debug!(profile_id = %profile_id, "history unavailable before run: {e}");
            None
        }
    }
}

pub(crate) async fn process_run_completion(
    store: &RunStore,
    history: &dyn HistoryStore,
    history_limit: usize,
    profile_id: &str,
    previous_id: Option<i64>,
) -> ProcessedRun {
    let run = store.snapshot(profile_id);
    let mut messages = Vec::new();

    let history = match history.list(Some(profile_id), Some(history_limit)).await {
        Ok(records) => records,
        Err(e) => {
            tracing::warn!(profile_id = %profile_id, "history reload failed: {e}");
            messages.push(format!("History reload failed: {e}"));
            Vec::new()
        }
    };
    match history.first() {
        Some(latest) if previous_id.map_or(true, |prev| latest.id > prev) => {
            messages.push(format!("Saved run #{} to history", latest.id));
        }
        _ => tracing::debug!(profile_id = %profile_id, "run added no history record"),
    }

    ProcessedRun {
        run,
        history,
        messages,
    }
}
