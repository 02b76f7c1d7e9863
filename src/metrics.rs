//! Progress, elapsed time and ETA derived from a run snapshot.
//!
//! Nothing here is stored; callers recompute on every read.

use crate::model::DatabaseCardState;
use crate::projection::ProfileRun;
use std::time::{Duration, Instant};

/// Databases that are done, errored, skipped or stopped.
pub fn completed_count(run: &ProfileRun) -> usize {
    run.databases
        .iter()
        .filter(|c| c.state.is_complete())
        .count()
}

/// Overall progress in database units, from 0 to `total_dbs`.
///
/// Parallel runs add the fractional progress of every running database;
/// sequential runs add only the first running one.
pub fn overall_progress(run: &ProfileRun) -> f64 {
    let done = completed_count(run) as f64;
    let mut running = run
        .databases
        .iter()
        .filter(|c| c.state == DatabaseCardState::Running);

    let in_flight = if run.is_parallel {
        running.map(|c| c.progress()).sum::<f64>()
    } else {
        running.next().map(|c| c.progress()).unwrap_or(0.0)
    };

    (done + in_flight).min(run.total_dbs as f64)
}

/// Progress as a whole percentage of completed databases.
pub fn progress_percent(run: &ProfileRun) -> u32 {
    if run.total_dbs == 0 {
        return 0;
    }
    let completed = overall_progress(run).max(0.0).floor();
    ((completed / run.total_dbs as f64) * 100.0).round() as u32
}

/// Wall-clock time since the run started, frozen once the run is terminal.
pub fn elapsed(run: &ProfileRun, now: Instant) -> Duration {
    let end = run.ended_at().unwrap_or(now);
    end.saturating_duration_since(run.started_at())
}

/// Remaining time estimated from the average time per completed item.
pub fn eta(elapsed: Duration, completed: usize, total: usize) -> Option<Duration> {
    if completed == 0 || total == 0 {
        return None;
    }
    let remaining = total.saturating_sub(completed) as f64;
    let per_item = elapsed.as_secs_f64() / completed as f64;
    Some(Duration::from_secs_f64(per_item * remaining))
}

pub fn run_eta(run: &ProfileRun, now: Instant) -> Option<Duration> {
    eta(
        elapsed(run, now),
        completed_count(run),
        run.total_dbs as usize,
    )
}

/// "42s", "5m 32s" or "1h 23m".
pub fn format_elapsed(secs: u64) -> String {
    if secs < 60 {
        return format!("{secs}s");
    }
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    if hours > 0 {
        return format!("{hours}h {minutes}m");
    }
    format!("{minutes}m {}s", secs % 60)
}

pub fn format_eta(eta: Option<Duration>) -> Option<String> {
    let secs = eta?.as_secs_f64().round() as u64;
    if secs < 1 {
        return Some("< 1s".to_string());
    }
    Some(format_elapsed(secs))
}
