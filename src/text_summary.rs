//! Text builders for CLI output.
//!
//! Everything here is pure formatting over snapshots and records; metrics are
//! computed through [`crate::metrics`] at the moment of rendering.

use crate::metrics;
use crate::model::{DatabaseCardState, IndexStatus, MaintenanceOptions, RunRecord, ServerProfile};
use crate::projection::{DatabaseCard, ProfileRun};
use std::time::Instant;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

/// One status line for a live run, e.g.
/// `[running] 1/4 databases 25% | Sales 3/4 indexes | elapsed 42s | eta 2m 6s`.
pub(crate) fn build_progress_line(run: &ProfileRun, now: Instant) -> String {
    let elapsed = metrics::elapsed(run, now);
    let mut line = format!(
        "[{}] {}/{} databases {}%",
        run.run_state.as_str(),
        metrics::completed_count(run),
        run.total_dbs,
        metrics::progress_percent(run)
    );

    if run.is_parallel {
        let running: Vec<&str> = run
            .databases
            .iter()
            .filter(|c| c.state == DatabaseCardState::Running)
            .map(|c| c.name.as_str())
            .collect();
        if !running.is_empty() {
            line.push_str(&format!(" | running: {}", running.join(", ")));
        }
    } else if let Some(card) = run
        .active_database()
        .filter(|c| c.state == DatabaseCardState::Running)
    {
        line.push_str(&format!(
            " | {} {}/{} indexes",
            card.name,
            card.indexes_processed,
            card.indexes.len()
        ));
    }

    line.push_str(&format!(
        " | elapsed {}",
        metrics::format_elapsed(elapsed.as_secs())
    ));
    if run.run_state.is_active() {
        if let Some(eta) = metrics::format_eta(metrics::run_eta(run, now)) {
            line.push_str(&format!(" | eta {eta}"));
        }
    }
    line
}

fn card_line(card: &DatabaseCard) -> String {
    let mut line = format!(
        "  {:<24} {:<8} {}/{} indexes (rebuilt {}, reorganized {}, skipped {})",
        card.name,
        card.state.as_str(),
        card.indexes_processed,
        card.indexes.len(),
        card.indexes_rebuilt,
        card.indexes_reorganized,
        card.indexes_skipped
    );
    if card.duration_secs > 0.0 {
        line.push_str(&format!(" in {:.1}s", card.duration_secs));
    }
    line
}

/// Full report for one run: header, one line per database, errors, totals.
pub(crate) fn build_run_summary(run: &ProfileRun, now: Instant) -> TextSummary {
    let mut lines = Vec::new();
    let server = if run.profile_server.is_empty() {
        "-"
    } else {
        run.profile_server.as_str()
    };
    lines.push(format!(
        "Profile: {} ({}) on {server}",
        run.profile_name, run.profile_id
    ));
    lines.push(format!(
        "State: {}{}",
        run.run_state.as_str(),
        if run.is_parallel { " (parallel)" } else { "" }
    ));
    lines.push(format!(
        "Elapsed: {}",
        metrics::format_elapsed(metrics::elapsed(run, now).as_secs())
    ));

    lines.push("Databases:".to_string());
    for card in &run.databases {
        lines.push(card_line(card));
        for idx in card.indexes.iter().filter(|i| i.status == IndexStatus::Error) {
            lines.push(format!(
                "    failed: {} {}.{}.{}: {}",
                idx.action.map_or("-", |a| a.as_str()),
                idx.schema_name,
                idx.table_name,
                idx.index_name,
                idx.error.as_deref().unwrap_or("unknown error")
            ));
        }
        for err in &card.errors {
            lines.push(format!("    error: {err}"));
        }
    }

    if let Some(summary) = &run.summary {
        lines.push(format!(
            "Summary: {} processed, {} failed, {} skipped",
            summary.databases_processed, summary.databases_failed, summary.databases_skipped
        ));
        lines.push(format!(
            "Indexes: {} rebuilt, {} reorganized, {} skipped in {}",
            summary.total_indexes_rebuilt,
            summary.total_indexes_reorganized,
            summary.total_indexes_skipped,
            metrics::format_elapsed(summary.total_duration_secs.round() as u64)
        ));
    }

    TextSummary { lines }
}

pub(crate) fn build_history_lines(records: &[RunRecord]) -> TextSummary {
    if records.is_empty() {
        return TextSummary {
            lines: vec!["No runs recorded.".to_string()],
        };
    }
    let lines = records
        .iter()
        .map(|r| {
            format!(
                "#{:<4} {}  {} ({})  dbs {} failed {} skipped {}  idx R{} O{} S{}  {}",
                r.id,
                r.started_at,
                r.profile_name,
                r.server,
                r.databases_processed,
                r.databases_failed,
                r.databases_skipped,
                r.total_indexes_rebuilt,
                r.total_indexes_reorganized,
                r.total_indexes_skipped,
                metrics::format_elapsed(r.total_duration_secs.round() as u64)
            )
        })
        .collect();
    TextSummary { lines }
}

pub(crate) fn build_profile_lines(profiles: &[ServerProfile]) -> TextSummary {
    if profiles.is_empty() {
        return TextSummary {
            lines: vec!["No saved profiles.".to_string()],
        };
    }
    let lines = profiles
        .iter()
        .map(|p| {
            let user = if p.username.is_empty() {
                "integrated".to_string()
            } else {
                p.username.clone()
            };
            format!(
                "{:<12} {:<24} {}:{}  user {user}{}",
                p.id,
                p.name,
                p.server,
                p.port,
                if p.encrypt { "  encrypted" } else { "" }
            )
        })
        .collect();
    TextSummary { lines }
}

/// One `key = value` line per maintenance option.
pub(crate) fn build_settings_lines(options: &MaintenanceOptions) -> TextSummary {
    let on_off = |b: bool| if b { "on" } else { "off" };
    let lines = vec![
        format!("rebuild_threshold        {}%", options.rebuild_threshold),
        format!("reorganize_threshold     {}%", options.reorganize_threshold),
        format!("rebuild_online           {}", on_off(options.rebuild_online)),
        format!("free_proc_cache          {}", on_off(options.free_proc_cache)),
        format!("parallel_databases       {}", on_off(options.parallel_databases)),
        format!("max_parallel_databases   {}", options.max_parallel_databases),
        format!("retry_max_attempts       {}", options.retry_max_attempts),
        format!("retry_base_delay_ms      {}", options.retry_base_delay_ms),
        format!("retry_max_delay_ms       {}", options.retry_max_delay_ms),
        format!("connection_timeout_ms    {}", options.connection_timeout_ms),
        format!("request_timeout_ms       {}", options.request_timeout_ms),
    ];
    TextSummary { lines }
}
