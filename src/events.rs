//! Progress events emitted by the maintenance engine.
//!
//! Every event carries the profile id it belongs to plus enough keys to find
//! its target database or index without relying on delivery order. Events
//! serialize as `{"topic": "...", "payload": {...}}`, one per line in an
//! event log.

use crate::model::{DatabaseResult, IndexInfo, MaintenanceAction, MaintenanceSummary, RunState};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "topic", content = "payload")]
pub enum EngineEvent {
    #[serde(rename = "maintenance:run-started")]
    RunStarted {
        profile_id: String,
        databases: Vec<String>,
        is_parallel: bool,
        #[serde(default)]
        profile_name: Option<String>,
        #[serde(default)]
        profile_server: Option<String>,
    },
    #[serde(rename = "maintenance:db-start")]
    DbStart {
        profile_id: String,
        db_name: String,
        current: u32,
        total: u32,
    },
    #[serde(rename = "maintenance:index-found")]
    IndexFound { profile_id: String, index: IndexInfo },
    #[serde(rename = "maintenance:index-action")]
    IndexActionChosen {
        profile_id: String,
        db_name: String,
        schema_name: String,
        table_name: String,
        index_name: String,
        action: MaintenanceAction,
    },
    #[serde(rename = "maintenance:index-complete")]
    IndexComplete {
        profile_id: String,
        db_name: String,
        schema_name: String,
        table_name: String,
        index_name: String,
        action: MaintenanceAction,
        success: bool,
        duration_secs: f64,
        retry_attempts: u32,
        #[serde(default)]
        error: Option<String>,
    },
    #[serde(rename = "maintenance:db-complete")]
    DbComplete {
        profile_id: String,
        result: DatabaseResult,
    },
    #[serde(rename = "maintenance:control")]
    RunControl { profile_id: String, state: RunState },
    #[serde(rename = "maintenance:finished")]
    RunFinished {
        profile_id: String,
        summary: MaintenanceSummary,
    },
    /// Advisory only; never folded into run state.
    #[serde(rename = "maintenance:error")]
    RunError { profile_id: String, message: String },
}

impl EngineEvent {
    pub fn profile_id(&self) -> &str {
        match self {
            EngineEvent::RunStarted { profile_id, .. }
            | EngineEvent::DbStart { profile_id, .. }
            | EngineEvent::IndexFound { profile_id, .. }
            | EngineEvent::IndexActionChosen { profile_id, .. }
            | EngineEvent::IndexComplete { profile_id, .. }
            | EngineEvent::DbComplete { profile_id, .. }
            | EngineEvent::RunControl { profile_id, .. }
            | EngineEvent::RunFinished { profile_id, .. }
            | EngineEvent::RunError { profile_id, .. } => profile_id,
        }
    }

    /// Channel topic this event is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            EngineEvent::RunStarted { .. } => "maintenance:run-started",
            EngineEvent::DbStart { .. } => "maintenance:db-start",
            EngineEvent::IndexFound { .. } => "maintenance:index-found",
            EngineEvent::IndexActionChosen { .. } => "maintenance:index-action",
            EngineEvent::IndexComplete { .. } => "maintenance:index-complete",
            EngineEvent::DbComplete { .. } => "maintenance:db-complete",
            EngineEvent::RunControl { .. } => "maintenance:control",
            EngineEvent::RunFinished { .. } => "maintenance:finished",
            EngineEvent::RunError { .. } => "maintenance:error",
        }
    }
}

/// Parse a JSON-lines event log. Blank lines are ignored.
pub fn parse_event_log(input: &str) -> Result<Vec<EngineEvent>, serde_json::Error> {
    input
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(serde_json::from_str)
        .collect()
}
