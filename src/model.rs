use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerProfile {
    pub id: String,
    pub name: String,
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    // Never written to disk by the profile store.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default = "default_true")]
    pub encrypt: bool,
    #[serde(default = "default_true")]
    pub trust_server_certificate: bool,
}

fn default_port() -> u16 {
    1433
}

fn default_true() -> bool {
    true
}

impl Default for ServerProfile {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            server: String::new(),
            port: default_port(),
            username: String::new(),
            password: String::new(),
            encrypt: true,
            trust_server_certificate: true,
        }
    }
}

/// Options forwarded untouched to the engine when a run starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceOptions {
    #[serde(default = "default_true")]
    pub rebuild_online: bool,
    #[serde(default)]
    pub free_proc_cache: bool,
    pub rebuild_threshold: f64,
    pub reorganize_threshold: f64,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub connection_timeout_ms: u64,
    #[serde(default)]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub parallel_databases: bool,
    pub max_parallel_databases: u32,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            rebuild_online: true,
            free_proc_cache: false,
            rebuild_threshold: 30.0,
            reorganize_threshold: 10.0,
            retry_max_attempts: 3,
            retry_base_delay_ms: 1000,
            retry_max_delay_ms: 30000,
            connection_timeout_ms: 30000,
            request_timeout_ms: 0,
            parallel_databases: false,
            max_parallel_databases: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub database_name: String,
    pub schema_name: String,
    pub table_name: String,
    pub index_name: String,
    pub fragmentation_percent: f64,
    pub page_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MaintenanceAction {
    Rebuild,
    Reorganize,
    Skip,
}

impl MaintenanceAction {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceAction::Rebuild => "REBUILD",
            MaintenanceAction::Reorganize => "REORGANIZE",
            MaintenanceAction::Skip => "SKIP",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResult {
    pub schema_name: String,
    pub table_name: String,
    pub index_name: String,
    pub fragmentation_percent: f64,
    pub page_count: i64,
    pub action: MaintenanceAction,
    pub success: bool,
    pub duration_secs: f64,
    pub retry_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseResult {
    pub database_name: String,
    pub success: bool,
    pub indexes_processed: u32,
    pub indexes_rebuilt: u32,
    pub indexes_reorganized: u32,
    pub indexes_skipped: u32,
    pub total_duration_secs: f64,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub critical_failure: bool,
    #[serde(default)]
    pub manually_skipped: bool,
    #[serde(default)]
    pub index_results: Vec<IndexResult>,
}

impl DatabaseResult {
    /// Result reported for a database skipped before any index was touched.
    pub fn skipped(database_name: &str) -> Self {
        Self {
            database_name: database_name.to_string(),
            success: true,
            indexes_processed: 0,
            indexes_rebuilt: 0,
            indexes_reorganized: 0,
            indexes_skipped: 0,
            total_duration_secs: 0.0,
            errors: Vec::new(),
            critical_failure: false,
            manually_skipped: true,
            index_results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceSummary {
    pub databases_processed: u32,
    pub databases_failed: u32,
    pub databases_skipped: u32,
    pub total_indexes_rebuilt: u32,
    pub total_indexes_reorganized: u32,
    pub total_indexes_skipped: u32,
    pub total_duration_secs: f64,
    #[serde(default)]
    pub database_results: Vec<DatabaseResult>,
}

impl MaintenanceSummary {
    /// Aggregate per-database results into a run summary.
    pub fn from_results(results: Vec<DatabaseResult>, total_duration_secs: f64) -> Self {
        Self {
            databases_processed: results.len() as u32,
            databases_failed: results.iter().filter(|r| r.critical_failure).count() as u32,
            databases_skipped: results.iter().filter(|r| r.manually_skipped).count() as u32,
            total_indexes_rebuilt: results.iter().map(|r| r.indexes_rebuilt).sum(),
            total_indexes_reorganized: results.iter().map(|r| r.indexes_reorganized).sum(),
            total_indexes_skipped: results.iter().map(|r| r.indexes_skipped).sum(),
            total_duration_secs,
            database_results: results,
        }
    }
}

/// A finished run as kept by history storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub profile_id: String,
    pub profile_name: String,
    pub server: String,
    pub started_at: String,
    pub finished_at: String,
    pub databases_processed: u32,
    pub databases_failed: u32,
    pub databases_skipped: u32,
    pub total_indexes_rebuilt: u32,
    pub total_indexes_reorganized: u32,
    pub total_indexes_skipped: u32,
    pub total_duration_secs: f64,
    #[serde(default)]
    pub database_results: Vec<DatabaseResult>,
}

impl RunRecord {
    pub fn from_summary(
        profile: &ServerProfile,
        started_at: String,
        finished_at: String,
        summary: &MaintenanceSummary,
    ) -> Self {
        Self {
            id: 0,
            profile_id: profile.id.clone(),
            profile_name: profile.name.clone(),
            server: profile.server.clone(),
            started_at,
            finished_at,
            databases_processed: summary.databases_processed,
            databases_failed: summary.databases_failed,
            databases_skipped: summary.databases_skipped,
            total_indexes_rebuilt: summary.total_indexes_rebuilt,
            total_indexes_reorganized: summary.total_indexes_reorganized,
            total_indexes_skipped: summary.total_indexes_skipped,
            total_duration_secs: summary.total_duration_secs,
            database_results: summary.database_results.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Idle,
    Running,
    Paused,
    Finished,
    Stopped,
}

impl RunState {
    pub fn is_active(self) -> bool {
        matches!(self, RunState::Running | RunState::Paused)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Finished | RunState::Stopped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Paused => "paused",
            RunState::Finished => "finished",
            RunState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseCardState {
    Queued,
    Running,
    Done,
    Error,
    Skipped,
    Stopped,
}

impl DatabaseCardState {
    /// Done, errored, skipped, or stopped cards count as completed for progress.
    pub fn is_complete(self) -> bool {
        matches!(
            self,
            DatabaseCardState::Done
                | DatabaseCardState::Error
                | DatabaseCardState::Skipped
                | DatabaseCardState::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DatabaseCardState::Queued => "queued",
            DatabaseCardState::Running => "running",
            DatabaseCardState::Done => "done",
            DatabaseCardState::Error => "error",
            DatabaseCardState::Skipped => "skipped",
            DatabaseCardState::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexStatus {
    Pending,
    Processing,
    Done,
    Skipped,
    Error,
}
