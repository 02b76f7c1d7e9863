//! In-memory run projection.
//!
//! One [`ProfileRun`] per connection profile, built only by folding engine
//! events (see [`fold`]) plus direct setters used for optimistic command
//! feedback. The setters only touch runs that already exist. Readers always get cloned snapshots; nothing outside this module
//! holds a reference into the map.

mod fold;
#[cfg(test)]
mod properties;

pub use fold::fold;

use crate::events::EngineEvent;
use crate::model::{
    DatabaseCardState, IndexInfo, IndexStatus, MaintenanceAction, MaintenanceSummary, RunState,
    ServerProfile,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

const UNKNOWN_PROFILE_NAME: &str = "Unknown Profile";

/// Natural key of an index inside one database.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IndexKey {
    pub schema: String,
    pub table: String,
    pub index: String,
}

impl IndexKey {
    pub fn new(schema: &str, table: &str, index: &str) -> Self {
        Self {
            schema: schema.to_string(),
            table: table.to_string(),
            index: index.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexDetail {
    pub schema_name: String,
    pub table_name: String,
    pub index_name: String,
    pub fragmentation_percent: f64,
    pub page_count: i64,
    pub status: IndexStatus,
    pub action: Option<MaintenanceAction>,
    pub duration_secs: Option<f64>,
    pub retry_attempts: Option<u32>,
    pub error: Option<String>,
}

impl IndexDetail {
    fn pending(info: &IndexInfo) -> Self {
        Self {
            schema_name: info.schema_name.clone(),
            table_name: info.table_name.clone(),
            index_name: info.index_name.clone(),
            fragmentation_percent: info.fragmentation_percent,
            page_count: info.page_count,
            status: IndexStatus::Pending,
            action: None,
            duration_secs: None,
            retry_attempts: None,
            error: None,
        }
    }

    pub fn key(&self) -> IndexKey {
        IndexKey::new(&self.schema_name, &self.table_name, &self.index_name)
    }
}

/// Per-database view within a run.
///
/// `indexes` keeps render order; `index_pos` maps each key to its slot and
/// is only ever appended to, so positions stay valid for the card's lifetime.
#[derive(Debug, Clone, Serialize)]
pub struct DatabaseCard {
    pub name: String,
    pub state: DatabaseCardState,
    pub indexes: Vec<IndexDetail>,
    #[serde(skip)]
    index_pos: HashMap<IndexKey, usize>,
    pub indexes_processed: u32,
    pub indexes_rebuilt: u32,
    pub indexes_reorganized: u32,
    pub indexes_skipped: u32,
    pub duration_secs: f64,
    pub errors: Vec<String>,
}

impl DatabaseCard {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: DatabaseCardState::Queued,
            indexes: Vec::new(),
            index_pos: HashMap::new(),
            indexes_processed: 0,
            indexes_rebuilt: 0,
            indexes_reorganized: 0,
            indexes_skipped: 0,
            duration_secs: 0.0,
            errors: Vec::new(),
        }
    }

    fn index_mut(&mut self, key: &IndexKey) -> Option<&mut IndexDetail> {
        match self.index_pos.get(key) {
            Some(&i) => self.indexes.get_mut(i),
            None => None,
        }
    }

    /// Append an index unless its key is already present. Returns whether it was added.
    fn push_index(&mut self, detail: IndexDetail) -> bool {
        let key = detail.key();
        if self.index_pos.contains_key(&key) {
            return false;
        }
        self.index_pos.insert(key, self.indexes.len());
        self.indexes.push(detail);
        true
    }

    /// Fraction of known indexes processed, capped at 1. Zero when none are known yet.
    pub fn progress(&self) -> f64 {
        if self.indexes.is_empty() {
            return 0.0;
        }
        (self.indexes_processed as f64 / self.indexes.len() as f64).min(1.0)
    }
}

/// Snapshot of one profile's run.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileRun {
    pub profile_id: String,
    pub profile_name: String,
    pub profile_server: String,
    pub run_state: RunState,
    pub databases: Vec<DatabaseCard>,
    #[serde(skip)]
    db_pos: HashMap<String, usize>,
    pub current_db_index: u32,
    pub total_dbs: u32,
    pub summary: Option<MaintenanceSummary>,
    #[serde(skip)]
    started_at: Instant,
    #[serde(skip)]
    ended_at: Option<Instant>,
    pub is_parallel: bool,
}

impl ProfileRun {
    /// Default run for a profile first seen through an event.
    pub fn new(profile_id: &str) -> Self {
        Self {
            profile_id: profile_id.to_string(),
            profile_name: UNKNOWN_PROFILE_NAME.to_string(),
            profile_server: String::new(),
            run_state: RunState::Idle,
            databases: Vec::new(),
            db_pos: HashMap::new(),
            current_db_index: 0,
            total_dbs: 0,
            summary: None,
            started_at: Instant::now(),
            ended_at: None,
            is_parallel: false,
        }
    }

    /// Fresh running snapshot with every database queued.
    pub fn started(
        profile_id: &str,
        profile_name: &str,
        profile_server: &str,
        database_names: &[String],
        is_parallel: bool,
    ) -> Self {
        let mut run = Self::new(profile_id);
        run.profile_name = profile_name.to_string();
        run.profile_server = profile_server.to_string();
        run.run_state = RunState::Running;
        run.is_parallel = is_parallel;
        for name in database_names {
            run.card_entry(name);
        }
        run.total_dbs = run.databases.len() as u32;
        run
    }

    pub fn card(&self, name: &str) -> Option<&DatabaseCard> {
        self.db_pos.get(name).map(|&i| &self.databases[i])
    }

    /// Card for `name`, created as queued if no event announced it yet.
    fn card_entry(&mut self, name: &str) -> &mut DatabaseCard {
        let pos = match self.db_pos.get(name) {
            Some(&i) => i,
            None => {
                let i = self.databases.len();
                self.databases.push(DatabaseCard::new(name));
                self.db_pos.insert(name.to_string(), i);
                i
            }
        };
        &mut self.databases[pos]
    }

    /// Set the run state, stamping or clearing the end time used to freeze elapsed time.
    fn set_state(&mut self, state: RunState) {
        self.run_state = state;
        if state.is_terminal() {
            self.ended_at.get_or_insert_with(Instant::now);
        } else {
            self.ended_at = None;
        }
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<Instant> {
        self.ended_at
    }

    /// Card currently being worked on: the running one, or the last announced
    /// database when the run sits between a db-complete and the next db-start.
    pub fn active_database(&self) -> Option<&DatabaseCard> {
        self.databases
            .iter()
            .find(|c| c.state == DatabaseCardState::Running)
            .or_else(|| {
                let idx = self.current_db_index.checked_sub(1)? as usize;
                self.databases.get(idx)
            })
    }
}

/// Process-wide store of profile runs.
///
/// Clones share the same map. Each operation takes the lock once, replaces a
/// single profile's run, and releases it; the lock is never held across an
/// await point.
#[derive(Clone, Default)]
pub struct RunStore {
    runs: Arc<RwLock<HashMap<String, ProfileRun>>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace the profile's run with a fresh snapshot.
    pub fn start_run(&self, profile: &ServerProfile, database_names: &[String], is_parallel: bool) {
        let run = ProfileRun::started(
            &profile.id,
            &profile.name,
            &profile.server,
            database_names,
            is_parallel,
        );
        tracing::debug!(
            profile_id = %profile.id,
            databases = database_names.len(),
            is_parallel,
            "run started"
        );
        self.write().insert(profile.id.clone(), run);
    }

    /// Drop the profile's run entirely. Returns whether one existed.
    pub fn reset_profile(&self, profile_id: &str) -> bool {
        self.write().remove(profile_id).is_some()
    }

    /// Only touches an existing run. Returns whether one existed.
    pub fn set_run_state(&self, profile_id: &str, state: RunState) -> bool {
        match self.write().get_mut(profile_id) {
            Some(run) => {
                run.set_state(state);
                true
            }
            None => false,
        }
    }

    /// Only touches an existing run. Returns whether one existed.
    pub fn set_database_state(
        &self,
        profile_id: &str,
        name: &str,
        state: DatabaseCardState,
    ) -> bool {
        match self.write().get_mut(profile_id) {
            Some(run) => {
                run.card_entry(name).state = state;
                true
            }
            None => false,
        }
    }

    /// Put a card back to `state` if it still shows `expected` and the run
    /// has not ended. Returns whether the card changed.
    pub fn revert_database_state(
        &self,
        profile_id: &str,
        name: &str,
        expected: DatabaseCardState,
        state: DatabaseCardState,
    ) -> bool {
        let mut runs = self.write();
        let Some(run) = runs.get_mut(profile_id) else {
            return false;
        };
        if run.run_state.is_terminal() {
            return false;
        }
        let Some(&pos) = run.db_pos.get(name) else {
            return false;
        };
        let card = &mut run.databases[pos];
        if card.state != expected {
            return false;
        }
        card.state = state;
        true
    }

    /// Fold one engine event into the owning profile's run.
    pub fn apply(&self, event: &EngineEvent) {
        if let EngineEvent::RunError {
            profile_id,
            message,
        } = event
        {
            tracing::warn!(profile_id = %profile_id, "engine error: {message}");
            return;
        }
        self.update(event.profile_id(), |run| fold(run, event));
    }

    pub fn snapshot(&self, profile_id: &str) -> Option<ProfileRun> {
        self.read().get(profile_id).cloned()
    }

    /// All runs, ordered by profile id.
    pub fn snapshots(&self) -> Vec<ProfileRun> {
        let mut runs: Vec<ProfileRun> = self.read().values().cloned().collect();
        runs.sort_by(|a, b| a.profile_id.cmp(&b.profile_id));
        runs
    }

    /// Profiles with a run, sorted.
    pub fn profile_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn run_state(&self, profile_id: &str) -> Option<RunState> {
        self.read().get(profile_id).map(|r| r.run_state)
    }

    pub fn contains(&self, profile_id: &str) -> bool {
        self.read().contains_key(profile_id)
    }

    fn update(&self, profile_id: &str, f: impl FnOnce(ProfileRun) -> ProfileRun) {
        let mut runs = self.write();
        let current = runs
            .remove(profile_id)
            .unwrap_or_else(|| ProfileRun::new(profile_id));
        runs.insert(profile_id.to_string(), f(current));
    }

    // A panic inside a fold cannot leave a half-written run behind (the map
    // entry is replaced whole), so a poisoned lock is still consistent.
    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ProfileRun>> {
        self.runs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ProfileRun>> {
        self.runs.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> ServerProfile {
        ServerProfile {
            id: id.into(),
            name: format!("{id} name"),
            server: "sql01".into(),
            ..Default::default()
        }
    }

    fn dbs(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn start_run_queues_every_database() {
        let store = RunStore::new();
        store.start_run(&profile("p1"), &dbs(&["db1", "db2"]), false);

        let run = store.snapshot("p1").expect("run should exist");
        assert_eq!(run.run_state, RunState::Running);
        assert_eq!(run.total_dbs, 2);
        assert_eq!(run.profile_name, "p1 name");
        assert!(run
            .databases
            .iter()
            .all(|c| c.state == DatabaseCardState::Queued));
        assert!(run.ended_at().is_none());
    }

    #[test]
    fn start_then_reset_leaves_no_entry() {
        let store = RunStore::new();
        store.start_run(&profile("p1"), &dbs(&["db1"]), false);
        assert!(store.reset_profile("p1"));
        assert!(store.snapshot("p1").is_none());
        assert!(!store.contains("p1"));
        assert!(!store.reset_profile("p1"));
    }

    #[test]
    fn setters_never_create_a_run() {
        let store = RunStore::new();
        assert!(!store.set_run_state("ghost", RunState::Paused));
        assert!(!store.set_database_state("ghost", "db1", DatabaseCardState::Skipped));
        assert!(!store.contains("ghost"));
    }

    #[test]
    fn revert_only_undoes_an_unchanged_card_on_a_live_run() {
        let store = RunStore::new();
        store.start_run(&profile("p1"), &dbs(&["db1", "db2"]), false);
        store.set_database_state("p1", "db1", DatabaseCardState::Skipped);
        store.set_database_state("p1", "db2", DatabaseCardState::Done);

        let (skipped, running) = (DatabaseCardState::Skipped, DatabaseCardState::Running);
        assert!(!store.revert_database_state("p1", "db2", skipped, running));
        assert!(!store.revert_database_state("p1", "missing", skipped, running));
        assert!(store.revert_database_state("p1", "db1", skipped, running));
        assert_eq!(store.snapshot("p1").unwrap().card("db1").unwrap().state, running);

        store.set_database_state("p1", "db1", skipped);
        store.set_run_state("p1", RunState::Stopped);
        assert!(!store.revert_database_state("p1", "db1", skipped, running));
        assert_eq!(store.snapshot("p1").unwrap().card("db1").unwrap().state, skipped);
    }

    #[test]
    fn profile_ids_are_sorted() {
        let store = RunStore::new();
        store.start_run(&profile("p2"), &dbs(&["db1"]), false);
        store.start_run(&profile("p1"), &dbs(&["db1"]), false);
        assert_eq!(store.profile_ids(), vec!["p1", "p2"]);
    }

    #[test]
    fn start_run_replaces_previous_snapshot() {
        let store = RunStore::new();
        store.start_run(&profile("p1"), &dbs(&["old"]), true);
        store.set_run_state("p1", RunState::Stopped);
        store.start_run(&profile("p1"), &dbs(&["a", "b", "c"]), false);

        let run = store.snapshot("p1").unwrap();
        assert_eq!(run.run_state, RunState::Running);
        assert_eq!(run.databases.len(), 3);
        assert!(run.card("old").is_none());
        assert!(!run.is_parallel);
    }

    #[test]
    fn setters_are_idempotent_and_reversible() {
        let store = RunStore::new();
        store.start_run(&profile("p1"), &dbs(&["db1"]), false);

        store.set_run_state("p1", RunState::Paused);
        store.set_run_state("p1", RunState::Paused);
        assert_eq!(store.run_state("p1"), Some(RunState::Paused));
        store.set_run_state("p1", RunState::Running);
        assert_eq!(store.run_state("p1"), Some(RunState::Running));

        store.set_database_state("p1", "db1", DatabaseCardState::Skipped);
        store.set_database_state("p1", "db1", DatabaseCardState::Running);
        let run = store.snapshot("p1").unwrap();
        assert_eq!(run.databases.len(), 1);
        assert_eq!(run.card("db1").unwrap().state, DatabaseCardState::Running);
    }

    #[test]
    fn terminal_state_freezes_end_time_until_reactivated() {
        let store = RunStore::new();
        store.start_run(&profile("p1"), &dbs(&["db1"]), false);
        store.set_run_state("p1", RunState::Stopped);
        let ended = store.snapshot("p1").unwrap().ended_at();
        assert!(ended.is_some());

        store.set_run_state("p1", RunState::Stopped);
        assert_eq!(store.snapshot("p1").unwrap().ended_at(), ended);

        store.set_run_state("p1", RunState::Running);
        assert!(store.snapshot("p1").unwrap().ended_at().is_none());
    }

    #[test]
    fn run_error_is_not_folded() {
        let store = RunStore::new();
        store.apply(&EngineEvent::RunError {
            profile_id: "ghost".into(),
            message: "connection refused".into(),
        });
        assert!(store.snapshot("ghost").is_none());
    }

    #[test]
    fn unknown_profile_gets_default_run() {
        let store = RunStore::new();
        store.apply(&EngineEvent::RunControl {
            profile_id: "p9".into(),
            state: RunState::Paused,
        });
        let run = store.snapshot("p9").unwrap();
        assert_eq!(run.profile_name, UNKNOWN_PROFILE_NAME);
        assert_eq!(run.run_state, RunState::Paused);
    }

    #[test]
    fn profiles_are_independent() {
        let store = RunStore::new();
        store.start_run(&profile("a"), &dbs(&["x"]), false);
        store.start_run(&profile("b"), &dbs(&["x"]), false);
        store.set_database_state("a", "x", DatabaseCardState::Done);

        assert_eq!(
            store.snapshot("b").unwrap().card("x").unwrap().state,
            DatabaseCardState::Queued
        );
        let ids: Vec<String> = store.snapshots().into_iter().map(|r| r.profile_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn active_database_falls_back_to_last_announced() {
        let mut run = ProfileRun::started("p1", "n", "s", &dbs(&["db1", "db2"]), false);
        assert!(run.active_database().is_none());

        run.current_db_index = 1;
        assert_eq!(run.active_database().unwrap().name, "db1");

        run.card_entry("db2").state = DatabaseCardState::Running;
        assert_eq!(run.active_database().unwrap().name, "db2");
    }
}
