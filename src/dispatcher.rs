//! Run controls with optimistic feedback.
//!
//! Every control follows the same protocol: remember what the store showed,
//! apply the expected result right away, ask the engine, and put the old
//! value back if the engine says no. The failure message is kept per profile
//! until the next attempt.

use crate::engine::EngineClient;
use crate::error::{CommandError, EngineError};
use crate::model::{DatabaseCardState, MaintenanceOptions, RunState, ServerProfile};
use crate::projection::RunStore;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunCommand {
    Pause,
    Resume,
    Stop,
}

impl RunCommand {
    fn target(self) -> RunState {
        match self {
            RunCommand::Pause => RunState::Paused,
            RunCommand::Resume => RunState::Running,
            RunCommand::Stop => RunState::Stopped,
        }
    }

    fn name(self) -> &'static str {
        match self {
            RunCommand::Pause => "pause",
            RunCommand::Resume => "resume",
            RunCommand::Stop => "stop",
        }
    }
}

/// Run-state commands for one profile that have been issued but not answered.
///
/// Tickets are handed out in issue order. Only the newest command may touch
/// the store when it resolves; older answers just move `fallback` forward.
#[derive(Debug, Default)]
struct Ledger {
    next: u64,
    in_flight: BTreeSet<u64>,
    confirmed: u64,
    /// State to restore on failure: the newest confirmed target, or what the
    /// store showed before the first of the overlapping commands.
    fallback: Option<RunState>,
}

impl Ledger {
    fn has_newer(&self, ticket: u64) -> bool {
        self.in_flight.range(ticket + 1..).next().is_some()
    }
}

/// Sends run controls to the engine and keeps the store's view optimistic.
#[derive(Clone)]
pub struct CommandDispatcher {
    store: RunStore,
    engine: Arc<dyn EngineClient>,
    errors: Arc<Mutex<HashMap<String, String>>>,
    ledgers: Arc<Mutex<HashMap<String, Ledger>>>,
}

impl CommandDispatcher {
    pub fn new(store: RunStore, engine: Arc<dyn EngineClient>) -> Self {
        Self {
            store,
            engine,
            errors: Arc::new(Mutex::new(HashMap::new())),
            ledgers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Most recent command failure for the profile, cleared by the next attempt.
    pub fn last_error(&self, profile_id: &str) -> Option<String> {
        lock(&self.errors).get(profile_id).cloned()
    }

    pub async fn pause(&self, profile_id: &str) -> Result<(), CommandError> {
        self.run_state_command(profile_id, RunCommand::Pause).await
    }

    pub async fn resume(&self, profile_id: &str) -> Result<(), CommandError> {
        self.run_state_command(profile_id, RunCommand::Resume).await
    }

    pub async fn toggle_pause(&self, profile_id: &str) -> Result<(), CommandError> {
        if self.store.run_state(profile_id) == Some(RunState::Paused) {
            self.resume(profile_id).await
        } else {
            self.pause(profile_id).await
        }
    }

    /// Stop shows as stopped at once, whatever the run was doing.
    pub async fn stop(&self, profile_id: &str) -> Result<(), CommandError> {
        self.run_state_command(profile_id, RunCommand::Stop).await
    }

    /// Skip the database currently being worked on. Sequential runs only.
    pub async fn skip_current_database(&self, profile_id: &str) -> Result<(), CommandError> {
        self.clear_error(profile_id);
        let run = self.store.snapshot(profile_id);
        if run.as_ref().is_some_and(|r| r.is_parallel) {
            let err = CommandError::SkipInParallel;
            self.record_error(profile_id, &err);
            return Err(err);
        }

        let prior = run
            .as_ref()
            .and_then(|r| r.active_database())
            .map(|card| (card.name.clone(), card.state));
        if let Some((name, _)) = &prior {
            self.store
                .set_database_state(profile_id, name, DatabaseCardState::Skipped);
        }

        match self.engine.skip_current(profile_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // Engine events may have moved the card or ended the run meanwhile.
                if let Some((name, state)) = prior {
                    self.store.revert_database_state(
                        profile_id,
                        &name,
                        DatabaseCardState::Skipped,
                        state,
                    );
                }
                Err(self.fail(profile_id, "skip", e))
            }
        }
    }

    /// Show the run as started, then ask the engine to start it. A refused
    /// start leaves no trace of the run behind.
    pub async fn start_run(
        &self,
        profile: &ServerProfile,
        databases: &[String],
        options: &MaintenanceOptions,
    ) -> Result<(), CommandError> {
        self.clear_error(&profile.id);
        if databases.is_empty() {
            let err = CommandError::Validation("Select at least one database".into());
            self.record_error(&profile.id, &err);
            return Err(err);
        }

        self.store
            .start_run(profile, databases, options.parallel_databases);
        match self.engine.start_run(profile, databases, options).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.store.reset_profile(&profile.id);
                Err(self.fail(&profile.id, "start", e))
            }
        }
    }

    async fn run_state_command(
        &self,
        profile_id: &str,
        command: RunCommand,
    ) -> Result<(), CommandError> {
        self.clear_error(profile_id);
        let target = command.target();
        let ticket = self.begin(profile_id, target);

        let result = match command {
            RunCommand::Pause => self.engine.pause(profile_id).await,
            RunCommand::Resume => self.engine.resume(profile_id).await,
            RunCommand::Stop => self.engine.stop(profile_id).await,
        };

        match result {
            Ok(()) => {
                self.confirm(profile_id, ticket, target);
                Ok(())
            }
            Err(e) => {
                self.roll_back(profile_id, ticket, target);
                Err(self.fail(profile_id, command.name(), e))
            }
        }
    }

    fn begin(&self, profile_id: &str, target: RunState) -> u64 {
        let mut ledgers = lock(&self.ledgers);
        let ledger = ledgers.entry(profile_id.to_string()).or_default();
        if ledger.in_flight.is_empty() {
            ledger.fallback = self.store.run_state(profile_id);
        }
        ledger.next += 1;
        let ticket = ledger.next;
        ledger.in_flight.insert(ticket);
        // No optimistic run for a profile the store has never seen.
        self.store.set_run_state(profile_id, target);
        ticket
    }

    fn confirm(&self, profile_id: &str, ticket: u64, target: RunState) {
        let mut ledgers = lock(&self.ledgers);
        let Some(ledger) = ledgers.get_mut(profile_id) else {
            return;
        };
        ledger.in_flight.remove(&ticket);
        if ticket < ledger.confirmed {
            return;
        }
        ledger.confirmed = ticket;
        ledger.fallback = Some(target);
        if ledger.has_newer(ticket) {
            return;
        }
        // Engine events may already have ended the run.
        let current = self.store.run_state(profile_id);
        if current.is_some_and(|s| !s.is_terminal()) {
            self.store.set_run_state(profile_id, target);
        }
    }

    fn roll_back(&self, profile_id: &str, ticket: u64, target: RunState) {
        let mut ledgers = lock(&self.ledgers);
        let Some(ledger) = ledgers.get_mut(profile_id) else {
            return;
        };
        ledger.in_flight.remove(&ticket);
        if ledger.has_newer(ticket) {
            return;
        }
        // Only undo what this command put there.
        if self.store.run_state(profile_id) != Some(target) {
            return;
        }
        if let Some(state) = ledger.fallback {
            self.store.set_run_state(profile_id, state);
        }
    }

    fn fail(&self, profile_id: &str, command: &str, err: EngineError) -> CommandError {
        let err = CommandError::from(err);
        tracing::warn!(profile_id = %profile_id, command, "command failed: {err}");
        self.record_error(profile_id, &err);
        err
    }

    fn record_error(&self, profile_id: &str, err: &CommandError) {
        lock(&self.errors).insert(profile_id.to_string(), err.to_string());
    }

    fn clear_error(&self, profile_id: &str) {
        lock(&self.errors).remove(profile_id);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EngineEvent;
    use async_trait::async_trait;
    use tokio::sync::oneshot;

    type Gate = oneshot::Receiver<Result<(), EngineError>>;

    /// Engine whose answers are handed out by the test, one gate per call.
    #[derive(Default)]
    struct FakeEngine {
        gates: Mutex<HashMap<&'static str, Vec<Gate>>>,
        calls: Mutex<Vec<&'static str>>,
    }

    impl FakeEngine {
        /// Queue the answer slot for the next `name` call.
        fn gate(&self, name: &'static str) -> oneshot::Sender<Result<(), EngineError>> {
            let (tx, rx) = oneshot::channel();
            lock(&self.gates).entry(name).or_default().push(rx);
            tx
        }

        /// Answer the next `name` call immediately.
        fn answer(&self, name: &'static str, result: Result<(), EngineError>) {
            let _ = self.gate(name).send(result);
        }

        fn calls(&self) -> Vec<&'static str> {
            lock(&self.calls).clone()
        }

        async fn call(&self, name: &'static str) -> Result<(), EngineError> {
            lock(&self.calls).push(name);
            let gate = {
                let mut gates = lock(&self.gates);
                let queue = gates.entry(name).or_default();
                (!queue.is_empty()).then(|| queue.remove(0))
            };
            match gate {
                Some(rx) => rx.await.unwrap_or(Err(EngineError::Unavailable)),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl EngineClient for FakeEngine {
        async fn start_run(
            &self,
            _: &ServerProfile,
            _: &[String],
            _: &MaintenanceOptions,
        ) -> Result<(), EngineError> {
            self.call("start").await
        }
        async fn pause(&self, _: &str) -> Result<(), EngineError> {
            self.call("pause").await
        }
        async fn resume(&self, _: &str) -> Result<(), EngineError> {
            self.call("resume").await
        }
        async fn skip_current(&self, _: &str) -> Result<(), EngineError> {
            self.call("skip").await
        }
        async fn stop(&self, _: &str) -> Result<(), EngineError> {
            self.call("stop").await
        }
        async fn test_connection(&self, _: &ServerProfile) -> Result<(), EngineError> {
            Ok(())
        }
        async fn list_databases(&self, _: &ServerProfile) -> Result<Vec<String>, EngineError> {
            Ok(Vec::new())
        }
    }

    fn profile() -> ServerProfile {
        ServerProfile {
            id: "p1".into(),
            name: "Primary".into(),
            server: "sql01".into(),
            ..ServerProfile::default()
        }
    }

    fn setup(parallel: bool) -> (CommandDispatcher, Arc<FakeEngine>) {
        let store = RunStore::new();
        let names: Vec<String> = ["db1", "db2", "db3"].iter().map(|s| s.to_string()).collect();
        store.start_run(&profile(), &names, parallel);
        let engine = Arc::new(FakeEngine::default());
        (CommandDispatcher::new(store, engine.clone()), engine)
    }

    fn db_start(store: &RunStore, db: &str, current: u32) {
        store.apply(&EngineEvent::DbStart {
            profile_id: "p1".into(),
            db_name: db.into(),
            current,
            total: 3,
        });
    }

    fn card_state(d: &CommandDispatcher, db: &str) -> DatabaseCardState {
        d.store().snapshot("p1").unwrap().card(db).unwrap().state
    }

    #[tokio::test]
    async fn failed_skip_restores_running_card() {
        let (d, engine) = setup(false);
        db_start(d.store(), "db1", 1);
        db_start(d.store(), "db2", 2);
        d.store().apply(&EngineEvent::DbComplete {
            profile_id: "p1".into(),
            result: crate::model::DatabaseResult::skipped("db1"),
        });
        let gate = engine.gate("skip");

        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.skip_current_database("p1").await })
        };
        tokio::task::yield_now().await;
        while engine.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(card_state(&d, "db2"), DatabaseCardState::Skipped);

        gate.send(Err(EngineError::Rejected("engine busy".into())))
            .unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "engine busy");
        assert_eq!(card_state(&d, "db2"), DatabaseCardState::Running);
        assert_eq!(d.last_error("p1").as_deref(), Some("engine busy"));
    }

    #[tokio::test]
    async fn failed_skip_after_stop_keeps_card_stopped() {
        let (d, engine) = setup(false);
        db_start(d.store(), "db1", 1);
        let gate = engine.gate("skip");

        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.skip_current_database("p1").await })
        };
        while engine.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(card_state(&d, "db1"), DatabaseCardState::Skipped);

        d.store().apply(&EngineEvent::DbComplete {
            profile_id: "p1".into(),
            result: crate::model::DatabaseResult::skipped("db1"),
        });
        d.store().apply(&EngineEvent::RunControl {
            profile_id: "p1".into(),
            state: RunState::Stopped,
        });
        gate.send(Err(EngineError::NoActiveRun)).unwrap();
        assert!(task.await.unwrap().is_err());

        let run = d.store().snapshot("p1").unwrap();
        assert_eq!(run.run_state, RunState::Stopped);
        assert!(run
            .databases
            .iter()
            .all(|c| c.state != DatabaseCardState::Running));
    }

    #[tokio::test]
    async fn failed_skip_leaves_card_the_engine_already_moved() {
        let (d, engine) = setup(false);
        db_start(d.store(), "db1", 1);
        let gate = engine.gate("skip");

        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.skip_current_database("p1").await })
        };
        while engine.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        d.store().set_database_state("p1", "db1", DatabaseCardState::Done);
        gate.send(Err(EngineError::Rejected("too late".into()))).unwrap();
        assert!(task.await.unwrap().is_err());
        assert_eq!(card_state(&d, "db1"), DatabaseCardState::Done);
    }

    #[tokio::test]
    async fn successful_skip_keeps_optimistic_state() {
        let (d, _engine) = setup(false);
        db_start(d.store(), "db1", 1);
        d.skip_current_database("p1").await.unwrap();
        assert_eq!(card_state(&d, "db1"), DatabaseCardState::Skipped);
        assert_eq!(d.last_error("p1"), None);
    }

    #[tokio::test]
    async fn skip_between_databases_targets_last_announced() {
        let (d, engine) = setup(false);
        db_start(d.store(), "db1", 1);
        d.store().set_database_state("p1", "db1", DatabaseCardState::Done);
        engine.answer("skip", Err(EngineError::NoActiveRun));

        assert!(d.skip_current_database("p1").await.is_err());
        assert_eq!(card_state(&d, "db1"), DatabaseCardState::Done);
    }

    #[tokio::test]
    async fn skip_without_active_database_still_reaches_engine() {
        let (d, engine) = setup(false);
        d.skip_current_database("p1").await.unwrap();
        assert_eq!(engine.calls(), vec!["skip"]);
        let run = d.store().snapshot("p1").unwrap();
        assert!(run
            .databases
            .iter()
            .all(|c| c.state == DatabaseCardState::Queued));
    }

    #[tokio::test]
    async fn parallel_skip_is_refused_before_dispatch() {
        let (d, engine) = setup(true);
        db_start(d.store(), "db1", 1);
        let err = d.skip_current_database("p1").await.unwrap_err();
        assert_eq!(err, CommandError::SkipInParallel);
        assert!(engine.calls().is_empty());
        assert_eq!(card_state(&d, "db1"), DatabaseCardState::Running);
        assert!(d.last_error("p1").is_some());
    }

    #[tokio::test]
    async fn failed_stop_restores_previous_state_exactly() {
        let (d, engine) = setup(false);
        d.store().set_run_state("p1", RunState::Paused);
        engine.answer("stop", Err(EngineError::Unavailable));

        assert!(d.stop("p1").await.is_err());
        assert_eq!(d.store().run_state("p1"), Some(RunState::Paused));
        assert_eq!(
            d.last_error("p1").as_deref(),
            Some("maintenance engine is unavailable")
        );
    }

    #[tokio::test]
    async fn stop_applies_before_engine_answers() {
        let (d, engine) = setup(false);
        let gate = engine.gate("stop");
        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.stop("p1").await })
        };
        while engine.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(d.store().run_state("p1"), Some(RunState::Stopped));
        gate.send(Ok(())).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(d.store().run_state("p1"), Some(RunState::Stopped));
    }

    #[tokio::test]
    async fn new_attempt_clears_previous_error() {
        let (d, engine) = setup(false);
        engine.answer("pause", Err(EngineError::Rejected("nope".into())));
        assert!(d.pause("p1").await.is_err());
        assert_eq!(d.store().run_state("p1"), Some(RunState::Running));
        assert!(d.last_error("p1").is_some());

        d.pause("p1").await.unwrap();
        assert_eq!(d.last_error("p1"), None);
        assert_eq!(d.store().run_state("p1"), Some(RunState::Paused));
    }

    #[tokio::test]
    async fn toggle_pause_follows_current_state() {
        let (d, engine) = setup(false);
        d.toggle_pause("p1").await.unwrap();
        assert_eq!(d.store().run_state("p1"), Some(RunState::Paused));
        d.toggle_pause("p1").await.unwrap();
        assert_eq!(d.store().run_state("p1"), Some(RunState::Running));
        assert_eq!(engine.calls(), vec!["pause", "resume"]);
    }

    async fn overlapping(
        pause: Result<(), EngineError>,
        resume: Result<(), EngineError>,
        resume_first: bool,
    ) -> RunState {
        let (d, engine) = setup(false);
        let pause_gate = engine.gate("pause");
        let resume_gate = engine.gate("resume");

        let p = {
            let d = d.clone();
            tokio::spawn(async move { d.pause("p1").await })
        };
        while engine.calls().len() < 1 {
            tokio::task::yield_now().await;
        }
        let r = {
            let d = d.clone();
            tokio::spawn(async move { d.resume("p1").await })
        };
        while engine.calls().len() < 2 {
            tokio::task::yield_now().await;
        }

        if resume_first {
            resume_gate.send(resume).unwrap();
            let _ = r.await.unwrap();
            pause_gate.send(pause).unwrap();
            let _ = p.await.unwrap();
        } else {
            pause_gate.send(pause).unwrap();
            let _ = p.await.unwrap();
            resume_gate.send(resume).unwrap();
            let _ = r.await.unwrap();
        }
        d.store().run_state("p1").unwrap()
    }

    #[tokio::test]
    async fn overlapping_pause_resume_both_succeed_ends_running() {
        assert_eq!(overlapping(Ok(()), Ok(()), false).await, RunState::Running);
        assert_eq!(overlapping(Ok(()), Ok(()), true).await, RunState::Running);
    }

    #[tokio::test]
    async fn overlapping_resume_failure_falls_back_to_confirmed_pause() {
        let busy = || Err(EngineError::Rejected("busy".into()));
        assert_eq!(overlapping(Ok(()), busy(), false).await, RunState::Paused);
    }

    #[tokio::test]
    async fn overlapping_both_fail_restores_original_state() {
        let busy = || Err(EngineError::Rejected("busy".into()));
        assert_eq!(overlapping(busy(), busy(), false).await, RunState::Running);
        assert_eq!(overlapping(busy(), busy(), true).await, RunState::Running);
    }

    #[tokio::test]
    async fn older_failure_does_not_undo_newer_command() {
        let busy = || Err(EngineError::Rejected("busy".into()));
        assert_eq!(overlapping(busy(), Ok(()), false).await, RunState::Running);
    }

    #[tokio::test]
    async fn confirmation_does_not_revive_finished_run() {
        let (d, engine) = setup(false);
        let gate = engine.gate("pause");
        let task = {
            let d = d.clone();
            tokio::spawn(async move { d.pause("p1").await })
        };
        while engine.calls().is_empty() {
            tokio::task::yield_now().await;
        }
        d.store().apply(&EngineEvent::RunControl {
            profile_id: "p1".into(),
            state: RunState::Stopped,
        });
        gate.send(Ok(())).unwrap();
        task.await.unwrap().unwrap();
        assert_eq!(d.store().run_state("p1"), Some(RunState::Stopped));
    }

    #[tokio::test]
    async fn start_with_no_databases_is_rejected_without_side_effects() {
        let store = RunStore::new();
        let engine = Arc::new(FakeEngine::default());
        let d = CommandDispatcher::new(store.clone(), engine.clone());

        let err = d
            .start_run(&profile(), &[], &MaintenanceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Validation(_)));
        assert!(!store.contains("p1"));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn refused_start_leaves_no_run_behind() {
        let store = RunStore::new();
        let engine = Arc::new(FakeEngine::default());
        engine.answer(
            "start",
            Err(EngineError::Rejected(
                "Maintenance run is already active for this profile".into(),
            )),
        );
        let d = CommandDispatcher::new(store.clone(), engine);

        let names = vec!["db1".to_string()];
        assert!(d
            .start_run(&profile(), &names, &MaintenanceOptions::default())
            .await
            .is_err());
        assert!(!store.contains("p1"));
        assert_eq!(
            d.last_error("p1").as_deref(),
            Some("Maintenance run is already active for this profile")
        );
    }

    #[tokio::test]
    async fn accepted_start_shows_queued_cards() {
        let store = RunStore::new();
        let d = CommandDispatcher::new(store.clone(), Arc::new(FakeEngine::default()));
        let names = vec!["db1".to_string(), "db2".to_string()];
        d.start_run(&profile(), &names, &MaintenanceOptions::default())
            .await
            .unwrap();

        let run = store.snapshot("p1").unwrap();
        assert_eq!(run.run_state, RunState::Running);
        assert_eq!(run.total_dbs, 2);
        assert_eq!(run.profile_name, "Primary");
    }

    #[tokio::test]
    async fn failed_pause_on_unknown_profile_leaves_no_entry() {
        let store = RunStore::new();
        let engine = Arc::new(FakeEngine::default());
        engine.answer("pause", Err(EngineError::NoActiveRun));
        let d = CommandDispatcher::new(store.clone(), engine);
        assert!(d.pause("ghost").await.is_err());
        assert!(!store.contains("ghost"));
    }

    #[tokio::test]
    async fn successful_commands_on_unknown_profile_leave_no_entry() {
        let store = RunStore::new();
        let engine = Arc::new(FakeEngine::default());
        let d = CommandDispatcher::new(store.clone(), engine.clone());

        d.pause("ghost").await.unwrap();
        d.resume("ghost").await.unwrap();
        d.stop("ghost").await.unwrap();
        d.skip_current_database("ghost").await.unwrap();

        assert_eq!(engine.calls(), vec!["pause", "resume", "stop", "skip"]);
        assert!(!store.contains("ghost"));
        assert!(store.snapshots().is_empty());
    }
}
