//! Generated event sequences checked against the fold invariants.

use super::{fold, ProfileRun};
use crate::events::EngineEvent;
use crate::model::{DatabaseCardState, DatabaseResult, IndexInfo, MaintenanceAction, RunState};
use proptest::prelude::*;

const P: &str = "p1";
const DATABASES: [&str; 3] = ["db1", "db2", "db3"];
const INDEXES: [&str; 3] = ["ix_a", "ix_b", "ix_c"];

fn arb_db() -> impl Strategy<Value = String> {
    (0..DATABASES.len()).prop_map(|i| DATABASES[i].to_string())
}

fn arb_index() -> impl Strategy<Value = String> {
    (0..INDEXES.len()).prop_map(|i| INDEXES[i].to_string())
}

fn arb_action() -> impl Strategy<Value = MaintenanceAction> {
    prop_oneof![
        Just(MaintenanceAction::Rebuild),
        Just(MaintenanceAction::Reorganize),
        Just(MaintenanceAction::Skip),
    ]
}

fn arb_run_state() -> impl Strategy<Value = RunState> {
    prop_oneof![
        Just(RunState::Idle),
        Just(RunState::Running),
        Just(RunState::Paused),
        Just(RunState::Finished),
        Just(RunState::Stopped),
    ]
}

fn arb_index_found() -> impl Strategy<Value = EngineEvent> {
    (arb_db(), arb_index(), 0.0..100.0f64).prop_map(|(db, index, fragmentation)| {
        EngineEvent::IndexFound {
            profile_id: P.into(),
            index: IndexInfo {
                database_name: db,
                schema_name: "dbo".into(),
                table_name: "orders".into(),
                index_name: index,
                fragmentation_percent: fragmentation,
                page_count: 1000,
            },
        }
    })
}

/// An index-complete event together with the database it names.
fn arb_index_complete() -> impl Strategy<Value = (String, EngineEvent)> {
    (arb_db(), arb_index(), arb_action(), any::<bool>(), 0u32..4).prop_map(
        |(db, index, action, success, retries)| {
            let event = EngineEvent::IndexComplete {
                profile_id: P.into(),
                db_name: db.clone(),
                schema_name: "dbo".into(),
                table_name: "orders".into(),
                index_name: index,
                action,
                success,
                duration_secs: 0.5,
                retry_attempts: retries,
                error: (!success).then(|| "deadlock victim".to_string()),
            };
            (db, event)
        },
    )
}

fn arb_event() -> impl Strategy<Value = EngineEvent> {
    prop_oneof![
        (arb_db(), 1u32..4).prop_map(|(db, current)| EngineEvent::DbStart {
            profile_id: P.into(),
            db_name: db,
            current,
            total: 3,
        }),
        arb_index_found(),
        (arb_db(), arb_index(), arb_action()).prop_map(|(db, index, action)| {
            EngineEvent::IndexActionChosen {
                profile_id: P.into(),
                db_name: db,
                schema_name: "dbo".into(),
                table_name: "orders".into(),
                index_name: index,
                action,
            }
        }),
        arb_index_complete().prop_map(|(_, event)| event),
        (arb_db(), any::<bool>(), any::<bool>()).prop_map(|(db, skipped, critical)| {
            let mut result = DatabaseResult::skipped(&db);
            result.manually_skipped = skipped;
            result.critical_failure = critical;
            result.success = !critical;
            result.indexes_processed = 1;
            EngineEvent::DbComplete {
                profile_id: P.into(),
                result,
            }
        }),
        arb_run_state().prop_map(|state| EngineEvent::RunControl {
            profile_id: P.into(),
            state,
        }),
    ]
}

fn arb_events() -> impl Strategy<Value = Vec<EngineEvent>> {
    prop::collection::vec(arb_event(), 0..40)
}

fn replay(events: &[EngineEvent]) -> ProfileRun {
    let names: Vec<String> = DATABASES.iter().map(|s| s.to_string()).collect();
    let run = ProfileRun::started(P, "Prod", "sql01", &names, false);
    events.iter().fold(run, fold)
}

fn processed(run: &ProfileRun, db: &str) -> u32 {
    run.card(db).map_or(0, |card| card.indexes_processed)
}

proptest! {
    #[test]
    fn index_found_is_idempotent(events in arb_events(), found in arb_index_found()) {
        let once = fold(replay(&events), &found);
        let twice = fold(once.clone(), &found);
        prop_assert_eq!(
            serde_json::to_value(&once).unwrap(),
            serde_json::to_value(&twice).unwrap()
        );
    }

    #[test]
    fn index_complete_counts_exactly_once(events in arb_events(), (db, complete) in arb_index_complete()) {
        let before = replay(&events);
        let after = fold(before.clone(), &complete);
        prop_assert_eq!(processed(&after, &db), processed(&before, &db) + 1);
        for other in DATABASES.iter().filter(|name| **name != db) {
            prop_assert_eq!(processed(&after, other), processed(&before, other));
        }
    }

    #[test]
    fn stop_leaves_no_running_cards(events in arb_events()) {
        let stop = EngineEvent::RunControl {
            profile_id: P.into(),
            state: RunState::Stopped,
        };
        let stopped = fold(replay(&events), &stop);
        prop_assert_eq!(stopped.run_state, RunState::Stopped);
        prop_assert!(stopped
            .databases
            .iter()
            .all(|card| card.state != DatabaseCardState::Running));
    }
}
