//! Subscription from the engine's event channel into the run store.
//!
//! One listener task per application: it is spawned once and stays up until
//! the engine closes the channel or the handle is shut down. Listening stays
//! continuous across run-state changes, so no event falls between an
//! unsubscribe and a resubscribe.

use crate::error::AlreadyRegistered;
use crate::events::EngineEvent;
use crate::projection::RunStore;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};

/// Counters reported when the listener stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub folded: u64,
    /// `maintenance:error` events, logged but not folded.
    pub advisories: u64,
}

pub struct EventBridge {
    store: RunStore,
    finished_tx: Option<mpsc::UnboundedSender<String>>,
    registered: AtomicBool,
}

impl EventBridge {
    pub fn new(store: RunStore) -> Self {
        Self {
            store,
            finished_tx: None,
            registered: AtomicBool::new(false),
        }
    }

    /// Also send the profile id of every finished run to `tx`.
    pub fn with_finished_observer(mut self, tx: mpsc::UnboundedSender<String>) -> Self {
        self.finished_tx = Some(tx);
        self
    }

    /// Spawn the listener. Only the first call succeeds.
    pub fn register(
        &self,
        source: mpsc::UnboundedReceiver<EngineEvent>,
    ) -> Result<BridgeHandle, AlreadyRegistered> {
        if self.registered.swap(true, Ordering::AcqRel) {
            tracing::warn!("engine event listeners already registered");
            return Err(AlreadyRegistered);
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(listen(
            self.store.clone(),
            source,
            self.finished_tx.clone(),
            shutdown_rx,
        ));
        tracing::debug!("engine event listeners registered");
        Ok(BridgeHandle { shutdown_tx, task })
    }
}

/// Control over the running listener. Dropping it leaves the listener running.
pub struct BridgeHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<BridgeStats>,
}

impl BridgeHandle {
    /// Stop listening now and return what was folded.
    pub async fn shutdown(self) -> Result<BridgeStats, JoinError> {
        let _ = self.shutdown_tx.send(true);
        self.task.await
    }

    /// Wait until the engine side closes the channel.
    pub async fn join(self) -> Result<BridgeStats, JoinError> {
        self.task.await
    }
}

async fn listen(
    store: RunStore,
    mut source: mpsc::UnboundedReceiver<EngineEvent>,
    finished_tx: Option<mpsc::UnboundedSender<String>>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> BridgeStats {
    let mut stats = BridgeStats::default();
    let mut handle_alive = true;
    loop {
        tokio::select! {
            changed = shutdown_rx.changed(), if handle_alive => {
                match changed {
                    Err(_) => handle_alive = false,
                    Ok(()) if *shutdown_rx.borrow() => break,
                    Ok(()) => {}
                }
            }
            ev = source.recv() => {
                let Some(ev) = ev else {
                    break;
                };
                tracing::trace!(topic = ev.topic(), profile_id = %ev.profile_id(), "engine event");
                store.apply(&ev);
                match &ev {
                    EngineEvent::RunError { .. } => stats.advisories += 1,
                    EngineEvent::RunFinished { profile_id, .. } => {
                        stats.folded += 1;
                        if let Some(tx) = &finished_tx {
                            let _ = tx.send(profile_id.clone());
                        }
                    }
                    _ => stats.folded += 1,
                }
            }
        }
    }
    tracing::debug!(folded = stats.folded, "engine event listener stopped");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MaintenanceSummary, RunState};

    fn control(state: RunState) -> EngineEvent {
        EngineEvent::RunControl {
            profile_id: "p1".into(),
            state,
        }
    }

    #[tokio::test]
    async fn folds_events_until_channel_closes() {
        let store = RunStore::new();
        let bridge = EventBridge::new(store.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bridge.register(rx).unwrap();

        tx.send(control(RunState::Running)).unwrap();
        tx.send(control(RunState::Paused)).unwrap();
        tx.send(EngineEvent::RunError {
            profile_id: "p1".into(),
            message: "db1: connection refused".into(),
        })
        .unwrap();
        drop(tx);

        let stats = handle.join().await.unwrap();
        assert_eq!(
            stats,
            BridgeStats {
                folded: 2,
                advisories: 1
            }
        );
        assert_eq!(store.run_state("p1"), Some(RunState::Paused));
    }

    #[tokio::test]
    async fn second_registration_is_refused() {
        let bridge = EventBridge::new(RunStore::new());
        let (_tx1, rx1) = mpsc::unbounded_channel();
        let (_tx2, rx2) = mpsc::unbounded_channel();
        let handle = bridge.register(rx1).unwrap();
        assert!(matches!(bridge.register(rx2), Err(AlreadyRegistered)));
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn finished_runs_are_reported_to_observer() {
        let store = RunStore::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let bridge = EventBridge::new(store.clone()).with_finished_observer(done_tx);
        let (tx, rx) = mpsc::unbounded_channel();
        let _handle = bridge.register(rx).unwrap();

        tx.send(EngineEvent::RunFinished {
            profile_id: "p1".into(),
            summary: MaintenanceSummary::default(),
        })
        .unwrap();

        assert_eq!(done_rx.recv().await.as_deref(), Some("p1"));
        assert_eq!(store.run_state("p1"), Some(RunState::Finished));
    }

    #[tokio::test]
    async fn dropped_handle_keeps_listening() {
        let store = RunStore::new();
        let bridge = EventBridge::new(store.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        drop(bridge.register(rx).unwrap());

        tx.send(control(RunState::Paused)).unwrap();
        for _ in 0..100 {
            if store.contains("p1") {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.run_state("p1"), Some(RunState::Paused));
    }

    #[tokio::test]
    async fn shutdown_stops_listening_while_engine_is_alive() {
        let store = RunStore::new();
        let bridge = EventBridge::new(store.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = bridge.register(rx).unwrap();

        let stats = handle.shutdown().await.unwrap();
        assert_eq!(stats.folded, 0);
        // The receiver went away with the listener.
        assert!(tx.send(control(RunState::Running)).is_err());
    }
}
