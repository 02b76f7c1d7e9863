//! Command seam to the maintenance engine.
//!
//! The console never touches a database itself. It sends commands through an
//! [`EngineClient`] and learns about progress only from the event channel the
//! engine publishes on.

pub mod sim;

use crate::error::EngineError;
use crate::model::{MaintenanceOptions, ServerProfile};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

/// Control signal delivered to a running maintenance task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineControl {
    Running,
    Paused,
    /// Abandon the current database and move on to the next one.
    SkipDatabase,
    Stop,
}

/// Request/response command API of the engine.
///
/// A successful return only means the engine accepted the command; its effect
/// shows up later on the event channel.
#[async_trait]
pub trait EngineClient: Send + Sync {
    async fn start_run(
        &self,
        profile: &ServerProfile,
        databases: &[String],
        options: &MaintenanceOptions,
    ) -> Result<(), EngineError>;

    async fn pause(&self, profile_id: &str) -> Result<(), EngineError>;

    async fn resume(&self, profile_id: &str) -> Result<(), EngineError>;

    async fn skip_current(&self, profile_id: &str) -> Result<(), EngineError>;

    async fn stop(&self, profile_id: &str) -> Result<(), EngineError>;

    async fn test_connection(&self, profile: &ServerProfile) -> Result<(), EngineError>;

    async fn list_databases(&self, profile: &ServerProfile) -> Result<Vec<String>, EngineError>;
}

#[derive(Debug)]
pub enum EngineCommand {
    StartRun {
        profile: ServerProfile,
        databases: Vec<String>,
        options: MaintenanceOptions,
    },
    Control {
        profile_id: String,
        control: EngineControl,
    },
    TestConnection(ServerProfile),
    ListDatabases(ServerProfile),
}

#[derive(Debug)]
pub enum EngineReply {
    Accepted,
    Databases(Vec<String>),
}

/// One command plus the slot its answer goes back through.
#[derive(Debug)]
pub struct EngineRequest {
    pub command: EngineCommand,
    pub reply: oneshot::Sender<Result<EngineReply, EngineError>>,
}

/// [`EngineClient`] that forwards commands to an engine task over a channel.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<EngineRequest>,
}

impl EngineHandle {
    pub fn new(tx: mpsc::UnboundedSender<EngineRequest>) -> Self {
        Self { tx }
    }

    async fn send(&self, command: EngineCommand) -> Result<EngineReply, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(EngineRequest { command, reply })
            .map_err(|_| EngineError::Unavailable)?;
        rx.await.map_err(|_| EngineError::Unavailable)?
    }

    async fn control(&self, profile_id: &str, control: EngineControl) -> Result<(), EngineError> {
        self.send(EngineCommand::Control {
            profile_id: profile_id.to_string(),
            control,
        })
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl EngineClient for EngineHandle {
    async fn start_run(
        &self,
        profile: &ServerProfile,
        databases: &[String],
        options: &MaintenanceOptions,
    ) -> Result<(), EngineError> {
        self.send(EngineCommand::StartRun {
            profile: profile.clone(),
            databases: databases.to_vec(),
            options: options.clone(),
        })
        .await
        .map(|_| ())
    }

    async fn pause(&self, profile_id: &str) -> Result<(), EngineError> {
        self.control(profile_id, EngineControl::Paused).await
    }

    async fn resume(&self, profile_id: &str) -> Result<(), EngineError> {
        self.control(profile_id, EngineControl::Running).await
    }

    async fn skip_current(&self, profile_id: &str) -> Result<(), EngineError> {
        self.control(profile_id, EngineControl::SkipDatabase).await
    }

    async fn stop(&self, profile_id: &str) -> Result<(), EngineError> {
        self.control(profile_id, EngineControl::Stop).await
    }

    async fn test_connection(&self, profile: &ServerProfile) -> Result<(), EngineError> {
        self.send(EngineCommand::TestConnection(profile.clone()))
            .await
            .map(|_| ())
    }

    async fn list_databases(&self, profile: &ServerProfile) -> Result<Vec<String>, EngineError> {
        match self
            .send(EngineCommand::ListDatabases(profile.clone()))
            .await?
        {
            EngineReply::Databases(names) => Ok(names),
            EngineReply::Accepted => Ok(Vec::new()),
        }
    }
}
