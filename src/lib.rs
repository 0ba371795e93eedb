//! classmesh: real-time session core for small live classrooms
//!
//! One [`ReconciliationController`] per client joins a session through a
//! signal relay, keeps a direct media link to every other participant and
//! mirrors the teacher-owned classroom state. [`spawn_client`] runs a
//! controller on the current runtime and hands back the UI side of its
//! channels.

use log::debug;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use network::{
    Delivery, LocalMedia, LocalRelay, LocalTrack, PresenceUpdate, RelaySubscription,
    SignalRelay, StateEvent, TransportProvider, WebRtcProvider,
};
pub use session::{
    Collaborators, ControllerCommand, ControllerConfig, Credentials, DeviceMediaSource,
    ExitReason, MediaSource, MemoryPersistence, PersistenceLayer, ReconciliationController,
    SessionRecord,
};
pub use session_core::{
    ComprehensionStatus, Error, LinkState, MediaPermission, NoticeLevel, Participant, Role,
    SessionEvent, SessionId, SessionIdentity, SessionSnapshot, SessionState, TimerState,
};
pub use settings_manager::{ConfigManager, Settings};

/// Buffered commands per client
const COMMAND_CAPACITY: usize = 64;

/// Collaborators backed by real peer connections configured from `settings`
pub fn webrtc_collaborators(
    settings: &Settings,
    relay: Arc<dyn SignalRelay>,
    persistence: Arc<dyn PersistenceLayer>,
    media: Arc<dyn MediaSource>,
) -> Result<Collaborators, Error> {
    settings.validate()?;
    let transports = WebRtcProvider::new(settings.ice_servers.clone())?;
    debug!("Peer connections use {} ICE servers", transports.ice_server_count());
    Ok(Collaborators {
        relay,
        transports: Arc::new(transports),
        persistence,
        media,
    })
}

/// In-process relay sized from `settings`
pub fn local_relay(settings: &Settings) -> LocalRelay {
    LocalRelay::new(settings.relay_capacity)
}

/// UI side of a running controller
pub struct ClientHandle {
    identity: SessionIdentity,
    commands: mpsc::Sender<ControllerCommand>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Events read past while waiting for a snapshot
    backlog: VecDeque<SessionEvent>,
    task: JoinHandle<Result<ExitReason, Error>>,
}

/// Join `session` and run the controller in the background
pub async fn spawn_client(
    session: SessionId,
    credentials: Credentials,
    collaborators: Collaborators,
    config: ControllerConfig,
) -> Result<ClientHandle, Error> {
    let identity = credentials.identity.clone();
    let (commands, command_rx) = mpsc::channel(COMMAND_CAPACITY);
    let (event_tx, events) = mpsc::unbounded_channel();

    let controller = ReconciliationController::join(
        session,
        credentials,
        collaborators,
        config,
        command_rx,
        event_tx,
    )
    .await?;
    debug!("Spawning controller for {}", identity);

    Ok(ClientHandle {
        identity,
        commands,
        events,
        backlog: VecDeque::new(),
        task: tokio::spawn(controller.run()),
    })
}

impl ClientHandle {
    pub fn identity(&self) -> &SessionIdentity {
        &self.identity
    }

    pub async fn send(&self, command: ControllerCommand) -> Result<(), Error> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::InvalidState(format!("Controller for {} has stopped", self.identity)))
    }

    /// Next event, or `None` once the controller is gone and drained
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        match self.backlog.pop_front() {
            Some(event) => Some(event),
            None => self.events.recv().await,
        }
    }

    /// Ask the controller for a snapshot; other events stay queued
    pub async fn snapshot(&mut self) -> Result<SessionSnapshot, Error> {
        self.send(ControllerCommand::RequestSnapshot).await?;
        while let Some(event) = self.events.recv().await {
            match event {
                SessionEvent::Snapshot(snapshot) => return Ok(snapshot),
                other => self.backlog.push_back(other),
            }
        }
        Err(Error::InvalidState(format!(
            "Controller for {} has stopped",
            self.identity
        )))
    }

    /// Wait for the controller to stop on its own
    pub async fn finished(self) -> Result<ExitReason, Error> {
        self.task
            .await
            .map_err(|e| Error::Other(anyhow::anyhow!("Controller task failed: {}", e)))?
    }

    /// Leave the session and wait for teardown
    pub async fn leave(self) -> Result<ExitReason, Error> {
        // the controller may already have stopped
        let _ = self.commands.send(ControllerCommand::Leave).await;
        self.finished().await
    }

    /// Stop the controller without a clean leave, as a crashed tab would
    pub fn abort(self) {
        self.task.abort();
    }
}
