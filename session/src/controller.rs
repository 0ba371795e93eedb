//! Top-level orchestration of one client's participation in a session.
//!
//! The controller is a single task. Relay traffic, transport callbacks, link
//! events, UI commands and the one-second ticker are multiplexed through one
//! `select!` loop, so every PeerLink and the state store are only ever
//! touched from here.

use crate::collaborators::{Credentials, MediaSource, PersistenceLayer};
use crate::commands::ControllerCommand;
use crate::state::SessionStateStore;
use log::{debug, error, info, trace, warn};
use network::media::{LocalMedia, LocalTrack};
use network::peer_link::{LinkEvent, PeerLink, RetryPolicy};
use network::presence::{PresenceRegistry, RosterChange};
use network::protocol::{self, RelayFrame, SignalEnvelope, StateBroadcast, StateEvent};
use network::relay::{Delivery, PresenceUpdate, RelaySubscription, SignalRelay};
use network::transport::{TransportEvent, TransportEventSender, TransportProvider};
use session_core::{
    Error, LinkState, MediaPermission, NoticeLevel, Participant, Role, SessionEvent, SessionId,
    SessionIdentity, SessionSnapshot,
};
use settings_manager::Settings;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};

const PERMISSION_REMEDIATION: &str = "Camera and microphone access was blocked. \
Allow access for this application in your browser or system privacy settings, \
then reload the session.";

/// Timing knobs of the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControllerConfig {
    pub retry: RetryPolicy,
    /// Interval of the teacher's authoritative timer broadcasts
    pub timer_resync: Duration,
    /// Delay between resubscription attempts while offline
    pub resubscribe: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            timer_resync: Duration::from_secs(5),
            resubscribe: Duration::from_secs(3),
        }
    }
}

impl From<&Settings> for ControllerConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            retry: RetryPolicy {
                timeout: Duration::from_secs(settings.negotiation_timeout_secs),
                max_retries: settings.max_negotiation_retries,
            },
            timer_resync: Duration::from_secs(settings.timer_resync_secs),
            resubscribe: Duration::from_secs(settings.resubscribe_secs),
        }
    }
}

/// External systems a controller talks to
#[derive(Clone)]
pub struct Collaborators {
    pub relay: Arc<dyn SignalRelay>,
    pub transports: Arc<dyn TransportProvider>,
    pub persistence: Arc<dyn PersistenceLayer>,
    pub media: Arc<dyn MediaSource>,
}

/// Why a controller stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitReason {
    /// The local user left
    Left,
    /// The teacher ended the session
    Ended { reason: String },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Left => write!(f, "You left the session"),
            ExitReason::Ended { reason } => write!(f, "{}", reason),
        }
    }
}

enum RelayInput {
    Presence(PresenceUpdate),
    Frame(String),
    Closed,
}

/// Next item from the live subscription; never resolves while offline
async fn next_relay_input(subscription: &mut Option<RelaySubscription>) -> RelayInput {
    let Some(subscription) = subscription else {
        return std::future::pending().await;
    };
    tokio::select! {
        biased;
        update = subscription.presence.recv() => {
            update.map(RelayInput::Presence).unwrap_or(RelayInput::Closed)
        }
        frame = subscription.frames.recv() => {
            frame.map(RelayInput::Frame).unwrap_or(RelayInput::Closed)
        }
    }
}

/// Owns local media and one PeerLink per present remote identity
pub struct ReconciliationController {
    session: SessionId,
    participant: Participant,
    config: ControllerConfig,
    collaborators: Collaborators,
    store: SessionStateStore,
    presence: PresenceRegistry,
    subscription: Option<RelaySubscription>,
    /// Set while offline
    resubscribe_at: Option<Instant>,
    ever_subscribed: bool,
    links: HashMap<SessionIdentity, PeerLink>,
    /// Identities whose link gave up; not recreated until they leave
    abandoned: HashSet<SessionIdentity>,
    /// Remote track IDs already reported to the UI
    announced: HashMap<SessionIdentity, HashSet<String>>,
    media: LocalMedia,
    screen_share: Option<Arc<LocalTrack>>,
    since_timer_sync: Duration,
    commands: mpsc::Receiver<ControllerCommand>,
    /// Commands received before the relay subscription existed
    deferred: Vec<ControllerCommand>,
    events: mpsc::UnboundedSender<SessionEvent>,
    link_tx: mpsc::UnboundedSender<LinkEvent>,
    link_rx: mpsc::UnboundedReceiver<LinkEvent>,
    transport_tx: TransportEventSender,
    transport_rx: mpsc::UnboundedReceiver<(SessionIdentity, TransportEvent)>,
    exit: Option<ExitReason>,
    torn_down: bool,
}

impl ReconciliationController {
    /// Resolve roles from the persisted record. Nothing is acquired yet.
    pub async fn join(
        session: SessionId,
        credentials: Credentials,
        collaborators: Collaborators,
        config: ControllerConfig,
        commands: mpsc::Receiver<ControllerCommand>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Self, Error> {
        let record = collaborators.persistence.load(&session).await?;
        if record.ended {
            info!("Refusing to join {}: session has ended", session);
            let _ = events.send(SessionEvent::Ended {
                reason: "This session has already ended".to_string(),
            });
            return Err(Error::SessionEnded(session));
        }

        let identity = credentials.identity;
        if credentials.role == Role::Teacher && identity != record.host {
            warn!(
                "{} claims the teacher role but {} hosts {}; joining as a student",
                identity, record.host, session
            );
        }
        let store = SessionStateStore::new(identity.clone(), record.host);
        info!(
            "Joining {} as {} ({})",
            session,
            identity,
            if store.is_teacher() { "teacher" } else { "student" }
        );

        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let _ = events.send(SessionEvent::Connecting);

        Ok(Self {
            session,
            participant: Participant {
                identity: identity.clone(),
                display_name: credentials.display_name,
            },
            config,
            collaborators,
            store,
            presence: PresenceRegistry::new(identity),
            subscription: None,
            resubscribe_at: None,
            ever_subscribed: false,
            links: HashMap::new(),
            abandoned: HashSet::new(),
            announced: HashMap::new(),
            media: LocalMedia::default(),
            screen_share: None,
            since_timer_sync: Duration::ZERO,
            commands,
            deferred: Vec::new(),
            events,
            link_tx,
            link_rx,
            transport_tx,
            transport_rx,
            exit: None,
            torn_down: false,
        })
    }

    /// Run until the user leaves or the session ends.
    ///
    /// Cleanup runs on every exit path. If the future is dropped instead of
    /// completing, `Drop` releases what it can.
    pub async fn run(mut self) -> Result<ExitReason, Error> {
        let outcome = self.drive().await;
        self.teardown().await;

        match &outcome {
            Ok(reason) => self.emit(SessionEvent::Ended {
                reason: reason.to_string(),
            }),
            Err(e) => error!("Session {} stopped: {}", self.session, e),
        }
        outcome
    }

    async fn drive(&mut self) -> Result<ExitReason, Error> {
        if let Some(reason) = self.acquire_media().await? {
            return Ok(reason);
        }

        self.subscribe().await;
        for command in std::mem::take(&mut self.deferred) {
            self.handle_command(command).await;
            if let Some(reason) = self.exit.take() {
                return Ok(reason);
            }
        }

        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Command channel closed, leaving {}", self.session);
                        self.exit = Some(ExitReason::Left);
                    }
                },

                input = next_relay_input(&mut self.subscription) => {
                    self.handle_relay_input(input).await;
                }

                Some((remote, event)) = self.transport_rx.recv() => {
                    self.handle_transport_event(remote, event).await;
                }

                Some(event) = self.link_rx.recv() => {
                    self.handle_link_event(event).await;
                }

                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
            }

            if let Some(reason) = self.exit.take() {
                return Ok(reason);
            }
        }
    }

    /// Wait for the permission prompt while still honouring `Leave`
    async fn acquire_media(&mut self) -> Result<Option<ExitReason>, Error> {
        self.emit(SessionEvent::Media(MediaPermission::Pending));
        let source = self.collaborators.media.clone();
        let mut acquire = source.acquire();

        let result = loop {
            tokio::select! {
                result = &mut acquire => break result,
                command = self.commands.recv() => match command {
                    None | Some(ControllerCommand::Leave) => {
                        info!("Left {} while waiting for media permission", self.session);
                        return Ok(Some(ExitReason::Left));
                    }
                    Some(command) => {
                        debug!("Deferring {:?} until joined", command);
                        self.deferred.push(command);
                    }
                },
            }
        };

        match result {
            Ok(media) => {
                debug!("Acquired {} local tracks", media.tracks().len());
                self.media = media;
                self.emit(SessionEvent::Media(MediaPermission::Granted));
                Ok(None)
            }
            Err(Error::PermissionDenied(reason)) => {
                warn!("Media permission denied: {}", reason);
                self.emit(SessionEvent::Media(MediaPermission::Denied {
                    reason: reason.clone(),
                }));
                self.emit(SessionEvent::PermissionDenied {
                    remediation: PERMISSION_REMEDIATION.to_string(),
                });
                Err(Error::PermissionDenied(reason))
            }
            Err(e) => {
                error!("Failed to acquire local media: {}", e);
                self.notice(format!("Could not start camera or microphone: {}", e));
                Err(e)
            }
        }
    }

    async fn subscribe(&mut self) {
        let result = self
            .collaborators
            .relay
            .subscribe(&self.session, self.participant.clone())
            .await;

        match result {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.resubscribe_at = None;
                if self.ever_subscribed {
                    info!("Resubscribed to {}", self.session);
                    self.emit(SessionEvent::Reconnected);
                } else {
                    info!("Subscribed to {}", self.session);
                    self.emit(SessionEvent::Joined);
                }
                self.ever_subscribed = true;
            }
            Err(e) => {
                warn!("Failed to subscribe to {}: {}", self.session, e);
                if self.resubscribe_at.is_some() {
                    self.resubscribe_at = Some(Instant::now() + self.config.resubscribe);
                } else {
                    self.go_offline().await;
                }
            }
        }
    }

    /// The roster is considered empty until the next snapshot
    async fn go_offline(&mut self) {
        self.subscription = None;
        self.resubscribe_at = Some(Instant::now() + self.config.resubscribe);
        self.emit(SessionEvent::Offline);

        let changes = self.presence.clear();
        self.apply_roster_changes(changes).await;
    }

    async fn handle_relay_input(&mut self, input: RelayInput) {
        match input {
            RelayInput::Presence(PresenceUpdate::Disconnected) | RelayInput::Closed => {
                warn!("Lost relay subscription to {}", self.session);
                self.go_offline().await;
            }
            RelayInput::Presence(update) => {
                let changes = self.presence.apply(update);
                self.apply_roster_changes(changes).await;
            }
            RelayInput::Frame(text) => self.handle_frame(&text).await,
        }
    }

    async fn apply_roster_changes(&mut self, changes: Vec<RosterChange>) {
        for change in changes {
            match change {
                RosterChange::Joined(participant) => {
                    info!("{} joined {}", participant.identity, self.session);
                    self.welcome(&participant.identity).await;
                    self.emit(SessionEvent::PeerJoined(participant));
                }
                RosterChange::Left(identity) => {
                    info!("{} left {}", identity, self.session);
                    self.abandoned.remove(&identity);
                    if self.store.on_departure(&identity) {
                        self.emit_state();
                    }
                    self.emit(SessionEvent::PeerLeft(identity));
                }
            }
        }
        self.reconcile().await;
    }

    /// Bring a newcomer up to date with the fields we own
    async fn welcome(&self, identity: &SessionIdentity) {
        for event in self.store.owned_fields() {
            let frame = RelayFrame::State(StateBroadcast {
                from: self.participant.identity.clone(),
                event,
            });
            self.send_frame(Delivery::To(identity.clone()), &frame).await;
        }
    }

    /// Make the link map match the roster
    async fn reconcile(&mut self) {
        let present = self.presence.remote_identities();
        let departed: Vec<SessionIdentity> = self
            .links
            .keys()
            .filter(|identity| !present.contains(identity))
            .cloned()
            .collect();
        for identity in departed {
            self.remove_link(&identity).await;
        }

        for identity in present {
            if self.links.contains_key(&identity) || self.abandoned.contains(&identity) {
                continue;
            }
            if let Err(e) = self.create_link(identity.clone()).await {
                warn!("Failed to create link to {}: {}", identity, e);
                self.notice(format!("Could not connect to {}", identity));
            }
        }
    }

    async fn create_link(&mut self, remote: SessionIdentity) -> Result<(), Error> {
        let transport = self
            .collaborators
            .transports
            .create(&remote, self.transport_tx.clone())
            .await?;

        let mut tracks = self.media.tracks().to_vec();
        tracks.extend(self.screen_share.clone());

        let opened = PeerLink::open(
            self.participant.identity.clone(),
            remote.clone(),
            transport.clone(),
            &tracks,
            self.link_tx.clone(),
        )
        .await;
        let mut link = match opened {
            Ok(link) => link,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };

        let started = link.start().await;
        self.links.insert(remote, link);
        started
    }

    async fn remove_link(&mut self, remote: &SessionIdentity) {
        if let Some(mut link) = self.links.remove(remote) {
            debug!("Closing link to {}", remote);
            link.close().await;
        }
        self.announced.remove(remote);
    }

    async fn handle_frame(&mut self, text: &str) {
        match protocol::decode(text) {
            Ok(RelayFrame::Signal(envelope)) => self.handle_signal(envelope).await,
            Ok(RelayFrame::State(broadcast)) => self.handle_broadcast(broadcast).await,
            Err(e) => debug!("Dropping frame: {}", e),
        }
    }

    async fn handle_signal(&mut self, envelope: SignalEnvelope) {
        let SignalEnvelope { from, to, payload } = envelope;
        if to != self.participant.identity || from == self.participant.identity {
            trace!("Ignoring misaddressed {} from {}", payload.name(), from);
            return;
        }

        if !self.links.contains_key(&from) {
            if !self.presence.contains(&from) || self.abandoned.contains(&from) {
                debug!("Dropping {}: {}", payload.name(), Error::StaleSignal(from));
                return;
            }
            debug!("Creating link to {} on first signal", from);
            if let Err(e) = self.create_link(from.clone()).await {
                warn!("Failed to create link to {}: {}", from, e);
                return;
            }
        }

        let Some(link) = self.links.get_mut(&from) else {
            return;
        };
        let kind = payload.name();
        match link.handle_signal(payload).await {
            Ok(()) => {}
            Err(Error::StaleSignal(remote)) => debug!("Dropped stale {} from {}", kind, remote),
            Err(e) => warn!("Failed to apply {} from {}: {}", kind, from, e),
        }
    }

    async fn handle_broadcast(&mut self, broadcast: StateBroadcast) {
        let StateBroadcast { from, event } = broadcast;
        match self.store.apply(&from, &event) {
            Ok(changed) => {
                if let StateEvent::SessionEnded { reason } = event {
                    let reason =
                        reason.unwrap_or_else(|| "The teacher ended the session".to_string());
                    info!("Session {} ended by {}", self.session, from);
                    self.exit = Some(ExitReason::Ended { reason });
                    return;
                }
                if changed {
                    self.emit_state();
                }
            }
            Err(e) => debug!("Rejected broadcast: {}", e),
        }
    }

    async fn handle_transport_event(&mut self, remote: SessionIdentity, event: TransportEvent) {
        let Some(link) = self.links.get_mut(&remote) else {
            trace!("Transport event for unknown link {}", remote);
            return;
        };
        if let Err(e) = link.on_transport_event(event).await {
            warn!("Link to {} failed to handle transport event: {}", remote, e);
        }
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Signal { to, payload } => {
                let frame = RelayFrame::Signal(SignalEnvelope {
                    from: self.participant.identity.clone(),
                    to: to.clone(),
                    payload,
                });
                self.send_frame(Delivery::To(to), &frame).await;
            }
            LinkEvent::StateChanged { remote, state } => {
                if state == LinkState::Closed
                    && self
                        .links
                        .get(&remote)
                        .is_some_and(|link| link.state() == LinkState::Closed)
                {
                    self.links.remove(&remote);
                    self.announced.remove(&remote);
                }
                self.emit(SessionEvent::PeerLinkChanged {
                    peer: remote,
                    state,
                });
            }
            LinkEvent::RemoteStream { remote, tracks } => {
                let announced = self.announced.entry(remote.clone()).or_default();
                let fresh: Vec<_> = tracks
                    .into_iter()
                    .filter(|track| announced.insert(track.track_id.clone()))
                    .collect();
                for track in fresh {
                    self.emit(SessionEvent::RemoteTrack {
                        peer: remote.clone(),
                        track_id: track.track_id,
                        kind: track.kind,
                    });
                }
            }
            LinkEvent::Failed { remote, reason } => {
                warn!("Giving up on {}: {}", remote, reason);
                self.links.remove(&remote);
                self.announced.remove(&remote);
                self.abandoned.insert(remote.clone());
                self.notice(format!("Could not connect to {}", remote));
            }
        }
    }

    async fn handle_command(&mut self, command: ControllerCommand) {
        match self.execute(command).await {
            Ok(Some(event)) => self.publish(event).await,
            Ok(None) => {}
            Err(e) => {
                info!("Rejected command: {}", e);
                self.emit(SessionEvent::CommandRejected {
                    reason: e.to_string(),
                });
            }
        }
    }

    /// Run a command; state writes return the event to publish
    async fn execute(&mut self, command: ControllerCommand) -> Result<Option<StateEvent>, Error> {
        match command {
            ControllerCommand::SetSpotlight(identity) => {
                let event = self.store.set_spotlight(identity.clone())?;
                self.require_present(&identity)?;
                Ok(Some(event))
            }
            ControllerCommand::SetWhiteboardController(identity) => {
                let event = self.store.set_whiteboard_controller(identity.clone())?;
                if let Some(identity) = &identity {
                    self.require_present(identity)?;
                }
                Ok(Some(event))
            }
            ControllerCommand::SetHandRaised { identity, raised } => {
                Ok(Some(self.store.set_hand_raised(identity, raised)?))
            }
            ControllerCommand::SetComprehension { identity, status } => {
                Ok(Some(self.store.set_comprehension(identity, status)?))
            }
            ControllerCommand::StartTimer { seconds } => {
                let event = self.store.start_timer(seconds)?;
                self.since_timer_sync = Duration::ZERO;
                Ok(Some(event))
            }
            ControllerCommand::PauseTimer => Ok(Some(self.store.pause_timer()?)),
            ControllerCommand::ResetTimer { seconds } => Ok(Some(self.store.reset_timer(seconds)?)),
            ControllerCommand::StartScreenShare(track) => {
                self.start_screen_share(track).await?;
                Ok(None)
            }
            ControllerCommand::StopScreenShare => {
                self.stop_screen_share().await?;
                Ok(None)
            }
            ControllerCommand::EndSession { reason } => {
                let event = self.store.end_session(reason.clone())?;
                self.publish(event).await;
                if let Err(e) = self.collaborators.persistence.mark_ended(&self.session).await {
                    warn!("Failed to mark {} ended: {}", self.session, e);
                }
                self.exit = Some(ExitReason::Ended {
                    reason: reason.unwrap_or_else(|| "You ended the session".to_string()),
                });
                Ok(None)
            }
            ControllerCommand::RequestSnapshot => {
                self.emit(SessionEvent::Snapshot(self.snapshot()));
                Ok(None)
            }
            ControllerCommand::Leave => {
                self.exit = Some(ExitReason::Left);
                Ok(None)
            }
        }
    }

    /// Spotlight and whiteboard may only point at the teacher or someone present
    fn require_present(&self, identity: &SessionIdentity) -> Result<(), Error> {
        if identity == self.store.teacher()
            || *identity == self.participant.identity
            || self.presence.contains(identity)
        {
            Ok(())
        } else {
            Err(Error::NotFound(format!("{} is not in the session", identity)))
        }
    }

    /// Broadcast, then apply locally
    async fn publish(&mut self, event: StateEvent) {
        let local = self.participant.identity.clone();
        let frame = RelayFrame::State(StateBroadcast {
            from: local.clone(),
            event: event.clone(),
        });
        self.send_frame(Delivery::Broadcast, &frame).await;

        match self.store.apply(&local, &event) {
            Ok(true) => self.emit_state(),
            Ok(false) => {}
            Err(e) => error!("Authorized write failed to apply: {}", e),
        }
    }

    async fn start_screen_share(&mut self, track: Arc<LocalTrack>) -> Result<(), Error> {
        if self.screen_share.is_some() {
            return Err(Error::InvalidState("Already sharing the screen".to_string()));
        }
        info!("Sharing screen with {} links", self.links.len());
        for (remote, link) in self.links.iter_mut() {
            if let Err(e) = link.add_track(track.clone()).await {
                warn!("Failed to share screen with {}: {}", remote, e);
                continue;
            }
            if let Err(e) = link.request_negotiation().await {
                warn!("Failed to renegotiate with {}: {}", remote, e);
            }
        }
        self.screen_share = Some(track);
        Ok(())
    }

    async fn stop_screen_share(&mut self) -> Result<(), Error> {
        let track = self
            .screen_share
            .take()
            .ok_or_else(|| Error::InvalidState("Not sharing the screen".to_string()))?;
        track.stop();
        for (remote, link) in self.links.iter_mut() {
            if let Err(e) = link.remove_track(track.id()).await {
                warn!("Failed to stop screen share for {}: {}", remote, e);
                continue;
            }
            if let Err(e) = link.request_negotiation().await {
                warn!("Failed to renegotiate with {}: {}", remote, e);
            }
        }
        Ok(())
    }

    async fn handle_tick(&mut self) {
        if self.store.tick_local() {
            self.emit_state();
        }

        if self.store.is_teacher() && self.store.state().timer.running {
            self.since_timer_sync += Duration::from_secs(1);
            if self.since_timer_sync >= self.config.timer_resync {
                self.since_timer_sync = Duration::ZERO;
                if let Some(event) = self.store.timer_sync() {
                    self.publish(event).await;
                }
            }
        }

        let now = Instant::now();
        for (remote, link) in self.links.iter_mut() {
            if let Err(e) = link.check_timeout(now.into_std(), self.config.retry).await {
                warn!("Retrying negotiation with {} failed: {}", remote, e);
            }
        }

        if self.subscription.is_none() && self.resubscribe_at.is_some_and(|at| at <= now) {
            debug!("Attempting to resubscribe to {}", self.session);
            self.subscribe().await;
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            roster: self.presence.participants(),
            links: self
                .links
                .iter()
                .map(|(identity, link)| (identity.clone(), link.state()))
                .collect(),
            state: self.store.state().clone(),
            online: self.subscription.is_some() && self.presence.is_online(),
        }
    }

    /// Close every link, stop local tracks and leave the relay
    async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        let remotes: Vec<_> = self.links.keys().cloned().collect();
        for remote in remotes {
            self.remove_link(&remote).await;
        }
        self.media.stop_all();
        if let Some(track) = self.screen_share.take() {
            track.stop();
        }
        if self.subscription.take().is_some() {
            if let Err(e) = self
                .collaborators
                .relay
                .unsubscribe(&self.session, &self.participant.identity)
                .await
            {
                warn!("Failed to unsubscribe from {}: {}", self.session, e);
            }
        }
        self.presence.clear();
        self.resubscribe_at = None;
        self.torn_down = true;

        while let Ok(event) = self.link_rx.try_recv() {
            if let LinkEvent::StateChanged { remote, state } = event {
                self.emit(SessionEvent::PeerLinkChanged {
                    peer: remote,
                    state,
                });
            }
        }
        info!("Left session {}", self.session);
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("Session event receiver is gone");
        }
    }

    fn emit_state(&self) {
        self.emit(SessionEvent::StateChanged(self.store.state().clone()));
    }

    fn notice(&self, message: String) {
        self.emit(SessionEvent::Notice {
            level: NoticeLevel::Destructive,
            message,
        });
    }

    async fn send_frame(&self, delivery: Delivery, frame: &RelayFrame) {
        let kind = match frame {
            RelayFrame::Signal(envelope) => envelope.payload.name(),
            RelayFrame::State(broadcast) => broadcast.event.name(),
        };
        let text = match protocol::encode(frame) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode {}: {}", kind, e);
                return;
            }
        };

        if let Err(e) = self
            .collaborators
            .relay
            .send(&self.session, &self.participant.identity, delivery, text)
            .await
        {
            warn!("Failed to send {}: {}", kind, e);
            self.notice(format!("Failed to send {}", kind));
        }
    }
}

impl Drop for ReconciliationController {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        warn!("Controller for {} dropped before teardown", self.session);
        self.media.stop_all();
        if let Some(track) = self.screen_share.take() {
            track.stop();
        }

        let transports: Vec<_> = self
            .links
            .drain()
            .map(|(_, link)| link.transport())
            .collect();
        let relay = self.collaborators.relay.clone();
        let session = self.session.clone();
        let identity = self.participant.identity.clone();
        let subscribed = self.subscription.take().is_some();

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    for transport in transports {
                        let _ = transport.close().await;
                    }
                    if subscribed {
                        let _ = relay.unsubscribe(&session, &identity).await;
                    }
                });
            }
            Err(_) => warn!("No runtime to release transports of {}", session),
        }
    }
}
