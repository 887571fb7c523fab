//! Session coordinator: the single owner of session state. Relay events,
//! link events, media results and local commands all pass through one loop
//! and are handled to completion one at a time.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SessionConfig;
use crate::error::{ChannelError, Error, LinkFailure, MediaAccessError, Result};
use crate::notice::{Notifier, SessionNotice};
use crate::peer::connection::LinkFactory;
use crate::peer::media::{
    LocalMedia, LocalMediaState, LocalStream, MediaRequest, MediaSource, TrackKind,
};
use crate::peer::state::{LinkEvent, LinkState, WATCHDOG_INTERVAL};
use crate::role::{Broadcaster, LinkTable, RoleController, Signaler, Viewer};
use crate::session::{Identity, ParticipantId, Role, SessionSnapshot, SessionState};
use crate::signaling::{
    ActionKind, BroadcastMessage, CommandKind, InboundEvent, LeaveBroadcast, OutboundEvent, Signal,
    SignalingChannel,
};

const COMMAND_CAPACITY: usize = 64;

/// ========  COMMANDS  =========

/// Local user actions, fed to the coordinator through a [`CoordinatorHandle`].
#[derive(Debug)]
pub enum Command {
    SendChat(String),
    ToggleCamera,
    ToggleMic,
    ToggleRecording,
    MuteAll,
    Leave,
    Status(oneshot::Sender<CoordinatorStatus>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorStatus {
    pub identity: Identity,
    pub session: SessionSnapshot,
    pub media: LocalMediaState,
    pub links: BTreeMap<ParticipantId, LinkState>,
}

/// Cloneable sender side of the command queue.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    pub fn channel() -> (Self, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(COMMAND_CAPACITY);
        (Self { tx }, rx)
    }

    pub async fn send(&self, command: Command) -> Result<()> {
        self.tx
            .send(command)
            .await
            .map_err(|_| Error::InvalidAction("coordinator is not running".to_string()))
    }

    pub async fn send_chat(&self, text: impl Into<String>) -> Result<()> {
        self.send(Command::SendChat(text.into())).await
    }

    pub async fn toggle_camera(&self) -> Result<()> {
        self.send(Command::ToggleCamera).await
    }

    pub async fn toggle_mic(&self) -> Result<()> {
        self.send(Command::ToggleMic).await
    }

    pub async fn toggle_recording(&self) -> Result<()> {
        self.send(Command::ToggleRecording).await
    }

    pub async fn mute_all(&self) -> Result<()> {
        self.send(Command::MuteAll).await
    }

    pub async fn leave(&self) -> Result<()> {
        self.send(Command::Leave).await
    }

    pub async fn status(&self) -> Result<CoordinatorStatus> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status(reply)).await?;
        rx.await
            .map_err(|_| Error::InvalidAction("coordinator stopped".to_string()))
    }
}

/// Result of a spawned media acquisition, tagged with the epoch it started in.
#[derive(Debug)]
pub struct MediaOutcome {
    epoch: u64,
    result: std::result::Result<LocalStream, MediaAccessError>,
}

/// ========  COORDINATOR  =========

pub struct SessionCoordinator {
    identity: Identity,
    config: SessionConfig,
    state: SessionState,
    controller: RoleController,
    signaler: Signaler,
    media_source: Arc<dyn MediaSource>,
    media: LocalMedia,
    notifier: Notifier,
    media_tx: mpsc::UnboundedSender<MediaOutcome>,
    link_rx: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    media_rx: Option<mpsc::UnboundedReceiver<MediaOutcome>>,
    finished: bool,
}

impl SessionCoordinator {
    pub fn new(
        identity: Identity,
        session_id: impl Into<String>,
        config: SessionConfig,
        channel: Arc<dyn SignalingChannel>,
        factory: Arc<dyn LinkFactory>,
        media_source: Arc<dyn MediaSource>,
    ) -> Self {
        let session_id = session_id.into();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (media_tx, media_rx) = mpsc::unbounded_channel();

        let links = LinkTable::new(factory, link_tx, config.pending_candidate_limit);
        let controller = match identity.role {
            Role::Broadcaster => RoleController::Broadcaster(Broadcaster::new(links)),
            Role::Viewer => RoleController::Viewer(Viewer::new(links)),
        };
        let signaler = Signaler::new(channel, session_id.clone(), identity.participant_id.clone());

        Self {
            identity,
            config,
            state: SessionState::new(session_id),
            controller,
            signaler,
            media_source,
            media: LocalMedia::new(),
            notifier: Notifier::new(),
            media_tx,
            link_rx: Some(link_rx),
            media_rx: Some(media_rx),
            finished: false,
        }
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn session(&self) -> &SessionState {
        &self.state
    }

    pub fn media_state(&self) -> LocalMediaState {
        self.media.state()
    }

    pub fn link_state(&self, id: &ParticipantId) -> Option<LinkState> {
        self.controller.links().state(id)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn status(&self) -> CoordinatorStatus {
        let links = self.controller.links();
        CoordinatorStatus {
            identity: self.identity.clone(),
            session: self.state.snapshot(),
            media: self.media.state(),
            links: links
                .ids()
                .into_iter()
                .filter_map(|id| links.state(&id).map(|state| (id, state)))
                .collect(),
        }
    }

    /// Drives the session until the user leaves or the relay is lost.
    pub async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
        mut commands: mpsc::Receiver<Command>,
    ) -> Result<()> {
        let (mut link_rx, mut media_rx) = match (self.link_rx.take(), self.media_rx.take()) {
            (Some(l), Some(m)) => (l, m),
            _ => return Err(Error::InvalidAction("coordinator already ran".to_string())),
        };
        let mut watchdog = tokio::time::interval(WATCHDOG_INTERVAL);
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            session = %self.state.session_id,
            participant = %self.identity.participant_id,
            role = ?self.identity.role,
            "coordinator started"
        );

        while !self.finished {
            tokio::select! {
                biased;

                Some(event) = link_rx.recv() => self.handle_link_event(event).await,
                Some(outcome) = media_rx.recv() => self.handle_media_outcome(outcome).await,
                event = inbound.recv() => {
                    let event = event.unwrap_or(InboundEvent::Disconnected);
                    self.handle_relay_event(event).await?;
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                _ = watchdog.tick() => self.check_negotiation_deadlines(Instant::now()).await,
            }
        }
        tracing::info!(session = %self.state.session_id, "coordinator stopped");
        Ok(())
    }

    /// ========  RELAY EVENTS  =========

    /// Applies one relay event. Only the loss of the relay is returned as an
    /// error; negotiation problems are logged and dropped.
    pub async fn handle_relay_event(&mut self, event: InboundEvent) -> Result<()> {
        tracing::debug!(event = event.name(), "relay event");
        match event {
            InboundEvent::SessionInfo(info) => {
                self.state.hydrate(
                    info.is_live,
                    info.messages,
                    info.total_students,
                    info.student_ids,
                    self.controller.is_broadcaster(),
                );
                if let RoleController::Broadcaster(b) = &mut self.controller {
                    b.prune_to_roster(&self.state).await;
                }
                self.notifier
                    .emit(SessionNotice::ParticipantsChanged(self.state.participant_count));
                // joined mid-broadcast
                if self.state.is_live {
                    self.setup_role().await;
                }
            }
            InboundEvent::BroadcastStarted => {
                self.state.is_live = true;
                self.notifier.emit(SessionNotice::BroadcastStarted);
                self.setup_role().await;
            }
            InboundEvent::SessionEnded => {
                self.teardown().await;
                self.notifier.emit(SessionNotice::SessionEnded);
            }
            InboundEvent::ParticipantJoined(joined) => {
                let stream = self.media.stream().cloned();
                let hold_offers = self.media.is_acquiring();
                if let RoleController::Broadcaster(b) = &mut self.controller {
                    let result = b
                        .participant_joined(
                            &joined.user_id,
                            &mut self.state,
                            stream.as_ref(),
                            hold_offers,
                            &self.signaler,
                        )
                        .await;
                    discard(result, &joined.user_id);
                }
            }
            InboundEvent::ParticipantLeft(left) => {
                if let RoleController::Broadcaster(b) = &mut self.controller {
                    b.participant_left(&left.user_id, &mut self.state).await;
                }
            }
            InboundEvent::ViewerSignal(signal) => match &mut self.controller {
                RoleController::Broadcaster(b) => {
                    let result = b
                        .handle_signal(&signal.student_id, signal.signal, &self.signaler)
                        .await;
                    discard(result, &signal.student_id);
                }
                RoleController::Viewer(_) => {
                    tracing::warn!(from = %signal.student_id, "viewer received a viewer signal")
                }
            },
            InboundEvent::BroadcasterSignal(signal) => match &mut self.controller {
                RoleController::Viewer(v) => {
                    let result = v.handle_signal(signal.signal, &self.signaler).await;
                    discard(result, &ParticipantId::broadcaster());
                }
                RoleController::Broadcaster(_) => {
                    tracing::warn!("broadcaster received a broadcaster signal")
                }
            },
            InboundEvent::NewMessage(message) => {
                if self.state.append_message(message.clone()) {
                    self.notifier.emit(SessionNotice::ChatMessage(message));
                } else {
                    tracing::debug!(id = ?message.id, "duplicate chat message dropped");
                }
            }
            InboundEvent::ParticipantsUpdated(update) => {
                self.state.participant_count = update.count;
                if let RoleController::Broadcaster(b) = &mut self.controller {
                    self.state.set_roster(update.student_ids);
                    b.prune_to_roster(&self.state).await;
                }
                self.notifier
                    .emit(SessionNotice::ParticipantsChanged(update.count));
            }
            InboundEvent::RecordingStatus(status) => {
                self.state.is_recording = status.is_recording;
                self.notifier
                    .emit(SessionNotice::RecordingChanged(status.is_recording));
            }
            InboundEvent::InstructorDisconnected => {
                if let RoleController::Viewer(v) = &mut self.controller {
                    v.broadcaster_gone().await;
                    self.state.is_live = false;
                    self.notifier.emit(SessionNotice::RemoteMediaCleared);
                    self.notifier.emit(SessionNotice::InstructorDisconnected);
                }
            }
            InboundEvent::InstructorCommand(command) => match command.command {
                CommandKind::MuteAll => self.apply_mute_all(),
                CommandKind::Unknown => tracing::debug!("ignoring unknown instructor command"),
            },
            InboundEvent::Disconnected => {
                tracing::warn!(session = %self.state.session_id, "relay connection lost");
                self.teardown().await;
                self.finished = true;
                self.notifier.emit(SessionNotice::ChannelLost);
                return Err(ChannelError::Lost.into());
            }
        }
        Ok(())
    }

    /// Broadcaster: capture media and link up with the known roster. Offers
    /// go out once capture resolves.
    /// Viewer: make sure the broadcast link exists.
    async fn setup_role(&mut self) {
        if self.controller.is_broadcaster() && self.media.stream().is_none() {
            self.start_acquisition(MediaRequest {
                video: true,
                audio: true,
            });
        }
        let stream = self.media.stream().cloned();
        let hold_offers = self.media.is_acquiring();
        match &mut self.controller {
            RoleController::Broadcaster(b) => {
                b.setup(&self.state, stream.as_ref(), hold_offers, &self.signaler)
                    .await;
            }
            RoleController::Viewer(v) => {
                if let Err(e) = v.ensure_link().await {
                    tracing::warn!(error = %e, "could not create broadcast link");
                }
            }
        }
    }

    /// A viewer only has outbound audio when it opted into it; disable it
    /// if it is currently on.
    fn apply_mute_all(&mut self) {
        if self.controller.is_broadcaster() {
            return;
        }
        let Some(track) = self.media.stream().and_then(|s| s.track(TrackKind::Audio)) else {
            return;
        };
        if track.is_enabled() {
            track.set_enabled(false);
            self.notifier.emit(SessionNotice::Muted);
        }
    }

    /// ========  LINK EVENTS  =========

    pub async fn handle_link_event(&mut self, event: LinkEvent) {
        tracing::trace!(
            counterpart = %event.counterpart(),
            generation = event.generation(),
            "link event"
        );
        let links = self.controller.links_mut();
        match event {
            LinkEvent::LocalCandidate {
                counterpart,
                generation,
                candidate,
            } => {
                if !links.is_current(&counterpart, generation) {
                    tracing::debug!(counterpart = %counterpart, generation, "candidate from stale link");
                    return;
                }
                let signal = Signal::Candidate { candidate };
                if let Err(e) = self.signaler.send_signal(&counterpart, signal) {
                    tracing::warn!(counterpart = %counterpart, error = %e, "could not send candidate");
                }
            }
            LinkEvent::StateChanged {
                counterpart,
                generation,
                state,
            } => {
                if !links.mark_state(&counterpart, generation, state) {
                    tracing::debug!(counterpart = %counterpart, generation, %state, "state from stale link");
                    return;
                }
                tracing::info!(counterpart = %counterpart, %state, "link state changed");
                match state {
                    LinkState::Connected => {
                        self.notifier.emit(SessionNotice::LinkConnected(counterpart))
                    }
                    LinkState::Failed => {
                        self.drop_link(LinkFailure::Failed(counterpart.clone()), &counterpart)
                            .await
                    }
                    LinkState::Disconnected | LinkState::Closed => {
                        self.drop_link(LinkFailure::Disconnected(counterpart.clone()), &counterpart)
                            .await
                    }
                    LinkState::New | LinkState::Negotiating => {}
                }
            }
            LinkEvent::RemoteTrack {
                counterpart,
                generation,
                kind,
            } => {
                if !links.is_current(&counterpart, generation) {
                    return;
                }
                tracing::info!(counterpart = %counterpart, kind = kind.as_str(), "remote track");
                if !self.controller.is_broadcaster() {
                    self.notifier.emit(SessionNotice::RemoteMediaAvailable(kind));
                }
            }
        }
    }

    /// Closes and removes a link that reached a terminal state. Other links
    /// are untouched.
    async fn drop_link(&mut self, failure: LinkFailure, counterpart: &ParticipantId) {
        tracing::warn!(error = %failure, "dropping peer link");
        match &mut self.controller {
            RoleController::Broadcaster(b) => {
                b.participant_left(counterpart, &mut self.state).await;
            }
            RoleController::Viewer(v) => {
                v.broadcaster_gone().await;
                self.notifier.emit(SessionNotice::RemoteMediaCleared);
            }
        }
        self.notifier.emit(SessionNotice::LinkLost(counterpart.clone()));
    }

    /// Closes links stuck in negotiation past the configured timeout.
    pub async fn check_negotiation_deadlines(&mut self, now: Instant) {
        let Some(timeout) = self.config.negotiation_timeout() else {
            return;
        };
        for id in self.controller.links().stalled(now, timeout) {
            self.drop_link(LinkFailure::Stalled(id.clone()), &id).await;
        }
    }

    /// ========  LOCAL MEDIA  =========

    fn start_acquisition(&mut self, request: MediaRequest) -> bool {
        let Some(epoch) = self.media.begin_acquire(request) else {
            tracing::debug!(?request, "media acquisition already running or stream present");
            return false;
        };
        tracing::debug!(?request, epoch, "acquiring local media");
        let source = self.media_source.clone();
        let tx = self.media_tx.clone();
        tokio::spawn(async move {
            let result = source.acquire(request).await;
            // the coordinator may be gone already
            let _ = tx.send(MediaOutcome { epoch, result });
        });
        true
    }

    pub async fn handle_media_outcome(&mut self, outcome: MediaOutcome) {
        match outcome.result {
            Ok(stream) => {
                let Some(stream) = self.media.complete_acquire(outcome.epoch, stream).cloned()
                else {
                    return;
                };
                tracing::info!(stream = stream.id(), tracks = stream.tracks().len(), "local media ready");
                // viewers keep their capture local
                if let RoleController::Broadcaster(b) = &mut self.controller {
                    b.attach_stream(&stream, &self.signaler).await;
                }
            }
            Err(e) => {
                if self.media.fail_acquire(outcome.epoch) {
                    tracing::warn!(error = %e, "media acquisition failed");
                    self.notifier.emit(SessionNotice::MediaError(e.to_string()));
                    // viewers still get a link, tracks can follow later
                    if let RoleController::Broadcaster(b) = &mut self.controller {
                        b.release_held_offers(&self.signaler).await;
                    }
                }
            }
        }
    }

    /// Flips the track in place when it exists. Without a stream, acquires
    /// one with just that track; it is attached to links once it arrives.
    pub fn toggle_track(&mut self, kind: TrackKind) -> Result<()> {
        if let Some(stream) = self.media.stream() {
            let track = stream
                .track(kind)
                .ok_or(MediaAccessError::MissingTrack(kind.as_str()))?;
            let enabled = !track.is_enabled();
            track.set_enabled(enabled);
            tracing::debug!(kind = kind.as_str(), enabled, "local track toggled");
            return Ok(());
        }
        self.start_acquisition(MediaRequest {
            video: kind == TrackKind::Video,
            audio: kind == TrackKind::Audio,
        });
        Ok(())
    }

    /// ========  LOCAL ACTIONS  =========

    pub async fn handle_command(&mut self, command: Command) {
        let result = match command {
            Command::SendChat(text) => self.send_chat_message(&text),
            Command::ToggleCamera => self.toggle_track(TrackKind::Video),
            Command::ToggleMic => self.toggle_track(TrackKind::Audio),
            Command::ToggleRecording => self.toggle_recording(),
            Command::MuteAll => self.mute_all(),
            Command::Leave => self.leave().await,
            Command::Status(reply) => {
                // caller may have given up waiting
                let _ = reply.send(self.status());
                Ok(())
            }
        };
        match result {
            Ok(()) => {}
            Err(Error::Media(e)) => self.notifier.emit(SessionNotice::MediaError(e.to_string())),
            Err(e) => {
                tracing::warn!(error = %e, "local action failed");
                self.notifier.emit(SessionNotice::ActionRejected(e.to_string()));
            }
        }
    }

    /// Sends a chat line. It shows up in the log only once the relay echoes
    /// it back as `new-message`.
    pub fn send_chat_message(&mut self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(Error::InvalidAction("chat message is empty".to_string()));
        }
        self.signaler
            .send(OutboundEvent::BroadcastMessage(BroadcastMessage {
                session_id: self.state.session_id.clone(),
                user_id: self.identity.participant_id.clone(),
                name: self.identity.display_name(),
                text: text.to_string(),
                user_type: self.identity.role,
            }))?;
        Ok(())
    }

    pub fn toggle_recording(&mut self) -> Result<()> {
        self.require_broadcaster("toggle recording")?;
        let recording = !self.state.is_recording;
        self.state.is_recording = recording;
        self.signaler
            .send_action(ActionKind::ToggleRecording, Some(recording))?;
        self.notifier.emit(SessionNotice::RecordingChanged(recording));
        Ok(())
    }

    pub fn mute_all(&mut self) -> Result<()> {
        self.require_broadcaster("mute all")?;
        self.signaler.send_action(ActionKind::MuteAll, None)?;
        Ok(())
    }

    /// Announces the departure, tears everything down locally and closes the
    /// relay channel.
    pub async fn leave(&mut self) -> Result<()> {
        let announced = match self.identity.role {
            Role::Broadcaster => self.signaler.send_action(ActionKind::EndSession, None),
            Role::Viewer => self
                .signaler
                .send(OutboundEvent::LeaveBroadcast(LeaveBroadcast {
                    session_id: self.state.session_id.clone(),
                    participant_id: self.identity.participant_id.clone(),
                })),
        };
        if let Err(e) = announced {
            tracing::warn!(error = %e, "could not announce leave");
        }
        self.teardown().await;
        self.signaler.channel().disconnect().await;
        self.finished = true;
        self.notifier.emit(SessionNotice::SessionEnded);
        Ok(())
    }

    /// Not-live, no links, no local media, empty roster and chat. Runs to
    /// completion before any other event is looked at.
    pub async fn teardown(&mut self) {
        self.state.is_live = false;
        self.controller.links_mut().close_all().await;
        self.media.teardown();
        self.state.reset();
        tracing::debug!(session = %self.state.session_id, "session torn down");
    }

    fn require_broadcaster(&self, action: &str) -> Result<()> {
        if self.identity.role.is_broadcaster() {
            Ok(())
        } else {
            Err(Error::InvalidAction(format!("only the instructor can {action}")))
        }
    }
}

fn discard(result: Result<()>, from: &ParticipantId) {
    if let Err(e) = result {
        tracing::warn!(counterpart = %from, error = %e, "discarding signal");
    }
}
