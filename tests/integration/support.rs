#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

use broadcast_session_lib::peer::{
    IceCandidate, LinkContext, LinkEvent, LinkFactory, LinkState, LocalStream, LocalTrack,
    MediaRequest, MediaSource, PeerLink, SessionDescription, StaticMediaSource, TrackKind,
};
use broadcast_session_lib::signaling::{
    BroadcasterSignal, InboundEvent, OutboundEvent, ParticipantRef, SessionInfo, Signal,
    SignalingChannel, ViewerSignal,
};
use broadcast_session_lib::{
    ChannelError, CoordinatorHandle, CoordinatorStatus, Identity, MediaAccessError,
    NegotiationError, ParticipantId, Result, Role, SessionConfig, SessionCoordinator,
    SessionNotice,
};

// ---------- links ----------

pub struct FakeLink {
    ctx: LinkContext,
    auto_connect: bool,
    remote_set: AtomicBool,
    offers: AtomicUsize,
    answers: AtomicUsize,
    closed: AtomicBool,
    candidates: Mutex<Vec<IceCandidate>>,
    attached: Mutex<Vec<LocalTrack>>,
}

impl FakeLink {
    pub fn counterpart_id(&self) -> &ParticipantId {
        &self.ctx.counterpart
    }

    pub fn generation(&self) -> u64 {
        self.ctx.generation
    }

    /// Pretend the connectivity layer reported `state`.
    pub fn report(&self, state: LinkState) {
        self.ctx.emit_state(state);
    }

    pub fn remote_track(&self, kind: TrackKind) {
        self.ctx.emit(LinkEvent::RemoteTrack {
            counterpart: self.ctx.counterpart.clone(),
            generation: self.ctx.generation,
            kind,
        });
    }

    pub fn gather(&self, candidate: IceCandidate) {
        self.ctx.emit_candidate(candidate);
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answers(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn attached_tracks(&self) -> usize {
        self.attached.lock().unwrap().len()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerLink for FakeLink {
    fn counterpart(&self) -> &ParticipantId {
        &self.ctx.counterpart
    }

    async fn attach_local_tracks(&self, stream: &LocalStream) -> std::result::Result<usize, NegotiationError> {
        let mut attached = self.attached.lock().unwrap();
        let fresh: Vec<LocalTrack> = stream
            .tracks()
            .iter()
            .filter(|t| !attached.iter().any(|a| a.same_track(t)))
            .cloned()
            .collect();
        let n = fresh.len();
        attached.extend(fresh);
        Ok(n)
    }

    async fn create_offer(&self) -> std::result::Result<SessionDescription, NegotiationError> {
        if self.is_closed() {
            return Err(NegotiationError::Closed);
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("offer-{}-{n}", self.ctx.counterpart)))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> std::result::Result<SessionDescription, NegotiationError> {
        self.remote_set.store(true, Ordering::SeqCst);
        self.answers.fetch_add(1, Ordering::SeqCst);
        if self.auto_connect {
            self.ctx.emit_state(LinkState::Connected);
        }
        Ok(SessionDescription::answer(format!("answer-to-{}", offer.sdp)))
    }

    async fn set_remote_answer(&self, _answer: SessionDescription) -> std::result::Result<(), NegotiationError> {
        self.remote_set.store(true, Ordering::SeqCst);
        if self.auto_connect {
            self.ctx.emit_state(LinkState::Connected);
        }
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> std::result::Result<(), NegotiationError> {
        if !self.remote_set.load(Ordering::SeqCst) {
            return Err(NegotiationError::CandidateBeforeDescription(
                self.ctx.counterpart.clone(),
            ));
        }
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote_set.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FakeFactory {
    auto_connect: bool,
    created: Mutex<Vec<Arc<FakeLink>>>,
}

impl FakeFactory {
    /// Links report `Connected` as soon as the remote description lands.
    pub fn connecting() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: true,
            created: Mutex::new(Vec::new()),
        })
    }

    /// Links stay where they are until the test reports a state.
    pub fn silent() -> Arc<Self> {
        Arc::new(Self {
            auto_connect: false,
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Every link ever created for `id`, oldest first.
    pub fn links_for(&self, id: &str) -> Vec<Arc<FakeLink>> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.ctx.counterpart.as_str() == id)
            .cloned()
            .collect()
    }

    pub fn latest(&self, id: &str) -> Arc<FakeLink> {
        self.links_for(id)
            .pop()
            .unwrap_or_else(|| panic!("no link created for {id}"))
    }

    pub fn all(&self) -> Vec<Arc<FakeLink>> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl LinkFactory for FakeFactory {
    async fn create(&self, ctx: LinkContext) -> std::result::Result<Arc<dyn PeerLink>, NegotiationError> {
        let link = Arc::new(FakeLink {
            ctx,
            auto_connect: self.auto_connect,
            remote_set: AtomicBool::new(false),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            candidates: Mutex::new(Vec::new()),
            attached: Mutex::new(Vec::new()),
        });
        self.created.lock().unwrap().push(link.clone());
        Ok(link)
    }
}

// ---------- relay ----------

#[derive(Default)]
pub struct RecordingChannel {
    sent: Mutex<Vec<OutboundEvent>>,
    disconnected: AtomicBool,
}

impl RecordingChannel {
    pub fn sent(&self) -> Vec<OutboundEvent> {
        self.sent.lock().unwrap().clone()
    }

    pub fn signals_to(&self, target: &str) -> Vec<Signal> {
        self.sent()
            .into_iter()
            .filter_map(|e| match e {
                OutboundEvent::BroadcastSignal(s) if s.target_id.as_str() == target => {
                    Some(s.signal)
                }
                _ => None,
            })
            .collect()
    }

    pub fn offers_to(&self, target: &str) -> usize {
        self.signals_to(target)
            .iter()
            .filter(|s| matches!(s, Signal::Offer { .. }))
            .count()
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for RecordingChannel {
    fn send(&self, event: OutboundEvent) -> std::result::Result<(), ChannelError> {
        if self.is_disconnected() {
            return Err(ChannelError::Closed);
        }
        self.sent.lock().unwrap().push(event);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

// ---------- media ----------

pub struct ScriptedMedia {
    gate: Option<Arc<Notify>>,
    failure: Option<MediaAccessError>,
    /// Number of leading calls that fail with `failure`.
    failing_calls: usize,
    calls: AtomicUsize,
}

impl ScriptedMedia {
    pub fn ready() -> Arc<Self> {
        Arc::new(Self {
            gate: None,
            failure: None,
            failing_calls: 0,
            calls: AtomicUsize::new(0),
        })
    }

    /// Acquisitions block until the returned `Notify` fires.
    pub fn gated() -> (Arc<Self>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let media = Arc::new(Self {
            gate: Some(gate.clone()),
            failure: None,
            failing_calls: 0,
            calls: AtomicUsize::new(0),
        });
        (media, gate)
    }

    pub fn failing(error: MediaAccessError) -> Arc<Self> {
        Arc::new(Self {
            gate: None,
            failure: Some(error),
            failing_calls: usize::MAX,
            calls: AtomicUsize::new(0),
        })
    }

    /// The first acquisition fails, later ones succeed.
    pub fn failing_once(error: MediaAccessError) -> Arc<Self> {
        Arc::new(Self {
            gate: None,
            failure: Some(error),
            failing_calls: 1,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for ScriptedMedia {
    async fn acquire(&self, request: MediaRequest) -> std::result::Result<LocalStream, MediaAccessError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if let Some(error) = &self.failure {
            if call < self.failing_calls {
                return Err(error.clone());
            }
        }
        StaticMediaSource.acquire(request).await
    }
}

// ---------- harness ----------

pub const SESSION: &str = "session-1";

pub struct Harness {
    pub handle: CoordinatorHandle,
    pub relay: mpsc::UnboundedSender<InboundEvent>,
    pub channel: Arc<RecordingChannel>,
    pub factory: Arc<FakeFactory>,
    pub media: Arc<ScriptedMedia>,
    pub notices: broadcast::Receiver<SessionNotice>,
    pub task: JoinHandle<Result<()>>,
}

pub struct HarnessBuilder {
    role: Role,
    participant: ParticipantId,
    config: SessionConfig,
    factory: Arc<FakeFactory>,
    media: Arc<ScriptedMedia>,
}

impl HarnessBuilder {
    pub fn new(role: Role) -> Self {
        let participant = match role {
            Role::Broadcaster => ParticipantId::new("user-teach01"),
            Role::Viewer => ParticipantId::new("user-5a7b9c1d"),
        };
        Self {
            role,
            participant,
            config: SessionConfig::default(),
            factory: FakeFactory::connecting(),
            media: ScriptedMedia::ready(),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn factory(mut self, factory: Arc<FakeFactory>) -> Self {
        self.factory = factory;
        self
    }

    pub fn media(mut self, media: Arc<ScriptedMedia>) -> Self {
        self.media = media;
        self
    }

    pub fn start(self) -> Harness {
        let channel = Arc::new(RecordingChannel::default());
        let coordinator = SessionCoordinator::new(
            Identity::new(self.participant, self.role),
            SESSION,
            self.config,
            channel.clone(),
            self.factory.clone(),
            self.media.clone(),
        );
        let notices = coordinator.notifier().subscribe();
        let (relay, inbound) = mpsc::unbounded_channel();
        let (handle, commands) = CoordinatorHandle::channel();
        let task = tokio::spawn(coordinator.run(inbound, commands));
        Harness {
            handle,
            relay,
            channel,
            factory: self.factory,
            media: self.media,
            notices,
            task,
        }
    }
}

impl Harness {
    pub fn push(&self, event: InboundEvent) {
        self.relay.send(event).expect("coordinator stopped");
    }

    /// Round-trips a status request, so every event pushed before it has
    /// been handled.
    pub async fn status(&self) -> CoordinatorStatus {
        self.handle.status().await.expect("status")
    }

    pub async fn wait_until(&self, what: &str, pred: impl Fn(&CoordinatorStatus) -> bool) -> CoordinatorStatus {
        for _ in 0..200 {
            let status = self.status().await;
            if pred(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    /// Polls until a notice matching `pred` shows up. Notices seen on the
    /// way are consumed.
    pub async fn wait_for_notice(&mut self, what: &str, pred: impl Fn(&SessionNotice) -> bool) {
        for _ in 0..200 {
            self.status().await;
            if self.drain_notices().iter().any(&pred) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    pub fn drain_notices(&mut self) -> Vec<SessionNotice> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }

    /// Broadcaster: live session with `viewers` in the roster and local media
    /// ready.
    pub async fn go_live(&self, viewers: &[&str]) -> CoordinatorStatus {
        self.push(session_info(true, viewers));
        self.wait_until("local media", |s| s.media.has_stream).await
    }
}

// ---------- events ----------

pub fn session_info(is_live: bool, viewers: &[&str]) -> InboundEvent {
    InboundEvent::SessionInfo(SessionInfo {
        is_live,
        messages: vec![],
        total_students: viewers.len(),
        student_ids: viewers.iter().map(|v| ParticipantId::new(*v)).collect(),
    })
}

pub fn joined(id: &str) -> InboundEvent {
    InboundEvent::ParticipantJoined(ParticipantRef {
        user_id: ParticipantId::new(id),
    })
}

pub fn left(id: &str) -> InboundEvent {
    InboundEvent::ParticipantLeft(ParticipantRef {
        user_id: ParticipantId::new(id),
    })
}

pub fn viewer_answer(id: &str) -> InboundEvent {
    InboundEvent::ViewerSignal(ViewerSignal {
        student_id: ParticipantId::new(id),
        signal: Signal::Answer {
            sdp: SessionDescription::answer(format!("answer-from-{id}")),
        },
    })
}

pub fn viewer_candidate(id: &str, n: u32) -> InboundEvent {
    InboundEvent::ViewerSignal(ViewerSignal {
        student_id: ParticipantId::new(id),
        signal: Signal::Candidate {
            candidate: candidate(n),
        },
    })
}

pub fn broadcaster_offer(n: u32) -> InboundEvent {
    InboundEvent::BroadcasterSignal(BroadcasterSignal {
        signal: Signal::Offer {
            sdp: SessionDescription::offer(format!("offer-{n}")),
        },
    })
}

pub fn broadcaster_candidate(n: u32) -> InboundEvent {
    InboundEvent::BroadcasterSignal(BroadcasterSignal {
        signal: Signal::Candidate {
            candidate: candidate(n),
        },
    })
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2122260223 192.168.1.{n} 5{n:04} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

pub fn id(s: &str) -> ParticipantId {
    ParticipantId::new(s)
}
