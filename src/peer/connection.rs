use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;

use crate::error::NegotiationError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::ice::analyze_candidates;
use crate::peer::media::{LocalStream, LocalTrack, TrackKind};
use crate::peer::state::{LinkEvent, LinkState};
use crate::peer::types::{IceCandidate, ServerConfig, SessionDescription};
use crate::session::ParticipantId;
use crate::utils::add_ice_url_scheme;

/// Everything a new link needs to know about its place in the session.
/// Passed in at construction instead of captured from outer state.
#[derive(Debug, Clone)]
pub struct LinkContext {
    pub counterpart: ParticipantId,
    pub generation: u64,
    pub events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkContext {
    pub fn emit(&self, event: LinkEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!(counterpart = %self.counterpart, "link event receiver gone");
        }
    }

    pub fn emit_state(&self, state: LinkState) {
        self.emit(LinkEvent::StateChanged {
            counterpart: self.counterpart.clone(),
            generation: self.generation,
            state,
        });
    }

    pub fn emit_candidate(&self, candidate: IceCandidate) {
        self.emit(LinkEvent::LocalCandidate {
            counterpart: self.counterpart.clone(),
            generation: self.generation,
            candidate,
        });
    }
}

/// One negotiated media connection to exactly one counterpart.
#[async_trait]
pub trait PeerLink: Send + Sync {
    fn counterpart(&self) -> &ParticipantId;

    /// Adds every track of `stream` not yet attached. Returns how many were
    /// added; the caller renegotiates when that is non-zero on a live link.
    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<usize, NegotiationError>;

    /// Creates an offer and sets it as local description.
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    /// Sets a remote offer, creates the answer and sets it locally.
    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError>;

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError>;

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    async fn has_remote_description(&self) -> bool;

    /// Releases the connection. Idempotent.
    async fn close(&self);
}

#[async_trait]
pub trait LinkFactory: Send + Sync {
    async fn create(&self, ctx: LinkContext) -> Result<Arc<dyn PeerLink>, NegotiationError>;
}

/// `PeerLink` over a webrtc-rs peer connection
pub struct WebRtcLink {
    counterpart: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    attached: Mutex<Vec<LocalTrack>>,
    closed: AtomicBool,
}

impl WebRtcLink {
    fn new(ctx: LinkContext, pc: Arc<RTCPeerConnection>) -> Self {
        install_callbacks(&ctx, &pc);
        Self {
            counterpart: ctx.counterpart,
            pc,
            attached: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        Ok(())
    }

    async fn local_description(&self) -> Result<SessionDescription, NegotiationError> {
        let desc = self.pc.local_description().await.ok_or_else(|| {
            NegotiationError::InvalidDescription("local description missing".to_string())
        })?;
        SessionDescription::from_rtc(&desc)
    }
}

fn install_callbacks(ctx: &LinkContext, pc: &Arc<RTCPeerConnection>) {
    let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::new(Mutex::new(Vec::new()));

    let cand_ctx = ctx.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        let ctx = cand_ctx.clone();
        let gathered = gathered.clone();
        Box::pin(async move {
            match cand {
                Some(c) => {
                    dump_candidate(ctx.counterpart.as_str(), &c);
                    match c.to_json() {
                        Ok(init) => {
                            let candidate = IceCandidate::from(init);
                            if let Ok(mut list) = gathered.lock() {
                                list.push(candidate.clone());
                            }
                            ctx.emit_candidate(candidate);
                        }
                        Err(e) => {
                            tracing::warn!(counterpart = %ctx.counterpart, error = %e, "candidate to_json failed")
                        }
                    }
                }
                // None marks the end of gathering
                None => {
                    if let Ok(list) = gathered.lock() {
                        analyze_candidates(&list);
                    }
                }
            }
        })
    }));

    let state_ctx = ctx.clone();
    let pc_stats = Arc::downgrade(pc);
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        tracing::debug!(counterpart = %state_ctx.counterpart, state = %st, "peer connection state changed");
        if st == RTCPeerConnectionState::Failed {
            if let Some(pc) = pc_stats.upgrade() {
                let label = state_ctx.counterpart.to_string();
                tokio::spawn(async move {
                    dump_selected_pair(&pc, &label).await;
                });
            }
        }
        let state = LinkState::from(st);
        if state != LinkState::New {
            state_ctx.emit_state(state);
        }
        Box::pin(async {})
    }));

    let track_ctx = ctx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };
        if let Some(kind) = kind {
            track_ctx.emit(LinkEvent::RemoteTrack {
                counterpart: track_ctx.counterpart.clone(),
                generation: track_ctx.generation,
                kind,
            });
        }
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerLink for WebRtcLink {
    fn counterpart(&self) -> &ParticipantId {
        &self.counterpart
    }

    async fn attach_local_tracks(&self, stream: &LocalStream) -> Result<usize, NegotiationError> {
        self.ensure_open()?;
        let fresh: Vec<LocalTrack> = {
            let attached = self.attached.lock().map_err(|_| NegotiationError::Closed)?;
            stream
                .tracks()
                .iter()
                .filter(|t| !attached.iter().any(|a| a.same_track(t)))
                .cloned()
                .collect()
        };

        for track in &fresh {
            let rtp_sender = self
                .pc
                .add_track(track.rtc_track() as Arc<dyn TrackLocal + Send + Sync>)
                .await?;
            // RTCP has to be drained for the interceptors to work
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while rtp_sender.read(&mut buf).await.is_ok() {}
            });
            tracing::debug!(counterpart = %self.counterpart, kind = track.kind().as_str(), "attached local track");
        }

        let count = fresh.len();
        if let Ok(mut attached) = self.attached.lock() {
            attached.extend(fresh);
        }
        Ok(count)
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.local_description().await
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.pc.set_remote_description(offer.to_rtc()?).await?;
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        self.local_description().await
    }

    async fn set_remote_answer(&self, answer: SessionDescription) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.pc.set_remote_description(answer.to_rtc()?).await?;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.pc.add_ice_candidate(candidate.into()).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.pc.close().await {
            tracing::debug!(counterpart = %self.counterpart, error = %e, "peer connection close failed");
        }
    }
}

/// Creates `WebRtcLink`s sharing one webrtc API instance.
pub struct WebRtcLinkFactory {
    api: API,
    config: RTCConfiguration,
}

impl WebRtcLinkFactory {
    pub fn new(servers: &[ServerConfig]) -> Result<Self, NegotiationError> {
        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            config: rtc_config(servers),
        })
    }
}

#[async_trait]
impl LinkFactory for WebRtcLinkFactory {
    async fn create(&self, ctx: LinkContext) -> Result<Arc<dyn PeerLink>, NegotiationError> {
        let pc = Arc::new(self.api.new_peer_connection(self.config.clone()).await?);
        tracing::debug!(counterpart = %ctx.counterpart, generation = ctx.generation, "created peer connection");
        Ok(Arc::new(WebRtcLink::new(ctx, pc)))
    }
}

/// Peer connection configuration for the given ICE servers
pub fn rtc_config(servers: &[ServerConfig]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(servers),
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}
