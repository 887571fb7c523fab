pub mod connection;
pub mod ice;
pub mod media;
pub mod state;
pub mod types;

pub use connection::{LinkContext, LinkFactory, PeerLink, WebRtcLink, WebRtcLinkFactory};
pub use media::{
    LocalMedia, LocalMediaState, LocalStream, LocalTrack, MediaRequest, MediaSource,
    StaticMediaSource, TrackKind,
};
pub use state::{LinkEvent, LinkState, DEFAULT_NEGOTIATION_TIMEOUT};
pub use types::{IceCandidate, IceServerKind, SdpKind, ServerConfig, SessionDescription};
