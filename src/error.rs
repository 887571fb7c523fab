//! Error types for the broadcast session coordinator

use thiserror::Error;

use crate::session::ParticipantId;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Media access error: {0}")]
    Media(#[from] MediaAccessError),

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Link failure: {0}")]
    Link(#[from] LinkFailure),

    #[error("Signaling channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Action rejected: {0}")]
    InvalidAction(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Local camera/microphone problems. Never fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("no {0} track in local stream")]
    MissingTrack(&'static str),
}

/// Malformed or out-of-order signaling. Logged and discarded.
#[derive(Error, Debug)]
pub enum NegotiationError {
    #[error("no peer link for {0}")]
    NoLink(ParticipantId),

    #[error("candidate from {0} arrived before remote description")]
    CandidateBeforeDescription(ParticipantId),

    #[error("unexpected {kind} from {from}")]
    UnexpectedSignal {
        from: ParticipantId,
        kind: &'static str,
    },

    #[error("invalid session description: {0}")]
    InvalidDescription(String),

    #[error("peer link is closed")]
    Closed,

    #[error("webrtc: {0}")]
    Rtc(#[from] webrtc::Error),
}

/// A peer link reached a terminal connectivity state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    #[error("link to {0} failed")]
    Failed(ParticipantId),

    #[error("link to {0} disconnected")]
    Disconnected(ParticipantId),

    #[error("link to {0} stalled in negotiation")]
    Stalled(ParticipantId),
}

/// Relay channel errors. `Lost` means session membership is gone.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("signaling channel lost")]
    Lost,

    #[error("signaling channel closed")]
    Closed,

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("invalid relay url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
