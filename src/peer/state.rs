use std::fmt;
use std::time::Duration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::peer::media::TrackKind;
use crate::peer::types::IceCandidate;
use crate::session::ParticipantId;

/// ========== CONSTANTS ==========

/// How long a link may sit in `Negotiating` before the watchdog closes it
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the coordinator checks negotiation deadlines
pub const WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// Lifecycle of one peer link as seen by the role controller.
/// Entries are removed from the link table once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::New => "new",
            LinkState::Negotiating => "negotiating",
            LinkState::Connected => "connected",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => LinkState::Negotiating,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::New,
        }
    }
}

/// Something a peer link reports back to the coordinator. The generation
/// lets the coordinator drop events from a link it has already replaced.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    LocalCandidate {
        counterpart: ParticipantId,
        generation: u64,
        candidate: IceCandidate,
    },
    StateChanged {
        counterpart: ParticipantId,
        generation: u64,
        state: LinkState,
    },
    RemoteTrack {
        counterpart: ParticipantId,
        generation: u64,
        kind: TrackKind,
    },
}

impl LinkEvent {
    pub fn counterpart(&self) -> &ParticipantId {
        match self {
            LinkEvent::LocalCandidate { counterpart, .. }
            | LinkEvent::StateChanged { counterpart, .. }
            | LinkEvent::RemoteTrack { counterpart, .. } => counterpart,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            LinkEvent::LocalCandidate { generation, .. }
            | LinkEvent::StateChanged { generation, .. }
            | LinkEvent::RemoteTrack { generation, .. } => *generation,
        }
    }
}
