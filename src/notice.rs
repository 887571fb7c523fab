//! UI-facing notices. The presentation layer subscribes and renders them
//! (toasts, status badges, the remote video element).

use tokio::sync::broadcast;

use crate::peer::media::TrackKind;
use crate::session::{ChatMessage, ParticipantId};

const NOTICE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    BroadcastStarted,
    SessionEnded,
    InstructorDisconnected,
    LinkConnected(ParticipantId),
    LinkLost(ParticipantId),
    RemoteMediaAvailable(TrackKind),
    RemoteMediaCleared,
    MediaError(String),
    /// The broadcaster muted this client's microphone.
    Muted,
    RecordingChanged(bool),
    ChatMessage(ChatMessage),
    ParticipantsChanged(usize),
    ChannelLost,
    ActionRejected(String),
}

#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<SessionNotice>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTICE_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotice> {
        self.tx.subscribe()
    }

    pub fn emit(&self, notice: SessionNotice) {
        tracing::debug!(?notice, "notice");
        // no subscribers is fine
        let _ = self.tx.send(notice);
    }
}
