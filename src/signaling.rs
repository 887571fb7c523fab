//! Relay channel: typed event payloads and the websocket transport.
//!
//! Frames on the wire are JSON envelopes `{"event": "<name>", "data": {...}}`.
//! Inbound frames are decoded into [`InboundEvent`] here, so anything that
//! reaches the coordinator has already been validated.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use crate::error::ChannelError;
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::session::{ChatMessage, ParticipantId, Role};

/// Negotiation payload carried inside `broadcast-signal` and the inbound
/// `*-signal` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Signal {
    Offer { sdp: SessionDescription },
    Answer { sdp: SessionDescription },
    Candidate { candidate: IceCandidate },
}

impl Signal {
    pub fn kind(&self) -> &'static str {
        match self {
            Signal::Offer { .. } => "offer",
            Signal::Answer { .. } => "answer",
            Signal::Candidate { .. } => "candidate",
        }
    }
}

// ---------- outbound ----------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinBroadcast {
    pub session_id: String,
    pub participant_id: ParticipantId,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastSignal {
    #[serde(flatten)]
    pub signal: Signal,
    pub target_id: ParticipantId,
    pub sender_id: ParticipantId,
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub session_id: String,
    pub user_id: ParticipantId,
    pub name: String,
    pub text: String,
    pub user_type: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    EndSession,
    ToggleRecording,
    MuteAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructorAction {
    #[serde(rename = "type")]
    pub action: ActionKind,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_recording: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveBroadcast {
    pub session_id: String,
    pub participant_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum OutboundEvent {
    JoinBroadcast(JoinBroadcast),
    BroadcastSignal(BroadcastSignal),
    BroadcastMessage(BroadcastMessage),
    InstructorAction(InstructorAction),
    LeaveBroadcast(LeaveBroadcast),
}

impl OutboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutboundEvent::JoinBroadcast(_) => "join-broadcast",
            OutboundEvent::BroadcastSignal(_) => "broadcast-signal",
            OutboundEvent::BroadcastMessage(_) => "broadcast-message",
            OutboundEvent::InstructorAction(_) => "instructor-action",
            OutboundEvent::LeaveBroadcast(_) => "leave-broadcast",
        }
    }

    pub fn encode(&self) -> Result<String, ChannelError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ---------- inbound ----------

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub is_live: bool,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub total_students: usize,
    #[serde(default)]
    pub student_ids: Vec<ParticipantId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRef {
    pub user_id: ParticipantId,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSignal {
    pub student_id: ParticipantId,
    pub signal: Signal,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BroadcasterSignal {
    pub signal: Signal,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantsUpdated {
    pub count: usize,
    #[serde(default)]
    pub student_ids: Vec<ParticipantId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingStatus {
    pub is_recording: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CommandKind {
    MuteAll,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct InstructorCommand {
    pub command: CommandKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    SessionInfo(SessionInfo),
    BroadcastStarted,
    SessionEnded,
    ParticipantJoined(ParticipantRef),
    ParticipantLeft(ParticipantRef),
    ViewerSignal(ViewerSignal),
    BroadcasterSignal(BroadcasterSignal),
    NewMessage(ChatMessage),
    ParticipantsUpdated(ParticipantsUpdated),
    RecordingStatus(RecordingStatus),
    InstructorDisconnected,
    InstructorCommand(InstructorCommand),
    /// Raised once by the transport when the relay connection drops.
    Disconnected,
}

#[derive(Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("unknown event {0}")]
    UnknownEvent(String),
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::SessionInfo(_) => "session-info",
            InboundEvent::BroadcastStarted => "broadcast-started",
            InboundEvent::SessionEnded => "session-ended",
            InboundEvent::ParticipantJoined(_) => "student-joined",
            InboundEvent::ParticipantLeft(_) => "student-left",
            InboundEvent::ViewerSignal(_) => "student-signal",
            InboundEvent::BroadcasterSignal(_) => "instructor-signal",
            InboundEvent::NewMessage(_) => "new-message",
            InboundEvent::ParticipantsUpdated(_) => "participants-updated",
            InboundEvent::RecordingStatus(_) => "recording-status",
            InboundEvent::InstructorDisconnected => "instructor-disconnected",
            InboundEvent::InstructorCommand(_) => "instructor-command",
            InboundEvent::Disconnected => "disconnect",
        }
    }

    /// Decodes one relay frame. Payload-less events ignore whatever `data` holds.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let frame: Frame = serde_json::from_str(text)?;
        let data = frame.data;
        let event = match frame.event.as_str() {
            "session-info" => InboundEvent::SessionInfo(serde_json::from_value(data)?),
            "broadcast-started" => InboundEvent::BroadcastStarted,
            "session-ended" => InboundEvent::SessionEnded,
            "student-joined" => InboundEvent::ParticipantJoined(serde_json::from_value(data)?),
            "student-left" => InboundEvent::ParticipantLeft(serde_json::from_value(data)?),
            "student-signal" => InboundEvent::ViewerSignal(serde_json::from_value(data)?),
            "instructor-signal" => InboundEvent::BroadcasterSignal(serde_json::from_value(data)?),
            "new-message" => InboundEvent::NewMessage(serde_json::from_value(data)?),
            "participants-updated" => {
                InboundEvent::ParticipantsUpdated(serde_json::from_value(data)?)
            }
            "recording-status" => InboundEvent::RecordingStatus(serde_json::from_value(data)?),
            "instructor-disconnected" => InboundEvent::InstructorDisconnected,
            "instructor-command" => InboundEvent::InstructorCommand(serde_json::from_value(data)?),
            other => return Err(DecodeError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }
}

// ---------- channel ----------

/// Duplex, ordered channel to the relay. Inbound events are delivered on
/// the receiver returned by the implementation's connect function.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Queues an event. Events are written to the relay in send order.
    fn send(&self, event: OutboundEvent) -> Result<(), ChannelError>;

    /// Closes the connection. No `Disconnected` event follows.
    async fn disconnect(&self);
}

/// How long `disconnect` waits for queued frames and the close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

enum WsCommand {
    Frame(String),
    Close,
}

/// Websocket transport to the relay
pub struct WsSignalingChannel {
    outbound: mpsc::UnboundedSender<WsCommand>,
    lost: Arc<AtomicBool>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Maps `http(s)://` relay addresses to `ws(s)://`.
pub fn websocket_url(relay_url: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(relay_url)?;
    let scheme = match url.scheme() {
        "http" => Some("ws"),
        "https" => Some("wss"),
        "ws" | "wss" => None,
        other => return Err(ChannelError::Connect(format!("unsupported scheme {other}"))),
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| ChannelError::Connect(format!("cannot rewrite scheme of {relay_url}")))?;
    }
    Ok(url)
}

impl WsSignalingChannel {
    /// Opens the relay socket and joins the session. `join-broadcast` is the
    /// first frame written.
    pub async fn connect(
        relay_url: &str,
        session_id: &str,
        participant_id: &ParticipantId,
        role: Role,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<InboundEvent>), ChannelError> {
        let url = websocket_url(relay_url)?;
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ChannelError::Connect(e.to_string()))?;
        tracing::debug!(url = %url, "signaling websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsCommand>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<InboundEvent>();
        let lost = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(async move {
            while let Some(cmd) = out_rx.recv().await {
                match cmd {
                    WsCommand::Frame(text) => {
                        if let Err(e) = ws_write.send(Message::Text(text)).await {
                            tracing::warn!(error = %e, "signaling write failed");
                            break;
                        }
                    }
                    WsCommand::Close => {
                        let _ = ws_write.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
        });

        let reader_lost = lost.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_read.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::warn!("dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "signaling websocket error");
                        break;
                    }
                };
                match InboundEvent::decode(&text) {
                    Ok(event) => {
                        tracing::trace!(event = event.name(), "relay event");
                        if in_tx.send(event).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "rejected relay frame"),
                }
            }
            if !reader_lost.swap(true, Ordering::SeqCst) {
                tracing::info!("signaling connection lost");
                let _ = in_tx.send(InboundEvent::Disconnected);
            }
        });

        let channel = Arc::new(Self {
            outbound: out_tx,
            lost,
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
        });

        channel.send(OutboundEvent::JoinBroadcast(JoinBroadcast {
            session_id: session_id.to_string(),
            participant_id: participant_id.clone(),
            role,
        }))?;
        Ok((channel, in_rx))
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    fn send(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        let text = event.encode()?;
        tracing::trace!(event = event.name(), "relay send");
        self.outbound
            .send(WsCommand::Frame(text))
            .map_err(|_| ChannelError::Closed)
    }

    async fn disconnect(&self) {
        // intentional close, suppress the Disconnected event
        self.lost.store(true, Ordering::SeqCst);
        // the writer flushes everything queued before Close, in order
        let _ = self.outbound.send(WsCommand::Close);
        if let Some(mut writer) = take_task(&self.writer) {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                tracing::warn!("signaling writer did not drain in time");
                writer.abort();
            }
        }
        if let Some(reader) = take_task(&self.reader) {
            reader.abort();
        }
    }
}

fn take_task(slot: &Mutex<Option<JoinHandle<()>>>) -> Option<JoinHandle<()>> {
    match slot.lock() {
        Ok(mut task) => task.take(),
        Err(_) => None,
    }
}
