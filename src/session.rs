//! Session-wide state: identity types, chat log, roster and live flags.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::utils::random_id;

/// Key under which a viewer stores its single link to the broadcaster.
const BROADCASTER_KEY: &str = "instructor";

/// Opaque per-membership participant identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh client-side id, e.g. `user-3fa9c01b`.
    pub fn generate() -> Self {
        Self(format!("user-{}", random_id()))
    }

    /// The reserved, well-known id viewers use for the broadcaster.
    pub fn broadcaster() -> Self {
        Self(BROADCASTER_KEY.to_string())
    }

    pub fn is_broadcaster(&self) -> bool {
        self.0 == BROADCASTER_KEY
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParticipantId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "instructor")]
    Broadcaster,
    #[serde(rename = "student")]
    Viewer,
}

impl Role {
    pub fn is_broadcaster(self) -> bool {
        matches!(self, Role::Broadcaster)
    }

    /// Parses the role names used on the command line and by the auth layer.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "instructor" | "teacher" | "broadcaster" => Some(Role::Broadcaster),
            "student" | "viewer" => Some(Role::Viewer),
            _ => None,
        }
    }
}

/// Who this client is within the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub participant_id: ParticipantId,
    pub role: Role,
}

impl Identity {
    pub fn new(participant_id: ParticipantId, role: Role) -> Self {
        Self {
            participant_id,
            role,
        }
    }

    /// Name shown next to chat messages sent by this client.
    pub fn display_name(&self) -> String {
        match self.role {
            Role::Broadcaster => "Instructor".to_string(),
            Role::Viewer => {
                let id = self.participant_id.as_str();
                let short: String = id.strip_prefix("user-").unwrap_or(id).chars().take(4).collect();
                format!("Student {short}")
            }
        }
    }
}

/// One chat line as echoed by the relay. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub text: String,
    pub user_type: Role,
}

#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub session_id: String,
    pub is_live: bool,
    pub is_recording: bool,
    pub participant_count: usize,
    /// Known viewers. Only populated on the broadcaster side.
    pub roster: BTreeSet<ParticipantId>,
    pub chat_log: Vec<ChatMessage>,
    pub joined_at: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }

    /// Applies a `session-info` payload. Roster is only kept when `track_roster`.
    pub fn hydrate(
        &mut self,
        is_live: bool,
        messages: Vec<ChatMessage>,
        total_viewers: usize,
        viewer_ids: Vec<ParticipantId>,
        track_roster: bool,
    ) {
        self.is_live = is_live;
        self.chat_log.clear();
        for message in messages {
            self.append_message(message);
        }
        // the broadcaster counts itself once it is live
        self.participant_count = total_viewers + usize::from(is_live && track_roster);
        if track_roster {
            self.roster = viewer_ids.into_iter().collect();
        }
        self.joined_at.get_or_insert_with(Utc::now);
    }

    /// Appends in arrival order. Returns false when a message with the same id
    /// is already in the log.
    pub fn append_message(&mut self, message: ChatMessage) -> bool {
        if let Some(id) = message.id.as_deref() {
            if self.chat_log.iter().any(|m| m.id.as_deref() == Some(id)) {
                return false;
            }
        }
        self.chat_log.push(message);
        true
    }

    pub fn add_viewer(&mut self, id: ParticipantId) -> bool {
        self.roster.insert(id)
    }

    pub fn remove_viewer(&mut self, id: &ParticipantId) -> bool {
        self.roster.remove(id)
    }

    pub fn set_roster(&mut self, ids: impl IntoIterator<Item = ParticipantId>) {
        self.roster = ids.into_iter().collect();
    }

    /// Not-live, empty roster, empty chat. Session id is kept.
    pub fn reset(&mut self) {
        self.is_live = false;
        self.is_recording = false;
        self.participant_count = 0;
        self.roster.clear();
        self.chat_log.clear();
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            is_live: self.is_live,
            is_recording: self.is_recording,
            participant_count: self.participant_count,
            roster: self.roster.iter().cloned().collect(),
            chat_log: self.chat_log.clone(),
            joined_at: self.joined_at,
        }
    }
}

/// Read-only copy of the session handed out to UI callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub session_id: String,
    pub is_live: bool,
    pub is_recording: bool,
    pub participant_count: usize,
    pub roster: Vec<ParticipantId>,
    pub chat_log: Vec<ChatMessage>,
    pub joined_at: Option<DateTime<Utc>>,
}
