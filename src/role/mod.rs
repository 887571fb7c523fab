//! Role-specific negotiation behavior. The broadcaster offers to every
//! viewer; a viewer answers the broadcaster over a single link.

pub mod broadcaster;
pub mod links;
pub mod viewer;


use std::sync::Arc;

pub use broadcaster::Broadcaster;
pub use links::{LinkTable, OfferOutcome};
pub use viewer::Viewer;

use crate::error::ChannelError;
use crate::session::ParticipantId;
use crate::signaling::{
    ActionKind, BroadcastSignal, InstructorAction, OutboundEvent, Signal, SignalingChannel,
};

/// Outbound half of the relay, stamped with this client's session and id.
#[derive(Clone)]
pub struct Signaler {
    channel: Arc<dyn SignalingChannel>,
    session_id: String,
    sender_id: ParticipantId,
}

impl Signaler {
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        session_id: impl Into<String>,
        sender_id: ParticipantId,
    ) -> Self {
        Self {
            channel,
            session_id: session_id.into(),
            sender_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn sender_id(&self) -> &ParticipantId {
        &self.sender_id
    }

    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }

    pub fn send(&self, event: OutboundEvent) -> Result<(), ChannelError> {
        self.channel.send(event)
    }

    pub fn send_signal(&self, target: &ParticipantId, signal: Signal) -> Result<(), ChannelError> {
        self.send(OutboundEvent::BroadcastSignal(BroadcastSignal {
            signal,
            target_id: target.clone(),
            sender_id: self.sender_id.clone(),
            session_id: self.session_id.clone(),
        }))
    }

    pub fn send_action(
        &self,
        action: ActionKind,
        is_recording: Option<bool>,
    ) -> Result<(), ChannelError> {
        self.send(OutboundEvent::InstructorAction(InstructorAction {
            action,
            session_id: self.session_id.clone(),
            is_recording,
        }))
    }
}

/// The controller for whichever role this client holds.
pub enum RoleController {
    Broadcaster(Broadcaster),
    Viewer(Viewer),
}

impl RoleController {
    pub fn links(&self) -> &LinkTable {
        match self {
            RoleController::Broadcaster(b) => b.links(),
            RoleController::Viewer(v) => v.links(),
        }
    }

    pub fn links_mut(&mut self) -> &mut LinkTable {
        match self {
            RoleController::Broadcaster(b) => b.links_mut(),
            RoleController::Viewer(v) => v.links_mut(),
        }
    }

    pub fn is_broadcaster(&self) -> bool {
        matches!(self, RoleController::Broadcaster(_))
    }
}
