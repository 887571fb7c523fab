pub mod config;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod notice;
pub mod peer;
pub mod role;
pub mod session;
pub mod signaling;
pub mod utils;

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

pub use config::SessionConfig;
pub use coordinator::{Command, CoordinatorHandle, CoordinatorStatus, SessionCoordinator};
pub use error::{ChannelError, Error, LinkFailure, MediaAccessError, NegotiationError, Result};
pub use notice::{Notifier, SessionNotice};
pub use session::{ChatMessage, Identity, ParticipantId, Role, SessionSnapshot, SessionState};

use peer::{StaticMediaSource, WebRtcLinkFactory};
use signaling::WsSignalingChannel;

/// A running session: command handle, notice stream and the coordinator task.
pub struct SessionClient {
    pub handle: CoordinatorHandle,
    pub notices: broadcast::Receiver<SessionNotice>,
    pub task: JoinHandle<Result<()>>,
}

/// Joins `session_id` through the configured relay with webrtc links and
/// the default media source, and spawns the coordinator.
pub async fn start(
    config: SessionConfig,
    session_id: &str,
    identity: Identity,
) -> Result<SessionClient> {
    config.validate()?;
    let factory = Arc::new(WebRtcLinkFactory::new(&config.ice_servers)?);
    let (channel, inbound) = WsSignalingChannel::connect(
        &config.relay_url,
        session_id,
        &identity.participant_id,
        identity.role,
    )
    .await?;
    tracing::info!(
        relay = %config.relay_url,
        session = session_id,
        participant = %identity.participant_id,
        "joined relay"
    );

    let coordinator = SessionCoordinator::new(
        identity,
        session_id,
        config,
        channel,
        factory,
        Arc::new(StaticMediaSource),
    );
    let notices = coordinator.notifier().subscribe();
    let (handle, commands) = CoordinatorHandle::channel();
    let task = tokio::spawn(coordinator.run(inbound, commands));
    Ok(SessionClient {
        handle,
        notices,
        task,
    })
}
