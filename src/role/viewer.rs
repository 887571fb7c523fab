use crate::error::{NegotiationError, Result};
use crate::role::links::LinkTable;
use crate::role::Signaler;
use crate::session::ParticipantId;
use crate::signaling::Signal;

/// Viewer side: a single link to the broadcaster's reserved id. The viewer
/// never offers; it answers whatever the broadcaster sends.
pub struct Viewer {
    links: LinkTable,
    broadcaster: ParticipantId,
}

impl Viewer {
    pub fn new(links: LinkTable) -> Self {
        Self {
            links,
            broadcaster: ParticipantId::broadcaster(),
        }
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut LinkTable {
        &mut self.links
    }

    pub fn has_link(&self) -> bool {
        self.links.contains(&self.broadcaster)
    }

    /// Idempotent. Returns true when a new link was created.
    pub async fn ensure_link(&mut self) -> Result<bool> {
        self.links.ensure(&self.broadcaster).await
    }

    pub async fn handle_signal(&mut self, signal: Signal, signaler: &Signaler) -> Result<()> {
        match signal {
            Signal::Offer { sdp } => {
                // broadcast-started may have been missed
                if self.links.ensure(&self.broadcaster).await? {
                    tracing::debug!("link created on offer");
                }
                self.links.accept_offer(&self.broadcaster, sdp, signaler).await
            }
            Signal::Candidate { candidate } => {
                self.links.add_candidate(&self.broadcaster, candidate).await
            }
            Signal::Answer { .. } => Err(NegotiationError::UnexpectedSignal {
                from: self.broadcaster.clone(),
                kind: "answer",
            }
            .into()),
        }
    }

    /// Drops the broadcast link. Returns false if there was none.
    pub async fn broadcaster_gone(&mut self) -> bool {
        self.links.close(&self.broadcaster).await
    }
}
