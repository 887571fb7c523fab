use crate::error::{NegotiationError, Result};
use crate::peer::media::LocalStream;
use crate::role::links::{LinkTable, OfferOutcome};
use crate::role::Signaler;
use crate::session::{ParticipantId, SessionState};
use crate::signaling::Signal;

/// Broadcaster side: one link per known viewer, always the offerer.
pub struct Broadcaster {
    links: LinkTable,
}

impl Broadcaster {
    pub fn new(links: LinkTable) -> Self {
        Self { links }
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn links_mut(&mut self) -> &mut LinkTable {
        &mut self.links
    }

    /// Opens links to every roster viewer that does not have one yet.
    /// Failures are per viewer and do not stop the others. With
    /// `hold_offers` the links are created but stay silent until local
    /// media resolves.
    pub async fn setup(
        &mut self,
        session: &SessionState,
        media: Option<&LocalStream>,
        hold_offers: bool,
        signaler: &Signaler,
    ) {
        let missing: Vec<ParticipantId> = session
            .roster
            .iter()
            .filter(|id| !self.links.contains(id))
            .cloned()
            .collect();
        for viewer in missing {
            if let Err(e) = self.open_link(&viewer, media, hold_offers, signaler).await {
                tracing::warn!(viewer = %viewer, error = %e, "could not open link to viewer");
            }
        }
    }

    pub async fn participant_joined(
        &mut self,
        viewer: &ParticipantId,
        session: &mut SessionState,
        media: Option<&LocalStream>,
        hold_offers: bool,
        signaler: &Signaler,
    ) -> Result<()> {
        if viewer.is_broadcaster() || viewer == signaler.sender_id() {
            tracing::warn!(viewer = %viewer, "ignoring join for reserved id");
            return Ok(());
        }
        session.add_viewer(viewer.clone());
        self.open_link(viewer, media, hold_offers, signaler).await
    }

    /// Creates or reuses the link, attaches current media and offers when
    /// something changed. A repeated join for a live link is a no-op.
    async fn open_link(
        &mut self,
        viewer: &ParticipantId,
        media: Option<&LocalStream>,
        hold_offers: bool,
        signaler: &Signaler,
    ) -> Result<()> {
        let created = self.links.ensure(viewer).await?;
        let attached = match media {
            Some(stream) => self.links.attach(viewer, stream).await?,
            None if hold_offers => {
                tracing::debug!(viewer = %viewer, "offer held until local media resolves");
                return Ok(());
            }
            None => 0,
        };
        if !created && attached == 0 {
            tracing::debug!(viewer = %viewer, "duplicate join, reusing link");
            return Ok(());
        }
        self.links.offer(viewer, signaler).await?;
        Ok(())
    }

    pub async fn handle_signal(
        &mut self,
        viewer: &ParticipantId,
        signal: Signal,
        signaler: &Signaler,
    ) -> Result<()> {
        match signal {
            Signal::Answer { sdp } => self.links.apply_answer(viewer, sdp, signaler).await,
            Signal::Candidate { candidate } => self.links.add_candidate(viewer, candidate).await,
            Signal::Offer { .. } => Err(NegotiationError::UnexpectedSignal {
                from: viewer.clone(),
                kind: "offer",
            }
            .into()),
        }
    }

    /// Closes the viewer's link and drops it from the roster.
    pub async fn participant_left(&mut self, viewer: &ParticipantId, session: &mut SessionState) {
        self.links.close(viewer).await;
        session.remove_viewer(viewer);
    }

    /// Closes links whose viewer is no longer in the roster.
    pub async fn prune_to_roster(&mut self, session: &SessionState) -> Vec<ParticipantId> {
        let stale: Vec<ParticipantId> = self
            .links
            .ids()
            .into_iter()
            .filter(|id| !session.roster.contains(id))
            .collect();
        for id in &stale {
            tracing::debug!(viewer = %id, "viewer left roster, closing link");
            self.links.close(id).await;
        }
        stale
    }

    /// Sends the offers held back while media was being acquired, without
    /// tracks. Used when acquisition failed.
    pub async fn release_held_offers(&mut self, signaler: &Signaler) {
        for viewer in self.links.awaiting_offer() {
            if let Err(e) = self.links.offer(&viewer, signaler).await {
                tracing::warn!(viewer = %viewer, error = %e, "could not send held offer");
            }
        }
    }

    /// Attaches a newly acquired stream to every link and renegotiates the
    /// ones that gained tracks.
    pub async fn attach_stream(
        &mut self,
        stream: &LocalStream,
        signaler: &Signaler,
    ) -> Vec<(ParticipantId, OfferOutcome)> {
        let mut offered = Vec::new();
        for viewer in self.links.ids() {
            let attached = match self.links.attach(&viewer, stream).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::warn!(viewer = %viewer, error = %e, "attach failed");
                    continue;
                }
            };
            if attached == 0 {
                continue;
            }
            match self.links.offer(&viewer, signaler).await {
                Ok(outcome) => offered.push((viewer, outcome)),
                Err(e) => tracing::warn!(viewer = %viewer, error = %e, "renegotiation failed"),
            }
        }
        offered
    }
}
