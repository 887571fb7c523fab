//! Table of live peer links, keyed by counterpart, with per-link negotiation
//! bookkeeping.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{NegotiationError, Result};
use crate::peer::connection::{LinkContext, LinkFactory, PeerLink};
use crate::peer::ice::{Admission, CandidateGate};
use crate::peer::media::LocalStream;
use crate::peer::state::{LinkEvent, LinkState};
use crate::peer::types::{IceCandidate, SessionDescription};
use crate::role::Signaler;
use crate::signaling::Signal;
use crate::session::ParticipantId;

struct LinkEntry {
    link: Arc<dyn PeerLink>,
    generation: u64,
    state: LinkState,
    /// An offer went out and its answer has not been applied yet.
    offer_in_flight: bool,
    /// Another offer was requested while one was in flight.
    renegotiate_pending: bool,
    negotiating_since: Option<Instant>,
    gate: CandidateGate,
}

impl LinkEntry {
    fn start_negotiating(&mut self) {
        if self.state == LinkState::New {
            self.state = LinkState::Negotiating;
        }
        self.negotiating_since.get_or_insert_with(Instant::now);
    }
}

/// Whether an offer was sent now or queued behind one in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferOutcome {
    Sent,
    Queued,
}

pub struct LinkTable {
    factory: Arc<dyn LinkFactory>,
    events: mpsc::UnboundedSender<LinkEvent>,
    entries: HashMap<ParticipantId, LinkEntry>,
    next_generation: u64,
    candidate_limit: usize,
}

impl LinkTable {
    pub fn new(
        factory: Arc<dyn LinkFactory>,
        events: mpsc::UnboundedSender<LinkEvent>,
        candidate_limit: usize,
    ) -> Self {
        Self {
            factory,
            events,
            entries: HashMap::new(),
            next_generation: 1,
            candidate_limit,
        }
    }

    #[cfg(test)]
    fn get(&self, id: &ParticipantId) -> Option<&LinkEntry> {
        self.entries.get(id)
    }

    /// `None` means absent.
    pub fn state(&self, id: &ParticipantId) -> Option<LinkState> {
        self.entries.get(id).map(|e| e.state)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.entries.keys().cloned().collect()
    }

    /// True if `generation` belongs to the link currently stored for `id`.
    pub fn is_current(&self, id: &ParticipantId, generation: u64) -> bool {
        self.entries
            .get(id)
            .map(|e| e.generation == generation)
            .unwrap_or(false)
    }

    /// Creates the link for `id` if absent. Returns true when created.
    pub async fn ensure(&mut self, id: &ParticipantId) -> Result<bool> {
        if self.entries.contains_key(id) {
            return Ok(false);
        }
        let generation = self.next_generation;
        self.next_generation += 1;
        let link = self
            .factory
            .create(LinkContext {
                counterpart: id.clone(),
                generation,
                events: self.events.clone(),
            })
            .await?;
        tracing::debug!(counterpart = %id, generation, "peer link created");
        self.entries.insert(
            id.clone(),
            LinkEntry {
                link,
                generation,
                state: LinkState::New,
                offer_in_flight: false,
                renegotiate_pending: false,
                negotiating_since: None,
                gate: CandidateGate::new(self.candidate_limit),
            },
        );
        Ok(true)
    }

    /// Attaches the stream's tracks to one link. Returns how many were new.
    pub async fn attach(&mut self, id: &ParticipantId, stream: &LocalStream) -> Result<usize> {
        let entry = self
            .entries
            .get(id)
            .ok_or_else(|| NegotiationError::NoLink(id.clone()))?;
        Ok(entry.link.attach_local_tracks(stream).await?)
    }

    /// Creates and sends an offer, or queues one if the previous offer on
    /// this link has not been answered yet.
    pub async fn offer(&mut self, id: &ParticipantId, signaler: &Signaler) -> Result<OfferOutcome> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| NegotiationError::NoLink(id.clone()))?;
        if entry.offer_in_flight {
            entry.renegotiate_pending = true;
            tracing::debug!(counterpart = %id, "offer in flight, renegotiation queued");
            return Ok(OfferOutcome::Queued);
        }
        let sdp = entry.link.create_offer().await?;
        entry.offer_in_flight = true;
        entry.start_negotiating();
        tracing::debug!(counterpart = %id, generation = entry.generation, "sending offer");
        signaler.send_signal(id, Signal::Offer { sdp })?;
        Ok(OfferOutcome::Sent)
    }

    /// Applies the counterpart's answer, replays held candidates and starts a
    /// queued renegotiation if there is one.
    pub async fn apply_answer(
        &mut self,
        id: &ParticipantId,
        sdp: SessionDescription,
        signaler: &Signaler,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| NegotiationError::NoLink(id.clone()))?;
        if !entry.offer_in_flight {
            return Err(NegotiationError::UnexpectedSignal {
                from: id.clone(),
                kind: "answer",
            }
            .into());
        }
        let applied = entry.link.set_remote_answer(sdp).await;
        if let Err(e) = applied {
            // the round is over either way; a queued one starts fresh
            entry.offer_in_flight = false;
            let retry = std::mem::take(&mut entry.renegotiate_pending);
            tracing::warn!(counterpart = %id, error = %e, "answer rejected, offer round dropped");
            if retry {
                if let Err(retry_err) = self.offer(id, signaler).await {
                    tracing::warn!(counterpart = %id, error = %retry_err, "renegotiation failed");
                }
            }
            return Err(e.into());
        }
        entry.offer_in_flight = false;
        replay_candidates(id, entry).await;

        if entry.renegotiate_pending {
            entry.renegotiate_pending = false;
            self.offer(id, signaler).await?;
        }
        Ok(())
    }

    /// Answerer side: sets the remote offer and sends back an answer.
    pub async fn accept_offer(
        &mut self,
        id: &ParticipantId,
        sdp: SessionDescription,
        signaler: &Signaler,
    ) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| NegotiationError::NoLink(id.clone()))?;
        let answer = entry.link.accept_offer(sdp).await?;
        entry.start_negotiating();
        replay_candidates(id, entry).await;
        tracing::debug!(counterpart = %id, generation = entry.generation, "sending answer");
        signaler.send_signal(id, Signal::Answer { sdp: answer })?;
        Ok(())
    }

    /// Adds a remote candidate, or hands it to the link's gate when the
    /// remote description is not set yet.
    pub async fn add_candidate(&mut self, id: &ParticipantId, candidate: IceCandidate) -> Result<()> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| NegotiationError::NoLink(id.clone()))?;
        if entry.link.has_remote_description().await {
            entry.link.add_remote_candidate(candidate).await?;
            return Ok(());
        }
        match entry.gate.admit_early(id, candidate) {
            Admission::Rejected => {
                Err(NegotiationError::CandidateBeforeDescription(id.clone()).into())
            }
            Admission::Buffered | Admission::BufferedWithEviction => Ok(()),
        }
    }

    /// Records a connectivity change reported by the link. Returns false for
    /// events from a link that is no longer current.
    pub fn mark_state(&mut self, id: &ParticipantId, generation: u64, state: LinkState) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        if entry.generation != generation {
            return false;
        }
        match state {
            LinkState::Connected => {
                entry.state = LinkState::Connected;
                entry.negotiating_since = None;
            }
            LinkState::Negotiating => entry.start_negotiating(),
            other => entry.state = other,
        }
        true
    }

    /// Closes and removes the link for `id`.
    pub async fn close(&mut self, id: &ParticipantId) -> bool {
        match self.entries.remove(id) {
            Some(mut entry) => {
                entry.gate.clear();
                entry.link.close().await;
                tracing::debug!(counterpart = %id, generation = entry.generation, "peer link closed");
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&mut self) {
        for id in self.ids() {
            self.close(&id).await;
        }
    }

    /// Links that were created but never offered on.
    pub fn awaiting_offer(&self) -> Vec<ParticipantId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == LinkState::New && !e.offer_in_flight)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Links that have been negotiating for longer than `timeout`.
    pub fn stalled(&self, now: Instant, timeout: Duration) -> Vec<ParticipantId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == LinkState::Negotiating)
            .filter(|(_, e)| {
                e.negotiating_since
                    .map(|since| now.saturating_duration_since(since) >= timeout)
                    .unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

async fn replay_candidates(id: &ParticipantId, entry: &mut LinkEntry) {
    for candidate in entry.gate.drain() {
        if let Err(e) = entry.link.add_remote_candidate(candidate).await {
            tracing::warn!(counterpart = %id, error = %e, "failed to apply held candidate");
        }
    }
}
