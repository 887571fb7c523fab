use std::collections::VecDeque;

use crate::peer::types::IceCandidate;
use crate::session::ParticipantId;

/// What happened to a remote candidate that arrived before the remote
/// description was set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Rejected,
    Buffered,
    /// Buffered, but the oldest held candidate had to be dropped.
    BufferedWithEviction,
}

/// Holds early remote candidates for one link. With a limit of 0 nothing is
/// ever held and every early candidate is rejected.
#[derive(Debug)]
pub struct CandidateGate {
    limit: usize,
    pending: VecDeque<IceCandidate>,
}

impl CandidateGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            pending: VecDeque::with_capacity(limit),
        }
    }

    pub fn admit_early(&mut self, from: &ParticipantId, candidate: IceCandidate) -> Admission {
        if self.limit == 0 {
            tracing::warn!(
                counterpart = %from,
                "remote description not set, discarding ICE candidate"
            );
            return Admission::Rejected;
        }
        let mut admission = Admission::Buffered;
        if self.pending.len() >= self.limit {
            self.pending.pop_front();
            admission = Admission::BufferedWithEviction;
            tracing::warn!(
                counterpart = %from,
                limit = self.limit,
                "early candidate buffer full, dropped oldest"
            );
        }
        self.pending.push_back(candidate);
        tracing::debug!(
            counterpart = %from,
            held = self.pending.len(),
            "remote description not set yet, holding candidate"
        );
        admission
    }

    /// Takes the held candidates in arrival order, for replay once the
    /// remote description is set.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.pending.drain(..).collect()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateSummary {
    let mut summary = CandidateSummary::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            summary.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            summary.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            summary.relay += 1;
        }
    }

    tracing::debug!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "candidate analysis"
    );

    if summary.relay == 0 && !candidates.is_empty() {
        tracing::warn!("no TURN relay candidates gathered, connections through NAT may fail");
    }
    summary
}
