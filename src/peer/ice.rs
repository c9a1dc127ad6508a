use crate::peer::types::IceCandidate;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// FIFO буфер удалённых кандидатов до установки remote description
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    pub fn push(&mut self, candidate: IceCandidate) {
        debug!(
            pending = self.queue.len() + 1,
            "Remote description not set yet, queuing candidate"
        );
        self.queue.push_back(candidate);
    }

    /// Забирает все отложенные кандидаты в порядке поступления
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// Тип кандидата по строке `typ ...`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    Relay,
    Other,
}

pub fn candidate_type(candidate: &IceCandidate) -> CandidateType {
    if candidate.candidate.contains("typ host") {
        CandidateType::Host
    } else if candidate.candidate.contains("typ srflx") {
        CandidateType::ServerReflexive
    } else if candidate.candidate.contains("typ relay") {
        CandidateType::Relay
    } else {
        CandidateType::Other
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
        match candidate_type(candidate) {
            CandidateType::Host => summary.host += 1,
            CandidateType::ServerReflexive => summary.srflx += 1,
            CandidateType::Relay => summary.relay += 1,
            CandidateType::Other => {}
        }
    }

    debug!(
        host = summary.host,
        srflx = summary.srflx,
        relay = summary.relay,
        "Candidate analysis"
    );

    if summary.relay == 0 {
        warn!("No TURN relay candidates found! Connection through NAT may fail.");
    }
    summary
}
