use std::collections::{HashMap, VecDeque};

use serde::Serialize;
use tracing::{debug, warn};

use crate::peer::types::{CandidateType, IceCandidate};
use crate::signaling::PeerId;

/// Remote candidates that arrived before the connection could take them.
///
/// Queues are per peer and bounded; on overflow the oldest candidate goes.
#[derive(Debug)]
pub struct CandidateBuffer {
    enabled: bool,
    limit: usize,
    queues: HashMap<PeerId, VecDeque<IceCandidate>>,
}

impl CandidateBuffer {
    pub fn new(enabled: bool, limit: usize) -> Self {
        Self {
            enabled,
            limit,
            queues: HashMap::new(),
        }
    }

    /// Returns `false` when the candidate was discarded because buffering is off.
    pub fn push(&mut self, peer: &str, candidate: IceCandidate) -> bool {
        if !self.enabled || self.limit == 0 {
            warn!(peer, candidate = %candidate.candidate, "no connection yet, candidate dropped");
            return false;
        }
        let queue = self.queues.entry(peer.to_owned()).or_default();
        if queue.len() == self.limit {
            if let Some(oldest) = queue.pop_front() {
                warn!(peer, candidate = %oldest.candidate, "early candidate queue full, dropping oldest");
            }
        }
        queue.push_back(candidate);
        debug!(peer, queued = queue.len(), "early candidate buffered");
        true
    }

    pub fn take(&mut self, peer: &str) -> Vec<IceCandidate> {
        self.queues
            .remove(peer)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub fn len(&self, peer: &str) -> usize {
        self.queues.get(peer).map_or(0, VecDeque::len)
    }

    /// Forgets everything queued for peers other than `peer`.
    pub fn retain_peer(&mut self, peer: &str) {
        self.queues.retain(|id, _| id == peer);
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }
}

/// Count of gathered local candidates by type
#[derive(Serialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateSummary {
    pub host: usize,
    pub srflx: usize,
    pub prflx: usize,
    pub relay: usize,
}

impl CandidateSummary {
    pub fn from_types<'a>(types: impl IntoIterator<Item = &'a CandidateType>) -> Self {
        let mut summary = Self::default();
        for kind in types {
            match kind {
                CandidateType::Host => summary.host += 1,
                CandidateType::Srflx => summary.srflx += 1,
                CandidateType::Prflx => summary.prflx += 1,
                CandidateType::Relay => summary.relay += 1,
                CandidateType::Unknown => {}
            }
        }
        summary
    }

    /// At least one candidate reachable from outside the local network
    pub fn has_public_path(&self) -> bool {
        self.srflx > 0 || self.relay > 0
    }
}

/// Health check run when gathering completes.
///
/// Returns the summary when only local candidates were found, which usually
/// means the peer sits behind a NAT that STUN cannot see through and no TURN
/// server is configured.
pub fn analyze_candidates(types: &[CandidateType]) -> Option<CandidateSummary> {
    let summary = CandidateSummary::from_types(types);
    debug!(?summary, "local candidate gathering complete");
    if summary.has_public_path() {
        None
    } else {
        warn!(?summary, "no server-reflexive or relay candidates gathered");
        Some(summary)
    }
}
