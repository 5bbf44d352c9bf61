//! Candidate bookkeeping: early remote candidates and a gathering summary.

use crate::peer::types::IceCandidate;
use tracing::{debug, info, warn};

/// Remote candidates that arrived before the remote description
#[derive(Debug, Default)]
pub struct CandidateBuffer {
    pending: Vec<IceCandidate>,
}

impl CandidateBuffer {
    pub fn push(&mut self, candidate: IceCandidate) {
        debug!("Remote description not set yet, queuing candidate");
        self.pending.push(candidate);
    }

    /// Hand back everything queued, in arrival order
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

/// `typ` field of an SDP candidate line
pub fn candidate_type(candidate: &str) -> Option<&str> {
    let mut parts = candidate.split_whitespace();
    while let Some(part) = parts.next() {
        if part == "typ" {
            return parts.next();
        }
    }
    None
}

pub fn analyze_candidates(candidates: &[IceCandidate]) {
    let mut host_count = 0;
    let mut srflx_count = 0;
    let mut relay_count = 0;

    for candidate in candidates {
        match candidate_type(&candidate.candidate) {
            Some("host") => host_count += 1,
            Some("srflx") | Some("prflx") => srflx_count += 1,
            Some("relay") => relay_count += 1,
            _ => {}
        }
    }

    info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        host_count, srflx_count, relay_count
    );

    if !candidates.is_empty() && srflx_count == 0 && relay_count == 0 {
        warn!("Only host candidates gathered; connectivity across NAT may fail");
    }
}
