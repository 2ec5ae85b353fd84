use std::collections::VecDeque;

use cfgsync_core::{ProcessRequest, Uid};
use rustc_hash::FxHashMap;

/// Pending requests keyed by identity, FIFO by first arrival. A later request
/// for an identity that is still pending replaces it in place.
#[derive(Default)]
pub struct Coalescer {
    map: FxHashMap<Uid, ProcessRequest>,
    order: VecDeque<Uid>,
    coalesced: u64,
}

impl Coalescer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn coalesced(&self) -> u64 {
        self.coalesced
    }

    pub fn contains(&self, uid: &Uid) -> bool {
        self.map.contains_key(uid)
    }

    pub fn uids(&self) -> impl Iterator<Item = &Uid> {
        self.order.iter()
    }

    /// Returns true when the request replaced one already pending.
    pub fn push(&mut self, req: ProcessRequest) -> bool {
        if let Some(slot) = self.map.get_mut(&req.uid) {
            *slot = req;
            self.coalesced += 1;
            return true;
        }
        self.order.push_back(req.uid.clone());
        self.map.insert(req.uid.clone(), req);
        false
    }

    /// Drain all pending requests in arrival order.
    pub fn drain_ready(&mut self) -> Vec<ProcessRequest> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(uid) = self.order.pop_front() {
            if let Some(req) = self.map.remove(&uid) {
                out.push(req);
            }
        }
        out
    }
}
