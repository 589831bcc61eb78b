//! Outbound gossip queue for local-state deltas
//!
//! A newer message about a node replaces any queued message about the same
//! node, so the queue never carries two versions of one node's state.

use std::collections::VecDeque;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::meta::NodeMeta;

/// Wire form of a metadata delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaBroadcast {
    pub node: String,
    pub meta: NodeMeta,
}

/// One pending gossip message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broadcast {
    node: String,
    payload: Vec<u8>,
}

impl Broadcast {
    #[must_use]
    pub fn new(node: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            node: node.into(),
            payload,
        }
    }

    #[must_use]
    pub fn node(&self) -> &str {
        &self.node
    }

    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether this message makes `other` obsolete
    #[must_use]
    pub fn supersedes(&self, other: &Broadcast) -> bool {
        self.node == other.node
    }
}

/// FIFO of pending broadcasts, drained by the engine's gossip cycle
#[derive(Debug, Default)]
pub struct BroadcastQueue {
    queue: Mutex<VecDeque<Broadcast>>,
}

impl BroadcastQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue, dropping every queued message the new one supersedes
    pub fn queue(&self, broadcast: Broadcast) {
        let mut queue = self.queue.lock();
        queue.retain(|old| !broadcast.supersedes(old));
        queue.push_back(broadcast);
    }

    /// Take messages in order while they fit in `limit` bytes
    ///
    /// Each message costs `overhead` plus its payload length. Messages that
    /// do not fit stay queued for a later cycle.
    pub fn drain(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        let mut queue = self.queue.lock();
        let mut used = 0usize;
        let mut out = Vec::new();
        let mut i = 0;
        while i < queue.len() {
            let cost = overhead + queue[i].payload.len();
            if used + cost > limit {
                i += 1;
                continue;
            }
            used += cost;
            if let Some(b) = queue.remove(i) {
                out.push(b.payload);
            }
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
