//! Local metadata producer handed to the membership engine

use parking_lot::Mutex;

use super::broadcast::{Broadcast, BroadcastQueue, MetaBroadcast};
use super::meta::{NodeMeta, Service};
use crate::error::Result;
use crate::membership::Delegate;

/// Owns the local `NodeMeta` and the outbound broadcast queue
pub struct MetaDelegate {
    meta: Mutex<NodeMeta>,
    broadcasts: BroadcastQueue,
}

impl MetaDelegate {
    /// Create with the given static weight override (0 = none)
    #[must_use]
    pub fn new(weight: u32) -> Self {
        Self {
            meta: Mutex::new(NodeMeta::new(weight)),
            broadcasts: BroadcastQueue::new(),
        }
    }

    /// Append a service to the local metadata
    ///
    /// Peers only learn about it after the engine pushes local state again.
    pub fn add_service(&self, service: Service) {
        self.meta.lock().services.push(service);
    }

    #[must_use]
    pub fn meta(&self) -> NodeMeta {
        self.meta.lock().clone()
    }

    pub fn encode_meta(&self, limit: usize) -> Result<Vec<u8>> {
        self.meta.lock().encode(limit)
    }

    /// Queue the current metadata for the gossip path, tagged with `node`
    pub fn queue_meta_broadcast(&self, node: &str) -> Result<()> {
        let msg = MetaBroadcast {
            node: node.to_string(),
            meta: self.meta(),
        };
        let payload = serde_json::to_vec(&msg)?;
        self.broadcasts.queue(Broadcast::new(node, payload));
        Ok(())
    }

    #[must_use]
    pub fn pending_broadcasts(&self) -> usize {
        self.broadcasts.len()
    }
}

impl Delegate for MetaDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        match self.encode_meta(limit) {
            Ok(buf) => buf,
            Err(e) => {
                // A node that cannot describe itself must not join a cluster
                tracing::error!(error = %e, "Local node metadata cannot be encoded");
                panic!("local node metadata cannot be encoded: {e}");
            }
        }
    }

    fn notify_msg(&self, msg: &[u8]) {
        match serde_json::from_slice::<MetaBroadcast>(msg) {
            Ok(update) => {
                tracing::debug!(
                    node = %update.node,
                    services = update.meta.services.len(),
                    "Received metadata broadcast"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, len = msg.len(), "Ignoring unrecognized gossip message");
            }
        }
    }

    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>> {
        self.broadcasts.drain(overhead, limit)
    }

    fn local_state(&self, _join: bool) -> Vec<u8> {
        Vec::new()
    }

    fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
}
