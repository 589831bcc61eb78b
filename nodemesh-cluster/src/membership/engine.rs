//! Contract between this layer and the gossip membership engine
//!
//! The engine owns failure detection, anti-entropy and transport. It calls
//! back into a [`Delegate`] for the local payload and into an
//! [`EventDelegate`] whenever its view of a remote member changes.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::MemberlistConfig;
use crate::error::Result;

/// Liveness state of a member as seen by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Alive,
    Suspect,
    Dead,
    Left,
}

/// A cluster member as reported by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Cluster-wide unique identity
    pub name: String,
    pub addr: String,
    pub port: u16,
    /// Encoded `NodeMeta` payload the member gossips about itself
    pub meta: Vec<u8>,
    pub state: NodeState,
    pub protocol_version: u8,
    /// Health-derived weight computed by the engine (0 = no signal)
    pub weight: u32,
}

impl Node {
    /// `addr:port` of the member's gossip endpoint
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.addr, self.port)
    }
}

/// Callbacks the engine uses to build and spread local state
pub trait Delegate: Send + Sync {
    /// Encoded local metadata, at most `limit` bytes long
    fn node_meta(&self, limit: usize) -> Vec<u8>;

    /// A user message received over gossip
    fn notify_msg(&self, msg: &[u8]);

    /// Queued broadcasts that fit in `limit` bytes, each paying `overhead`
    fn get_broadcasts(&self, overhead: usize, limit: usize) -> Vec<Vec<u8>>;

    /// Payload for full push/pull state sync
    fn local_state(&self, join: bool) -> Vec<u8>;

    /// Remote payload received during push/pull state sync
    fn merge_remote_state(&self, buf: &[u8], join: bool);
}

/// Callbacks for remote membership changes
///
/// Every method returns the failure of that single callback to the engine
/// instead of hiding it.
pub trait EventDelegate: Send + Sync {
    fn notify_join(&self, node: &Node) -> Result<()>;
    fn notify_leave(&self, node: &Node) -> Result<()>;
    fn notify_update(&self, node: &Node) -> Result<()>;
    fn notify_suspect_state_change(&self, node: &Node) -> Result<()>;
    fn notify_weight(&self, node: &Node) -> Result<()>;
}

/// Operations exposed by a running membership engine
#[async_trait]
pub trait MembershipEngine: Send + Sync {
    /// Contact `seeds` (`host:port` each) and return how many answered
    async fn join(&self, seeds: &[String]) -> Result<usize>;

    fn members(&self) -> Vec<Node>;

    fn local_node(&self) -> Node;

    /// Re-read local metadata and push it to peers
    async fn update_node(&self, timeout: Duration) -> Result<()>;

    async fn leave(&self, timeout: Duration) -> Result<()>;

    async fn shutdown(&self) -> Result<()>;
}

/// Callback targets handed to the engine at construction time
#[derive(Clone)]
pub struct EngineHooks {
    pub delegate: Arc<dyn Delegate>,
    pub events: Arc<dyn EventDelegate>,
}

/// Builds an engine from the live configuration and the callback targets
pub trait EngineFactory: Send + Sync {
    fn create(
        &self,
        config: Arc<RwLock<MemberlistConfig>>,
        hooks: EngineHooks,
    ) -> Result<Arc<dyn MembershipEngine>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_address() {
        let node = Node {
            name: "a".to_string(),
            addr: "10.0.0.1".to_string(),
            port: 7946,
            meta: Vec::new(),
            state: NodeState::Alive,
            protocol_version: 1,
            weight: 0,
        };
        assert_eq!(node.address(), "10.0.0.1:7946");
    }
}
