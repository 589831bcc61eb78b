//! In-process membership engine
//!
//! Engines created from one [`MemoryNetwork`] see each other by advertise
//! address. Membership changes are delivered synchronously, which makes
//! convergence deterministic in tests and single-process deployments.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};

use super::engine::{EngineFactory, EngineHooks, MembershipEngine, Node, NodeState};
use crate::config::MemberlistConfig;
use crate::error::{Error, Result};

/// Ceiling for one node's encoded metadata
pub const META_MAX_SIZE: usize = 512;

/// Ceiling for one gossip round's broadcast payload
const GOSSIP_PACKET_SIZE: usize = 1400;

/// Per-message framing cost charged against [`GOSSIP_PACKET_SIZE`]
const GOSSIP_OVERHEAD: usize = 2;

const PROTOCOL_VERSION: u8 = 1;

/// Shared address space for [`MemoryEngine`]s
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    engines: Arc<Mutex<HashMap<String, Weak<MemoryEngine>>>>,
}

impl MemoryNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(&self, address: &str) -> Option<Arc<MemoryEngine>> {
        self.engines
            .lock()
            .get(address)
            .and_then(Weak::upgrade)
            .filter(|e| !e.is_shutdown())
    }

    fn unregister(&self, address: &str) {
        self.engines.lock().remove(address);
    }

    /// Running engines on this network
    #[must_use]
    pub fn len(&self) -> usize {
        self.engines
            .lock()
            .values()
            .filter(|e| e.upgrade().is_some_and(|e| !e.is_shutdown()))
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create an engine without erasing its type
    pub fn spawn(
        &self,
        config: Arc<RwLock<MemberlistConfig>>,
        hooks: EngineHooks,
    ) -> Result<Arc<MemoryEngine>> {
        let (name, address) = {
            let config = config.read();
            (config.name.clone(), config.advertise_address())
        };

        let mut engines = self.engines.lock();
        if engines
            .get(&address)
            .and_then(Weak::upgrade)
            .is_some_and(|e| !e.is_shutdown())
        {
            return Err(Error::Engine(format!("Address {address} is already in use")));
        }

        let engine = Arc::new(MemoryEngine {
            name,
            address: address.clone(),
            config,
            hooks,
            network: self.clone(),
            peers: Mutex::new(HashMap::new()),
            weight: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
        });
        engines.insert(address.clone(), Arc::downgrade(&engine));
        tracing::debug!(node = %engine.name, address = %address, "Memory engine started");
        Ok(engine)
    }
}

impl EngineFactory for MemoryNetwork {
    fn create(
        &self,
        config: Arc<RwLock<MemberlistConfig>>,
        hooks: EngineHooks,
    ) -> Result<Arc<dyn MembershipEngine>> {
        let engine: Arc<dyn MembershipEngine> = self.spawn(config, hooks)?;
        Ok(engine)
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Join,
    Leave,
    Update,
    Suspect,
    Weight,
}

/// One member of a [`MemoryNetwork`]
pub struct MemoryEngine {
    name: String,
    address: String,
    config: Arc<RwLock<MemberlistConfig>>,
    hooks: EngineHooks,
    network: MemoryNetwork,
    /// Remote members by name
    peers: Mutex<HashMap<String, Node>>,
    /// Dynamic weight this node reports about itself
    weight: AtomicU32,
    shutdown: AtomicBool,
}

impl MemoryEngine {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Engine(format!("Engine {} is shut down", self.name)));
        }
        Ok(())
    }

    fn snapshot(&self) -> Node {
        let (addr, port) = {
            let config = self.config.read();
            (config.advertise_addr.clone(), config.advertise_port)
        };
        Node {
            name: self.name.clone(),
            addr,
            port,
            meta: self.hooks.delegate.node_meta(META_MAX_SIZE),
            state: NodeState::Alive,
            protocol_version: PROTOCOL_VERSION,
            weight: self.weight.load(Ordering::Acquire),
        }
    }

    fn accepts(&self, node: &Node) -> bool {
        match node.addr.parse::<IpAddr>() {
            Ok(ip) => self.config.read().is_allowed(ip),
            Err(_) => true,
        }
    }

    /// Run one callback; the engine keeps going when it fails
    fn fire(&self, event: Event, node: &Node) {
        let events = &self.hooks.events;
        let result = match event {
            Event::Join => events.notify_join(node),
            Event::Leave => events.notify_leave(node),
            Event::Update => events.notify_update(node),
            Event::Suspect => events.notify_suspect_state_change(node),
            Event::Weight => events.notify_weight(node),
        };
        if let Err(e) = result {
            tracing::error!(
                local = %self.name,
                node = %node.name,
                event = ?event,
                error = %e,
                "Membership callback failed"
            );
        }
    }

    /// Record `node` as alive, firing join for newcomers and update otherwise
    fn observe(&self, node: Node) {
        if node.name == self.name {
            return;
        }
        let previous = self.peers.lock().insert(node.name.clone(), node.clone());
        match previous {
            None => self.fire(Event::Join, &node),
            Some(_) => self.fire(Event::Update, &node),
        }
    }

    fn forget(&self, name: &str) {
        let removed = self.peers.lock().remove(name);
        if let Some(mut node) = removed {
            node.state = NodeState::Left;
            self.fire(Event::Leave, &node);
        }
    }

    fn observe_weight(&self, node: Node) {
        let known = {
            let mut peers = self.peers.lock();
            match peers.get_mut(&node.name) {
                Some(existing) => {
                    existing.weight = node.weight;
                    true
                }
                None => false,
            }
        };
        if known {
            self.fire(Event::Weight, &node);
        }
    }

    fn peer_engines(&self) -> Vec<Arc<MemoryEngine>> {
        let addresses: Vec<String> = self.peers.lock().values().map(Node::address).collect();
        addresses
            .iter()
            .filter_map(|a| self.network.lookup(a))
            .collect()
    }

    /// Exchange state with `other`; returns `false` when either side refuses
    fn introduce(&self, other: &MemoryEngine) -> bool {
        let local = self.snapshot();
        let remote = other.snapshot();
        if !other.accepts(&local) || !self.accepts(&remote) {
            tracing::warn!(
                local = %self.name,
                remote = %other.name,
                "Peer rejected by allowed CIDRs"
            );
            return false;
        }
        other.observe(local);
        self.observe(remote);
        true
    }

    /// Set the dynamic weight this node reports and tell every peer
    pub fn set_weight(&self, weight: u32) {
        if self.is_shutdown() {
            return;
        }
        self.weight.store(weight, Ordering::Release);
        let local = self.snapshot();
        for peer in self.peer_engines() {
            peer.observe_weight(local.clone());
        }
    }

    /// Mark a remote member suspect in this node's view
    ///
    /// Returns whether the member was known and alive.
    pub fn mark_suspect(&self, name: &str) -> bool {
        let node = {
            let mut peers = self.peers.lock();
            match peers.get_mut(name) {
                Some(node) if node.state == NodeState::Alive => {
                    node.state = NodeState::Suspect;
                    Some(node.clone())
                }
                _ => None,
            }
        };
        match node {
            Some(node) => {
                self.fire(Event::Suspect, &node);
                true
            }
            None => false,
        }
    }

    /// Run one gossip round, delivering queued broadcasts to every peer
    ///
    /// Returns the number of messages sent per peer.
    pub fn gossip(&self) -> usize {
        if self.is_shutdown() {
            return 0;
        }
        let msgs = self
            .hooks
            .delegate
            .get_broadcasts(GOSSIP_OVERHEAD, GOSSIP_PACKET_SIZE);
        if msgs.is_empty() {
            return 0;
        }
        for peer in self.peer_engines() {
            for msg in &msgs {
                peer.hooks.delegate.notify_msg(msg);
            }
        }
        tracing::trace!(node = %self.name, messages = msgs.len(), "Gossip round");
        msgs.len()
    }
}

#[async_trait]
impl MembershipEngine for MemoryEngine {
    async fn join(&self, seeds: &[String]) -> Result<usize> {
        self.ensure_running()?;

        let mut contacted = 0usize;
        for seed in seeds {
            if *seed == self.address {
                continue;
            }
            let Some(remote) = self.network.lookup(seed) else {
                tracing::warn!(node = %self.name, seed = %seed, "Seed unreachable");
                continue;
            };
            if !self.introduce(&remote) {
                continue;
            }
            contacted += 1;

            // Push/pull: learn everyone the seed knows
            for peer in remote.peer_engines() {
                let known = peer.name == self.name || self.peers.lock().contains_key(&peer.name);
                if !known {
                    self.introduce(&peer);
                }
            }
        }

        if contacted == 0 && !seeds.is_empty() {
            return Err(Error::Join(format!(
                "None of {} seed(s) could be contacted",
                seeds.len()
            )));
        }
        Ok(contacted)
    }

    fn members(&self) -> Vec<Node> {
        let mut members = vec![self.snapshot()];
        let mut peers: Vec<Node> = self.peers.lock().values().cloned().collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name));
        members.extend(peers);
        members
    }

    fn local_node(&self) -> Node {
        self.snapshot()
    }

    async fn update_node(&self, _timeout: Duration) -> Result<()> {
        self.ensure_running()?;
        let local = self.snapshot();
        for peer in self.peer_engines() {
            peer.observe(local.clone());
        }
        Ok(())
    }

    async fn leave(&self, _timeout: Duration) -> Result<()> {
        self.ensure_running()?;
        for peer in self.peer_engines() {
            peer.forget(&self.name);
        }
        self.peers.lock().clear();
        tracing::debug!(node = %self.name, "Left cluster");
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.network.unregister(&self.address);
        tracing::debug!(node = %self.name, "Memory engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::membership::{Delegate, EventDelegate};

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
        msgs: Mutex<Vec<Vec<u8>>>,
        outbound: Mutex<Vec<Vec<u8>>>,
    }

    impl Recorder {
        fn push(&self, kind: &str, node: &Node) -> Result<()> {
            self.events.lock().push(format!("{kind}:{}", node.name));
            Ok(())
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.events.lock())
        }
    }

    impl Delegate for Recorder {
        fn node_meta(&self, _limit: usize) -> Vec<u8> {
            b"{}".to_vec()
        }

        fn notify_msg(&self, msg: &[u8]) {
            self.msgs.lock().push(msg.to_vec());
        }

        fn get_broadcasts(&self, _overhead: usize, _limit: usize) -> Vec<Vec<u8>> {
            std::mem::take(&mut *self.outbound.lock())
        }

        fn local_state(&self, _join: bool) -> Vec<u8> {
            Vec::new()
        }

        fn merge_remote_state(&self, _buf: &[u8], _join: bool) {}
    }

    impl EventDelegate for Recorder {
        fn notify_join(&self, node: &Node) -> Result<()> {
            self.push("join", node)
        }

        fn notify_leave(&self, node: &Node) -> Result<()> {
            self.push("leave", node)
        }

        fn notify_update(&self, node: &Node) -> Result<()> {
            self.push("update", node)
        }

        fn notify_suspect_state_change(&self, node: &Node) -> Result<()> {
            self.push("suspect", node)
        }

        fn notify_weight(&self, node: &Node) -> Result<()> {
            self.push("weight", node)
        }
    }

    fn engine(
        network: &MemoryNetwork,
        name: &str,
        port: u16,
    ) -> (Arc<MemoryEngine>, Arc<Recorder>) {
        let config = MemberlistConfig {
            name: name.to_string(),
            advertise_addr: "127.0.0.1".to_string(),
            advertise_port: port,
            ..MemberlistConfig::default()
        };
        let recorder = Arc::new(Recorder::default());
        let hooks = EngineHooks {
            delegate: recorder.clone(),
            events: recorder.clone(),
        };
        let engine = network
            .spawn(Arc::new(RwLock::new(config)), hooks)
            .unwrap();
        (engine, recorder)
    }

    #[tokio::test]
    async fn test_join_notifies_both_sides() {
        let network = MemoryNetwork::new();
        let (a, ra) = engine(&network, "a", 7001);
        let (b, rb) = engine(&network, "b", 7002);

        assert_eq!(b.join(&["127.0.0.1:7001".to_string()]).await.unwrap(), 1);
        assert_eq!(ra.take(), vec!["join:b"]);
        assert_eq!(rb.take(), vec!["join:a"]);
        assert_eq!(a.members().len(), 2);
        assert_eq!(b.members()[0].name, "b");
    }

    #[tokio::test]
    async fn test_join_learns_seed_peers() {
        let network = MemoryNetwork::new();
        let (a, _) = engine(&network, "a", 7001);
        let (b, _) = engine(&network, "b", 7002);
        let (c, _) = engine(&network, "c", 7003);

        b.join(&["127.0.0.1:7001".to_string()]).await.unwrap();
        c.join(&["127.0.0.1:7001".to_string()]).await.unwrap();

        for e in [&a, &b, &c] {
            assert_eq!(e.members().len(), 3);
        }
    }

    #[tokio::test]
    async fn test_join_unreachable_seed_fails() {
        let network = MemoryNetwork::new();
        let (a, _) = engine(&network, "a", 7001);
        assert!(matches!(
            a.join(&["127.0.0.1:9999".to_string()]).await,
            Err(Error::Join(_))
        ));
        assert_eq!(a.join(&[]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_address_in_use() {
        let network = MemoryNetwork::new();
        let (a, _) = engine(&network, "a", 7001);
        let config = MemberlistConfig {
            name: "dup".to_string(),
            advertise_port: 7001,
            ..MemberlistConfig::default()
        };
        let hooks = EngineHooks {
            delegate: Arc::new(Recorder::default()),
            events: Arc::new(Recorder::default()),
        };
        assert!(network
            .spawn(Arc::new(RwLock::new(config.clone())), hooks.clone())
            .is_err());

        a.shutdown().await.unwrap();
        assert!(network.spawn(Arc::new(RwLock::new(config)), hooks).is_ok());
    }

    #[tokio::test]
    async fn test_update_weight_suspect_and_leave() {
        let network = MemoryNetwork::new();
        let (a, ra) = engine(&network, "a", 7001);
        let (b, rb) = engine(&network, "b", 7002);
        b.join(&["127.0.0.1:7001".to_string()]).await.unwrap();
        ra.take();
        rb.take();

        b.update_node(Duration::from_secs(1)).await.unwrap();
        b.set_weight(3);
        assert_eq!(ra.take(), vec!["update:b", "weight:b"]);
        assert_eq!(a.members()[1].weight, 3);

        assert!(a.mark_suspect("b"));
        assert!(!a.mark_suspect("b"));
        assert_eq!(ra.take(), vec!["suspect:b"]);

        b.leave(Duration::from_secs(1)).await.unwrap();
        assert_eq!(ra.take(), vec!["leave:b"]);
        assert_eq!(a.members().len(), 1);
    }

    #[tokio::test]
    async fn test_gossip_delivers_broadcasts() {
        let network = MemoryNetwork::new();
        let (a, _) = engine(&network, "a", 7001);
        let (_b, rb) = engine(&network, "b", 7002);
        a.join(&["127.0.0.1:7002".to_string()]).await.unwrap();

        assert_eq!(a.gossip(), 0);

        let (c, rc) = engine(&network, "c", 7003);
        rc.outbound.lock().push(b"hello".to_vec());
        c.join(&["127.0.0.1:7002".to_string()]).await.unwrap();
        assert_eq!(c.gossip(), 1);
        assert_eq!(rb.msgs.lock().as_slice(), &[b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let network = MemoryNetwork::new();
        let (a, _) = engine(&network, "a", 7001);
        assert_eq!(network.len(), 1);
        a.shutdown().await.unwrap();
        a.shutdown().await.unwrap();
        assert!(network.is_empty());
        assert!(a.join(&["127.0.0.1:7002".to_string()]).await.is_err());
    }
}
