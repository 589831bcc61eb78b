//! Per-service registries of candidate peers
//!
//! A provider is fed by membership events (`add_node`, `update_weight`,
//! `remove_node`) and answers `select_server` from its cached view.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::load_balancer::{smooth_weighted_next, LoadBalancingStrategy, RoundRobin, Weighted};
use super::meta::{NodeMeta, ServiceType};
use crate::error::Result;
use crate::membership::Node;

/// Weight used when neither the override nor the dynamic signal is set
pub const DEFAULT_WEIGHT: u32 = 1;

/// Receiver of membership changes for one logical service
pub trait ServiceProvider: Send + Sync {
    /// Service name this provider tracks
    fn service_name(&self) -> &str;

    fn add_node(&self, node: &Node) -> Result<()>;

    fn update_weight(&self, node: &Node) -> Result<()>;

    fn remove_node(&self, node: &Node) -> Result<()>;
}

/// Cached view of one remote peer offering a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub service_name: String,
    pub node_name: String,
    pub base_url: String,
    /// Effective weight, always positive
    pub weight: u32,
    /// Static override from the node's metadata (0 = none)
    pub static_weight: u32,
    current_weight: i64,
}

impl Weighted for Server {
    fn weight(&self) -> u32 {
        self.weight
    }

    fn current_weight_mut(&mut self) -> &mut i64 {
        &mut self.current_weight
    }
}

/// Servers of one service in selection order, indexed by node name
#[derive(Debug, Clone)]
pub struct ServerTable {
    service: String,
    service_type: ServiceType,
    servers: Vec<Server>,
    index: HashMap<String, usize>,
}

impl ServerTable {
    /// Table of the peers offering `service` over `service_type`
    #[must_use]
    pub fn new(service: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            service: service.into(),
            service_type,
            servers: Vec::new(),
            index: HashMap::new(),
        }
    }

    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    #[must_use]
    pub const fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Insert or update the server for `node`
    ///
    /// Returns `false` when the node does not offer this service over the
    /// table's transport.
    pub fn add_node(&mut self, node: &Node) -> Result<bool> {
        let meta = NodeMeta::from_node(node)?;
        let Some(service) = meta.service(&self.service, self.service_type) else {
            return Ok(false);
        };
        let base_url = service.base_url();

        if let Some(&i) = self.index.get(&node.name) {
            let server = &mut self.servers[i];
            server.base_url = base_url;
            server.static_weight = meta.weight;
            if meta.weight > 0 {
                server.weight = meta.weight;
            } else if node.weight > 0 {
                server.weight = node.weight;
            }
        } else {
            let weight = [meta.weight, node.weight]
                .into_iter()
                .find(|w| *w > 0)
                .unwrap_or(DEFAULT_WEIGHT);
            self.index.insert(node.name.clone(), self.servers.len());
            self.servers.push(Server {
                service_name: self.service.clone(),
                node_name: node.name.clone(),
                base_url,
                weight,
                static_weight: meta.weight,
                current_weight: 0,
            });
        }
        Ok(true)
    }

    /// Adopt the node's dynamic weight unless it carries a static override
    ///
    /// A zero dynamic weight is no signal and leaves the stored weight alone.
    /// Returns whether the table changed.
    pub fn update_weight(&mut self, node: &Node) -> Result<bool> {
        let meta = NodeMeta::from_node(node)?;
        if meta.weight > 0 || node.weight == 0 {
            return Ok(false);
        }
        let Some(&i) = self.index.get(&node.name) else {
            return Ok(false);
        };
        let server = &mut self.servers[i];
        if server.weight == node.weight {
            return Ok(false);
        }
        server.weight = node.weight;
        Ok(true)
    }

    /// Remove the server for `node`; returns whether it was present
    pub fn remove_node(&mut self, node: &Node) -> bool {
        let Some(i) = self.index.remove(&node.name) else {
            return false;
        };
        self.servers.remove(i);
        for pos in self.index.values_mut() {
            if *pos > i {
                *pos -= 1;
            }
        }
        true
    }

    #[must_use]
    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    #[must_use]
    pub fn get(&self, node_name: &str) -> Option<&Server> {
        self.index.get(node_name).map(|&i| &self.servers[i])
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Pick by smooth weighted round-robin
    pub fn next_weighted(&mut self) -> Option<&Server> {
        let i = smooth_weighted_next(&mut self.servers)?;
        self.servers.get(i)
    }
}

/// Service provider used for plain base-URL lookups of REST services
pub struct LookupProvider {
    service: String,
    table: RwLock<ServerTable>,
    strategy: LoadBalancingStrategy,
    round_robin: RoundRobin,
}

impl LookupProvider {
    #[must_use]
    pub fn new(service: impl Into<String>, strategy: LoadBalancingStrategy) -> Self {
        let service = service.into();
        Self {
            table: RwLock::new(ServerTable::new(service.clone(), ServiceType::Rest)),
            service,
            strategy,
            round_robin: RoundRobin::new(),
        }
    }

    #[must_use]
    pub fn round_robin(service: impl Into<String>) -> Self {
        Self::new(service, LoadBalancingStrategy::RoundRobin)
    }

    #[must_use]
    pub fn smooth_weighted(service: impl Into<String>) -> Self {
        Self::new(service, LoadBalancingStrategy::SmoothWeighted)
    }

    /// Base URL of the next server, `None` when no server is known
    pub fn select_server(&self) -> Option<String> {
        match self.strategy {
            LoadBalancingStrategy::RoundRobin => {
                let table = self.table.read();
                let i = self.round_robin.next(table.len())?;
                table.servers().get(i).map(|s| s.base_url.clone())
            }
            LoadBalancingStrategy::SmoothWeighted => {
                let mut table = self.table.write();
                table.next_weighted().map(|s| s.base_url.clone())
            }
        }
    }

    /// Snapshot of the known servers in selection order
    #[must_use]
    pub fn servers(&self) -> Vec<Server> {
        self.table.read().servers().to_vec()
    }

    #[must_use]
    pub fn server(&self, node_name: &str) -> Option<Server> {
        self.table.read().get(node_name).cloned()
    }
}

impl ServiceProvider for LookupProvider {
    fn service_name(&self) -> &str {
        &self.service
    }

    fn add_node(&self, node: &Node) -> Result<()> {
        if self.table.write().add_node(node)? {
            tracing::debug!(node = %node.name, service = %self.service_name(), "Server added");
        }
        Ok(())
    }

    fn update_weight(&self, node: &Node) -> Result<()> {
        if self.table.write().update_weight(node)? {
            tracing::debug!(
                node = %node.name,
                weight = node.weight,
                "Server weight updated"
            );
        }
        Ok(())
    }

    fn remove_node(&self, node: &Node) -> Result<()> {
        if self.table.write().remove_node(node) {
            tracing::debug!(node = %node.name, service = %self.service_name(), "Server removed");
        }
        Ok(())
    }
}
