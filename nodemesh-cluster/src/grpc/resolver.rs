//! Membership-driven name resolution for RPC channels
//!
//! A [`Resolver`] is a service provider whose every mutation republishes the
//! full address list to the bound connection.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cluster::Cluster;
use crate::discovery::meta::ServiceType;
use crate::discovery::provider::{ServerTable, ServiceProvider};
use crate::error::{Error, Result};
use crate::membership::Node;

/// URI scheme routed to this resolver
pub const SCHEME: &str = "nodemesh";

/// A parsed `nodemesh://<service>` target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub service: String,
}

impl FromStr for Target {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| {
                Error::Configuration(format!("Target '{s}' does not use the {SCHEME} scheme"))
            })?;
        let service = rest.trim_matches('/');
        if service.is_empty() || service.contains('/') {
            return Err(Error::Configuration(format!("Invalid service in target '{s}'")));
        }
        Ok(Self {
            service: service.to_string(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME}://{}", self.service)
    }
}

/// One resolved endpoint with its balancing weight
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub addr: String,
    pub weight: u32,
}

/// Full address list published on every change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<Address>,
}

/// Connection side of the resolver contract
#[cfg_attr(test, mockall::automock)]
pub trait ClientConnState: Send + Sync {
    fn update_state(&self, state: ResolverState) -> Result<()>;
}

/// Resolver for one service, fed by membership events
pub struct Resolver {
    target: Target,
    table: RwLock<ServerTable>,
    conn: Arc<dyn ClientConnState>,
}

impl Resolver {
    #[must_use]
    pub fn new(target: Target, conn: Arc<dyn ClientConnState>) -> Self {
        Self {
            table: RwLock::new(ServerTable::new(target.service.clone(), ServiceType::Grpc)),
            target,
            conn,
        }
    }

    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Addresses as they would be published now
    #[must_use]
    pub fn state(&self) -> ResolverState {
        Self::state_of(&self.table.read())
    }

    fn state_of(table: &ServerTable) -> ResolverState {
        ResolverState {
            addresses: table
                .servers()
                .iter()
                .map(|s| Address {
                    addr: s.base_url.clone(),
                    weight: s.weight,
                })
                .collect(),
        }
    }

    // Called with the write lock held so publications never interleave
    fn publish(&self, table: &ServerTable) -> Result<()> {
        let state = Self::state_of(table);
        tracing::debug!(
            target_uri = %self.target,
            addresses = state.addresses.len(),
            "Publishing resolver state"
        );
        self.conn.update_state(state)
    }

    /// Apply `change` to a copy and commit it once the connection took it
    ///
    /// A failed publish leaves the table as the connection last saw it.
    fn mutate(&self, change: impl FnOnce(&mut ServerTable) -> Result<bool>) -> Result<()> {
        let mut table = self.table.write();
        let mut next = table.clone();
        if change(&mut next)? {
            self.publish(&next)?;
            *table = next;
        }
        Ok(())
    }

    /// Accepted for the framework's sake; membership pushes every change
    pub fn resolve_now(&self) {}

    pub fn close(&self) {}
}

impl ServiceProvider for Resolver {
    fn service_name(&self) -> &str {
        &self.target.service
    }

    fn add_node(&self, node: &Node) -> Result<()> {
        self.mutate(|table| table.add_node(node))
    }

    fn update_weight(&self, node: &Node) -> Result<()> {
        self.mutate(|table| table.update_weight(node))
    }

    fn remove_node(&self, node: &Node) -> Result<()> {
        self.mutate(|table| Ok(table.remove_node(node)))
    }
}

/// Builds resolvers bound to one cluster
pub struct ResolverBuilder {
    cluster: Arc<Cluster>,
}

impl ResolverBuilder {
    #[must_use]
    pub const fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    #[must_use]
    pub const fn scheme(&self) -> &'static str {
        SCHEME
    }

    /// Create a resolver for `target` and register it with the cluster
    ///
    /// Current members offering the service are published right away.
    pub fn build(&self, target: Target, conn: Arc<dyn ClientConnState>) -> Result<Arc<Resolver>> {
        let resolver = Arc::new(Resolver::new(target, conn));
        self.cluster.register_service_provider(resolver.clone())?;
        Ok(resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::meta::{NodeMeta, Service};
    use crate::membership::NodeState;
    use std::collections::HashMap;

    fn grpc_node(name: &str, static_weight: u32, weight: u32) -> Node {
        let mut meta = NodeMeta::new(static_weight);
        meta.services.push(Service {
            name: "orders".to_string(),
            host: format!("{name}.local"),
            port: 50051,
            route_root_path: String::new(),
            service_type: ServiceType::Grpc,
            data: HashMap::new(),
        });
        Node {
            name: name.to_string(),
            addr: "127.0.0.1".to_string(),
            port: 7946,
            meta: meta.encode(usize::MAX).unwrap(),
            state: NodeState::Alive,
            protocol_version: 1,
            weight,
        }
    }

    fn address(addr: &str, weight: u32) -> Address {
        Address {
            addr: addr.to_string(),
            weight,
        }
    }

    #[test]
    fn test_target_parse() {
        let target: Target = "nodemesh://orders".parse().unwrap();
        assert_eq!(target.service, "orders");
        assert_eq!(target.to_string(), "nodemesh://orders");
        assert_eq!("nodemesh:///orders".parse::<Target>().unwrap(), target);
        assert!("dns://orders".parse::<Target>().is_err());
        assert!("nodemesh://".parse::<Target>().is_err());
        assert!("nodemesh://a/b".parse::<Target>().is_err());
    }

    #[test]
    fn test_every_mutation_publishes_full_list() {
        let mut conn = MockClientConnState::new();
        let mut seq = mockall::Sequence::new();
        for expected in [
            vec![address("a.local:50051", 1)],
            vec![address("a.local:50051", 1), address("b.local:50051", 4)],
            vec![address("a.local:50051", 3), address("b.local:50051", 4)],
            vec![address("b.local:50051", 4)],
        ] {
            conn.expect_update_state()
                .withf(move |state| state.addresses == expected)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|_| Ok(()));
        }

        let resolver = Resolver::new("nodemesh://orders".parse().unwrap(), Arc::new(conn));
        resolver.add_node(&grpc_node("a", 0, 0)).unwrap();
        resolver.add_node(&grpc_node("b", 4, 0)).unwrap();
        resolver.update_weight(&grpc_node("a", 0, 3)).unwrap();
        // Static override on b wins; nothing changes, nothing is published
        resolver.update_weight(&grpc_node("b", 4, 1)).unwrap();
        resolver.remove_node(&grpc_node("a", 0, 0)).unwrap();
        resolver.remove_node(&grpc_node("a", 0, 0)).unwrap();

        resolver.resolve_now();
        resolver.close();
        assert_eq!(resolver.state().addresses, vec![address("b.local:50051", 4)]);
    }

    #[test]
    fn test_publish_failure_propagates() {
        let mut conn = MockClientConnState::new();
        conn.expect_update_state()
            .returning(|_| Err(Error::Rpc("connection closed".to_string())));

        let resolver = Resolver::new("nodemesh://orders".parse().unwrap(), Arc::new(conn));
        assert!(matches!(
            resolver.add_node(&grpc_node("a", 0, 0)),
            Err(Error::Rpc(_))
        ));
    }

    #[test]
    fn test_failed_publish_is_not_committed() {
        let mut conn = MockClientConnState::new();
        let mut seq = mockall::Sequence::new();
        conn.expect_update_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(Error::Rpc("connection closed".to_string())));
        conn.expect_update_state()
            .withf(|state| state.addresses == vec![address("b.local:50051", 1)])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let resolver = Resolver::new("nodemesh://orders".parse().unwrap(), Arc::new(conn));
        assert!(resolver.add_node(&grpc_node("a", 0, 0)).is_err());
        assert!(resolver.state().addresses.is_empty());

        // The next publication carries only what the connection accepted
        resolver.add_node(&grpc_node("b", 0, 0)).unwrap();
        assert_eq!(resolver.state().addresses, vec![address("b.local:50051", 1)]);
    }

    #[test]
    fn test_rest_entries_are_ignored() {
        let mut conn = MockClientConnState::new();
        conn.expect_update_state().never();

        let mut meta = NodeMeta::new(0);
        meta.services.push(Service {
            name: "orders".to_string(),
            host: "a.local".to_string(),
            port: 6060,
            route_root_path: String::new(),
            service_type: ServiceType::Rest,
            data: HashMap::new(),
        });
        let mut node = grpc_node("a", 0, 0);
        node.meta = meta.encode(usize::MAX).unwrap();

        let resolver = Resolver::new("nodemesh://orders".parse().unwrap(), Arc::new(conn));
        resolver.add_node(&node).unwrap();
        assert!(resolver.state().addresses.is_empty());
    }
}
