//! Translation of membership callbacks into provider updates

use std::sync::Arc;

use parking_lot::RwLock;

use super::meta::NodeMeta;
use super::provider::ServiceProvider;
use crate::error::Result;
use crate::membership::{EventDelegate, Node};

/// Registration table of active service providers
///
/// Owned by the [`Cluster`](crate::Cluster) that created it; tests build
/// their own.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: RwLock<Vec<Arc<dyn ServiceProvider>>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider: Arc<dyn ServiceProvider>) {
        tracing::debug!(service = %provider.service_name(), "Service provider registered");
        self.providers.write().push(provider);
    }

    /// Providers tracking `service`, cloned out so callers run without the lock
    #[must_use]
    pub fn matching(&self, service: &str) -> Vec<Arc<dyn ServiceProvider>> {
        self.providers
            .read()
            .iter()
            .filter(|p| p.service_name() == service)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Add,
    Remove,
    UpdateWeight,
}

/// Event delegate fanning membership changes out to registered providers
pub struct ProviderEventDelegate {
    registry: Arc<ProviderRegistry>,
}

impl ProviderEventDelegate {
    #[must_use]
    pub const fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    fn dispatch(&self, node: &Node, action: Action) -> Result<()> {
        let meta = NodeMeta::from_node(node)?;
        for service in &meta.services {
            for provider in self.registry.matching(&service.name) {
                match action {
                    Action::Add => provider.add_node(node)?,
                    Action::Remove => provider.remove_node(node)?,
                    Action::UpdateWeight => provider.update_weight(node)?,
                }
            }
        }
        Ok(())
    }
}

impl EventDelegate for ProviderEventDelegate {
    fn notify_join(&self, node: &Node) -> Result<()> {
        tracing::info!(node = %node.name, addr = %node.address(), "Node joined");
        self.dispatch(node, Action::Add)
    }

    fn notify_leave(&self, node: &Node) -> Result<()> {
        tracing::info!(node = %node.name, addr = %node.address(), "Node left");
        self.dispatch(node, Action::Remove)
    }

    fn notify_update(&self, node: &Node) -> Result<()> {
        tracing::debug!(node = %node.name, "Node updated");
        self.dispatch(node, Action::Add)
    }

    fn notify_suspect_state_change(&self, node: &Node) -> Result<()> {
        // Excluded while suspect; a later join/update brings it back
        tracing::warn!(node = %node.name, state = ?node.state, "Node suspected");
        self.dispatch(node, Action::Remove)
    }

    fn notify_weight(&self, node: &Node) -> Result<()> {
        tracing::trace!(node = %node.name, weight = node.weight, "Node weight changed");
        self.dispatch(node, Action::UpdateWeight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::provider::LookupProvider;
    use crate::test_helpers::node_with;

    fn setup() -> (ProviderEventDelegate, Arc<LookupProvider>, Arc<LookupProvider>) {
        let registry = Arc::new(ProviderRegistry::new());
        let orders = Arc::new(LookupProvider::smooth_weighted("orders"));
        let billing = Arc::new(LookupProvider::round_robin("billing"));
        registry.register(orders.clone());
        registry.register(billing.clone());
        (ProviderEventDelegate::new(registry), orders, billing)
    }

    #[test]
    fn test_join_fans_out_by_service_name() {
        let (events, orders, billing) = setup();
        events.notify_join(&node_with("a", &["orders"], 0, 0)).unwrap();
        events.notify_join(&node_with("b", &["orders", "billing"], 0, 0)).unwrap();

        assert_eq!(orders.servers().len(), 2);
        assert_eq!(billing.servers().len(), 1);
        assert_eq!(billing.servers()[0].node_name, "b");
    }

    #[test]
    fn test_leave_and_suspect_remove() {
        let (events, orders, _) = setup();
        let a = node_with("a", &["orders"], 0, 0);
        let b = node_with("b", &["orders"], 0, 0);
        events.notify_join(&a).unwrap();
        events.notify_join(&b).unwrap();

        events.notify_leave(&a).unwrap();
        events.notify_suspect_state_change(&b).unwrap();
        assert!(orders.servers().is_empty());

        // Recovery re-adds through update
        events.notify_update(&b).unwrap();
        assert_eq!(orders.servers().len(), 1);
    }

    #[test]
    fn test_weight_events_reach_providers() {
        let (events, orders, _) = setup();
        events.notify_join(&node_with("a", &["orders"], 0, 0)).unwrap();
        for w in [1, 3, 2] {
            events.notify_weight(&node_with("a", &["orders"], 0, w)).unwrap();
            assert_eq!(orders.server("a").map(|s| s.weight), Some(w));
        }
    }

    #[test]
    fn test_malformed_meta_fails_callback() {
        let (events, _, _) = setup();
        let mut node = node_with("a", &["orders"], 0, 0);
        node.meta = b"\x00\x01".to_vec();
        assert!(events.notify_join(&node).is_err());
        assert!(events.notify_leave(&node).is_err());
        assert!(events.notify_weight(&node).is_err());
    }

    #[test]
    fn test_registry_matching() {
        let registry = ProviderRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(LookupProvider::round_robin("orders")));
        registry.register(Arc::new(LookupProvider::round_robin("orders")));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.matching("orders").len(), 2);
        assert!(registry.matching("billing").is_empty());
    }
}
