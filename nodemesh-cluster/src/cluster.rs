//! Discovery runtime
//!
//! [`Cluster`] is the composition root: it owns the live engine
//! configuration, the local metadata delegate and the provider registry,
//! and drives the membership engine through its lifecycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{
    ClusterConfig, ConfigReloader, ConfigWatcher, MemberlistConfig, RemoteConfigKind,
    ServiceConfig, Settings,
};
use crate::discovery::delegate::MetaDelegate;
use crate::discovery::events::{ProviderEventDelegate, ProviderRegistry};
use crate::discovery::meta::{NodeMeta, Service, ServiceType};
use crate::discovery::provider::ServiceProvider;
use crate::discovery::seeds::{resolve_seeds, DnsExchange};
use crate::error::{Error, Result};
use crate::membership::{EngineFactory, EngineHooks, MembershipEngine, Node};

/// Discovery runtime for one process
pub struct Cluster {
    /// Live engine tunables, shared with the engine and the reloader
    config: Arc<RwLock<MemberlistConfig>>,
    service: ServiceConfig,
    seeds: String,
    remote_config: Option<RemoteConfigKind>,
    delegate: Arc<MetaDelegate>,
    registry: Arc<ProviderRegistry>,
    engine: RwLock<Option<Arc<dyn MembershipEngine>>>,
    cancel: CancellationToken,
    shutdown: AtomicBool,
}

impl Cluster {
    #[must_use]
    pub fn new(config: ClusterConfig) -> Self {
        let delegate = Arc::new(MetaDelegate::new(config.memberlist.weight));
        Self {
            config: Arc::new(RwLock::new(config.memberlist)),
            service: config.service,
            seeds: config.seeds,
            remote_config: config.remote_config,
            delegate,
            registry: Arc::new(ProviderRegistry::new()),
            engine: RwLock::new(None),
            cancel: CancellationToken::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Build from raw settings
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        Ok(Self::new(ClusterConfig::from_settings(settings)?))
    }

    /// Snapshot of the live engine tunables
    #[must_use]
    pub fn config(&self) -> MemberlistConfig {
        self.config.read().clone()
    }

    #[must_use]
    pub const fn service_config(&self) -> &ServiceConfig {
        &self.service
    }

    /// Comma separated seeds from the configuration
    #[must_use]
    pub fn seeds(&self) -> &str {
        &self.seeds
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ProviderRegistry> {
        &self.registry
    }

    /// Local metadata as currently advertised
    #[must_use]
    pub fn local_meta(&self) -> NodeMeta {
        self.delegate.meta()
    }

    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn engine(&self) -> Result<Arc<dyn MembershipEngine>> {
        self.engine.read().clone().ok_or(Error::NotInitialized)
    }

    /// Create the membership engine
    ///
    /// Construction failure is returned to the caller, which must not keep
    /// running without an engine.
    pub fn start(&self, factory: &dyn EngineFactory) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::Engine("Cluster has been shut down".to_string()));
        }
        let mut slot = self.engine.write();
        if slot.is_some() {
            return Err(Error::Engine("Membership engine already started".to_string()));
        }

        let hooks = EngineHooks {
            delegate: self.delegate.clone(),
            events: Arc::new(ProviderEventDelegate::new(self.registry.clone())),
        };
        let engine = factory.create(self.config.clone(), hooks)?;
        let local = engine.local_node();
        info!(node = %local.name, address = %local.address(), "Membership engine started");
        *slot = Some(engine);
        Ok(())
    }

    /// Join the cluster through the configured seeds
    pub async fn bootstrap(&self, dns: &dyn DnsExchange) -> Result<usize> {
        self.join(&self.seeds, dns).await
    }

    /// Join through a comma separated seed list
    ///
    /// An empty list leaves this node as a single-member cluster. A
    /// non-empty list that reaches no peer within the join timeout fails.
    pub async fn join(&self, seeds: &str, dns: &dyn DnsExchange) -> Result<usize> {
        let engine = self.engine()?;
        if seeds.split(',').all(|s| s.trim().is_empty()) {
            warn!("No seeds configured, running as a single-member cluster");
            return Ok(0);
        }

        let (bind_port, join_timeout) = {
            let config = self.config.read();
            (config.bind_port, config.join_timeout)
        };

        let attempt = async {
            let peers = resolve_seeds(seeds, bind_port, dns, "").await;
            if peers.is_empty() {
                return Err(Error::Join(format!("No usable peer in seed list '{seeds}'")));
            }
            debug!(peers = ?peers, "Joining cluster");
            engine.join(&peers).await
        };

        let joined = tokio::select! {
            () = self.cancel.cancelled() => {
                return Err(Error::Join("Join cancelled by shutdown".to_string()));
            }
            result = tokio::time::timeout(join_timeout, attempt) => result.map_err(|_| {
                Error::Timeout(format!("Join did not finish within {join_timeout:?}"))
            })??,
        };

        if joined == 0 {
            return Err(Error::Join(format!("No seed in '{seeds}' could be reached")));
        }
        info!(joined, members = engine.members().len(), "Joined cluster");
        Ok(joined)
    }

    /// Advertise a local service and push the new metadata to peers
    ///
    /// Before [`start`](Self::start) the service is only recorded; it is
    /// advertised once the engine exists.
    pub async fn register_service(&self, service: Service) -> Result<()> {
        info!(
            service = %service.name,
            kind = ?service.service_type,
            url = %service.base_url(),
            "Registering local service"
        );
        self.delegate.add_service(service);

        let Some(engine) = self.engine.read().clone() else {
            debug!("Engine not started, service will be advertised at start");
            return Ok(());
        };

        let local = engine.local_node();
        self.delegate.queue_meta_broadcast(&local.name)?;
        let timeout = self.config.read().tcp_timeout;
        engine.update_node(timeout).await.map_err(|e| {
            error!(error = %e, "Failed to push local metadata");
            e
        })
    }

    fn local_service(&self, service_type: ServiceType, data: HashMap<String, String>) -> Service {
        let port = match service_type {
            ServiceType::Rest => self.service.http_port,
            ServiceType::Grpc => self.service.grpc_port,
        };
        Service {
            name: self.service.name.clone(),
            host: self.service.host.clone(),
            port,
            route_root_path: self.service.route_root_path.clone(),
            service_type,
            data,
        }
    }

    /// Advertise the configured REST service
    pub async fn register_rest(&self, data: HashMap<String, String>) -> Result<()> {
        self.register_service(self.local_service(ServiceType::Rest, data)).await
    }

    /// Advertise the configured gRPC service
    pub async fn register_grpc(&self, data: HashMap<String, String>) -> Result<()> {
        self.register_service(self.local_service(ServiceType::Grpc, data)).await
    }

    /// Start routing membership events to `provider`
    ///
    /// Members already known to a running engine are replayed through
    /// `add_node`.
    pub fn register_service_provider(&self, provider: Arc<dyn ServiceProvider>) -> Result<()> {
        self.registry.register(provider.clone());

        let Some(engine) = self.engine.read().clone() else {
            return Ok(());
        };
        let local = engine.local_node().name;
        for node in engine.members().iter().filter(|n| n.name != local) {
            provider.add_node(node)?;
        }
        Ok(())
    }

    /// Every member, the local node included
    pub fn all_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.engine()?.members())
    }

    pub fn local_node(&self) -> Result<Node> {
        Ok(self.engine()?.local_node())
    }

    /// Announce departure; failures are logged
    pub async fn leave(&self, timeout: Duration) {
        let engine = match self.engine() {
            Ok(engine) => engine,
            Err(e) => {
                warn!(error = %e, "Leave skipped");
                return;
            }
        };
        match tokio::time::timeout(timeout, engine.leave(timeout)).await {
            Ok(Ok(())) => info!("Left cluster"),
            Ok(Err(e)) => error!(error = %e, "Failed to leave cluster"),
            Err(_) => error!(timeout = ?timeout, "Leave timed out"),
        }
    }

    /// Stop the engine; only the first call has an effect
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            debug!("Cluster already shut down");
            return;
        }
        self.cancel.cancel();

        let engine = self.engine.read().clone();
        if let Some(engine) = engine {
            if let Err(e) = engine.shutdown().await {
                error!(error = %e, "Membership engine shutdown failed");
            }
        }
        info!("Cluster shut down");
    }

    /// Attach a remote config watcher that live-patches engine tunables
    ///
    /// The watcher must be of the configured `config_remote_type`.
    pub fn watch_config(
        &self,
        watcher: &dyn ConfigWatcher,
        settings: Settings,
    ) -> Result<Arc<ConfigReloader>> {
        match self.remote_config {
            Some(kind) if kind == watcher.kind() => {}
            Some(kind) => {
                return Err(Error::Configuration(format!(
                    "Watcher is {:?} but remote config type is {kind:?}",
                    watcher.kind()
                )));
            }
            None => {
                return Err(Error::Configuration(
                    "No remote config type configured".to_string(),
                ));
            }
        }

        let reloader = Arc::new(ConfigReloader::new(settings, self.config.clone()));
        watcher.watch(reloader.clone())?;
        info!(kind = ?watcher.kind(), "Remote config watcher registered");
        Ok(reloader)
    }
}
