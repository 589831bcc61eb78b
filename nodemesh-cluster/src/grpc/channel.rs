//! tonic channel balanced over membership-resolved peers
//!
//! [`WeightedChannel`] is the client connection a [`Resolver`] publishes to.
//! Every resolved address gets a connection task; only connected addresses
//! enter the picker, so generated clients are never routed to a peer that
//! cannot be reached while a reachable one exists.

use std::collections::HashMap;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::transport::{Channel, Endpoint};
use tower::{BoxError, Service, ServiceExt};
use tracing::{debug, warn};

use super::balancer::{Picker, Policy};
use super::resolver::{
    Address, ClientConnState, Resolver, ResolverBuilder, ResolverState, Target,
};
use crate::cluster::Cluster;
use crate::error::{Error, Result};

/// Pause between connection attempts to an unreachable address
const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Established connection to one resolved address
#[derive(Clone)]
pub struct Subconn {
    addr: String,
    channel: Channel,
}

impl Subconn {
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

struct Subchannel {
    addr: String,
    weight: u32,
    endpoint: Endpoint,
    /// `None` while connecting
    channel: Option<Channel>,
    cancel: CancellationToken,
}

struct Inner {
    policy: Policy,
    connect_timeout: Duration,
    handle: Handle,
    cancel: CancellationToken,
    /// Resolver order
    subchannels: Mutex<Vec<Subchannel>>,
    picker: RwLock<Arc<dyn Picker<Subconn>>>,
    /// Number of connected addresses in the current picker
    ready_tx: watch::Sender<usize>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl Inner {
    // Called with the subchannel lock held
    fn rebuild(&self, subchannels: &[Subchannel]) {
        let ready: Vec<_> = subchannels
            .iter()
            .filter_map(|sub| {
                let channel = sub.channel.clone()?;
                let conn = Subconn {
                    addr: sub.addr.clone(),
                    channel,
                };
                let address = Address {
                    addr: sub.addr.clone(),
                    weight: sub.weight,
                };
                Some((conn, address))
            })
            .collect();

        let count = ready.len();
        let picker: Arc<dyn Picker<Subconn>> = Arc::from(self.policy.build_picker(ready));
        *self.picker.write() = picker;
        self.ready_tx.send_replace(count);
        debug!(
            policy = %self.policy.name(),
            ready = count,
            addresses = subchannels.len(),
            "Picker rebuilt"
        );
    }

    fn spawn_connect(
        self: &Arc<Self>,
        addr: String,
        endpoint: Endpoint,
        cancel: CancellationToken,
    ) {
        let inner = Arc::downgrade(self);
        self.handle.spawn(async move {
            loop {
                let attempt = tokio::select! {
                    () = cancel.cancelled() => return,
                    attempt = endpoint.connect() => attempt,
                };
                match attempt {
                    Ok(channel) => {
                        if let Some(inner) = inner.upgrade() {
                            inner.connected(&addr, &cancel, channel);
                        }
                        return;
                    }
                    Err(e) => debug!(addr = %addr, error = %e, "Connect failed, retrying"),
                }
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(RECONNECT_DELAY) => {}
                }
            }
        });
    }

    fn connected(&self, addr: &str, cancel: &CancellationToken, channel: Channel) {
        let mut subchannels = self.subchannels.lock();
        // Removed while the attempt was in flight
        if cancel.is_cancelled() {
            return;
        }
        let Some(sub) = subchannels.iter_mut().find(|sub| sub.addr == addr) else {
            return;
        };
        sub.channel = Some(channel);
        debug!(addr = %addr, "Connection ready");
        self.rebuild(&subchannels);
    }

    /// Take a failed connection out of the picker and start reconnecting
    fn disconnected(self: &Arc<Self>, addr: &str) {
        let mut subchannels = self.subchannels.lock();
        let Some(sub) = subchannels.iter_mut().find(|sub| sub.addr == addr) else {
            return;
        };
        if sub.channel.take().is_none() {
            return;
        }
        sub.cancel = self.cancel.child_token();
        let (endpoint, cancel) = (sub.endpoint.clone(), sub.cancel.clone());
        warn!(addr = %addr, "Connection lost, reconnecting");
        self.rebuild(&subchannels);
        drop(subchannels);
        self.spawn_connect(addr.to_string(), endpoint, cancel);
    }
}

/// Client connection balancing calls across resolved peers
#[derive(Clone)]
pub struct WeightedChannel {
    inner: Arc<Inner>,
}

impl WeightedChannel {
    /// Create an empty channel; must be called inside a tokio runtime
    pub fn new(policy: Policy, connect_timeout: Duration) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| Error::Rpc(format!("WeightedChannel needs a tokio runtime: {e}")))?;
        let (ready_tx, _) = watch::channel(0);
        let picker: Arc<dyn Picker<Subconn>> = Arc::from(policy.build_picker(Vec::new()));
        Ok(Self {
            inner: Arc::new(Inner {
                policy,
                connect_timeout,
                handle,
                cancel: CancellationToken::new(),
                subchannels: Mutex::new(Vec::new()),
                picker: RwLock::new(picker),
                ready_tx,
            }),
        })
    }

    #[must_use]
    pub fn policy(&self) -> Policy {
        self.inner.policy
    }

    /// Every resolved address, connected or not
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<_> = self
            .inner
            .subchannels
            .lock()
            .iter()
            .map(|sub| sub.addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    /// Addresses with an established connection
    #[must_use]
    pub fn ready_addresses(&self) -> Vec<String> {
        let mut addrs: Vec<_> = self
            .inner
            .subchannels
            .lock()
            .iter()
            .filter(|sub| sub.channel.is_some())
            .map(|sub| sub.addr.clone())
            .collect();
        addrs.sort();
        addrs
    }

    fn endpoint(&self, addr: &str) -> Result<Endpoint> {
        let uri = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.to_string()
        } else {
            format!("http://{addr}")
        };
        Ok(Endpoint::from_shared(uri)
            .map_err(|e| Error::Rpc(format!("Invalid endpoint URI for {addr}: {e}")))?
            .connect_timeout(self.inner.connect_timeout))
    }

    /// Next connection according to the policy
    pub fn pick(&self) -> Result<Subconn> {
        self.inner.picker.read().pick()
    }

    /// Wait until at least one address is connected
    async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.ready_tx.subscribe();
        rx.wait_for(|ready| *ready > 0)
            .await
            .map(|_| ())
            .map_err(|e| Error::Rpc(format!("Channel closed while dialing: {e}")))
    }
}

impl ClientConnState for WeightedChannel {
    fn update_state(&self, state: ResolverState) -> Result<()> {
        let mut subchannels = self.inner.subchannels.lock();

        // Reject the whole update before touching the current set
        let mut fresh = HashMap::new();
        for address in &state.addresses {
            if !subchannels.iter().any(|sub| sub.addr == address.addr) {
                fresh.insert(address.addr.clone(), self.endpoint(&address.addr)?);
            }
        }

        let mut previous = std::mem::take(&mut *subchannels);
        let mut started = Vec::new();
        for address in state.addresses {
            if subchannels.iter().any(|sub| sub.addr == address.addr) {
                continue;
            }
            if let Some(pos) = previous.iter().position(|sub| sub.addr == address.addr) {
                let mut sub = previous.swap_remove(pos);
                sub.weight = address.weight;
                subchannels.push(sub);
            } else if let Some(endpoint) = fresh.remove(&address.addr) {
                let cancel = self.inner.cancel.child_token();
                started.push((address.addr.clone(), endpoint.clone(), cancel.clone()));
                subchannels.push(Subchannel {
                    addr: address.addr,
                    weight: address.weight,
                    endpoint,
                    channel: None,
                    cancel,
                });
            }
        }
        for gone in previous {
            gone.cancel.cancel();
            debug!(addr = %gone.addr, "Address removed");
        }

        self.inner.rebuild(&subchannels);
        drop(subchannels);
        for (addr, endpoint, cancel) in started {
            self.inner.spawn_connect(addr, endpoint, cancel);
        }
        Ok(())
    }
}

impl Service<http::Request<Body>> for WeightedChannel {
    type Response = http::Response<Body>;
    type Error = BoxError;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        // Readiness is per picked connection, checked in `call`
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let picked = self.pick();
        let inner = self.inner.clone();
        Box::pin(async move {
            let Subconn { addr, mut channel } = picked.map_err(BoxError::from)?;
            let result = match ServiceExt::<http::Request<Body>>::ready(&mut channel).await {
                Ok(channel) => channel.call(request).await,
                Err(e) => Err(e),
            };
            result.map_err(|e| -> BoxError {
                inner.disconnected(&addr);
                e.into()
            })
        })
    }
}

/// Build a balanced channel for `target` and wait until it can serve calls
///
/// Fails with [`Error::Timeout`] when no resolved peer accepts a connection
/// within `timeout`. The returned resolver stays registered with the cluster.
pub async fn dial(
    cluster: Arc<Cluster>,
    target: &str,
    policy: Policy,
    timeout: Duration,
) -> Result<(WeightedChannel, Arc<Resolver>)> {
    let target: Target = target.parse()?;
    let channel = WeightedChannel::new(policy, timeout)?;
    let conn = Arc::new(channel.clone());
    let resolver = ResolverBuilder::new(cluster).build(target.clone(), conn)?;

    tokio::time::timeout(timeout, channel.wait_ready())
        .await
        .map_err(|_| {
            Error::Timeout(format!("No ready connection for {target} after {timeout:?}"))
        })??;

    tracing::info!(
        target_uri = %target,
        policy = %policy.name(),
        ready = ?channel.ready_addresses(),
        "Channel ready"
    );
    Ok((channel, resolver))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Unused port on this host; connections are refused
    const DEAD: &str = "127.0.0.1:1";

    fn state(addrs: &[(&str, u32)]) -> ResolverState {
        ResolverState {
            addresses: addrs
                .iter()
                .map(|&(addr, weight)| Address {
                    addr: addr.to_string(),
                    weight,
                })
                .collect(),
        }
    }

    /// Accepts and holds TCP connections; enough for the HTTP/2 client handshake
    async fn listener() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        addr
    }

    fn channel(policy: Policy) -> WeightedChannel {
        WeightedChannel::new(policy, Duration::from_secs(1)).unwrap()
    }

    #[tokio::test]
    async fn test_update_state_tracks_addresses() {
        let channel = channel(Policy::WeightedRoundRobin);
        assert!(matches!(channel.pick(), Err(Error::NoConnectionAvailable)));

        channel
            .update_state(state(&[("127.0.0.1:50051", 1), ("127.0.0.1:50052", 2)]))
            .unwrap();
        assert_eq!(channel.addresses(), vec!["127.0.0.1:50051", "127.0.0.1:50052"]);

        channel.update_state(state(&[("127.0.0.1:50052", 2)])).unwrap();
        assert_eq!(channel.addresses(), vec!["127.0.0.1:50052"]);

        channel.update_state(ResolverState::default()).unwrap();
        assert!(channel.addresses().is_empty());
        assert!(matches!(channel.pick(), Err(Error::NoConnectionAvailable)));
    }

    #[tokio::test]
    async fn test_invalid_address_is_rejected() {
        let channel = channel(Policy::PickFirst);
        channel.update_state(state(&[("127.0.0.1:50051", 1)])).unwrap();
        assert!(channel.update_state(state(&[("not a uri", 1)])).is_err());
        assert_eq!(channel.addresses(), vec!["127.0.0.1:50051"]);
    }

    #[tokio::test]
    async fn test_unreachable_address_never_becomes_ready() {
        let channel = channel(Policy::WeightedRoundRobin);
        channel.update_state(state(&[(DEAD, 1)])).unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(600), channel.wait_ready()).await;
        assert!(waited.is_err());
        assert!(channel.ready_addresses().is_empty());
        assert!(matches!(channel.pick(), Err(Error::NoConnectionAvailable)));
    }

    #[tokio::test]
    async fn test_picker_only_uses_connected_peers() {
        let live = listener().await;
        let channel = channel(Policy::WeightedRoundRobin);
        channel
            .update_state(state(&[(DEAD, 5), (live.as_str(), 1)]))
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), channel.wait_ready())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(channel.addresses().len(), 2);
        assert_eq!(channel.ready_addresses(), vec![live.clone()]);
        for _ in 0..6 {
            assert_eq!(channel.pick().unwrap().addr(), live);
        }
    }

    #[tokio::test]
    async fn test_removed_peer_leaves_picker() {
        let live = listener().await;
        let channel = channel(Policy::PickFirst);
        channel.update_state(state(&[(live.as_str(), 1)])).unwrap();
        tokio::time::timeout(Duration::from_secs(5), channel.wait_ready())
            .await
            .unwrap()
            .unwrap();

        // Weight changes keep the established connection
        channel.update_state(state(&[(live.as_str(), 3)])).unwrap();
        assert_eq!(channel.ready_addresses(), vec![live.clone()]);

        channel.update_state(ResolverState::default()).unwrap();
        assert!(channel.ready_addresses().is_empty());
        assert!(matches!(channel.pick(), Err(Error::NoConnectionAvailable)));
    }

    #[tokio::test]
    async fn test_call_without_peers_fails_fast() {
        let mut channel = channel(Policy::WeightedRoundRobin);
        let request = http::Request::new(Body::empty());
        let err = channel.call(request).await.unwrap_err();
        assert!(err.to_string().contains("No connection available"));
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        assert!(WeightedChannel::new(Policy::WeightedRoundRobin, Duration::from_secs(1)).is_err());
    }
}
