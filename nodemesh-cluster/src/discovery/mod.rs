//! Service discovery on top of cluster membership

pub mod broadcast;
pub mod delegate;
pub mod events;
pub mod load_balancer;
pub mod meta;
pub mod provider;
pub mod seeds;

pub use broadcast::{Broadcast, BroadcastQueue, MetaBroadcast};
pub use delegate::MetaDelegate;
pub use events::{ProviderEventDelegate, ProviderRegistry};
pub use load_balancer::{LoadBalancingStrategy, RoundRobin};
pub use meta::{BuildInfo, NodeMeta, Service, ServiceType};
pub use provider::{LookupProvider, Server, ServiceProvider, DEFAULT_WEIGHT};
pub use seeds::{resolve_seeds, DnsExchange, DnsQuery, DnsResponse, SystemResolver};
