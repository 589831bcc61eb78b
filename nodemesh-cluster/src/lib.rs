pub mod cluster;
pub mod config;
pub mod discovery;
pub mod error;
pub mod grpc;
pub mod logging;
pub mod membership;

#[cfg(test)]
mod test_helpers;

pub use cluster::Cluster;
pub use config::{ClusterConfig, MemberlistConfig, ServiceConfig, Settings};
pub use discovery::{LookupProvider, NodeMeta, Service, ServiceProvider, ServiceType};
pub use error::{Error, Result};
pub use grpc::{dial, Policy, ResolverBuilder, WeightedChannel};
pub use logging::{init_logging, set_membership_level, LoggingConfig};
pub use membership::{MemoryNetwork, Node, NodeState};
