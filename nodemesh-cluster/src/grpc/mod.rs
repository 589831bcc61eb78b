//! gRPC name resolution and balancing over discovered peers

pub mod balancer;
pub mod channel;
pub mod resolver;

pub use balancer::{Picker, Policy, WeightedPicker, PICK_FIRST, WEIGHTED_ROUND_ROBIN};
pub use channel::{dial, Subconn, WeightedChannel};
pub use resolver::{
    Address, ClientConnState, Resolver, ResolverBuilder, ResolverState, Target, SCHEME,
};
