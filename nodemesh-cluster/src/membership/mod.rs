//! Membership engine boundary

mod engine;
pub mod memory;

pub use engine::{
    Delegate, EngineFactory, EngineHooks, EventDelegate, MembershipEngine, Node, NodeState,
};
pub use memory::{MemoryEngine, MemoryNetwork, META_MAX_SIZE};
