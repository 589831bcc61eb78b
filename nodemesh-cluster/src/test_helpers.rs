//! Fixtures shared by unit tests

use std::collections::HashMap;

use crate::discovery::meta::{NodeMeta, Service, ServiceType};
use crate::membership::{Node, NodeState};

/// REST service named `name` hosted at `<host>.local:6060`
pub fn rest_service(name: &str, host: &str) -> Service {
    Service {
        name: name.to_string(),
        host: format!("{host}.local"),
        port: 6060,
        route_root_path: String::new(),
        service_type: ServiceType::Rest,
        data: HashMap::new(),
    }
}

/// An alive member offering `services`, with the given static and dynamic weights
pub fn node_with(name: &str, services: &[&str], static_weight: u32, weight: u32) -> Node {
    let mut meta = NodeMeta::new(static_weight);
    for svc in services {
        meta.services.push(rest_service(svc, name));
    }
    Node {
        name: name.to_string(),
        addr: "127.0.0.1".to_string(),
        port: 7946,
        meta: meta.encode(usize::MAX).expect("fixture metadata encodes"),
        state: NodeState::Alive,
        protocol_version: 1,
        weight,
    }
}
