//! Node metadata gossiped by every member
//!
//! The payload is JSON encoded and must fit in the engine's per-message
//! ceiling; the size is checked when encoding.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::membership::Node;

/// Transport a service is reachable over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    Rest,
    Grpc,
}

/// One endpoint exposed by a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub route_root_path: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub data: HashMap<String, String>,
}

impl Service {
    /// Address callers use to reach this service
    ///
    /// REST services resolve to `http://host:port<root>`, gRPC services to
    /// `host:port`.
    #[must_use]
    pub fn base_url(&self) -> String {
        match self.service_type {
            ServiceType::Rest => {
                let root = self.route_root_path.trim_end_matches('/');
                if root.is_empty() || root.starts_with('/') {
                    format!("http://{}:{}{}", self.host, self.port, root)
                } else {
                    format!("http://{}:{}/{}", self.host, self.port, root)
                }
            }
            ServiceType::Grpc => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Build information advertised alongside the services
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_time: Option<String>,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build_time: option_env!("NODEMESH_BUILD_TIME").map(str::to_string),
        }
    }
}

/// Payload a node gossips about itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default)]
    pub services: Vec<Service>,
    pub register_at: DateTime<Utc>,
    #[serde(default)]
    pub build: BuildInfo,
    /// Operator-declared capacity; 0 means no override
    #[serde(default)]
    pub weight: u32,
}

impl NodeMeta {
    #[must_use]
    pub fn new(weight: u32) -> Self {
        Self {
            services: Vec::new(),
            register_at: Utc::now(),
            build: BuildInfo::default(),
            weight,
        }
    }

    /// Encode, failing when the result would exceed `limit` bytes
    pub fn encode(&self, limit: usize) -> Result<Vec<u8>> {
        let buf = serde_json::to_vec(self)?;
        if buf.len() > limit {
            return Err(Error::MetaTooLarge {
                size: buf.len(),
                limit,
            });
        }
        Ok(buf)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        serde_json::from_slice(buf)
            .map_err(|e| Error::Serialization(format!("Failed to decode node metadata: {e}")))
    }

    /// Decode the metadata carried by a member
    pub fn from_node(node: &Node) -> Result<Self> {
        Self::decode(&node.meta).map_err(|e| match e {
            Error::Serialization(msg) => Error::Serialization(format!("node {}: {msg}", node.name)),
            other => other,
        })
    }

    /// Service with the given name over the given transport
    ///
    /// A node registering both REST and gRPC advertises two entries under
    /// one name; callers pick the one they can talk to.
    #[must_use]
    pub fn service(&self, name: &str, service_type: ServiceType) -> Option<&Service> {
        self.services
            .iter()
            .find(|s| s.name == name && s.service_type == service_type)
    }
}
