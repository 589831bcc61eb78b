//! Connection pickers built from the resolver's address snapshot

use parking_lot::Mutex;
use serde_json::Value;

use super::resolver::Address;
use crate::discovery::load_balancer::{smooth_weighted_next, Weighted};
use crate::discovery::provider::DEFAULT_WEIGHT;
use crate::error::{Error, Result};

/// Registered name of the smooth weighted round-robin policy
pub const WEIGHTED_ROUND_ROBIN: &str = "nodemesh_weighted_round_robin";

/// Registered name of the first-address policy
pub const PICK_FIRST: &str = "pick_first";

/// Balancing policy of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Policy {
    #[default]
    WeightedRoundRobin,
    PickFirst,
}

impl Policy {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::WeightedRoundRobin => WEIGHTED_ROUND_ROBIN,
            Self::PickFirst => PICK_FIRST,
        }
    }

    /// Look up a policy by its registered name
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            WEIGHTED_ROUND_ROBIN => Some(Self::WeightedRoundRobin),
            PICK_FIRST => Some(Self::PickFirst),
            _ => None,
        }
    }

    /// Select the policy named by a service config document
    ///
    /// `{"loadBalancingConfig":[{"<name>":{}}]}`; the first entry wins and an
    /// unknown name falls back to the weighted policy.
    pub fn from_service_config(json: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(json)?;
        let name = doc
            .get("loadBalancingConfig")
            .and_then(Value::as_array)
            .and_then(|configs| configs.first())
            .and_then(Value::as_object)
            .and_then(|config| config.keys().next().cloned());

        let Some(name) = name else {
            return Ok(Self::default());
        };
        Ok(Self::from_name(&name).unwrap_or_else(|| {
            tracing::warn!(policy = %name, "Unknown balancer policy, using weighted round-robin");
            Self::default()
        }))
    }

    /// Service config document selecting this policy
    #[must_use]
    pub fn service_config(self) -> String {
        serde_json::json!({ "loadBalancingConfig": [{ self.name(): {} }] }).to_string()
    }

    /// Build a picker over `ready`, in resolver order
    #[must_use]
    pub fn build_picker<C>(self, ready: Vec<(C, Address)>) -> Box<dyn Picker<C>>
    where
        C: Clone + Send + Sync + 'static,
    {
        match self {
            Self::WeightedRoundRobin => Box::new(WeightedPicker::new(ready)),
            Self::PickFirst => Box::new(FirstPicker {
                conn: ready.into_iter().next().map(|(conn, _)| conn),
            }),
        }
    }
}

/// Chooses a connection for one call
pub trait Picker<C>: Send + Sync {
    /// `NoConnectionAvailable` when the snapshot is empty
    fn pick(&self) -> Result<C>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct WeightedEntry<C> {
    conn: C,
    weight: u32,
    current_weight: i64,
}

impl<C> Weighted for WeightedEntry<C> {
    fn weight(&self) -> u32 {
        self.weight
    }

    fn current_weight_mut(&mut self) -> &mut i64 {
        &mut self.current_weight
    }
}

/// Smooth weighted round-robin over one immutable snapshot
pub struct WeightedPicker<C> {
    entries: Mutex<Vec<WeightedEntry<C>>>,
}

impl<C: Clone> WeightedPicker<C> {
    #[must_use]
    pub fn new(ready: Vec<(C, Address)>) -> Self {
        let entries = ready
            .into_iter()
            .map(|(conn, address)| WeightedEntry {
                conn,
                weight: if address.weight > 0 {
                    address.weight
                } else {
                    DEFAULT_WEIGHT
                },
                current_weight: 0,
            })
            .collect();
        Self {
            entries: Mutex::new(entries),
        }
    }
}

impl<C: Clone + Send> Picker<C> for WeightedPicker<C> {
    fn pick(&self) -> Result<C> {
        let mut entries = self.entries.lock();
        let i = smooth_weighted_next(&mut entries).ok_or(Error::NoConnectionAvailable)?;
        Ok(entries[i].conn.clone())
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

struct FirstPicker<C> {
    conn: Option<C>,
}

impl<C: Clone + Send + Sync> Picker<C> for FirstPicker<C> {
    fn pick(&self) -> Result<C> {
        self.conn.clone().ok_or(Error::NoConnectionAvailable)
    }

    fn len(&self) -> usize {
        usize::from(self.conn.is_some())
    }
}
