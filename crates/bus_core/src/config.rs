//! Configuration surface (SPEC §2.1, §6): a builder-style `BusClientConfig`
//! validated eagerly at construction: zero timeouts and zero-capacity
//! channels are rejected immediately rather than surfacing later as a stuck
//! call or a full mailbox.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::errors::BusError;

/// A top-level subsystem toggle consulted once, at `start_server`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Feature {
    Rpcs,
    Events,
    Tasks,
}

impl Feature {
    pub const ALL: [Feature; 3] = [Feature::Rpcs, Feature::Events, Feature::Tasks];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Rpcs => "RPCS",
            Feature::Events => "EVENTS",
            Feature::Tasks => "TASKS",
        }
    }

    pub fn parse(name: &str) -> Result<Self, BusError> {
        Feature::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| BusError::UnsupportedUse {
                requested: name.to_owned(),
                allowed: Feature::ALL.iter().map(|f| f.as_str()).collect::<Vec<_>>().join(", "),
            })
    }
}

/// Per-API overrides. `cast_values` is carried through for parity with the
/// reference configuration surface; since procedures here declare only
/// parameter presence and not parameter types (SPEC §3's data model has no
/// notion of a declared type), there is no coercion to perform yet; it is a
/// no-op today, reserved for a future typed `ParamSpec`.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub rpc_timeout: Duration,
    pub cast_values: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            rpc_timeout: Duration::from_secs(5),
            cast_values: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BusClientConfig {
    default_api: ApiConfig,
    apis: HashMap<String, ApiConfig>,
    features: HashSet<Feature>,
    rpc_channel_capacity: usize,
    event_channel_capacity: usize,
}

impl Default for BusClientConfig {
    fn default() -> Self {
        Self {
            default_api: ApiConfig::default(),
            apis: HashMap::new(),
            features: Feature::ALL.into_iter().collect(),
            rpc_channel_capacity: 100,
            event_channel_capacity: 100,
        }
    }
}

impl BusClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_api_rpc_timeout(mut self, api_name: impl Into<String>, timeout: Duration) -> Result<Self, BusError> {
        if timeout.is_zero() {
            return Err(BusError::InvalidConfig(
                "rpc_timeout must be greater than zero".to_owned(),
            ));
        }
        self.apis.entry(api_name.into()).or_default().rpc_timeout = timeout;
        Ok(self)
    }

    pub fn with_api_cast_values(mut self, api_name: impl Into<String>, cast_values: bool) -> Self {
        self.apis.entry(api_name.into()).or_default().cast_values = cast_values;
        self
    }

    pub fn with_features(mut self, features: impl IntoIterator<Item = Feature>) -> Self {
        self.features = features.into_iter().collect();
        self
    }

    pub fn with_rpc_channel_capacity(mut self, capacity: usize) -> Result<Self, BusError> {
        if capacity == 0 {
            return Err(BusError::InvalidConfig(
                "rpc_channel_capacity must be greater than zero".to_owned(),
            ));
        }
        self.rpc_channel_capacity = capacity;
        Ok(self)
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Result<Self, BusError> {
        if capacity == 0 {
            return Err(BusError::InvalidConfig(
                "event_channel_capacity must be greater than zero".to_owned(),
            ));
        }
        self.event_channel_capacity = capacity;
        Ok(self)
    }

    pub fn api(&self, api_name: &str) -> ApiConfig {
        self.apis.get(api_name).cloned().unwrap_or_else(|| self.default_api.clone())
    }

    pub fn features(&self) -> &HashSet<Feature> {
        &self.features
    }

    pub fn rpc_channel_capacity(&self) -> usize {
        self.rpc_channel_capacity
    }

    pub fn event_channel_capacity(&self) -> usize {
        self.event_channel_capacity
    }
}
