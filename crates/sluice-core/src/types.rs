//! Settings types shared by the proxy, the config loader and the runtime

use crate::error::{Error, Result};
use crate::upstream::Upstream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Connection pool settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum in-flight (pipelined) requests per connection
    pub pipelining: usize,

    /// Maximum connections per origin
    pub connections: usize,

    /// Deadline from slot acquisition until the upstream response head arrives
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Idle time after which a connection with nothing in flight is closed
    #[serde(with = "humantime_serde")]
    pub keep_alive: Duration,

    /// TCP connect timeout
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Callers allowed to wait for a slot once every connection is saturated
    pub max_queued: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            pipelining: 1,
            connections: 16,
            request_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(4),
            connect_timeout: Duration::from_secs(10),
            max_queued: 128,
        }
    }
}

impl PoolSettings {
    /// Check the limits are usable
    pub fn validate(&self) -> Result<()> {
        if self.pipelining == 0 {
            return Err(Error::Config("pool.pipelining must be > 0".to_string()));
        }
        if self.connections == 0 {
            return Err(Error::Config("pool.connections must be > 0".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::Config("pool.request_timeout must be > 0".to_string()));
        }
        if self.keep_alive.is_zero() {
            return Err(Error::Config("pool.keep_alive must be > 0".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::Config("pool.connect_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Settings for one proxy instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Upstream base address, e.g. `http://127.0.0.1:3000`
    pub base: String,

    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolSettings,
}

impl ProxySettings {
    /// Create settings for a base address with default pool limits
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            pool: PoolSettings::default(),
        }
    }

    /// Replace the pool settings
    pub fn with_pool(mut self, pool: PoolSettings) -> Self {
        self.pool = pool;
        self
    }

    /// Validate the base address and pool limits
    pub fn validate(&self) -> Result<()> {
        Upstream::parse(&self.base)?;
        self.pool.validate()
    }
}

/// Declarative header rewrite rules for one side of the exchange
///
/// Removals apply before sets, so a header can be replaced by listing it in
/// both.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderRules {
    /// Header names to delete
    pub remove: Vec<String>,

    /// Headers to insert, replacing existing values
    pub set: BTreeMap<String, String>,
}

impl HeaderRules {
    /// True when the rules do nothing
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.set.is_empty()
    }
}
