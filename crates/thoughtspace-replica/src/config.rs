//! Replica configuration.

use std::time::Duration;
use thoughtspace_crdt::ReplicaId;
use ulid::Ulid;

/// Configuration for one thoughtspace replica.
#[derive(Clone, Debug)]
pub struct ReplicaConfig {
    /// Thoughtspace id. Prefixes every document name.
    pub tsid: String,
    /// Tags every local transaction so echoes can be recognised.
    pub replica_id: ReplicaId,
    /// Opaque credential forwarded to the relay.
    pub access_token: String,
    /// Whether entity documents connect to the relay at all.
    pub remote: bool,
    /// Wait before retrying an aborted persistence operation.
    pub retry_delay: Duration,
    /// Window within which change notifications are merged.
    pub throttle_window: Duration,
    /// Concurrent document writes during a bulk save.
    pub save_concurrency: usize,
    /// Concurrent document loads during subtree replication.
    pub subtree_concurrency: usize,
    /// Capacity of each document's update broadcast channel.
    pub event_capacity: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            tsid: Ulid::new().to_string(),
            replica_id: ReplicaId::random(),
            access_token: String::new(),
            remote: true,
            retry_delay: Duration::from_millis(1000),
            throttle_window: Duration::from_millis(100),
            save_concurrency: 16,
            subtree_concurrency: 4,
            event_capacity: 256,
        }
    }
}

/// Builder for replica configuration.
pub struct ReplicaConfigBuilder {
    config: ReplicaConfig,
}

impl ReplicaConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ReplicaConfig::default(),
        }
    }

    pub fn tsid(mut self, tsid: impl Into<String>) -> Self {
        self.config.tsid = tsid.into();
        self
    }

    pub fn replica_id(mut self, replica_id: impl Into<ReplicaId>) -> Self {
        self.config.replica_id = replica_id.into();
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.config.access_token = token.into();
        self
    }

    pub fn remote(mut self, enabled: bool) -> Self {
        self.config.remote = enabled;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn throttle_window(mut self, window: Duration) -> Self {
        self.config.throttle_window = window;
        self
    }

    pub fn save_concurrency(mut self, concurrency: usize) -> Self {
        self.config.save_concurrency = concurrency.max(1);
        self
    }

    pub fn subtree_concurrency(mut self, concurrency: usize) -> Self {
        self.config.subtree_concurrency = concurrency.max(1);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ReplicaConfig {
        self.config
    }
}

impl Default for ReplicaConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
