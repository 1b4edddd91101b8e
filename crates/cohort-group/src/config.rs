//! Container configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to replicas whose originating member leaves the group.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrphanPolicy {
    /// Keep the replica and mark it orphaned.
    #[default]
    Retain,
    /// Remove the replica from the local directory.
    Remove,
}

/// Configuration for a [`SharedObjectContainer`](crate::SharedObjectContainer).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Default deadline of a replication transaction.
    pub transaction_timeout_ms: u64,
    /// How long `connect` waits for the join handshake.
    pub connect_timeout_ms: u64,
    pub orphan_policy: OrphanPolicy,
    /// Capacity of the container event channel.
    pub event_capacity: usize,
}

impl ContainerConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            transaction_timeout_ms: 30_000,
            connect_timeout_ms: 10_000,
            orphan_policy: OrphanPolicy::Retain,
            event_capacity: 100,
        }
    }
}

/// Builder for container configuration.
pub struct ContainerConfigBuilder {
    config: ContainerConfig,
}

impl ContainerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ContainerConfig::default(),
        }
    }

    pub fn transaction_timeout_ms(mut self, ms: u64) -> Self {
        self.config.transaction_timeout_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    pub fn orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.config.orphan_policy = policy;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.config.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> ContainerConfig {
        self.config
    }
}

impl Default for ContainerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ContainerConfig::default();
        assert_eq!(config.transaction_timeout(), Duration::from_secs(30));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.orphan_policy, OrphanPolicy::Retain);
    }

    #[test]
    fn test_builder() {
        let config = ContainerConfigBuilder::new()
            .transaction_timeout_ms(2000)
            .orphan_policy(OrphanPolicy::Remove)
            .event_capacity(0)
            .build();

        assert_eq!(config.transaction_timeout_ms, 2000);
        assert_eq!(config.connect_timeout_ms, 10_000);
        assert_eq!(config.orphan_policy, OrphanPolicy::Remove);
        assert_eq!(config.event_capacity, 1);
    }
}
