//! Configuration for the cluster control core.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ControlError, ControlResult};
use crate::membership;

/// Configuration for a broker's controller node.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// This broker's unique ID (cluster-unique, non-negative).
    /// The raft server ID is the same value.
    pub id: i32,

    /// This node's gossip member name (must be unique across the cluster).
    pub node_name: String,

    /// Address peers use for broker-to-broker RPC (LeaderAndISR).
    pub broker_addr: String,

    /// Address for raft communication.
    pub raft_addr: String,

    /// Address the gossip layer binds on the LAN.
    pub serf_lan_addr: String,

    /// Directory for persisted raft state. Snapshots live under
    /// `<data_dir>/raft/`.
    pub data_dir: PathBuf,

    /// Substitute in-memory stores for all persisted raft state.
    pub dev_mode: bool,

    /// Whether this node may form a one-member cluster at startup.
    /// At most one node per cluster sets this.
    pub bootstrap: bool,

    /// Join the consensus group as a non-voter.
    pub non_voter: bool,

    /// How often the leader re-runs a full membership reconcile.
    pub reconcile_interval: Duration,

    /// Upper bound on waiting for the post-election log barrier.
    pub barrier_timeout: Duration,

    /// Upper bound on waiting for a proposal to commit.
    pub propose_timeout: Duration,

    /// Depth of the bounded member-event channel feeding the leader loop.
    /// Overflow drops events; the periodic reconcile recovers them.
    pub reconcile_queue_depth: usize,

    /// Raft leader heartbeat interval.
    pub heartbeat_interval: Duration,

    /// Raft election timeout range (min).
    pub election_timeout_min: Duration,

    /// Raft election timeout range (max).
    pub election_timeout_max: Duration,

    /// Snapshot policy: snapshot after this many log entries.
    pub snapshot_threshold: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_payload_entries: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            id: 0,
            node_name: "node-0".to_string(),
            broker_addr: "127.0.0.1:9092".to_string(),
            raft_addr: "127.0.0.1:9192".to_string(),
            serf_lan_addr: "127.0.0.1:9292".to_string(),
            data_dir: PathBuf::from("/tmp/skipjack"),
            dev_mode: false,
            bootstrap: false,
            non_voter: false,
            reconcile_interval: Duration::from_secs(60),
            barrier_timeout: Duration::from_secs(120),
            propose_timeout: Duration::from_secs(30),
            reconcile_queue_depth: 32,
            heartbeat_interval: Duration::from_millis(100),
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(400),
            snapshot_threshold: 1_000,
            max_payload_entries: 100,
        }
    }
}

impl ControllerConfig {
    /// Validate the configuration, returning all problems found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.id < 0 {
            errors.push(format!("id must be non-negative, got {}", self.id));
        }
        if self.node_name.is_empty() {
            errors.push("node_name must not be empty".to_string());
        }
        for (name, addr) in [
            ("broker_addr", &self.broker_addr),
            ("raft_addr", &self.raft_addr),
            ("serf_lan_addr", &self.serf_lan_addr),
        ] {
            if addr.is_empty() {
                errors.push(format!("{name} must not be empty"));
            }
        }
        if self.bootstrap && self.non_voter {
            errors.push("a bootstrap node cannot be a non-voter".to_string());
        }
        if self.reconcile_interval.is_zero() {
            errors.push("reconcile_interval must be positive".to_string());
        }
        if self.election_timeout_min >= self.election_timeout_max {
            errors.push(format!(
                "election_timeout_min ({:?}) must be below election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> ControlResult<Self> {
        let defaults = Self::default();

        let id: i32 = read_env("SKIPJACK_ID")?.unwrap_or(defaults.id);
        let node_name =
            std::env::var("SKIPJACK_NODE_NAME").unwrap_or_else(|_| format!("node-{id}"));

        let config = Self {
            id,
            node_name,
            broker_addr: std::env::var("SKIPJACK_BROKER_ADDR")
                .unwrap_or(defaults.broker_addr),
            raft_addr: std::env::var("SKIPJACK_RAFT_ADDR").unwrap_or(defaults.raft_addr),
            serf_lan_addr: std::env::var("SKIPJACK_SERF_ADDR")
                .unwrap_or(defaults.serf_lan_addr),
            data_dir: std::env::var("SKIPJACK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            dev_mode: read_env("SKIPJACK_DEV_MODE")?.unwrap_or(defaults.dev_mode),
            bootstrap: read_env("SKIPJACK_BOOTSTRAP")?.unwrap_or(defaults.bootstrap),
            non_voter: read_env("SKIPJACK_NON_VOTER")?.unwrap_or(defaults.non_voter),
            reconcile_interval: read_env("SKIPJACK_RECONCILE_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.reconcile_interval),
            ..defaults
        };

        config
            .validate()
            .map_err(|errors| ControlError::Config(errors.join(", ")))?;
        Ok(config)
    }

    /// The gossip tag map advertising this node as a broker.
    ///
    /// The inverse of [`membership::BrokerMetadata::from_member`].
    pub fn tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::from([
            (membership::TAG_ID.to_string(), self.id.to_string()),
            (
                membership::TAG_BROKER_ADDR.to_string(),
                self.broker_addr.clone(),
            ),
            (membership::TAG_RAFT_ADDR.to_string(), self.raft_addr.clone()),
            (
                membership::TAG_SERF_LAN_ADDR.to_string(),
                self.serf_lan_addr.clone(),
            ),
        ]);
        if self.bootstrap {
            tags.insert(membership::TAG_BOOTSTRAP.to_string(), "1".to_string());
        }
        if self.non_voter {
            tags.insert(membership::TAG_NON_VOTER.to_string(), "1".to_string());
        }
        tags
    }

    /// Translate to the consensus engine's configuration.
    pub fn to_openraft_config(&self) -> openraft::Config {
        openraft::Config {
            heartbeat_interval: self.heartbeat_interval.as_millis() as u64,
            election_timeout_min: self.election_timeout_min.as_millis() as u64,
            election_timeout_max: self.election_timeout_max.as_millis() as u64,
            max_payload_entries: self.max_payload_entries,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            ..Default::default()
        }
    }
}

fn read_env<T: std::str::FromStr>(name: &str) -> ControlResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ControlError::Config(format!("invalid {name}: {e}"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ControllerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validate_negative_id() {
        let config = ControllerConfig {
            id: -1,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("non-negative")));
    }

    #[test]
    fn test_validate_bootstrap_non_voter_conflict() {
        let config = ControllerConfig {
            bootstrap: true,
            non_voter: true,
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("non-voter")));
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = ControllerConfig {
            id: -2,
            node_name: String::new(),
            raft_addr: String::new(),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(errors.len() >= 3);
    }

    #[test]
    fn test_tags_roundtrip_through_broker_metadata() {
        let config = ControllerConfig {
            id: 7,
            node_name: "node-7".to_string(),
            bootstrap: true,
            ..Default::default()
        };
        let member = membership::Member {
            name: config.node_name.clone(),
            status: membership::MemberStatus::Alive,
            tags: config.tags(),
        };
        let broker = membership::BrokerMetadata::from_member(&member).unwrap();
        assert_eq!(broker.id, 7);
        assert_eq!(broker.broker_addr, config.broker_addr);
        assert_eq!(broker.raft_addr, config.raft_addr);
        assert!(broker.bootstrap);
        assert!(!broker.non_voter);
    }

    #[test]
    fn test_tags_omit_unset_flags() {
        let tags = ControllerConfig::default().tags();
        assert!(!tags.contains_key(membership::TAG_BOOTSTRAP));
        assert!(!tags.contains_key(membership::TAG_NON_VOTER));
    }
}
