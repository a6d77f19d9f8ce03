//! The consensus engine contract.
//!
//! The controller treats the log-replication engine as a black box behind
//! this trait: submit proposals, wait on the apply barrier, and manage the
//! voter/non-voter set. The production implementation lives in
//! [`crate::raft`]; an in-memory mock backs the test suites.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ControlResult;
use crate::fsm::{MetadataRequest, MetadataResponse};

#[cfg(any(test, feature = "test-utilities"))]
pub mod mock;

/// Whether a consensus server votes in elections.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServerSuffrage {
    Voter,
    Nonvoter,
}

/// One server in the consensus configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: i32,
    pub address: String,
    pub suffrage: ServerSuffrage,
}

/// The engine's current voter/non-voter set.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ClusterConfiguration {
    pub servers: Vec<Server>,
}

impl ClusterConfiguration {
    pub fn server(&self, id: i32) -> Option<&Server> {
        self.servers.iter().find(|s| s.id == id)
    }

    pub fn contains(&self, id: i32) -> bool {
        self.server(id).is_some()
    }

    pub fn voter_ids(&self) -> Vec<i32> {
        self.servers
            .iter()
            .filter(|s| s.suffrage == ServerSuffrage::Voter)
            .map(|s| s.id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// The black-box contract the controller requires from the consensus
/// engine. All membership operations are idempotent under retry.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Encode and submit a proposal, wait for commit, and return the FSM's
    /// apply response. Bounded by the engine's propose timeout.
    async fn propose(&self, request: MetadataRequest) -> ControlResult<MetadataResponse>;

    /// Block until all log entries committed before this call have been
    /// applied locally, up to `wait`.
    async fn barrier(&self, wait: Duration) -> ControlResult<()>;

    /// The current voter/non-voter set.
    async fn configuration(&self) -> ControlResult<ClusterConfiguration>;

    /// Add a voting server. No-op when already a voter at that address.
    async fn add_voter(&self, id: i32, address: &str) -> ControlResult<()>;

    /// Add a non-voting server. No-op when already present at that address.
    async fn add_nonvoter(&self, id: i32, address: &str) -> ControlResult<()>;

    /// Remove a server from the configuration. No-op when absent.
    async fn remove_server(&self, id: i32) -> ControlResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_queries() {
        let configuration = ClusterConfiguration {
            servers: vec![
                Server {
                    id: 1,
                    address: "127.0.0.1:9193".to_string(),
                    suffrage: ServerSuffrage::Voter,
                },
                Server {
                    id: 2,
                    address: "127.0.0.1:9194".to_string(),
                    suffrage: ServerSuffrage::Nonvoter,
                },
            ],
        };

        assert!(configuration.contains(1));
        assert!(!configuration.contains(3));
        assert_eq!(configuration.voter_ids(), vec![1]);
        assert_eq!(configuration.len(), 2);
        assert_eq!(
            configuration.server(2).unwrap().suffrage,
            ServerSuffrage::Nonvoter
        );
    }
}
