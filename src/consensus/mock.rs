//! In-memory mock consensus for testing.
//!
//! Applies proposals straight to the FSM through the same encode/decode
//! path production uses, tracks a local cluster configuration, and records
//! every membership change so tests can assert on the exact sequence of
//! engine calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use super::{ClusterConfiguration, Consensus, Server, ServerSuffrage};
use crate::error::ControlResult;
use crate::fsm::{MetadataFsm, MetadataRequest, MetadataResponse};

/// A recorded membership change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipCall {
    AddVoter { id: i32, address: String },
    AddNonvoter { id: i32, address: String },
    RemoveServer { id: i32 },
}

/// In-memory [`Consensus`] implementation.
pub struct MockConsensus {
    fsm: Arc<MetadataFsm>,
    configuration: RwLock<ClusterConfiguration>,
    calls: Mutex<Vec<MembershipCall>>,
    barrier_count: AtomicU64,
}

impl MockConsensus {
    pub fn new(fsm: Arc<MetadataFsm>) -> Self {
        Self {
            fsm,
            configuration: RwLock::new(ClusterConfiguration::default()),
            calls: Mutex::new(Vec::new()),
            barrier_count: AtomicU64::new(0),
        }
    }

    /// Seed the configuration, e.g. with the bootstrap server.
    pub fn with_voter(self, id: i32, address: &str) -> Self {
        {
            let mut configuration = self
                .configuration
                .try_write()
                .expect("configuration uncontended during setup");
            configuration.servers.push(Server {
                id,
                address: address.to_string(),
                suffrage: ServerSuffrage::Voter,
            });
        }
        self
    }

    /// Every membership change recorded so far, in call order.
    pub async fn membership_calls(&self) -> Vec<MembershipCall> {
        self.calls.lock().await.clone()
    }

    /// How many times the apply barrier was awaited.
    pub fn barrier_count(&self) -> u64 {
        self.barrier_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Consensus for MockConsensus {
    async fn propose(&self, request: MetadataRequest) -> ControlResult<MetadataResponse> {
        // Exercise the wire codec exactly like the production log path.
        let encoded = request.encode()?;
        let decoded = MetadataRequest::decode(&encoded)?;
        Ok(self.fsm.apply(decoded).await)
    }

    async fn barrier(&self, _wait: Duration) -> ControlResult<()> {
        self.barrier_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn configuration(&self) -> ControlResult<ClusterConfiguration> {
        Ok(self.configuration.read().await.clone())
    }

    async fn add_voter(&self, id: i32, address: &str) -> ControlResult<()> {
        let mut configuration = self.configuration.write().await;
        if let Some(server) = configuration.server(id) {
            if server.suffrage == ServerSuffrage::Voter && server.address == address {
                return Ok(());
            }
        }
        self.calls.lock().await.push(MembershipCall::AddVoter {
            id,
            address: address.to_string(),
        });
        configuration.servers.retain(|s| s.id != id);
        configuration.servers.push(Server {
            id,
            address: address.to_string(),
            suffrage: ServerSuffrage::Voter,
        });
        Ok(())
    }

    async fn add_nonvoter(&self, id: i32, address: &str) -> ControlResult<()> {
        let mut configuration = self.configuration.write().await;
        if let Some(server) = configuration.server(id) {
            if server.address == address {
                return Ok(());
            }
        }
        self.calls.lock().await.push(MembershipCall::AddNonvoter {
            id,
            address: address.to_string(),
        });
        configuration.servers.retain(|s| s.id != id);
        configuration.servers.push(Server {
            id,
            address: address.to_string(),
            suffrage: ServerSuffrage::Nonvoter,
        });
        Ok(())
    }

    async fn remove_server(&self, id: i32) -> ControlResult<()> {
        let mut configuration = self.configuration.write().await;
        if !configuration.contains(id) {
            return Ok(());
        }
        self.calls
            .lock()
            .await
            .push(MembershipCall::RemoveServer { id });
        configuration.servers.retain(|s| s.id != id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::{DeregisterNodeRequest, HealthCheck, Node, RegisterNodeRequest};

    #[tokio::test]
    async fn test_propose_applies_to_fsm() {
        let fsm = Arc::new(MetadataFsm::new());
        let consensus = MockConsensus::new(fsm.clone());

        let response = consensus
            .propose(MetadataRequest::RegisterNode(RegisterNodeRequest {
                node: Node {
                    id: 1,
                    address: "127.0.0.1:9092".to_string(),
                    meta: Default::default(),
                    check: HealthCheck::alive(1),
                },
            }))
            .await
            .unwrap();

        assert_eq!(response, MetadataResponse::NodeRegistered { node_id: 1 });
        assert!(fsm.state().await.get_node(1).is_some());

        consensus
            .propose(MetadataRequest::DeregisterNode(DeregisterNodeRequest {
                node_id: 1,
            }))
            .await
            .unwrap();
        assert!(fsm.state().await.get_node(1).is_none());
    }

    #[tokio::test]
    async fn test_membership_ops_are_idempotent() {
        let consensus =
            MockConsensus::new(Arc::new(MetadataFsm::new())).with_voter(1, "127.0.0.1:9193");

        consensus.add_voter(1, "127.0.0.1:9193").await.unwrap();
        assert!(consensus.membership_calls().await.is_empty());

        consensus.add_voter(2, "127.0.0.1:9194").await.unwrap();
        consensus.add_voter(2, "127.0.0.1:9194").await.unwrap();
        consensus.add_nonvoter(3, "127.0.0.1:9195").await.unwrap();
        consensus.remove_server(9).await.unwrap();

        assert_eq!(
            consensus.membership_calls().await,
            vec![
                MembershipCall::AddVoter {
                    id: 2,
                    address: "127.0.0.1:9194".to_string()
                },
                MembershipCall::AddNonvoter {
                    id: 3,
                    address: "127.0.0.1:9195".to_string()
                },
            ]
        );

        let configuration = consensus.configuration().await.unwrap();
        assert_eq!(configuration.voter_ids(), vec![1, 2]);
        assert_eq!(configuration.len(), 3);
    }
}
