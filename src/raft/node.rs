//! The openraft-backed consensus adapter.
//!
//! Wraps the raft engine behind the [`Consensus`] contract: encode and
//! submit proposals, wait on the apply barrier, and manage the
//! voter/non-voter set. Also sources the leadership edge channel the
//! leadership monitor consumes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use object_store::ObjectStore;
use openraft::storage::Adaptor;
use openraft::{BasicNode, ChangeMembers, Raft};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{error, info, warn};

use super::network::{RaftNetworkFactoryImpl, RaftRpcServer};
use super::store::RaftStore;
use super::types::{RaftNodeId, TypeConfig};
use crate::config::ControllerConfig;
use crate::consensus::{ClusterConfiguration, Consensus, Server, ServerSuffrage};
use crate::error::{ControlError, ControlResult};
use crate::fsm::{MetadataFsm, MetadataRequest, MetadataResponse};

/// Production [`Consensus`] implementation over openraft.
pub struct RaftConsensus {
    raft: Arc<Raft<TypeConfig>>,
    network: RaftNetworkFactoryImpl,
    node_id: RaftNodeId,
    raft_addr: String,
    propose_timeout: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

fn consensus_error(e: impl std::fmt::Display) -> ControlError {
    ControlError::Consensus(e.to_string())
}

impl RaftConsensus {
    /// Create and start a raft node applying committed entries to `fsm`.
    ///
    /// Restores any persisted snapshot and starts the RPC server. When
    /// `bootstrap` is set and no prior state exists, submits the initial
    /// single-server configuration.
    pub async fn new(config: &ControllerConfig, fsm: Arc<MetadataFsm>) -> ControlResult<Self> {
        config
            .validate()
            .map_err(|errors| ControlError::Config(errors.join(", ")))?;

        let object_store: Arc<dyn ObjectStore> = if config.dev_mode {
            Arc::new(object_store::memory::InMemory::new())
        } else {
            let raft_dir = config.data_dir.join("raft");
            std::fs::create_dir_all(&raft_dir)?;
            Arc::new(
                object_store::local::LocalFileSystem::new_with_prefix(&raft_dir)
                    .map_err(|e| ControlError::Config(e.to_string()))?,
            )
        };

        let store = RaftStore::new(
            fsm,
            object_store,
            &format!("snapshots/node-{}", config.id),
        );
        match store.load_snapshot_from_store().await {
            Ok(true) => info!(node_id = config.id, "restored state from snapshot"),
            Ok(false) => info!(node_id = config.id, "no existing snapshot, starting fresh"),
            Err(e) => {
                warn!(
                    node_id = config.id,
                    error = %e,
                    "failed to load snapshot, starting with empty state"
                );
            }
        }

        let network = RaftNetworkFactoryImpl::new();
        let (log_store, sm_store) = Adaptor::new(store);

        let node_id = config.id as RaftNodeId;
        let raft = Raft::new(
            node_id,
            Arc::new(config.to_openraft_config()),
            network.clone(),
            log_store,
            sm_store,
        )
        .await
        .map_err(|e| ControlError::Config(format!("failed to create raft node: {e}")))?;
        let raft = Arc::new(raft);

        let (shutdown_tx, _) = broadcast::channel(1);

        let rpc_server = RaftRpcServer::new(raft.clone(), config.raft_addr.clone());
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                result = rpc_server.run() => {
                    if let Err(e) = result {
                        error!(error = %e, "raft rpc server error");
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("raft rpc server shutting down");
                }
            }
        });

        let node = Self {
            raft,
            network,
            node_id,
            raft_addr: config.raft_addr.clone(),
            propose_timeout: config.propose_timeout,
            shutdown_tx,
        };

        if config.bootstrap && !node.is_initialized() {
            node.initialize().await?;
        }

        info!(
            node_id = config.id,
            raft_addr = %config.raft_addr,
            dev_mode = config.dev_mode,
            "raft node started"
        );
        Ok(node)
    }

    /// Whether the cluster already has a membership (restored snapshot or
    /// a previous initialization).
    pub fn is_initialized(&self) -> bool {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        metrics
            .membership_config
            .membership()
            .voter_ids()
            .next()
            .is_some()
    }

    /// Submit the initial single-server configuration containing only this
    /// node. Other nodes join dynamically through the controller.
    async fn initialize(&self) -> ControlResult<()> {
        let members = BTreeMap::from([(
            self.node_id,
            BasicNode {
                addr: self.raft_addr.clone(),
            },
        )]);
        self.raft
            .initialize(members)
            .await
            .map_err(|e| ControlError::Consensus(format!("failed to bootstrap cluster: {e}")))?;
        info!(node_id = self.node_id, "cluster bootstrapped as single node");
        Ok(())
    }

    /// Leadership edge notifications: `true` when this node becomes
    /// leader, `false` when it steps down. Buffered like the engine's
    /// notify channel so a slow consumer coalesces into the latest edge.
    pub fn leadership_changes(&self) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel(1);
        let mut metrics = self.raft.metrics();
        let node_id = self.node_id;
        let mut shutdown = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut was_leader = false;
            loop {
                let is_leader = metrics.borrow_and_update().current_leader == Some(node_id);
                if is_leader != was_leader {
                    was_leader = is_leader;
                    if tx.send(is_leader).await.is_err() {
                        return;
                    }
                }
                tokio::select! {
                    changed = metrics.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    _ = shutdown.recv() => return,
                }
            }
        });

        rx
    }

    /// The current leader's node ID, if any is known.
    pub fn current_leader(&self) -> Option<RaftNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Whether this node is currently the leader.
    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    pub fn node_id(&self) -> RaftNodeId {
        self.node_id
    }

    /// Shut down the raft node and its RPC server.
    pub async fn shutdown(&self) -> ControlResult<()> {
        let _ = self.shutdown_tx.send(());
        self.raft
            .shutdown()
            .await
            .map_err(|e| ControlError::Consensus(format!("failed to shut down raft: {e}")))?;
        info!(node_id = self.node_id, "raft node shut down");
        Ok(())
    }

    fn read_configuration(&self) -> ClusterConfiguration {
        let metrics = self.raft.metrics();
        let metrics = metrics.borrow();
        let membership = metrics.membership_config.membership();
        let voters: BTreeSet<RaftNodeId> = membership.voter_ids().collect();
        let servers = membership
            .nodes()
            .map(|(id, node)| Server {
                id: *id as i32,
                address: node.addr.clone(),
                suffrage: if voters.contains(id) {
                    ServerSuffrage::Voter
                } else {
                    ServerSuffrage::Nonvoter
                },
            })
            .collect();
        ClusterConfiguration { servers }
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    async fn propose(&self, request: MetadataRequest) -> ControlResult<MetadataResponse> {
        let encoded = request.encode()?;

        let result = timeout(self.propose_timeout, self.raft.client_write(encoded))
            .await
            .map_err(|_| ControlError::Timeout {
                op: "propose",
                after: self.propose_timeout,
            })?;

        match result {
            Ok(response) => Ok(response.data),
            Err(e) => {
                let message = e.to_string();
                if message.contains("forward request to") || message.contains("ForwardToLeader") {
                    Err(ControlError::NotLeader)
                } else {
                    Err(consensus_error(e))
                }
            }
        }
    }

    async fn barrier(&self, wait: Duration) -> ControlResult<()> {
        timeout(wait, self.raft.ensure_linearizable())
            .await
            .map_err(|_| ControlError::Timeout {
                op: "barrier",
                after: wait,
            })?
            .map_err(consensus_error)?;
        Ok(())
    }

    async fn configuration(&self) -> ControlResult<ClusterConfiguration> {
        Ok(self.read_configuration())
    }

    async fn add_voter(&self, id: i32, address: &str) -> ControlResult<()> {
        let configuration = self.read_configuration();
        if let Some(server) = configuration.server(id) {
            if server.suffrage == ServerSuffrage::Voter && server.address == address {
                return Ok(());
            }
        }

        let raft_id = id as RaftNodeId;
        self.network.add_node(raft_id, address.to_string()).await;
        self.raft
            .add_learner(raft_id, BasicNode::new(address), true)
            .await
            .map_err(consensus_error)?;

        let mut voters: BTreeSet<RaftNodeId> = configuration
            .voter_ids()
            .into_iter()
            .map(|v| v as RaftNodeId)
            .collect();
        voters.insert(raft_id);
        self.raft
            .change_membership(voters, false)
            .await
            .map_err(consensus_error)?;

        info!(node_id = id, address, "added raft voter");
        Ok(())
    }

    async fn add_nonvoter(&self, id: i32, address: &str) -> ControlResult<()> {
        let configuration = self.read_configuration();
        if let Some(server) = configuration.server(id) {
            if server.address == address {
                return Ok(());
            }
        }

        let raft_id = id as RaftNodeId;
        self.network.add_node(raft_id, address.to_string()).await;
        self.raft
            .add_learner(raft_id, BasicNode::new(address), true)
            .await
            .map_err(consensus_error)?;

        info!(node_id = id, address, "added raft non-voter");
        Ok(())
    }

    async fn remove_server(&self, id: i32) -> ControlResult<()> {
        let configuration = self.read_configuration();
        let Some(server) = configuration.server(id) else {
            return Ok(());
        };
        let raft_id = id as RaftNodeId;

        if server.suffrage == ServerSuffrage::Voter {
            let voters: BTreeSet<RaftNodeId> = configuration
                .voter_ids()
                .into_iter()
                .filter(|v| *v != id)
                .map(|v| v as RaftNodeId)
                .collect();
            self.raft
                .change_membership(voters, false)
                .await
                .map_err(consensus_error)?;
        } else {
            self.raft
                .change_membership(ChangeMembers::RemoveNodes(BTreeSet::from([raft_id])), false)
                .await
                .map_err(consensus_error)?;
        }

        info!(node_id = id, "removed raft server");
        Ok(())
    }
}
