//! Network transport for raft RPC between controller nodes.
//!
//! Framed TCP with bincode payloads: one request frame, one response frame
//! per connection. The controller only proposes while it is the leader, so
//! there is no client-write forwarding here; a proposal on a non-leader
//! surfaces as a transient error and the next reconcile tick retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{BasicNode, Raft};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::types::{RaftNodeId, TypeConfig};
use crate::protocol::{read_frame, write_frame};

/// Timeout for RPC connection establishment.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single RPC exchange.
const RPC_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Message types for raft RPC.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
}

/// Response types for raft RPC.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<RaftNodeId>),
    Vote(VoteResponse<RaftNodeId>),
    InstallSnapshot(InstallSnapshotResponse<RaftNodeId>),
    /// The remote raft rejected the request.
    Error(String),
}

/// Factory creating per-target connections for the raft core.
pub struct RaftNetworkFactoryImpl {
    addrs: Arc<RwLock<BTreeMap<RaftNodeId, String>>>,
}

impl RaftNetworkFactoryImpl {
    pub fn new() -> Self {
        Self {
            addrs: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }

    /// Record a peer's raft address.
    pub async fn add_node(&self, node_id: RaftNodeId, addr: String) {
        self.addrs.write().await.insert(node_id, addr);
    }

    pub async fn get_node_addr(&self, node_id: RaftNodeId) -> Option<String> {
        self.addrs.read().await.get(&node_id).cloned()
    }
}

impl Default for RaftNetworkFactoryImpl {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for RaftNetworkFactoryImpl {
    fn clone(&self) -> Self {
        Self {
            addrs: self.addrs.clone(),
        }
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkFactoryImpl {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, target: RaftNodeId, node: &BasicNode) -> Self::Network {
        // The membership entry carries the authoritative address; keep the
        // factory map in sync for diagnostics.
        self.addrs.write().await.insert(target, node.addr.clone());
        RaftNetworkConnection {
            target,
            addr: node.addr.clone(),
        }
    }
}

/// One logical connection to a raft peer. Dials per request.
pub struct RaftNetworkConnection {
    target: RaftNodeId,
    addr: String,
}

impl RaftNetworkConnection {
    async fn exchange(&self, message: RaftRpcMessage) -> Result<RaftRpcResponse, NetworkError> {
        let mut stream = timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(&self.addr))
            .await
            .map_err(|e| NetworkError::new(&e))?
            .map_err(|e| NetworkError::new(&e))?;

        timeout(RPC_OPERATION_TIMEOUT, async {
            write_frame(&mut stream, &message).await?;
            read_frame::<_, RaftRpcResponse>(&mut stream).await
        })
        .await
        .map_err(|e| NetworkError::new(&e))?
        .map_err(|e| NetworkError::new(&e))
    }
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        AppendEntriesResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>,
    > {
        match self
            .exchange(RaftRpcMessage::AppendEntries(rpc))
            .await
            .map_err(RPCError::Network)?
        {
            RaftRpcResponse::AppendEntries(response) => Ok(response),
            RaftRpcResponse::Error(message) => {
                debug!(target = self.target, %message, "append entries rejected");
                Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
                    message,
                ))))
            }
            other => Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
                format!("unexpected response: {other:?}"),
            )))),
        }
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        match self
            .exchange(RaftRpcMessage::Vote(rpc))
            .await
            .map_err(RPCError::Network)?
        {
            RaftRpcResponse::Vote(response) => Ok(response),
            RaftRpcResponse::Error(message) => Err(RPCError::Network(NetworkError::new(
                &std::io::Error::other(message),
            ))),
            other => Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
                format!("unexpected response: {other:?}"),
            )))),
        }
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        match self
            .exchange(RaftRpcMessage::InstallSnapshot(rpc))
            .await
            .map_err(RPCError::Network)?
        {
            RaftRpcResponse::InstallSnapshot(response) => Ok(response),
            RaftRpcResponse::Error(message) => Err(RPCError::Network(NetworkError::new(
                &std::io::Error::other(message),
            ))),
            other => Err(RPCError::Network(NetworkError::new(&std::io::Error::other(
                format!("unexpected response: {other:?}"),
            )))),
        }
    }
}

/// Accept loop serving raft RPC for the local node.
pub struct RaftRpcServer {
    raft: Arc<Raft<TypeConfig>>,
    addr: String,
}

impl RaftRpcServer {
    pub fn new(raft: Arc<Raft<TypeConfig>>, addr: String) -> Self {
        Self { raft, addr }
    }

    pub async fn run(self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.addr).await?;
        info!(addr = %self.addr, "raft rpc server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let raft = self.raft.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(raft, stream).await {
                    debug!(peer = %peer, error = %e, "raft rpc connection closed with error");
                }
            });
        }
    }
}

async fn handle_connection(
    raft: Arc<Raft<TypeConfig>>,
    mut stream: TcpStream,
) -> Result<(), std::io::Error> {
    let message: RaftRpcMessage = match read_frame(&mut stream).await {
        Ok(message) => message,
        Err(e) => return Err(std::io::Error::other(e.to_string())),
    };

    let response = match message {
        RaftRpcMessage::AppendEntries(rpc) => match raft.append_entries(rpc).await {
            Ok(response) => RaftRpcResponse::AppendEntries(response),
            Err(e) => RaftRpcResponse::Error(e.to_string()),
        },
        RaftRpcMessage::Vote(rpc) => match raft.vote(rpc).await {
            Ok(response) => RaftRpcResponse::Vote(response),
            Err(e) => RaftRpcResponse::Error(e.to_string()),
        },
        RaftRpcMessage::InstallSnapshot(rpc) => match raft.install_snapshot(rpc).await {
            Ok(response) => RaftRpcResponse::InstallSnapshot(response),
            Err(e) => {
                warn!(error = %e, "install snapshot failed");
                RaftRpcResponse::Error(e.to_string())
            }
        },
    };

    write_frame(&mut stream, &response)
        .await
        .map_err(|e| std::io::Error::other(e.to_string()))
}
