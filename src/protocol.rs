//! Broker-to-broker control RPC: LeaderAndISR.
//!
//! After a partition failover the controller notifies every passing broker
//! of the new leader and ISR assignments. Requests travel over TCP as
//! length-prefixed bincode frames.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::error::{ControlError, ControlResult};

/// Timeout for establishing a peer connection.
pub const PEER_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeout for a single request/response exchange.
pub const PEER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// New leader and ISR assignment for one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionState {
    pub topic: String,
    pub partition: i32,
    pub leader: i32,
    pub isr: Vec<i32>,
    pub replicas: Vec<i32>,
    /// Reserved, 0 in v1.
    pub controller_epoch: i32,
    /// Reserved, 0 in v1.
    pub leader_epoch: i32,
    /// Reserved, 0 in v1.
    pub zk_version: i32,
}

/// A live partition leader endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LiveLeader {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

/// Leader/ISR reassignments broadcast by the controller after failover.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderAndIsrRequest {
    pub controller_id: i32,
    /// Reserved, 0 in v1.
    pub controller_epoch: i32,
    pub partition_states: Vec<PartitionState>,
    /// Reserved, empty in v1.
    pub live_leaders: Vec<LiveLeader>,
}

/// Acknowledgement of a LeaderAndISR request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LeaderAndIsrResponse {
    pub error_code: i16,
}

impl LeaderAndIsrResponse {
    pub fn ok() -> Self {
        Self { error_code: 0 }
    }
}

/// Write a length-prefixed bincode frame.
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> ControlResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(message)?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(ControlError::Rpc(format!(
            "frame of {} bytes exceeds maximum {}",
            payload.len(),
            MAX_FRAME_SIZE
        )));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-prefixed bincode frame.
pub async fn read_frame<R, T>(reader: &mut R) -> ControlResult<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = reader.read_u32().await?;
    if len > MAX_FRAME_SIZE {
        return Err(ControlError::Rpc(format!(
            "frame of {len} bytes exceeds maximum {MAX_FRAME_SIZE}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(bincode::deserialize(&payload)?)
}

/// Transport seam for controller-to-broker RPC.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Deliver a LeaderAndISR request to the broker at `addr`.
    async fn leader_and_isr(
        &self,
        addr: &str,
        request: &LeaderAndIsrRequest,
    ) -> ControlResult<LeaderAndIsrResponse>;
}

/// TCP implementation of [`PeerClient`].
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpPeerClient {
    pub fn new() -> Self {
        Self {
            connect_timeout: PEER_CONNECT_TIMEOUT,
            request_timeout: PEER_REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeouts(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl Default for TcpPeerClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn leader_and_isr(
        &self,
        addr: &str,
        request: &LeaderAndIsrRequest,
    ) -> ControlResult<LeaderAndIsrResponse> {
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ControlError::Rpc(format!("connect to {addr} timed out")))?
            .map_err(|e| ControlError::Rpc(format!("connect to {addr} failed: {e}")))?;

        timeout(self.request_timeout, async {
            write_frame(&mut stream, request).await?;
            read_frame(&mut stream).await
        })
        .await
        .map_err(|_| ControlError::Rpc(format!("leader and isr request to {addr} timed out")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request() -> LeaderAndIsrRequest {
        LeaderAndIsrRequest {
            controller_id: 2,
            controller_epoch: 0,
            partition_states: vec![PartitionState {
                topic: "events".to_string(),
                partition: 0,
                leader: 2,
                isr: vec![2, 3],
                replicas: vec![2, 3],
                controller_epoch: 0,
                leader_epoch: 0,
                zk_version: 0,
            }],
            live_leaders: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let request = sample_request();

        write_frame(&mut client, &request).await.unwrap();
        let received: LeaderAndIsrRequest = read_frame(&mut server).await.unwrap();
        assert_eq!(received, request);

        write_frame(&mut server, &LeaderAndIsrResponse::ok())
            .await
            .unwrap();
        let response: LeaderAndIsrResponse = read_frame(&mut client).await.unwrap();
        assert_eq!(response.error_code, 0);
    }

    #[tokio::test]
    async fn test_read_frame_rejects_oversized_length() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(u32::MAX).await.unwrap();

        let result: ControlResult<LeaderAndIsrRequest> = read_frame(&mut server).await;
        assert!(matches!(result, Err(ControlError::Rpc(_))));
    }

    #[tokio::test]
    async fn test_connect_failure_is_rpc_error() {
        // Nothing listens on this port.
        let client = TcpPeerClient::with_timeouts(
            Duration::from_millis(500),
            Duration::from_millis(500),
        );
        let result = client
            .leader_and_isr("127.0.0.1:1", &sample_request())
            .await;
        assert!(matches!(result, Err(ControlError::Rpc(_))));
    }
}
