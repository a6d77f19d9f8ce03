//! Replicated metadata state machine.
//!
//! The FSM holds the cluster-wide metadata the controller replicates:
//! registered broker nodes (with their membership-derived health check) and
//! topic partitions (leader, assigned replicas, in-sync replicas).
//!
//! Proposals reach the FSM as typed log entries. Apply is deterministic and
//! has no side effects beyond the store, so every replica converges on the
//! same state. Snapshots round-trip the full store as a byte stream.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{ControlError, ControlResult};

/// Check ID of the gossip-derived health check. Every registered node
/// carries exactly one check with this ID.
pub const SERF_CHECK_ID: &str = "serf-health";

/// Human-readable name of the gossip-derived health check.
pub const SERF_CHECK_NAME: &str = "Serf Health Status";

/// Check output recorded when a member is observed alive.
pub const SERF_CHECK_ALIVE_OUTPUT: &str = "Member is alive";

/// Check output recorded when a member is observed failed.
pub const SERF_CHECK_FAILED_OUTPUT: &str = "Member failed";

/// Health status of a node's membership check.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    Passing,
    Warning,
    Critical,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Passing => write!(f, "passing"),
            HealthStatus::Warning => write!(f, "warning"),
            HealthStatus::Critical => write!(f, "critical"),
        }
    }
}

/// A node's membership-derived health check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthCheck {
    pub node_id: i32,
    pub check_id: String,
    pub name: String,
    pub status: HealthStatus,
    pub output: String,
}

impl HealthCheck {
    /// The check recorded for a member observed alive.
    pub fn alive(node_id: i32) -> Self {
        Self {
            node_id,
            check_id: SERF_CHECK_ID.to_string(),
            name: SERF_CHECK_NAME.to_string(),
            status: HealthStatus::Passing,
            output: SERF_CHECK_ALIVE_OUTPUT.to_string(),
        }
    }

    /// The check recorded for a member observed failed.
    pub fn failed(node_id: i32) -> Self {
        Self {
            node_id,
            check_id: SERF_CHECK_ID.to_string(),
            name: SERF_CHECK_NAME.to_string(),
            status: HealthStatus::Critical,
            output: SERF_CHECK_FAILED_OUTPUT.to_string(),
        }
    }
}

/// A registered broker node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// Cluster-unique broker ID.
    pub id: i32,
    /// Broker RPC endpoint.
    pub address: String,
    /// Advertised metadata (`raft_addr`, `serf_lan_addr`, `name`).
    pub meta: HashMap<String, String>,
    /// The membership health check.
    pub check: HealthCheck,
}

/// A topic partition's replication assignment.
///
/// `leader` is a member of `isr` whenever `isr` is non-empty, and
/// `isr` is a subset of `ar`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Partition {
    pub topic: String,
    pub partition_id: i32,
    /// Node ID of the current partition leader.
    pub leader: i32,
    /// Assigned replicas, in assignment order.
    pub ar: Vec<i32>,
    /// In-sync replicas, in assignment order.
    pub isr: Vec<i32>,
}

/// Wire-stable type codes for replicated log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    RegisterNode = 0,
    DeregisterNode = 1,
    RegisterPartition = 2,
}

impl MessageType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(MessageType::RegisterNode),
            1 => Some(MessageType::DeregisterNode),
            2 => Some(MessageType::RegisterPartition),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterNodeRequest {
    pub node: Node,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeregisterNodeRequest {
    pub node_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterPartitionRequest {
    pub partition: Partition,
}

/// A proposal submitted to the replicated log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataRequest {
    RegisterNode(RegisterNodeRequest),
    DeregisterNode(DeregisterNodeRequest),
    RegisterPartition(RegisterPartitionRequest),
}

impl MetadataRequest {
    pub fn message_type(&self) -> MessageType {
        match self {
            MetadataRequest::RegisterNode(_) => MessageType::RegisterNode,
            MetadataRequest::DeregisterNode(_) => MessageType::DeregisterNode,
            MetadataRequest::RegisterPartition(_) => MessageType::RegisterPartition,
        }
    }

    /// Encode as a `(u8 type-tag, body)` frame for the replicated log.
    pub fn encode(&self) -> ControlResult<Vec<u8>> {
        let body = match self {
            MetadataRequest::RegisterNode(req) => bincode::serialize(req)?,
            MetadataRequest::DeregisterNode(req) => bincode::serialize(req)?,
            MetadataRequest::RegisterPartition(req) => bincode::serialize(req)?,
        };
        let mut buf = Vec::with_capacity(1 + body.len());
        buf.push(self.message_type() as u8);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    /// Decode a `(u8 type-tag, body)` frame.
    pub fn decode(buf: &[u8]) -> ControlResult<Self> {
        let (&tag, body) = buf.split_first().ok_or_else(|| {
            ControlError::InvariantViolation("empty log entry".to_string())
        })?;
        let message_type = MessageType::from_u8(tag).ok_or_else(|| {
            ControlError::InvariantViolation(format!("unknown log entry type {tag}"))
        })?;
        Ok(match message_type {
            MessageType::RegisterNode => {
                MetadataRequest::RegisterNode(bincode::deserialize(body)?)
            }
            MessageType::DeregisterNode => {
                MetadataRequest::DeregisterNode(bincode::deserialize(body)?)
            }
            MessageType::RegisterPartition => {
                MetadataRequest::RegisterPartition(bincode::deserialize(body)?)
            }
        })
    }
}

/// The response produced by applying a proposal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataResponse {
    /// Response for log entries that carry no proposal (blank or
    /// membership entries).
    Noop,
    NodeRegistered { node_id: i32 },
    NodeDeregistered { node_id: i32 },
    PartitionRegistered { topic: String, partition_id: i32 },
}

/// The in-memory metadata store the FSM applies proposals to.
///
/// Readers take a cloned snapshot via [`MetadataFsm::state`], so queries
/// here run against an immutable view and never block writers.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetadataStore {
    nodes: BTreeMap<i32, Node>,
    partitions: BTreeMap<(String, i32), Partition>,
}

impl MetadataStore {
    /// Apply a proposal. Deterministic and idempotent.
    pub fn apply(&mut self, request: MetadataRequest) -> MetadataResponse {
        match request {
            MetadataRequest::RegisterNode(req) => {
                let node_id = req.node.id;
                match self.nodes.get_mut(&node_id) {
                    Some(existing) => {
                        // A health-only registration (failed member) must
                        // not wipe the node's address and metadata.
                        if !req.node.address.is_empty() {
                            existing.address = req.node.address;
                            existing.meta = req.node.meta;
                        }
                        existing.check = req.node.check;
                    }
                    None => {
                        self.nodes.insert(node_id, req.node);
                    }
                }
                MetadataResponse::NodeRegistered { node_id }
            }
            MetadataRequest::DeregisterNode(req) => {
                self.nodes.remove(&req.node_id);
                MetadataResponse::NodeDeregistered {
                    node_id: req.node_id,
                }
            }
            MetadataRequest::RegisterPartition(req) => {
                let key = (req.partition.topic.clone(), req.partition.partition_id);
                let response = MetadataResponse::PartitionRegistered {
                    topic: req.partition.topic.clone(),
                    partition_id: req.partition.partition_id,
                };
                self.partitions.insert(key, req.partition);
                response
            }
        }
    }

    pub fn get_node(&self, id: i32) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> Vec<&Node> {
        self.nodes.values().collect()
    }

    pub fn partitions(&self) -> Vec<&Partition> {
        self.partitions.values().collect()
    }

    /// All partitions whose leader is the given node.
    pub fn partitions_by_leader(&self, id: i32) -> Vec<&Partition> {
        self.partitions.values().filter(|p| p.leader == id).collect()
    }
}

/// Async wrapper owning the store.
///
/// The raft storage layer applies committed entries through this handle;
/// the controller reads snapshots from it.
#[derive(Clone, Default)]
pub struct MetadataFsm {
    store: Arc<RwLock<MetadataStore>>,
}

impl MetadataFsm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a proposal to the store.
    pub async fn apply(&self, request: MetadataRequest) -> MetadataResponse {
        self.store.write().await.apply(request)
    }

    /// A snapshot read of the full store.
    pub async fn state(&self) -> MetadataStore {
        self.store.read().await.clone()
    }

    /// Serialize the full store for a snapshot.
    pub async fn snapshot(&self) -> ControlResult<Vec<u8>> {
        let store = self.store.read().await;
        Ok(bincode::serialize(&*store)?)
    }

    /// Replace the store from a serialized snapshot.
    pub async fn restore(&self, data: &[u8]) -> ControlResult<()> {
        let restored: MetadataStore = bincode::deserialize(data)?;
        *self.store.write().await = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i32, status: HealthStatus) -> Node {
        Node {
            id,
            address: format!("127.0.0.1:{}", 9092 + id),
            meta: HashMap::from([("name".to_string(), format!("node-{id}"))]),
            check: HealthCheck {
                node_id: id,
                check_id: SERF_CHECK_ID.to_string(),
                name: SERF_CHECK_NAME.to_string(),
                status,
                output: SERF_CHECK_ALIVE_OUTPUT.to_string(),
            },
        }
    }

    fn partition(topic: &str, id: i32, leader: i32, replicas: &[i32]) -> Partition {
        Partition {
            topic: topic.to_string(),
            partition_id: id,
            leader,
            ar: replicas.to_vec(),
            isr: replicas.to_vec(),
        }
    }

    #[test]
    fn test_register_node() {
        let mut store = MetadataStore::default();
        let response = store.apply(MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: node(1, HealthStatus::Passing),
        }));
        assert_eq!(response, MetadataResponse::NodeRegistered { node_id: 1 });

        let stored = store.get_node(1).unwrap();
        assert_eq!(stored.address, "127.0.0.1:9093");
        assert_eq!(stored.check.status, HealthStatus::Passing);
    }

    #[test]
    fn test_register_node_idempotent() {
        let mut store = MetadataStore::default();
        let request = MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: node(1, HealthStatus::Passing),
        });

        store.apply(request.clone());
        let once = store.clone();
        store.apply(request);

        assert_eq!(format!("{:?}", once), format!("{:?}", store));
    }

    #[test]
    fn test_health_only_registration_preserves_address() {
        let mut store = MetadataStore::default();
        store.apply(MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: node(1, HealthStatus::Passing),
        }));

        // Failed-member registration carries only the id and the check.
        store.apply(MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: Node {
                id: 1,
                address: String::new(),
                meta: HashMap::new(),
                check: HealthCheck::failed(1),
            },
        }));

        let stored = store.get_node(1).unwrap();
        assert_eq!(stored.address, "127.0.0.1:9093");
        assert!(!stored.meta.is_empty());
        assert_eq!(stored.check.status, HealthStatus::Critical);
        assert_eq!(stored.check.output, SERF_CHECK_FAILED_OUTPUT);
    }

    #[test]
    fn test_deregister_node() {
        let mut store = MetadataStore::default();
        store.apply(MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: node(1, HealthStatus::Passing),
        }));
        store.apply(MetadataRequest::DeregisterNode(DeregisterNodeRequest {
            node_id: 1,
        }));
        assert!(store.get_node(1).is_none());

        // Deregistering an absent node is a no-op.
        let response = store.apply(MetadataRequest::DeregisterNode(DeregisterNodeRequest {
            node_id: 1,
        }));
        assert_eq!(response, MetadataResponse::NodeDeregistered { node_id: 1 });
    }

    #[test]
    fn test_partitions_by_leader() {
        let mut store = MetadataStore::default();
        for (id, leader) in [(0, 1), (1, 2), (2, 1)] {
            store.apply(MetadataRequest::RegisterPartition(
                RegisterPartitionRequest {
                    partition: partition("events", id, leader, &[1, 2, 3]),
                },
            ));
        }

        let led_by_1 = store.partitions_by_leader(1);
        assert_eq!(led_by_1.len(), 2);
        assert!(led_by_1.iter().all(|p| p.leader == 1));
        assert!(store.partitions_by_leader(9).is_empty());
        assert_eq!(store.partitions().len(), 3);
    }

    #[test]
    fn test_register_partition_overwrites_by_key() {
        let mut store = MetadataStore::default();
        store.apply(MetadataRequest::RegisterPartition(
            RegisterPartitionRequest {
                partition: partition("events", 0, 1, &[1, 2]),
            },
        ));
        store.apply(MetadataRequest::RegisterPartition(
            RegisterPartitionRequest {
                partition: partition("events", 0, 2, &[2]),
            },
        ));

        assert_eq!(store.partitions().len(), 1);
        assert_eq!(store.partitions()[0].leader, 2);
    }

    #[test]
    fn test_codec_roundtrip_and_stable_tags() {
        let requests = [
            MetadataRequest::RegisterNode(RegisterNodeRequest {
                node: node(3, HealthStatus::Passing),
            }),
            MetadataRequest::DeregisterNode(DeregisterNodeRequest { node_id: 3 }),
            MetadataRequest::RegisterPartition(RegisterPartitionRequest {
                partition: partition("events", 0, 3, &[3]),
            }),
        ];

        for (expected_tag, request) in requests.into_iter().enumerate() {
            let encoded = request.encode().unwrap();
            assert_eq!(encoded[0], expected_tag as u8);
            let decoded = MetadataRequest::decode(&encoded).unwrap();
            assert_eq!(decoded, request);
        }
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(MetadataRequest::decode(&[]).is_err());
        assert!(MetadataRequest::decode(&[9, 0, 0]).is_err());
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip() {
        let fsm = MetadataFsm::new();
        fsm.apply(MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: node(1, HealthStatus::Passing),
        }))
        .await;
        fsm.apply(MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: node(2, HealthStatus::Critical),
        }))
        .await;
        fsm.apply(MetadataRequest::RegisterPartition(
            RegisterPartitionRequest {
                partition: partition("events", 0, 1, &[1, 2]),
            },
        ))
        .await;
        fsm.apply(MetadataRequest::DeregisterNode(DeregisterNodeRequest {
            node_id: 2,
        }))
        .await;

        let snapshot = fsm.snapshot().await.unwrap();

        let restored = MetadataFsm::new();
        restored.restore(&snapshot).await.unwrap();

        let original = fsm.state().await;
        let recovered = restored.state().await;
        assert_eq!(original.nodes(), recovered.nodes());
        assert_eq!(original.partitions(), recovered.partitions());
        assert!(recovered.get_node(2).is_none());
    }
}
