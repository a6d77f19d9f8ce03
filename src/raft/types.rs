//! Type definitions for the raft consensus layer.

use std::io::Cursor;

use openraft::BasicNode;

use crate::fsm::MetadataResponse;

/// Node ID type for raft servers. By convention this equals the broker ID.
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = Vec<u8>,
        R = MetadataResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);
