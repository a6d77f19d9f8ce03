//! Raft consensus layer.
//!
//! Production implementation of the [`Consensus`](crate::consensus::Consensus)
//! contract: an embedded openraft node with framed TCP transport and
//! object-store snapshot persistence. The metadata FSM it applies entries
//! to lives in [`crate::fsm`]; the controller drives it through the trait.

mod network;
mod node;
mod store;
mod types;

pub use network::{RaftNetworkFactoryImpl, RaftRpcMessage, RaftRpcResponse, RaftRpcServer};
pub use node::RaftConsensus;
pub use store::RaftStore;
pub use types::{RaftNodeId, TypeConfig};
