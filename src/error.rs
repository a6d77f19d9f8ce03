//! Error types for the cluster control core.
//!
//! Errors fall into a few categories with different handling policies:
//!
//! - **Transient consensus errors** (barrier/propose timeouts, not-leader):
//!   logged by the leader loop, retried on the next reconcile tick.
//! - **Per-member reconciliation errors**: logged and swallowed so one bad
//!   member cannot abort the batch.
//! - **Invariant violations**: fatal to the current leader loop. The
//!   leadership monitor keeps observing edges, so a later election can
//!   recover.
//! - **Configuration errors**: surfaced at startup or refused non-fatally
//!   during joins (e.g. two bootstrap nodes).
//!
//! No error terminates the process.

use std::time::Duration;

use thiserror::Error;

/// Result type for control plane operations.
pub type ControlResult<T> = Result<T, ControlError>;

/// Errors that can occur in the cluster control core.
#[derive(Debug, Error)]
pub enum ControlError {
    /// Error from the consensus engine (election churn, replication stall).
    #[error("consensus error: {0}")]
    Consensus(String),

    /// A proposal was submitted while this node is not the leader.
    #[error("not the cluster leader")]
    NotLeader,

    /// A bounded consensus operation did not complete in time.
    #[error("{op} timed out after {after:?}")]
    Timeout {
        op: &'static str,
        after: Duration,
    },

    /// Peer RPC failure (dial or request/response).
    #[error("peer rpc error: {0}")]
    Rpc(String),

    /// Partition failover could not be planned (e.g. no passing brokers).
    #[error("failover error: {0}")]
    Failover(String),

    /// A state invariant the controller relies on does not hold.
    /// Halts the current leader loop.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Log entry or snapshot encoding/decoding failure.
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ControlError {
    /// True when the error must halt the leader loop instead of being
    /// retried on the next tick.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ControlError::InvariantViolation(_))
    }

    /// True when retrying the operation on a later tick can succeed.
    #[inline]
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ControlError::Consensus(_)
                | ControlError::NotLeader
                | ControlError::Timeout { .. }
                | ControlError::Rpc(_)
                | ControlError::Failover(_)
                | ControlError::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(ControlError::InvariantViolation("bad".to_string()).is_fatal());
        assert!(!ControlError::NotLeader.is_fatal());
        assert!(!ControlError::Consensus("stall".to_string()).is_fatal());
    }

    #[test]
    fn test_retriable_classification() {
        assert!(ControlError::NotLeader.is_retriable());
        assert!(
            ControlError::Timeout {
                op: "barrier",
                after: Duration::from_secs(120),
            }
            .is_retriable()
        );
        assert!(ControlError::Rpc("dial".to_string()).is_retriable());
        assert!(!ControlError::Config("bad id".to_string()).is_retriable());
        assert!(!ControlError::InvariantViolation("bad".to_string()).is_retriable());
    }

    #[test]
    fn test_timeout_display() {
        let err = ControlError::Timeout {
            op: "propose",
            after: Duration::from_secs(30),
        };
        let display = format!("{}", err);
        assert!(display.contains("propose"));
        assert!(display.contains("30"));
    }

    #[test]
    fn test_codec_error_from() {
        let bad: Result<String, _> = bincode::deserialize(&[0xff, 0xff, 0xff]);
        let err: ControlError = bad.unwrap_err().into();
        assert!(matches!(err, ControlError::Codec(_)));
    }
}
