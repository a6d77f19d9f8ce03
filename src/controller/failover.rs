//! Partition leader failover planning.
//!
//! When a broker fails, every partition it led is reassigned to a passing
//! broker, the trimmed assignment is proposed to the replicated log, and a
//! single LeaderAndISR request carrying all reassignments is broadcast to
//! the passing set.

use tracing::info;

use super::Controller;
use crate::error::{ControlError, ControlResult};
use crate::fsm::{HealthStatus, MetadataRequest, Partition, RegisterPartitionRequest};
use crate::protocol::{LeaderAndIsrRequest, PartitionState};

impl Controller {
    /// Reassign leadership for every partition led by `failed_id`.
    ///
    /// Aborts on the first error; the next reconcile tick retries. An
    /// empty passing set fails the whole operation. A passing broker
    /// missing from the lookup is an invariant violation and halts the
    /// leader loop.
    pub(super) async fn failover_partitions(&self, failed_id: i32) -> ControlResult<()> {
        let state = self.fsm.state().await;

        let partitions = state.partitions_by_leader(failed_id);
        if partitions.is_empty() {
            return Ok(());
        }

        let passing: Vec<_> = state
            .nodes()
            .into_iter()
            .filter(|n| n.check.status == HealthStatus::Passing && n.id != failed_id)
            .collect();

        let mut request = LeaderAndIsrRequest {
            controller_id: self.config.id,
            controller_epoch: 0,
            partition_states: Vec::with_capacity(partitions.len()),
            live_leaders: Vec::new(),
        };

        for partition in partitions {
            if passing.is_empty() {
                return Err(ControlError::Failover(format!(
                    "no passing brokers available to lead {}/{}",
                    partition.topic, partition.partition_id
                )));
            }

            // Deterministic rotation keyed by partition id stands in for
            // uniform random selection.
            let pick = partition.partition_id.rem_euclid(passing.len() as i32) as usize;
            let new_leader = passing[pick].id;

            let ar: Vec<i32> = partition
                .ar
                .iter()
                .copied()
                .filter(|r| *r != failed_id)
                .collect();
            let isr: Vec<i32> = partition
                .isr
                .iter()
                .copied()
                .filter(|r| *r != failed_id)
                .collect();

            self.consensus
                .propose(MetadataRequest::RegisterPartition(
                    RegisterPartitionRequest {
                        partition: Partition {
                            topic: partition.topic.clone(),
                            partition_id: partition.partition_id,
                            leader: new_leader,
                            ar: ar.clone(),
                            isr: isr.clone(),
                        },
                    },
                ))
                .await?;

            request.partition_states.push(PartitionState {
                topic: partition.topic.clone(),
                partition: partition.partition_id,
                leader: new_leader,
                isr,
                replicas: ar,
                controller_epoch: 0,
                leader_epoch: 0,
                zk_version: 0,
            });
        }

        for node in &passing {
            let Some(broker) = self.lookup.get(node.id) else {
                return Err(ControlError::InvariantViolation(format!(
                    "passing node {} missing from broker lookup",
                    node.id
                )));
            };
            self.peers
                .leader_and_isr(&broker.broker_addr, &request)
                .await?;
        }

        info!(
            failed_node = failed_id,
            partitions = request.partition_states.len(),
            notified_brokers = passing.len(),
            "reassigned partition leadership"
        );
        Ok(())
    }
}
