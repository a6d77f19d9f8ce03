//! The leader loop and membership reconciler.
//!
//! Runs once per leadership acquisition. Each pass waits on the apply
//! barrier so the new leader never acts on stale FSM state, establishes
//! read readiness, reconciles every known member, then parks in a WAIT
//! select until the next tick or membership event.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Controller, LeadershipState};
use crate::error::ControlResult;
use crate::fsm::{
    DeregisterNodeRequest, HealthCheck, MetadataRequest, Node, RegisterNodeRequest,
};
use crate::membership::{BrokerMetadata, Member, MemberStatus, TAG_RAFT_ADDR, TAG_SERF_LAN_ADDR};

/// Clears `consistent_read_ready` on every exit path from the leader loop
/// once leadership has been established.
struct RevokeOnExit<'a> {
    leadership: &'a LeadershipState,
    armed: bool,
}

impl<'a> RevokeOnExit<'a> {
    fn new(leadership: &'a LeadershipState) -> Self {
        Self {
            leadership,
            armed: false,
        }
    }

    fn arm(&mut self) {
        self.armed = true;
    }
}

impl Drop for RevokeOnExit<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.leadership.reset_read_ready();
        }
    }
}

impl Controller {
    /// The leader loop. Returns when the stop token fires, on shutdown, or
    /// on a fatal invariant violation.
    pub(super) async fn leader_loop(self: Arc<Self>, stop: CancellationToken) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut reconcile_rx = self.reconcile_rx.lock().await;
        let mut revoke = RevokeOnExit::new(&self.leadership);
        let mut established = false;

        'reconcile: loop {
            let interval = tokio::time::sleep(self.config.reconcile_interval);
            tokio::pin!(interval);

            match self.consensus.barrier(self.config.barrier_timeout).await {
                Ok(()) => {
                    if !established {
                        self.establish_leadership();
                        established = true;
                        revoke.arm();
                    }
                    if let Err(e) = self.reconcile().await {
                        // Only invariant violations propagate this far.
                        error!(error = %e, "halting leader loop");
                        return;
                    }
                }
                Err(e) => error!(error = %e, "failed to wait for barrier"),
            }

            // WAIT: membership events are drained only once leadership is
            // established, so no member is reconciled before the barrier.
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = shutdown.recv() => return,
                    _ = &mut interval => continue 'reconcile,
                    member = reconcile_rx.recv(), if established => {
                        let Some(member) = member else { return };
                        if let Err(e) = self.reconcile_member(&member).await {
                            error!(error = %e, "halting leader loop");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn establish_leadership(&self) {
        self.leadership.set_read_ready();
        debug!("leadership established, consistent reads enabled");
    }

    /// Reconcile every currently known member.
    async fn reconcile(&self) -> ControlResult<()> {
        for member in self.membership.members() {
            self.reconcile_member(&member).await?;
        }
        Ok(())
    }

    /// Reconcile a single member. Per-member errors are logged and
    /// swallowed so one bad member cannot abort the batch; only fatal
    /// invariant violations propagate.
    async fn reconcile_member(&self, member: &Member) -> ControlResult<()> {
        let result = match member.status {
            MemberStatus::Alive => self.handle_alive_member(member).await,
            MemberStatus::Failed => self.handle_failed_member(member).await,
            MemberStatus::Left => self.handle_left_member(member).await,
        };
        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!(member = %member.name, error = %e, "failed to reconcile member");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn handle_alive_member(&self, member: &Member) -> ControlResult<()> {
        let Some(broker) = BrokerMetadata::from_member(member) else {
            return Ok(());
        };
        self.join_cluster(member, &broker).await?;

        let state = self.fsm.state().await;
        if state.get_node(broker.id).is_some() {
            // TODO: re-register to refresh the check output after a
            // failed -> alive transition instead of leaving it stale.
            return Ok(());
        }

        info!(member = %member.name, node_id = broker.id, "member joined, marking health alive");
        let request = MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: Node {
                id: broker.id,
                address: broker.broker_addr.clone(),
                meta: [
                    (TAG_RAFT_ADDR.to_string(), broker.raft_addr.clone()),
                    (TAG_SERF_LAN_ADDR.to_string(), broker.serf_lan_addr.clone()),
                    ("name".to_string(), broker.name.clone()),
                ]
                .into_iter()
                .collect(),
                check: HealthCheck::alive(broker.id),
            },
        });
        self.consensus.propose(request).await?;
        Ok(())
    }

    /// Add a joining broker to the consensus configuration.
    async fn join_cluster(&self, member: &Member, broker: &BrokerMetadata) -> ControlResult<()> {
        if broker.bootstrap {
            for other in self.membership.members() {
                if other.name == member.name {
                    continue;
                }
                if let Some(peer) = BrokerMetadata::from_member(&other) {
                    if peer.bootstrap {
                        error!(
                            member = %member.name,
                            other = %other.name,
                            "multiple nodes in bootstrap mode, there can only be one; refusing join"
                        );
                        return Ok(());
                    }
                }
            }
        }

        let configuration = self.consensus.configuration().await?;

        if member.name == self.config.node_name && configuration.len() < 3 {
            debug!(member = %member.name, "skipping self join, cluster is too small");
            return Ok(());
        }

        if broker.non_voter {
            self.consensus
                .add_nonvoter(broker.id, &broker.raft_addr)
                .await?;
        } else {
            debug!(member = %member.name, node_id = broker.id, "adding raft voter");
            self.consensus
                .add_voter(broker.id, &broker.raft_addr)
                .await?;
        }
        Ok(())
    }

    async fn handle_left_member(&self, member: &Member) -> ControlResult<()> {
        self.handle_deregister_member("left", member).await
    }

    /// Cleanly deregister a member: drop its consensus seat, then its
    /// Node record.
    async fn handle_deregister_member(
        &self,
        reason: &str,
        member: &Member,
    ) -> ControlResult<()> {
        let Some(broker) = BrokerMetadata::from_member(member) else {
            return Ok(());
        };

        if broker.id == self.config.id {
            debug!("deregistering self is done by the follower");
            return Ok(());
        }

        self.consensus.remove_server(broker.id).await?;

        let state = self.fsm.state().await;
        if state.get_node(broker.id).is_none() {
            return Ok(());
        }

        info!(node_id = broker.id, reason, "member is deregistering");
        self.consensus
            .propose(MetadataRequest::DeregisterNode(DeregisterNodeRequest {
                node_id: broker.id,
            }))
            .await?;
        Ok(())
    }

    /// Mark a failed member critical and fail its partitions over. The
    /// consensus seat is kept: the failure may be transient.
    async fn handle_failed_member(&self, member: &Member) -> ControlResult<()> {
        let Some(broker) = BrokerMetadata::from_member(member) else {
            return Ok(());
        };

        warn!(member = %member.name, node_id = broker.id, "member failed, marking health critical");
        let request = MetadataRequest::RegisterNode(RegisterNodeRequest {
            node: Node {
                id: broker.id,
                address: String::new(),
                meta: Default::default(),
                check: HealthCheck::failed(broker.id),
            },
        });
        self.consensus.propose(request).await?;

        self.failover_partitions(broker.id).await
    }
}
