//! The controller: leadership monitoring and the leader loop.
//!
//! Exactly one node in the cluster, the consensus leader, acts as the
//! controller. The leadership monitor watches the engine's leadership edge
//! channel and starts or stops the leader loop; the loop reconciles gossip
//! membership against the replicated metadata and plans partition failover
//! when brokers die.

mod failover;
mod leader;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::ControllerConfig;
use crate::consensus::Consensus;
use crate::fsm::MetadataFsm;
use crate::lookup::BrokerLookup;
use crate::membership::{self, Member, MembershipView};
use crate::protocol::PeerClient;

/// Per-process leadership flags.
///
/// `consistent_read_ready` implies `is_leader`: readiness is set only after
/// the leader loop passes its post-election barrier, and cleared on every
/// exit path from the loop.
#[derive(Default)]
pub struct LeadershipState {
    is_leader: AtomicBool,
    consistent_read_ready: AtomicBool,
}

impl LeadershipState {
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    pub fn consistent_read_ready(&self) -> bool {
        self.consistent_read_ready.load(Ordering::Acquire)
    }

    fn set_leader(&self, is_leader: bool) {
        self.is_leader.store(is_leader, Ordering::Release);
    }

    fn set_read_ready(&self) {
        self.consistent_read_ready.store(true, Ordering::Release);
    }

    fn reset_read_ready(&self) {
        self.consistent_read_ready.store(false, Ordering::Release);
    }
}

/// The cluster controller for one broker process.
pub struct Controller {
    pub(crate) config: ControllerConfig,
    pub(crate) fsm: Arc<MetadataFsm>,
    pub(crate) consensus: Arc<dyn Consensus>,
    pub(crate) peers: Arc<dyn PeerClient>,
    pub(crate) membership: Arc<MembershipView>,
    pub(crate) lookup: Arc<BrokerLookup>,
    pub(crate) leadership: LeadershipState,
    reconcile_tx: mpsc::Sender<Member>,
    /// Held exclusively by the live leader loop; the monitor serializes
    /// loop lifetimes, so the lock is never contended.
    pub(crate) reconcile_rx: Mutex<mpsc::Receiver<Member>>,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        fsm: Arc<MetadataFsm>,
        consensus: Arc<dyn Consensus>,
        peers: Arc<dyn PeerClient>,
    ) -> Arc<Self> {
        let (reconcile_tx, reconcile_rx) = mpsc::channel(config.reconcile_queue_depth);
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            config,
            fsm,
            consensus,
            peers,
            membership: Arc::new(MembershipView::new()),
            lookup: Arc::new(BrokerLookup::new()),
            leadership: LeadershipState::default(),
            reconcile_tx,
            reconcile_rx: Mutex::new(reconcile_rx),
            shutdown_tx,
        })
    }

    /// Start the controller's long-lived tasks: the membership consumer
    /// fed by `member_events` and the leadership monitor fed by
    /// `leadership_changes`.
    pub fn start(
        self: Arc<Self>,
        member_events: mpsc::Receiver<Member>,
        leadership_changes: mpsc::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let consumer = membership::spawn_membership_consumer(
            self.membership.clone(),
            self.lookup.clone(),
            self.reconcile_tx.clone(),
            member_events,
            self.shutdown_tx.subscribe(),
        );
        let monitor = tokio::spawn(self.clone().monitor_leadership(leadership_changes));
        vec![consumer, monitor]
    }

    /// Signal every controller task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn fsm(&self) -> &Arc<MetadataFsm> {
        &self.fsm
    }

    pub fn membership(&self) -> &Arc<MembershipView> {
        &self.membership
    }

    pub fn broker_lookup(&self) -> &Arc<BrokerLookup> {
        &self.lookup
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Whether the leader has passed its post-election barrier and is safe
    /// to serve consistent reads.
    pub fn consistent_read_ready(&self) -> bool {
        self.leadership.consistent_read_ready()
    }

    /// The leadership monitor. Single long-lived task; leader loop creation
    /// and teardown are serialized here, so two loops never run at once.
    async fn monitor_leadership(self: Arc<Self>, mut notify: mpsc::Receiver<bool>) {
        let mut leader_task: Option<(CancellationToken, JoinHandle<()>)> = None;
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                edge = notify.recv() => match edge {
                    Some(true) => {
                        if leader_task.is_some() {
                            error!("attempted to start the leader loop while running");
                            continue;
                        }
                        let stop = CancellationToken::new();
                        self.leadership.set_leader(true);
                        let handle = tokio::spawn(self.clone().leader_loop(stop.clone()));
                        leader_task = Some((stop, handle));
                        info!("cluster leadership acquired");
                    }
                    Some(false) => {
                        let Some((stop, handle)) = leader_task.take() else {
                            error!("attempted to stop the leader loop while not running");
                            continue;
                        };
                        debug!("shutting down leader loop");
                        stop.cancel();
                        if let Err(e) = handle.await {
                            error!(error = %e, "leader loop task failed");
                        }
                        self.leadership.set_leader(false);
                        info!("cluster leadership lost");
                    }
                    None => return,
                },
                _ = shutdown.recv() => return,
            }
        }
    }
}
