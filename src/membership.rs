//! Gossip membership types and the membership consumer task.
//!
//! The gossip engine is external; it hands the control core a stream of
//! [`Member`] lifecycle events. A member is classified as a broker when its
//! tags carry an id and the three advertised addresses. Everything else
//! (CLI sessions, observers) is ignored by the reconciler.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::lookup::BrokerLookup;

/// Tag carrying the broker ID (parseable as i32).
pub const TAG_ID: &str = "id";
/// Tag carrying the raft endpoint.
pub const TAG_RAFT_ADDR: &str = "raft_addr";
/// Tag carrying the gossip LAN endpoint.
pub const TAG_SERF_LAN_ADDR: &str = "serf_lan_addr";
/// Tag carrying the broker RPC endpoint.
pub const TAG_BROKER_ADDR: &str = "broker_addr";
/// Optional tag marking the cluster's bootstrap node.
pub const TAG_BOOTSTRAP: &str = "bootstrap";
/// Optional tag requesting a non-voting consensus seat.
pub const TAG_NON_VOTER: &str = "non_voter";

/// Lifecycle status of a gossip member.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MemberStatus {
    Alive,
    Failed,
    Left,
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberStatus::Alive => write!(f, "alive"),
            MemberStatus::Failed => write!(f, "failed"),
            MemberStatus::Left => write!(f, "left"),
        }
    }
}

/// A gossip member as delivered by the membership engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Member {
    pub name: String,
    pub status: MemberStatus,
    pub tags: HashMap<String, String>,
}

/// Broker identity derived from a member's tags.
///
/// Not replicated; re-derived on every membership event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMetadata {
    pub id: i32,
    pub name: String,
    pub broker_addr: String,
    pub raft_addr: String,
    pub serf_lan_addr: String,
    pub bootstrap: bool,
    pub non_voter: bool,
}

impl BrokerMetadata {
    /// Classify a member as a broker. Returns `None` when any required tag
    /// is missing or the id does not parse.
    pub fn from_member(member: &Member) -> Option<Self> {
        let id = member.tags.get(TAG_ID)?.parse::<i32>().ok()?;
        Some(Self {
            id,
            name: member.name.clone(),
            broker_addr: member.tags.get(TAG_BROKER_ADDR)?.clone(),
            raft_addr: member.tags.get(TAG_RAFT_ADDR)?.clone(),
            serf_lan_addr: member.tags.get(TAG_SERF_LAN_ADDR)?.clone(),
            bootstrap: member.tags.contains_key(TAG_BOOTSTRAP),
            non_voter: member.tags.contains_key(TAG_NON_VOTER),
        })
    }
}

/// The latest observed state of every gossip member, keyed by name.
///
/// Written by the membership consumer; read by the reconciler for full
/// sweeps and by `join_cluster` for the bootstrap uniqueness check.
#[derive(Default)]
pub struct MembershipView {
    members: RwLock<HashMap<String, Member>>,
}

impl MembershipView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest state of a member.
    pub fn observe(&self, member: Member) {
        self.members
            .write()
            .expect("membership view lock poisoned")
            .insert(member.name.clone(), member);
    }

    /// A snapshot of all known members.
    pub fn members(&self) -> Vec<Member> {
        self.members
            .read()
            .expect("membership view lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members
            .read()
            .expect("membership view lock poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the membership consumer.
///
/// Applies each event to the view and the broker lookup, then forwards it
/// to the leader loop's bounded channel. The forward never blocks: when the
/// channel is full the event is dropped and the next periodic reconcile
/// picks the member up again.
pub fn spawn_membership_consumer(
    view: Arc<MembershipView>,
    lookup: Arc<BrokerLookup>,
    reconcile_tx: mpsc::Sender<Member>,
    mut events: mpsc::Receiver<Member>,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(member) = event else { return };
                    trace!(member = %member.name, status = %member.status, "membership event");
                    view.observe(member.clone());
                    match member.status {
                        MemberStatus::Alive => {
                            if let Some(broker) = BrokerMetadata::from_member(&member) {
                                lookup.insert(broker);
                            }
                        }
                        MemberStatus::Failed | MemberStatus::Left => {
                            if let Some(broker) = BrokerMetadata::from_member(&member) {
                                lookup.remove(broker.id);
                            }
                        }
                    }
                    if let Err(mpsc::error::TrySendError::Full(dropped)) =
                        reconcile_tx.try_send(member)
                    {
                        debug!(
                            member = %dropped.name,
                            "reconcile channel full, dropping membership event"
                        );
                    }
                }
                _ = shutdown.recv() => return,
            }
        }
    })
}
