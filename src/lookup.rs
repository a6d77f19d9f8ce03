//! In-memory broker lookup keyed by raft server ID.
//!
//! Written by the membership consumer on member events; read by the
//! partition failover planner when broadcasting LeaderAndISR requests.

use dashmap::DashMap;

use crate::membership::BrokerMetadata;

/// Broker ID → transport metadata, kept consistent with membership events.
#[derive(Default)]
pub struct BrokerLookup {
    brokers: DashMap<i32, BrokerMetadata>,
}

impl BrokerLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, broker: BrokerMetadata) {
        self.brokers.insert(broker.id, broker);
    }

    pub fn remove(&self, id: i32) {
        self.brokers.remove(&id);
    }

    pub fn get(&self, id: i32) -> Option<BrokerMetadata> {
        self.brokers.get(&id).map(|b| b.value().clone())
    }

    pub fn brokers(&self) -> Vec<BrokerMetadata> {
        self.brokers.iter().map(|b| b.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
