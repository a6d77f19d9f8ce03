//! # Skipjack
//! Cluster control core for a Kafka-family distributed log broker.
//!
//! A broker cluster replicates its metadata (broker membership,
//! topic/partition assignments, leaders, in-sync replica sets) through a
//! raft-replicated state machine, and learns about broker liveness from a
//! gossip membership engine. This crate is the piece that keeps the two in
//! agreement: the elected controller reconciles the gossip view with the
//! replicated metadata, reassigns partition leadership when brokers fail,
//! and notifies surviving brokers with LeaderAndISR requests.
//!
//! ```text
//!   gossip events ──► membership consumer ──► view + broker lookup
//!                                        │
//!                                        ▼ (bounded channel)
//!   raft leadership edges ──► monitor ──► leader loop
//!                                        │  barrier → establish →
//!                                        │  reconcile (alive/failed/left)
//!                                        ▼
//!                      proposals to the metadata FSM, raft peer
//!                      add/remove, LeaderAndISR broadcasts
//! ```
//!
//! The consensus engine is consumed as a black box behind the
//! [`consensus::Consensus`] trait. The production implementation in
//! [`raft`] embeds an openraft node with TCP transport and object-store
//! snapshot persistence; tests run the controller against the in-memory
//! mock in `consensus::mock`.
//!
//! # Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use skipjack::config::ControllerConfig;
//! use skipjack::controller::Controller;
//! use skipjack::fsm::MetadataFsm;
//! use skipjack::protocol::TcpPeerClient;
//! use skipjack::raft::RaftConsensus;
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ControllerConfig {
//!         bootstrap: true,
//!         dev_mode: true,
//!         ..Default::default()
//!     };
//!
//!     let fsm = Arc::new(MetadataFsm::new());
//!     let consensus = Arc::new(RaftConsensus::new(&config, fsm.clone()).await?);
//!     let leadership = consensus.leadership_changes();
//!
//!     // The gossip engine feeds member lifecycle events into this channel.
//!     let (member_tx, member_rx) = mpsc::channel(64);
//!     let _ = member_tx;
//!
//!     let controller = Controller::new(
//!         config,
//!         fsm,
//!         consensus,
//!         Arc::new(TcpPeerClient::new()),
//!     );
//!     let tasks = controller.start(member_rx, leadership);
//!
//!     for task in tasks {
//!         task.await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consensus;
pub mod controller;
pub mod error;
pub mod fsm;
pub mod lookup;
pub mod membership;
pub mod protocol;
pub mod raft;

pub use config::ControllerConfig;
pub use controller::Controller;
pub use error::{ControlError, ControlResult};
