// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Implementation of a replicated log using the Multi-Paxos consensus protocol.
//!
//! The deterministic core lives in [`node`], wrapped by the durability- and
//! concurrency-aware [`engine`]. The replica layer on top adds UDP transport
//! and deadline timers so a cluster can actually be run; the core itself
//! performs no I/O beyond the pluggable [`journal`].

pub mod codec;
pub mod engine;
pub mod journal;
pub mod network;
pub mod node;
pub mod progress;
pub mod protocol;
pub mod quorum;
pub mod replica;
pub mod tally;
pub mod udp_network;

use std::io;
use std::thread;

pub use engine::{Engine, EngineResult, TimerControl};
pub use journal::{FileJournal, Journal, JournalError, MemoryJournal};
pub use node::{PaxosNode, Role, Step};
pub use progress::Progress;
pub use protocol::{Accept, BallotNumber, Command, Message, Slot, Vote};
pub use quorum::{Outcome, QuorumAssessor, SimpleMajority};
pub use replica::{DeadlineTimers, PaxosReplica};
pub use udp_network::UdpNetworkNode;

/// The application consuming the replicated log. Commands arrive exactly
/// once per slot, in contiguous ascending slot order; recovery no-ops are
/// filtered out before this up-call.
pub trait ReplicatedStateMachine {
    fn apply(&mut self, slot: Slot, uuid: &[u8], payload: &[u8]);
}

/// Starts a replica with an in-memory journal on a background thread.
pub fn start_replica<A>(node_id: u8, cluster: &[u8], app: A) -> Result<u8, JournalError>
where
    A: ReplicatedStateMachine + Send + 'static,
{
    let mut replica = PaxosReplica::new(node_id, cluster, MemoryJournal::new(), app)?;
    replica.start();
    thread::spawn(move || {
        loop {
            replica.tick();
        }
    });
    Ok(node_id)
}

/// Submits a command to the replica with ID dst from an ephemeral client
/// socket.
pub fn submit_value(dst: u8, uuid: Vec<u8>, payload: Vec<u8>) -> io::Result<()> {
    UdpNetworkNode::submit(dst, uuid, payload)
}
