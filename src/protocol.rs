// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Contains structures, types and constants used by the rest of the Paxos implementation.

use serde::{Deserialize, Serialize};

/// Index of a position in the replicated log.
/// Slot 0 is reserved, the first usable slot is 1.
pub type Slot = u64;

/// Unique monotonic increasing proposal ID.
/// Ordered lexicographically on `(counter, node_id)`, so two distinct nodes
/// can never produce the same ballot.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BallotNumber {
    pub counter: u32,
    pub node_id: u8,
}

impl BallotNumber {
    pub fn new(counter: u32, node_id: u8) -> Self {
        Self { counter, node_id }
    }

    /// Fabricates the next ballot in the number space of `node_id`.
    /// The result is strictly higher than `self` and can not collide with a
    /// ballot fabricated by any other node.
    pub fn next_for(self, node_id: u8) -> Self {
        Self {
            counter: self.counter + 1,
            node_id,
        }
    }
}

/// A single entry of the replicated log.
///
/// `NoOp` is the sentinel used to fill uncontested slots during recovery so
/// the log stays contiguous; it is never handed to the application.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    NoOp,
    App { uuid: Vec<u8>, payload: Vec<u8> },
}

impl Command {
    pub fn is_noop(&self) -> bool {
        matches!(self, Command::NoOp)
    }
}

/// Phase-2 message and, keyed by slot, the only per-slot journal record.
/// `proposer` doubles as the sender when the accept travels on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Accept {
    pub proposer: u8,
    pub slot: Slot,
    pub ballot: BallotNumber,
    pub command: Command,
}

/// A single yes/no answer to a prepare or accept round.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Vote {
    pub voter: u8,
    pub voted_for: u8,
    pub slot: Slot,
    pub yes: bool,
    pub ballot: BallotNumber,
}

/// Paxos phase 1a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prepare {
    pub from: u8,
    pub slot: Slot,
    pub ballot: BallotNumber,
}

/// Paxos phase 1b message.
///
/// Besides the vote it carries the voter's fixed and accepted watermarks and
/// the accept journalled at the probed slot, which the recoverer needs to
/// extend its probing and to pick the highest-numbered accepted value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrepareResponse {
    pub from: u8,
    pub to: u8,
    pub vote: Vote,
    pub voter_highest_fixed: Slot,
    pub voter_highest_accepted: Slot,
    pub journalled_accept: Option<Accept>,
}

/// Paxos phase 2b message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AcceptResponse {
    pub from: u8,
    pub to: u8,
    pub vote: Vote,
    pub voter_highest_fixed: Slot,
}

/// Announcement that every slot up to `fixed_slot` is fixed at the sender.
/// Carries the ballot of the accept at the boundary slot so a receiver can
/// verify its own journalled accept before fixing from it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fixed {
    pub from: u8,
    pub fixed_slot: Slot,
    pub fixed_ballot: BallotNumber,
}

/// Targeted request for the accepts a node is missing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Catchup {
    pub from: u8,
    pub to: u8,
    pub slots: Vec<Slot>,
}

/// Answer to a [`Catchup`], satisfied from the sender's journal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CatchupResponse {
    pub from: u8,
    pub to: u8,
    pub accepts: Vec<Accept>,
}

/// Internal messages for the Paxos protocol.
///
/// Every inbound message is dispatched through an exhaustive match, so each
/// kind is handled exactly once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    Prepare(Prepare),
    PrepareResponse(PrepareResponse),
    Accept(Accept),
    AcceptResponse(AcceptResponse),
    Fixed(Fixed),
    Catchup(Catchup),
    CatchupResponse(CatchupResponse),
}

impl Message {
    /// The node that sent this message.
    pub fn from_node(&self) -> u8 {
        match self {
            Message::Prepare(m) => m.from,
            Message::PrepareResponse(m) => m.from,
            Message::Accept(m) => m.proposer,
            Message::AcceptResponse(m) => m.from,
            Message::Fixed(m) => m.from,
            Message::Catchup(m) => m.from,
            Message::CatchupResponse(m) => m.from,
        }
    }

    /// The addressee, or `None` for broadcast messages.
    pub fn to_node(&self) -> Option<u8> {
        match self {
            Message::Prepare(_) | Message::Accept(_) | Message::Fixed(_) => None,
            Message::PrepareResponse(m) => Some(m.to),
            Message::AcceptResponse(m) => Some(m.to),
            Message::Catchup(m) => Some(m.to),
            Message::CatchupResponse(m) => Some(m.to),
        }
    }
}
