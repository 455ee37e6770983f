// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! The durable per-node progress record.

use crate::protocol::{BallotNumber, Slot};

/// Everything a node must remember across a crash.
///
/// Invariants: `highest_fixed <= highest_accepted`, and `highest_promised`
/// never decreases over the node's entire lifetime, restarts included.
/// Volatile state (role, term, vote tallies) is deliberately absent; a node
/// restarts as a follower knowing only this triple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Progress {
    pub node_id: u8,
    pub highest_promised: BallotNumber,
    pub highest_accepted: Slot,
    pub highest_fixed: Slot,
}

impl Progress {
    /// Blank progress for a node that has never voted.
    pub fn new(node_id: u8) -> Self {
        Self {
            node_id,
            highest_promised: BallotNumber::default(),
            highest_accepted: 0,
            highest_fixed: 0,
        }
    }
}
