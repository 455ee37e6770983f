// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Per-slot vote aggregation during recovery and leadership.
//!
//! Tallies are volatile: created when this node issues a prepare or accept
//! for a slot, garbage-collected once the slot is committed or the node
//! backs down. They are never persisted.

use std::collections::BTreeMap;

use crate::protocol::{Accept, AcceptResponse, PrepareResponse, Slot};

/// Prepare responses gathered for one probed slot, keyed by voter.
#[derive(Clone, Debug, Default)]
pub struct PrepareTally {
    responses: BTreeMap<u8, PrepareResponse>,
}

impl PrepareTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a response, superseding any earlier one from the same voter.
    pub fn record(&mut self, response: PrepareResponse) {
        self.responses.insert(response.vote.voter, response);
    }

    /// The yes/no votes as the quorum assessor wants them.
    pub fn votes(&self) -> BTreeMap<u8, bool> {
        self.responses
            .iter()
            .map(|(voter, r)| (*voter, r.vote.yes))
            .collect()
    }

    /// The highest-numbered accept any voter reported for this slot.
    /// This is the value a new leader is bound to re-propose.
    pub fn highest_accept(&self) -> Option<&Accept> {
        self.responses
            .values()
            .filter_map(|r| r.journalled_accept.as_ref())
            .max_by_key(|a| (a.ballot, a.slot))
    }

    /// The highest accepted slot any voter has reported, which bounds how far
    /// the recoverer must extend its probing.
    pub fn max_voter_accepted(&self) -> Slot {
        self.responses
            .values()
            .map(|r| r.voter_highest_accepted)
            .max()
            .unwrap_or(0)
    }
}

/// An in-flight proposal: the accept this node issued for one slot, the
/// responses so far, and whether a quorum has already been reached.
#[derive(Clone, Debug)]
pub struct AcceptTally {
    pub accept: Accept,
    pub chosen: bool,
    responses: BTreeMap<u8, AcceptResponse>,
}

impl AcceptTally {
    pub fn new(accept: Accept) -> Self {
        Self {
            accept,
            chosen: false,
            responses: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, response: AcceptResponse) {
        self.responses.insert(response.vote.voter, response);
    }

    pub fn votes(&self) -> BTreeMap<u8, bool> {
        self.responses
            .iter()
            .map(|(voter, r)| (*voter, r.vote.yes))
            .collect()
    }
}
