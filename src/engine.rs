// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Thread-safe wrapper around the Paxos core.
//!
//! The engine guards the node with a single-permit mutex, filters out the
//! node's own broadcasts, watches for evidence of a newer leader, and
//! enforces the durability ordering: the journal is synced before any
//! outbound message is handed back to the host for transmission. Timer
//! policy is delegated to a [`TimerControl`] implementation supplied by the
//! host.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};

use crate::journal::{Journal, JournalError};
use crate::node::{PaxosNode, Role, Step};
use crate::progress::Progress;
use crate::protocol::{Command, Message, Prepare, Slot};
use crate::quorum::QuorumAssessor;
use crate::ReplicatedStateMachine;

/// Timer hooks the engine drives; the host decides what arming a timer
/// actually means (deadlines, wheel entries, test recordings).
pub trait TimerControl {
    /// Arms (or re-arms) the randomized election timeout.
    fn set_random_timeout(&mut self);
    /// Cancels the election timeout; called on ascent to leader.
    fn clear_timeout(&mut self);
    /// Arms the heartbeat; called whenever the node leads or recovers.
    fn set_heartbeat(&mut self);
}

/// Merged output of one engine call: messages for the host to transmit and
/// the commands fixed by the batch, keyed by slot.
#[derive(Clone, Debug, Default)]
pub struct EngineResult {
    pub messages: Vec<Message>,
    pub commands_by_slot: BTreeMap<Slot, Command>,
}

pub struct Engine<J, Q, T, A> {
    node_id: u8,
    inner: Mutex<Inner<J, Q, T, A>>,
}

struct Inner<J, Q, T, A> {
    node: PaxosNode<J, Q>,
    timers: T,
    app: A,
}

impl<J, Q, T, A> Engine<J, Q, T, A>
where
    J: Journal,
    Q: QuorumAssessor,
    T: TimerControl,
    A: ReplicatedStateMachine,
{
    pub fn new(node_id: u8, journal: J, assessor: Q, timers: T, app: A) -> Result<Self, JournalError> {
        let node = PaxosNode::new(node_id, journal, assessor)?;
        Ok(Self {
            node_id,
            inner: Mutex::new(Inner { node, timers, app }),
        })
    }

    /// Arms the initial election timeout; the node sits as a follower until
    /// it fires or a leader shows itself.
    pub fn start(&self) {
        let mut inner = self.lock();
        info!("starting node {}", self.node_id);
        inner.timers.set_random_timeout();
    }

    /// Runs a batch of inbound messages through the core, syncs the journal,
    /// and only then releases the merged results for transmission.
    pub fn paxos(&self, batch: Vec<Message>) -> Result<EngineResult, JournalError> {
        let mut inner = self.lock();
        let prev_role = inner.node.role();
        let mut steps = Vec::new();
        for msg in batch {
            // our own broadcasts come back to us; never process them
            if msg.from_node() == self.node_id {
                continue;
            }
            if evidence_of_leader(&inner.node, &msg) {
                debug!("evidence of another leader in {:?}", msg);
                inner.timers.set_random_timeout();
                if inner.node.role() == Role::Lead {
                    inner.node.backdown();
                }
            }
            steps.push(inner.node.dispatch(msg)?);
        }
        inner.node.sync_journal()?;
        let result = merge_steps(steps);
        inner.apply_fixed(&result);
        inner.adjust_timers(prev_role);
        Ok(result)
    }

    /// Proposes a batch of client commands. Only a leader produces accepts;
    /// on any other role the batch is dropped without state change.
    pub fn command(&self, batch: Vec<Command>) -> Result<Vec<Message>, JournalError> {
        let mut inner = self.lock();
        let prev_role = inner.node.role();
        let mut steps = Vec::new();
        for command in batch {
            steps.push(inner.node.propose(command)?);
        }
        inner.node.sync_journal()?;
        let result = merge_steps(steps);
        inner.apply_fixed(&result);
        inner.adjust_timers(prev_role);
        Ok(result.messages)
    }

    /// Fires the election timeout. Returns the prepare to broadcast when the
    /// node actually moved to recovering.
    pub fn timeout(&self) -> Result<Option<Prepare>, JournalError> {
        let mut inner = self.lock();
        let prev_role = inner.node.role();
        let (prepare, step) = inner.node.timeout()?;
        inner.node.sync_journal()?;
        let result = merge_steps(vec![step]);
        inner.apply_fixed(&result);
        inner.adjust_timers(prev_role);
        Ok(prepare)
    }

    /// Fires the heartbeat: retransmissions only, no journal writes.
    pub fn heartbeat(&self) -> Result<Vec<Message>, JournalError> {
        let mut inner = self.lock();
        let out = inner.node.heartbeat()?;
        if inner.node.role() != Role::Follow {
            inner.timers.set_heartbeat();
        }
        Ok(out)
    }

    pub fn role(&self) -> Role {
        self.lock().node.role()
    }

    pub fn progress(&self) -> Progress {
        self.lock().node.progress()
    }

    fn lock(&self) -> MutexGuard<'_, Inner<J, Q, T, A>> {
        self.inner.lock().expect("engine mutex poisoned")
    }
}

impl<J, Q, T, A> Inner<J, Q, T, A>
where
    J: Journal,
    Q: QuorumAssessor,
    T: TimerControl,
    A: ReplicatedStateMachine,
{
    /// Hands newly fixed application commands to the state machine, in slot
    /// order. NoOps advance the watermark but are not applied.
    fn apply_fixed(&mut self, result: &EngineResult) {
        for (slot, command) in &result.commands_by_slot {
            if let Command::App { uuid, payload } = command {
                self.app.apply(*slot, uuid, payload);
            }
        }
    }

    fn adjust_timers(&mut self, prev_role: Role) {
        let role = self.node.role();
        if role == Role::Lead && prev_role != Role::Lead {
            self.timers.clear_timeout();
        }
        if role == Role::Follow && prev_role != Role::Follow {
            self.timers.set_random_timeout();
        }
        if role != Role::Follow {
            self.timers.set_heartbeat();
        }
    }
}

/// An incoming message proves some other node is further along than us when
/// it has fixed at least as much, accepted beyond our watermarks, or (while
/// we lead) voted with more fixed slots than we have.
fn evidence_of_leader<J, Q>(node: &PaxosNode<J, Q>, msg: &Message) -> bool
where
    J: Journal,
    Q: QuorumAssessor,
{
    let progress = node.progress();
    match msg {
        Message::Fixed(m) => m.fixed_slot >= progress.highest_fixed,
        Message::Accept(m) => {
            m.slot > progress.highest_accepted || m.slot > progress.highest_fixed
        }
        Message::AcceptResponse(m) => {
            node.role() == Role::Lead && m.voter_highest_fixed > progress.highest_fixed
        }
        _ => false,
    }
}

/// Merges per-message steps into one envelope. Two different commands fixed
/// at the same slot within a batch would mean diverging replicas, so that is
/// a fatal assertion rather than an error.
fn merge_steps(steps: Vec<Step>) -> EngineResult {
    let mut messages = Vec::new();
    let mut commands_by_slot = BTreeMap::new();
    for step in steps {
        messages.extend(step.outbound);
        for (slot, command) in step.fixed {
            match commands_by_slot.entry(slot) {
                Entry::Vacant(e) => {
                    e.insert(command);
                }
                Entry::Occupied(e) => {
                    assert_eq!(
                        e.get(),
                        &command,
                        "two different commands fixed at slot {}",
                        slot,
                    );
                }
            }
        }
    }
    EngineResult {
        messages,
        commands_by_slot,
    }
}
