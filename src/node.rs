// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Contains the main algorithm for the Paxos consensus protocol.
//!
//! [`PaxosNode`] is a deterministic decision function: one inbound message
//! plus the node's durable progress in, outbound messages plus newly fixed
//! commands out. All I/O goes through the [`Journal`]; the node never touches
//! the network. Messages the node addresses to itself (its own prepare and
//! accept acknowledgements) are queued and drained within the same dispatch,
//! so a single call can carry a slot all the way to fixed.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info};

use crate::journal::{Journal, JournalError};
use crate::progress::Progress;
use crate::protocol::*;
use crate::quorum::{Outcome, QuorumAssessor};
use crate::tally::{AcceptTally, PrepareTally};

/// Upper bound on slots requested per catch-up round; a node further behind
/// than this catches up over several rounds.
const CATCHUP_BATCH: usize = 64;

/// The three protocol roles.
///
/// A follower holds no term and no tallies. A recoverer probes the log under
/// a fresh term and holds prepare tallies (and accept tallies for slots it
/// has already won). A leader holds accept tallies for in-flight proposals
/// but never prepare tallies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Follow,
    Recover,
    Lead,
}

/// Output of one dispatch: messages to transmit and commands newly fixed,
/// in contiguous ascending slot order.
#[derive(Clone, Debug, Default)]
pub struct Step {
    pub outbound: Vec<Message>,
    pub fixed: Vec<(Slot, Command)>,
}

pub struct PaxosNode<J, Q> {
    node_id: u8,
    journal: J,
    assessor: Q,
    progress: Progress,
    role: Role,
    term: Option<BallotNumber>,
    prepare_tallies: BTreeMap<Slot, PrepareTally>,
    accept_tallies: BTreeMap<Slot, AcceptTally>,
}

impl<J: Journal, Q: QuorumAssessor> PaxosNode<J, Q> {
    /// Loads durable progress and starts as a follower. Tallies, term and
    /// role are volatile and deliberately not restored.
    pub fn new(node_id: u8, mut journal: J, assessor: Q) -> Result<Self, JournalError> {
        let progress = journal.load_progress(node_id)?;
        Ok(Self {
            node_id,
            journal,
            assessor,
            progress,
            role: Role::Follow,
            term: None,
            prepare_tallies: BTreeMap::new(),
            accept_tallies: BTreeMap::new(),
        })
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn term(&self) -> Option<BallotNumber> {
        self.term
    }

    pub fn progress(&self) -> Progress {
        self.progress
    }

    /// Flushes the journal. The engine calls this before releasing any
    /// outbound message.
    pub fn sync_journal(&mut self) -> Result<(), JournalError> {
        self.journal.sync()
    }

    /// Processes one inbound message, including any self-addressed responses
    /// it triggers, and returns everything to transmit and apply.
    pub fn dispatch(&mut self, msg: Message) -> Result<Step, JournalError> {
        let mut step = Step::default();
        let mut queue = VecDeque::new();
        queue.push_back(msg);
        self.run(&mut step, &mut queue)?;
        Ok(step)
    }

    /// Proposes a command for the next free slot. Only a leader produces an
    /// accept here; on any other role this is inert.
    pub fn propose(&mut self, command: Command) -> Result<Step, JournalError> {
        let term = match (self.role, self.term) {
            (Role::Lead, Some(term)) => term,
            _ => {
                debug!("dropping proposal, not the leader");
                return Ok(Step::default());
            }
        };
        let slot = self.progress.highest_accepted + 1;
        let accept = Accept {
            proposer: self.node_id,
            slot,
            ballot: term,
            command,
        };
        self.accept_tallies
            .insert(slot, AcceptTally::new(accept.clone()));

        // The accept runs through the regular handler, which journals it,
        // advances highest_accepted and produces the self-acknowledgement.
        let mut step = Step::default();
        let mut queue = VecDeque::new();
        self.issue(Message::Accept(accept), &mut step, &mut queue);
        self.run(&mut step, &mut queue)?;
        Ok(step)
    }

    /// Election timeout: a follower starts recovering under a fresh term by
    /// probing the first unfixed slot. On any other role this is a no-op.
    pub fn timeout(&mut self) -> Result<(Option<Prepare>, Step), JournalError> {
        if self.role != Role::Follow {
            return Ok((None, Step::default()));
        }
        let term = self.progress.highest_promised.next_for(self.node_id);
        self.role = Role::Recover;
        self.term = Some(term);
        let slot = self.progress.highest_fixed + 1;
        self.prepare_tallies.insert(slot, PrepareTally::new());
        info!("timeout, recovering slot {} under term {:?}", slot, term);

        let prepare = Prepare {
            from: self.node_id,
            slot,
            ballot: term,
        };
        let mut step = Step::default();
        let mut queue = VecDeque::new();
        self.issue(Message::Prepare(prepare.clone()), &mut step, &mut queue);
        self.run(&mut step, &mut queue)?;
        Ok((Some(prepare), step))
    }

    /// Periodic retransmission against message loss: a leader re-announces
    /// its fixed watermark and its in-flight accepts, a recoverer re-issues
    /// its prepares, a follower stays silent.
    pub fn heartbeat(&mut self) -> Result<Vec<Message>, JournalError> {
        let mut out = Vec::new();
        match self.role {
            Role::Follow => {}
            Role::Recover => {
                if let Some(term) = self.term {
                    for slot in self.prepare_tallies.keys() {
                        out.push(Message::Prepare(Prepare {
                            from: self.node_id,
                            slot: *slot,
                            ballot: term,
                        }));
                    }
                }
            }
            Role::Lead => {
                let fixed = self.progress.highest_fixed;
                let fixed_ballot = self
                    .journal
                    .load_accept(fixed)?
                    .map(|a| a.ballot)
                    .unwrap_or_default();
                out.push(Message::Fixed(Fixed {
                    from: self.node_id,
                    fixed_slot: fixed,
                    fixed_ballot,
                }));
                for slot in fixed + 1..=self.progress.highest_accepted {
                    if let Some(tally) = self.accept_tallies.get(&slot) {
                        out.push(Message::Accept(tally.accept.clone()));
                    } else if let Some(accept) = self.journal.load_accept(slot)? {
                        out.push(Message::Accept(accept));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Steps back to follower, dropping the term and all tallies. Durable
    /// progress is untouched, so no journal write is needed.
    pub fn backdown(&mut self) {
        if self.role != Role::Follow {
            info!("backing down from {:?} to follower", self.role);
        }
        self.role = Role::Follow;
        self.term = None;
        self.prepare_tallies.clear();
        self.accept_tallies.clear();
    }

    fn run(&mut self, step: &mut Step, queue: &mut VecDeque<Message>) -> Result<(), JournalError> {
        while let Some(msg) = queue.pop_front() {
            match msg {
                Message::Prepare(m) => self.on_prepare(m, step, queue)?,
                Message::PrepareResponse(m) => self.on_prepare_response(m, step, queue)?,
                Message::Accept(m) => self.on_accept(m, step, queue)?,
                Message::AcceptResponse(m) => self.on_accept_response(m, step)?,
                Message::Fixed(m) => self.on_fixed(m, step)?,
                Message::Catchup(m) => self.on_catchup(m, step, queue)?,
                Message::CatchupResponse(m) => self.on_catchup_response(m, queue),
            }
        }
        Ok(())
    }

    /// Routes a response: back into the work queue when addressed to self,
    /// onto the wire otherwise.
    fn route(&self, msg: Message, step: &mut Step, queue: &mut VecDeque<Message>) {
        match msg.to_node() {
            Some(to) if to == self.node_id => queue.push_back(msg),
            _ => step.outbound.push(msg),
        }
    }

    /// Issues one of this node's own broadcasts: it goes onto the wire and is
    /// also delivered to self, where the regular handler produces the node's
    /// own vote.
    fn issue(&self, msg: Message, step: &mut Step, queue: &mut VecDeque<Message>) {
        step.outbound.push(msg.clone());
        queue.push_back(msg);
    }

    fn prepare_response(&self, m: &Prepare, yes: bool) -> Result<Message, JournalError> {
        Ok(Message::PrepareResponse(PrepareResponse {
            from: self.node_id,
            to: m.from,
            vote: Vote {
                voter: self.node_id,
                voted_for: m.from,
                slot: m.slot,
                yes,
                ballot: m.ballot,
            },
            voter_highest_fixed: self.progress.highest_fixed,
            voter_highest_accepted: self.progress.highest_accepted,
            journalled_accept: self.journal.load_accept(m.slot)?,
        }))
    }

    fn accept_response(&self, to: u8, slot: Slot, ballot: BallotNumber, yes: bool) -> Message {
        Message::AcceptResponse(AcceptResponse {
            from: self.node_id,
            to,
            vote: Vote {
                voter: self.node_id,
                voted_for: to,
                slot,
                yes,
                ballot,
            },
            voter_highest_fixed: self.progress.highest_fixed,
        })
    }

    fn on_prepare(
        &mut self,
        m: Prepare,
        step: &mut Step,
        queue: &mut VecDeque<Message>,
    ) -> Result<(), JournalError> {
        if m.ballot < self.progress.highest_promised || m.slot <= self.progress.highest_fixed {
            // the response still carries our watermark and journalled accept
            // so a stale proposer can catch up
            let response = self.prepare_response(&m, false)?;
            self.route(response, step, queue);
        } else if m.ballot > self.progress.highest_promised {
            self.progress.highest_promised = m.ballot;
            self.journal.save_progress(&self.progress)?;
            let response = self.prepare_response(&m, true)?;
            self.route(response, step, queue);
            if m.from != self.node_id && self.role != Role::Follow {
                self.backdown();
            }
        } else {
            // equal ballot: idempotent re-acknowledgement
            let response = self.prepare_response(&m, true)?;
            self.route(response, step, queue);
        }
        Ok(())
    }

    fn on_accept(
        &mut self,
        m: Accept,
        step: &mut Step,
        queue: &mut VecDeque<Message>,
    ) -> Result<(), JournalError> {
        let promised = self.progress.highest_promised;
        if m.ballot < promised || (m.ballot > promised && m.slot <= self.progress.highest_fixed) {
            let response = self.accept_response(m.proposer, m.slot, m.ballot, false);
            self.route(response, step, queue);
            return Ok(());
        }

        self.journal.journal_accept(&m)?;
        if m.slot > self.progress.highest_accepted {
            self.progress.highest_accepted = m.slot;
        }
        if m.ballot > promised {
            // a higher accept without a prior prepare counts as a promise too
            self.progress.highest_promised = m.ballot;
            if self.role == Role::Lead {
                // our own lower-ballot proposal at this slot just lost a voter
                let lost = match self.accept_tallies.get_mut(&m.slot) {
                    Some(tally) if tally.accept.ballot < m.ballot && !tally.chosen => {
                        let ballot = tally.accept.ballot;
                        let nack = AcceptResponse {
                            from: self.node_id,
                            to: self.node_id,
                            vote: Vote {
                                voter: self.node_id,
                                voted_for: self.node_id,
                                slot: m.slot,
                                yes: false,
                                ballot,
                            },
                            voter_highest_fixed: self.progress.highest_fixed,
                        };
                        tally.record(nack);
                        self.assessor.assess_accepts(m.slot, &tally.votes()) == Outcome::Lose
                    }
                    _ => false,
                };
                if lost {
                    self.backdown();
                }
            }
        }
        self.journal.save_progress(&self.progress)?;
        let response = self.accept_response(m.proposer, m.slot, m.ballot, true);
        self.route(response, step, queue);
        Ok(())
    }

    fn on_prepare_response(
        &mut self,
        m: PrepareResponse,
        step: &mut Step,
        queue: &mut VecDeque<Message>,
    ) -> Result<(), JournalError> {
        if self.role != Role::Recover || m.to != self.node_id || m.vote.voted_for != self.node_id {
            return Ok(());
        }
        let term = match self.term {
            Some(term) => term,
            None => return Ok(()),
        };
        if m.vote.ballot != term {
            // stale response from an abandoned term
            return Ok(());
        }
        if m.voter_highest_fixed > self.progress.highest_fixed {
            // the voter has fixed more than us: someone else is leading
            self.backdown();
            return Ok(());
        }

        let slot = m.vote.slot;
        let (outcome, max_voter_accepted, chosen_command) = {
            let tally = match self.prepare_tallies.get_mut(&slot) {
                Some(tally) => tally,
                None => return Ok(()),
            };
            tally.record(m);
            (
                self.assessor.assess_promises(slot, &tally.votes()),
                tally.max_voter_accepted(),
                tally
                    .highest_accept()
                    .map(|a| a.command.clone())
                    .unwrap_or(Command::NoOp),
            )
        };

        match outcome {
            Outcome::Wait => {}
            Outcome::Lose => self.backdown(),
            Outcome::Win => {
                // Extend probing to every slot some voter has accepted beyond
                // what we have probed so far.
                let highest_probed = self
                    .prepare_tallies
                    .keys()
                    .next_back()
                    .copied()
                    .unwrap_or(0)
                    .max(self.accept_tallies.keys().next_back().copied().unwrap_or(0))
                    .max(slot);
                for probe in highest_probed + 1..=max_voter_accepted {
                    self.prepare_tallies.insert(probe, PrepareTally::new());
                    self.issue(
                        Message::Prepare(Prepare {
                            from: self.node_id,
                            slot: probe,
                            ballot: term,
                        }),
                        step,
                        queue,
                    );
                }

                // Propose the highest-numbered accepted value for this slot,
                // or a no-op if the slot is uncontested.
                let accept = Accept {
                    proposer: self.node_id,
                    slot,
                    ballot: term,
                    command: chosen_command,
                };
                self.accept_tallies
                    .insert(slot, AcceptTally::new(accept.clone()));
                self.issue(Message::Accept(accept), step, queue);

                self.prepare_tallies.remove(&slot);
                if self.prepare_tallies.is_empty() {
                    info!("recovery complete, leading under term {:?}", term);
                    self.role = Role::Lead;
                }
            }
        }
        Ok(())
    }

    fn on_accept_response(&mut self, m: AcceptResponse, step: &mut Step) -> Result<(), JournalError> {
        if self.role == Role::Follow || m.to != self.node_id || m.vote.voted_for != self.node_id {
            return Ok(());
        }
        if self.role == Role::Lead && m.voter_highest_fixed > self.progress.highest_fixed {
            // a voter has fixed slots we have not: a newer leader exists
            self.backdown();
            return Ok(());
        }

        let slot = m.vote.slot;
        let outcome = {
            let tally = match self.accept_tallies.get_mut(&slot) {
                Some(tally) => tally,
                None => return Ok(()),
            };
            if tally.chosen || tally.accept.ballot != m.vote.ballot {
                return Ok(());
            }
            tally.record(m);
            self.assessor.assess_accepts(slot, &tally.votes())
        };

        match outcome {
            Outcome::Wait => {}
            Outcome::Lose => self.backdown(),
            Outcome::Win => {
                if let Some(tally) = self.accept_tallies.get_mut(&slot) {
                    tally.chosen = true;
                }
                self.commit_scan(step)?;
            }
        }
        Ok(())
    }

    /// Walks the accept tallies upward from the fixed watermark and consumes
    /// every contiguous chosen entry. Stops at the first gap or undecided
    /// slot, so fixed slots are always reported in contiguous ascending
    /// order.
    fn commit_scan(&mut self, step: &mut Step) -> Result<(), JournalError> {
        let mut consumed = Vec::new();
        let mut boundary_ballot = BallotNumber::default();
        let mut next = self.progress.highest_fixed + 1;
        for (slot, tally) in &self.accept_tallies {
            if *slot != next || !tally.chosen {
                break;
            }
            step.fixed.push((*slot, tally.accept.command.clone()));
            boundary_ballot = tally.accept.ballot;
            consumed.push(*slot);
            next += 1;
        }
        if consumed.is_empty() {
            return Ok(());
        }

        for slot in &consumed {
            self.accept_tallies.remove(slot);
        }
        self.progress.highest_fixed = next - 1;
        self.journal.save_progress(&self.progress)?;
        debug!("fixed through slot {}", self.progress.highest_fixed);
        step.outbound.push(Message::Fixed(Fixed {
            from: self.node_id,
            fixed_slot: self.progress.highest_fixed,
            fixed_ballot: boundary_ballot,
        }));
        Ok(())
    }

    fn on_fixed(&mut self, m: Fixed, step: &mut Step) -> Result<(), JournalError> {
        if m.fixed_slot <= self.progress.highest_fixed {
            return Ok(());
        }

        // Materialize the announced range from our own journal as far as the
        // records reach; the boundary slot must match the announced ballot.
        let mut advanced = false;
        let mut slot = self.progress.highest_fixed + 1;
        while slot <= m.fixed_slot {
            match self.journal.load_accept(slot)? {
                Some(accept) => {
                    if slot == m.fixed_slot && accept.ballot != m.fixed_ballot {
                        break;
                    }
                    step.fixed.push((slot, accept.command));
                    self.progress.highest_fixed = slot;
                    advanced = true;
                    slot += 1;
                }
                None => break,
            }
        }
        if advanced {
            self.journal.save_progress(&self.progress)?;
        }

        if self.progress.highest_fixed < m.fixed_slot {
            let missing: Vec<Slot> = (self.progress.highest_fixed + 1..=m.fixed_slot)
                .take(CATCHUP_BATCH)
                .collect();
            debug!("missing {} accepts, catching up from node {}", missing.len(), m.from);
            step.outbound.push(Message::Catchup(Catchup {
                from: self.node_id,
                to: m.from,
                slots: missing,
            }));
        }

        // Another node is fixing values; whatever we were, stop leading.
        if self.role != Role::Follow {
            self.backdown();
        }
        Ok(())
    }

    fn on_catchup(
        &mut self,
        m: Catchup,
        step: &mut Step,
        queue: &mut VecDeque<Message>,
    ) -> Result<(), JournalError> {
        if m.to != self.node_id {
            return Ok(());
        }
        let mut accepts = Vec::new();
        for slot in m.slots {
            if slot == 0 || slot > self.progress.highest_fixed {
                continue;
            }
            if let Some(accept) = self.journal.load_accept(slot)? {
                accepts.push(accept);
            }
        }
        let response = Message::CatchupResponse(CatchupResponse {
            from: self.node_id,
            to: m.from,
            accepts,
        });
        self.route(response, step, queue);
        Ok(())
    }

    /// Replays caught-up accepts through the regular accept handler, which
    /// applies all its own safety checks. Fixing is driven by the next
    /// `Fixed` announcement, not here.
    fn on_catchup_response(&mut self, m: CatchupResponse, queue: &mut VecDeque<Message>) {
        if m.to != self.node_id {
            return;
        }
        for accept in m.accepts {
            queue.push_back(Message::Accept(accept));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;
    use crate::quorum::SimpleMajority;

    fn node(id: u8, cluster: usize) -> PaxosNode<MemoryJournal, SimpleMajority> {
        PaxosNode::new(id, MemoryJournal::new(), SimpleMajority::new(cluster)).unwrap()
    }

    fn prepare(from: u8, slot: Slot, counter: u32) -> Message {
        Message::Prepare(Prepare {
            from,
            slot,
            ballot: BallotNumber::new(counter, from),
        })
    }

    #[test]
    fn lower_ballot_prepare_is_refused() {
        let mut n = node(1, 3);
        n.dispatch(prepare(2, 1, 5)).unwrap();
        let step = n.dispatch(prepare(3, 1, 4)).unwrap();
        match &step.outbound[0] {
            Message::PrepareResponse(r) => {
                assert!(!r.vote.yes);
                assert_eq!(r.to, 3);
            }
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(n.progress().highest_promised, BallotNumber::new(5, 2));
    }

    #[test]
    fn equal_ballot_prepare_reacks_identically() {
        let mut n = node(1, 3);
        let first = n.dispatch(prepare(2, 1, 5)).unwrap();
        let before = n.progress();
        let second = n.dispatch(prepare(2, 1, 5)).unwrap();
        assert_eq!(first.outbound, second.outbound);
        assert_eq!(n.progress(), before);
    }

    #[test]
    fn accept_below_promise_is_refused() {
        let mut n = node(1, 3);
        n.dispatch(prepare(2, 1, 5)).unwrap();
        let step = n
            .dispatch(Message::Accept(Accept {
                proposer: 3,
                slot: 1,
                ballot: BallotNumber::new(4, 3),
                command: Command::NoOp,
            }))
            .unwrap();
        match &step.outbound[0] {
            Message::AcceptResponse(r) => assert!(!r.vote.yes),
            other => panic!("unexpected message {:?}", other),
        }
        assert_eq!(n.progress().highest_accepted, 0);
    }

    #[test]
    fn higher_accept_raises_promise_too() {
        let mut n = node(1, 3);
        n.dispatch(prepare(2, 1, 3)).unwrap();
        n.dispatch(Message::Accept(Accept {
            proposer: 3,
            slot: 1,
            ballot: BallotNumber::new(7, 3),
            command: Command::NoOp,
        }))
        .unwrap();
        assert_eq!(n.progress().highest_promised, BallotNumber::new(7, 3));
        assert_eq!(n.progress().highest_accepted, 1);
    }

    #[test]
    fn backdown_only_touches_volatile_state() {
        let mut n = node(1, 3);
        n.timeout().unwrap();
        assert_eq!(n.role(), Role::Recover);
        let before = n.progress();
        n.backdown();
        assert_eq!(n.role(), Role::Follow);
        assert_eq!(n.term(), None);
        assert_eq!(n.progress(), before);
    }

    #[test]
    fn timeout_is_noop_unless_follower() {
        let mut n = node(1, 3);
        let (first, _) = n.timeout().unwrap();
        assert!(first.is_some());
        let (second, step) = n.timeout().unwrap();
        assert!(second.is_none());
        assert!(step.outbound.is_empty());
    }

    #[test]
    fn propose_on_non_leader_is_inert() {
        let mut n = node(1, 3);
        let step = n.propose(Command::NoOp).unwrap();
        assert!(step.outbound.is_empty());
        assert!(step.fixed.is_empty());
        assert_eq!(n.progress().highest_accepted, 0);
    }

    #[test]
    fn follower_heartbeat_is_silent() {
        let mut n = node(1, 3);
        assert!(n.heartbeat().unwrap().is_empty());
    }

    #[test]
    fn recoverer_heartbeat_reissues_prepares() {
        let mut n = node(1, 3);
        n.timeout().unwrap();
        let out = n.heartbeat().unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            Message::Prepare(p) => {
                assert_eq!(p.slot, 1);
                assert_eq!(p.ballot, BallotNumber::new(1, 1));
            }
            other => panic!("unexpected message {:?}", other),
        }
    }
}
