// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! End-to-end protocol scenarios driven deterministically through the
//! engine, with crafted peer messages instead of a network.

use std::sync::{Arc, Mutex};

use quorumlog::protocol::{
    AcceptResponse, Catchup, CatchupResponse, Fixed, Prepare, PrepareResponse,
};
use quorumlog::{
    Accept, BallotNumber, Command, Engine, MemoryJournal, Message, Progress,
    ReplicatedStateMachine, Role, SimpleMajority, Slot, TimerControl, Vote,
};

struct NullTimers;

impl TimerControl for NullTimers {
    fn set_random_timeout(&mut self) {}
    fn clear_timeout(&mut self) {}
    fn set_heartbeat(&mut self) {}
}

/// Records every applied command for assertions.
#[derive(Clone, Default)]
struct RecordingApp {
    applied: Arc<Mutex<Vec<(Slot, Vec<u8>, Vec<u8>)>>>,
}

impl RecordingApp {
    fn applied(&self) -> Vec<(Slot, Vec<u8>, Vec<u8>)> {
        self.applied.lock().unwrap().clone()
    }
}

impl ReplicatedStateMachine for RecordingApp {
    fn apply(&mut self, slot: Slot, uuid: &[u8], payload: &[u8]) {
        self.applied
            .lock()
            .unwrap()
            .push((slot, uuid.to_vec(), payload.to_vec()));
    }
}

type TestEngine = Engine<MemoryJournal, SimpleMajority, NullTimers, RecordingApp>;

fn engine(node_id: u8, cluster_size: usize, journal: MemoryJournal, app: RecordingApp) -> TestEngine {
    Engine::new(
        node_id,
        journal,
        SimpleMajority::new(cluster_size),
        NullTimers,
        app,
    )
    .unwrap()
}

fn ballot(counter: u32, node_id: u8) -> BallotNumber {
    BallotNumber::new(counter, node_id)
}

fn app_command(uuid: u8, payload: &[u8]) -> Command {
    Command::App {
        uuid: vec![uuid],
        payload: payload.to_vec(),
    }
}

fn yes_prepare_response(
    voter: u8,
    leader: u8,
    slot: Slot,
    term: BallotNumber,
    voter_highest_accepted: Slot,
    journalled_accept: Option<Accept>,
) -> Message {
    Message::PrepareResponse(PrepareResponse {
        from: voter,
        to: leader,
        vote: Vote {
            voter,
            voted_for: leader,
            slot,
            yes: true,
            ballot: term,
        },
        voter_highest_fixed: 0,
        voter_highest_accepted,
        journalled_accept,
    })
}

fn yes_accept_response(
    voter: u8,
    leader: u8,
    slot: Slot,
    term: BallotNumber,
    voter_highest_fixed: Slot,
) -> Message {
    Message::AcceptResponse(AcceptResponse {
        from: voter,
        to: leader,
        vote: Vote {
            voter,
            voted_for: leader,
            slot,
            yes: true,
            ballot: term,
        },
        voter_highest_fixed,
    })
}

fn find_accept(messages: &[Message], slot: Slot) -> &Accept {
    messages
        .iter()
        .find_map(|m| match m {
            Message::Accept(a) if a.slot == slot => Some(a),
            _ => None,
        })
        .expect("no accept for slot")
}

fn find_fixed(messages: &[Message]) -> Option<&Fixed> {
    messages.iter().find_map(|m| match m {
        Message::Fixed(f) => Some(f),
        _ => None,
    })
}

fn find_catchup(messages: &[Message]) -> Option<&Catchup> {
    messages.iter().find_map(|m| match m {
        Message::Catchup(c) => Some(c),
        _ => None,
    })
}

fn find_catchup_response(messages: &[Message]) -> Option<&CatchupResponse> {
    messages.iter().find_map(|m| match m {
        Message::CatchupResponse(c) => Some(c),
        _ => None,
    })
}

/// Elects node 1 leader of a 3-node cluster, with slot 1 fixed as a no-op.
fn elect_node_one(journal: MemoryJournal, app: RecordingApp) -> TestEngine {
    let engine = engine(1, 3, journal, app);
    engine.start();
    let prepare = engine.timeout().unwrap().expect("no prepare on timeout");
    let term = prepare.ballot;
    engine
        .paxos(vec![yes_prepare_response(2, 1, 1, term, 0, None)])
        .unwrap();
    assert_eq!(engine.role(), Role::Lead);
    engine
        .paxos(vec![yes_accept_response(2, 1, 1, term, 0)])
        .unwrap();
    assert_eq!(engine.progress().highest_fixed, 1);
    engine
}

/// S1: a cluster of one makes progress entirely through self-delivery and
/// comes back from a restart with its durable progress intact.
#[test]
fn single_node_self_progress() {
    let journal = MemoryJournal::new();
    let app = RecordingApp::default();
    let engine1 = engine(1, 1, journal.clone(), app.clone());
    engine1.start();

    let prepare = engine1.timeout().unwrap().expect("no prepare on timeout");
    assert_eq!(prepare.slot, 1);
    assert_eq!(prepare.ballot, ballot(1, 1));
    assert_eq!(engine1.role(), Role::Lead);
    assert_eq!(engine1.progress().highest_fixed, 1);
    // the recovery no-op never reaches the application
    assert!(app.applied().is_empty());

    let messages = engine1.command(vec![app_command(0x58, b"hi")]).unwrap();
    assert_eq!(find_accept(&messages, 2).command, app_command(0x58, b"hi"));
    assert_eq!(find_fixed(&messages).unwrap().fixed_slot, 2);
    assert_eq!(app.applied(), vec![(2, vec![0x58], b"hi".to_vec())]);
    assert_eq!(
        engine1.progress(),
        Progress {
            node_id: 1,
            highest_promised: ballot(1, 1),
            highest_accepted: 2,
            highest_fixed: 2,
        },
    );

    // restart on the same journal: durable progress survives, volatile
    // leadership does not
    let app2 = RecordingApp::default();
    let engine2 = engine(1, 1, journal, app2.clone());
    assert_eq!(engine2.role(), Role::Follow);
    assert_eq!(
        engine2.progress(),
        Progress {
            node_id: 1,
            highest_promised: ballot(1, 1),
            highest_accepted: 2,
            highest_fixed: 2,
        },
    );

    // re-delivered messages fix nothing new
    let result = engine2
        .paxos(vec![Message::Fixed(Fixed {
            from: 1,
            fixed_slot: 2,
            fixed_ballot: ballot(1, 1),
        })])
        .unwrap();
    assert!(result.commands_by_slot.is_empty());
    assert!(app2.applied().is_empty());
}

/// S2: the happy path in a 3-node cluster, including a node that missed the
/// accept and catches up off the fixed announcement.
#[test]
fn three_node_happy_path_with_catchup() {
    let app1 = RecordingApp::default();
    let engine1 = elect_node_one(MemoryJournal::new(), app1.clone());
    let term = ballot(1, 1);

    let messages = engine1.command(vec![app_command(0xA, b"A")]).unwrap();
    let accept = find_accept(&messages, 2).clone();
    assert_eq!(accept.command, app_command(0xA, b"A"));

    let result = engine1
        .paxos(vec![yes_accept_response(2, 1, 2, term, 1)])
        .unwrap();
    let fixed = find_fixed(&result.messages).expect("no fixed announcement").clone();
    assert_eq!(fixed.fixed_slot, 2);
    assert_eq!(engine1.progress().highest_fixed, 2);
    assert_eq!(app1.applied(), vec![(2, vec![0xA], b"A".to_vec())]);

    // node 3 missed both accepts and only sees the announcement
    let app3 = RecordingApp::default();
    let engine3 = engine(3, 3, MemoryJournal::new(), app3.clone());
    let announcement = Message::Fixed(fixed);

    let result = engine3.paxos(vec![announcement.clone()]).unwrap();
    let catchup = find_catchup(&result.messages).expect("no catchup request").clone();
    assert_eq!(catchup.to, 1);
    assert_eq!(catchup.slots, vec![1, 2]);

    // the leader answers from its journal
    let result = engine1.paxos(vec![Message::Catchup(catchup)]).unwrap();
    let catchup_response = find_catchup_response(&result.messages)
        .expect("no catchup response")
        .clone();
    assert_eq!(catchup_response.accepts.len(), 2);

    // node 3 journals the accepts, then the re-announcement fixes them
    let result = engine3
        .paxos(vec![Message::CatchupResponse(catchup_response)])
        .unwrap();
    assert!(result.commands_by_slot.is_empty());

    let result = engine3.paxos(vec![announcement]).unwrap();
    assert_eq!(result.commands_by_slot.len(), 2);
    assert_eq!(engine3.progress().highest_fixed, 2);
    assert_eq!(app3.applied(), vec![(2, vec![0xA], b"A".to_vec())]);
}

/// S3: an isolated leader abdicates on evidence that a newer leader has
/// fixed more, then converges to the newer leader's value.
#[test]
fn split_brain_rejoin_converges() {
    let app1 = RecordingApp::default();
    let engine1 = engine(1, 3, MemoryJournal::new(), app1.clone());
    engine1.start();

    // node 1 wins its election, but its slot-1 no-op never commits
    let prepare = engine1.timeout().unwrap().expect("no prepare on timeout");
    engine1
        .paxos(vec![yes_prepare_response(2, 1, 1, prepare.ballot, 0, None)])
        .unwrap();
    assert_eq!(engine1.role(), Role::Lead);
    assert_eq!(engine1.progress().highest_fixed, 0);

    // meanwhile node 2 led at (2,2) and fixed slot 1 = B; its nack carries
    // the higher fixed watermark
    let nack = Message::AcceptResponse(AcceptResponse {
        from: 2,
        to: 1,
        vote: Vote {
            voter: 2,
            voted_for: 1,
            slot: 1,
            yes: false,
            ballot: prepare.ballot,
        },
        voter_highest_fixed: 1,
    });
    engine1.paxos(vec![nack]).unwrap();
    assert_eq!(engine1.role(), Role::Follow);

    // node 2's announcement: node 1's own journalled accept is from the dead
    // term, so it must catch up rather than fix it
    let announcement = Message::Fixed(Fixed {
        from: 2,
        fixed_slot: 1,
        fixed_ballot: ballot(2, 2),
    });
    let result = engine1.paxos(vec![announcement.clone()]).unwrap();
    assert!(result.commands_by_slot.is_empty());
    let catchup = find_catchup(&result.messages).expect("no catchup request");
    assert_eq!(catchup.slots, vec![1]);

    let catchup_response = Message::CatchupResponse(CatchupResponse {
        from: 2,
        to: 1,
        accepts: vec![Accept {
            proposer: 2,
            slot: 1,
            ballot: ballot(2, 2),
            command: app_command(0xB, b"B"),
        }],
    });
    engine1.paxos(vec![catchup_response]).unwrap();

    let result = engine1.paxos(vec![announcement]).unwrap();
    assert_eq!(
        result.commands_by_slot.get(&1),
        Some(&app_command(0xB, b"B")),
    );
    assert_eq!(engine1.progress().highest_fixed, 1);
    // node 1 only ever applied B at slot 1
    assert_eq!(app1.applied(), vec![(1, vec![0xB], b"B".to_vec())]);
}

/// S4: recovery re-proposes the highest-ballot accept reported by any voter.
#[test]
fn recovery_picks_highest_numbered_accept() {
    let app1 = RecordingApp::default();
    let engine1 = engine(1, 5, MemoryJournal::new(), app1.clone());
    engine1.start();

    // an earlier prepare pushes node 1's promise to (4,3), so its fresh
    // term is (5,1)
    engine1
        .paxos(vec![Message::Prepare(Prepare {
            from: 3,
            slot: 1,
            ballot: ballot(4, 3),
        })])
        .unwrap();
    let prepare = engine1.timeout().unwrap().expect("no prepare on timeout");
    let term = prepare.ballot;
    assert_eq!(term, ballot(5, 1));

    // node 2 journalled C under (3,1), node 3 journalled D under (4,1)
    let accepted_c = Accept {
        proposer: 1,
        slot: 1,
        ballot: ballot(3, 1),
        command: app_command(0xC, b"C"),
    };
    let accepted_d = Accept {
        proposer: 1,
        slot: 1,
        ballot: ballot(4, 1),
        command: app_command(0xD, b"D"),
    };

    let result = engine1
        .paxos(vec![yes_prepare_response(2, 1, 1, term, 1, Some(accepted_c))])
        .unwrap();
    // two of five promises: no quorum yet
    assert!(result.messages.is_empty());
    assert_eq!(engine1.role(), Role::Recover);

    let result = engine1
        .paxos(vec![yes_prepare_response(3, 1, 1, term, 1, Some(accepted_d))])
        .unwrap();
    // quorum: the higher-ballot value D must be re-proposed under (5,1)
    let accept = find_accept(&result.messages, 1);
    assert_eq!(accept.ballot, term);
    assert_eq!(accept.command, app_command(0xD, b"D"));
    assert_eq!(engine1.role(), Role::Lead);

    // once a quorum accepts, slot 1 is fixed as D
    engine1
        .paxos(vec![yes_accept_response(2, 1, 1, term, 0)])
        .unwrap();
    let result = engine1
        .paxos(vec![yes_accept_response(3, 1, 1, term, 0)])
        .unwrap();
    assert_eq!(
        result.commands_by_slot.get(&1),
        Some(&app_command(0xD, b"D")),
    );
    assert_eq!(app1.applied(), vec![(1, vec![0xD], b"D".to_vec())]);
}

/// A voter that accepted beyond the probed slot forces the recoverer to
/// extend its probing before it may lead; unreported slots fill with no-ops.
#[test]
fn recovery_extends_probing_to_voters_accepted_slots() {
    let app1 = RecordingApp::default();
    let engine1 = engine(1, 3, MemoryJournal::new(), app1.clone());
    engine1.start();

    let prepare = engine1.timeout().unwrap().expect("no prepare on timeout");
    let term = prepare.ballot;

    let old_x = Accept {
        proposer: 2,
        slot: 1,
        ballot: ballot(0, 2),
        command: app_command(0x1, b"x"),
    };
    let old_y = Accept {
        proposer: 2,
        slot: 2,
        ballot: ballot(0, 2),
        command: app_command(0x2, b"y"),
    };

    // node 2 reports accepts through slot 3: probing must extend to 2 and 3
    let result = engine1
        .paxos(vec![yes_prepare_response(2, 1, 1, term, 3, Some(old_x))])
        .unwrap();
    assert_eq!(find_accept(&result.messages, 1).command, app_command(0x1, b"x"));
    assert!(result
        .messages
        .iter()
        .any(|m| matches!(m, Message::Prepare(p) if p.slot == 2)));
    assert!(result
        .messages
        .iter()
        .any(|m| matches!(m, Message::Prepare(p) if p.slot == 3)));
    assert_eq!(engine1.role(), Role::Recover);

    let result = engine1
        .paxos(vec![yes_prepare_response(2, 1, 2, term, 3, Some(old_y))])
        .unwrap();
    assert_eq!(find_accept(&result.messages, 2).command, app_command(0x2, b"y"));
    assert_eq!(engine1.role(), Role::Recover);

    // nothing was ever accepted at slot 3: it fills with a no-op
    let result = engine1
        .paxos(vec![yes_prepare_response(2, 1, 3, term, 3, None)])
        .unwrap();
    assert_eq!(find_accept(&result.messages, 3).command, Command::NoOp);
    assert_eq!(engine1.role(), Role::Lead);

    // node 2 accepts all three; the log fixes through slot 3 in order
    for slot in 1..=3 {
        engine1
            .paxos(vec![yes_accept_response(2, 1, slot, term, 0)])
            .unwrap();
    }
    assert_eq!(engine1.progress().highest_fixed, 3);
    assert_eq!(
        app1.applied(),
        vec![
            (1, vec![0x1], b"x".to_vec()),
            (2, vec![0x2], b"y".to_vec()),
        ],
    );
}

/// S5: the commit scan never advances past a slot that is not yet chosen.
#[test]
fn commit_scan_stops_at_gaps() {
    let app1 = RecordingApp::default();
    let engine1 = elect_node_one(MemoryJournal::new(), app1.clone());
    let term = ballot(1, 1);

    engine1
        .command(vec![
            app_command(0xA, b"A"),
            app_command(0xB, b"B"),
            app_command(0xC, b"C"),
        ])
        .unwrap();

    // slot 2 chosen: fixed advances to 2
    let result = engine1
        .paxos(vec![yes_accept_response(2, 1, 2, term, 1)])
        .unwrap();
    assert_eq!(find_fixed(&result.messages).unwrap().fixed_slot, 2);
    assert_eq!(engine1.progress().highest_fixed, 2);

    // slot 4 chosen out of order: no progress past the gap at 3
    let result = engine1
        .paxos(vec![yes_accept_response(2, 1, 4, term, 2)])
        .unwrap();
    assert!(result.commands_by_slot.is_empty());
    assert!(find_fixed(&result.messages).is_none());
    assert_eq!(engine1.progress().highest_fixed, 2);

    // slot 3 closes the gap: 3 and 4 fix in one step
    let result = engine1
        .paxos(vec![yes_accept_response(2, 1, 3, term, 2)])
        .unwrap();
    assert_eq!(
        result.commands_by_slot.keys().copied().collect::<Vec<_>>(),
        vec![3, 4],
    );
    assert_eq!(find_fixed(&result.messages).unwrap().fixed_slot, 4);
    assert_eq!(engine1.progress().highest_fixed, 4);
    assert_eq!(
        app1.applied(),
        vec![
            (2, vec![0xA], b"A".to_vec()),
            (3, vec![0xB], b"B".to_vec()),
            (4, vec![0xC], b"C".to_vec()),
        ],
    );
}

/// S6: a repeated prepare at the promised ballot re-acks identically and
/// leaves progress untouched.
#[test]
fn equal_ballot_prepare_is_idempotent() {
    let app = RecordingApp::default();
    let engine1 = engine(1, 3, MemoryJournal::new(), app);
    let prepare = Message::Prepare(Prepare {
        from: 2,
        slot: 1,
        ballot: ballot(3, 2),
    });

    let first = engine1.paxos(vec![prepare.clone()]).unwrap();
    let progress = engine1.progress();
    let second = engine1.paxos(vec![prepare]).unwrap();
    assert_eq!(first.messages, second.messages);
    assert_eq!(engine1.progress(), progress);
    match &second.messages[0] {
        Message::PrepareResponse(r) => assert!(r.vote.yes),
        other => panic!("unexpected message {:?}", other),
    }
}
