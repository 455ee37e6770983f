// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! A simple binary for launching a single Paxos replica.

use clap::*;
use tracing::{info, info_span, Level};
use tracing_subscriber::{fmt::time::ChronoLocal, FmtSubscriber};

use quorumlog::{FileJournal, PaxosReplica, ReplicatedStateMachine, Slot};

/// Default state machine: just logs every command it is handed.
struct LogApp;

impl ReplicatedStateMachine for LogApp {
    fn apply(&mut self, slot: Slot, uuid: &[u8], payload: &[u8]) {
        info!(
            "applied slot {} uuid {:02x?} payload {:?}",
            slot,
            uuid,
            String::from_utf8_lossy(payload),
        );
    }
}

fn main() {
    let matches = clap_app!(quorumlog_replica =>
        (version: "0.1")
        (author: "Quentin M. Kniep <hello@quentinkniep.com>")
        (about: "Launch a single Paxos replica.")
        (@arg NODE_ID: +required "Sets this replica's node ID (1-based)")
        (@arg GROUP_SIZE: +required "Sets the current Paxos group size")
        (@arg journal: -j --journal +takes_value "Sets the journal directory")
    )
    .get_matches();

    let node_id = value_t!(matches, "NODE_ID", u8).unwrap_or_else(|e| e.exit());
    let group_size = value_t!(matches, "GROUP_SIZE", u8).unwrap_or_else(|e| e.exit());
    let journal_dir = matches
        .value_of("journal")
        .map(str::to_owned)
        .unwrap_or_else(|| format!("quorumlog-{}", node_id));

    // initialize the tracer
    FmtSubscriber::builder()
        .with_timer(ChronoLocal::with_format("[%Mm %Ss]".to_string()))
        .with_max_level(Level::DEBUG)
        .init();

    let tracing_span = info_span!("Replica", id = node_id);
    let _guard = tracing_span.enter();
    info!("Running Paxos replica {} of {}.", node_id, group_size);

    let cluster: Vec<u8> = (1..=group_size).collect();
    let journal = FileJournal::open(&journal_dir).expect("failed to open journal directory");
    let mut replica =
        PaxosReplica::new(node_id, &cluster, journal, LogApp).expect("failed to start replica");

    replica.start();
    loop {
        replica.tick();
    }
}
