// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Single-threaded replica loop wiring the engine to a UDP transport.
//!
//! The engine declares when timers must be armed through [`TimerControl`];
//! the replica realizes them as deadlines and fires `timeout`/`heartbeat`
//! from its tick loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::prelude::*;
use tracing::error;

use crate::engine::{Engine, TimerControl};
use crate::journal::{Journal, JournalError};
use crate::network::{Inbound, NetworkNode};
use crate::protocol::Message;
use crate::quorum::SimpleMajority;
use crate::udp_network::UdpNetworkNode;
use crate::ReplicatedStateMachine;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const ELECTION_TIMEOUT_MIN_MS: u64 = 750;
const ELECTION_TIMEOUT_MAX_MS: u64 = 1500;
const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(250);

/// Deadline-backed timers shared between the engine (which arms them) and
/// the replica loop (which polls them).
#[derive(Clone, Default)]
pub struct DeadlineTimers {
    state: Arc<Mutex<TimerState>>,
}

#[derive(Default)]
struct TimerState {
    timeout_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
}

impl DeadlineTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the election deadline has passed; firing consumes it.
    fn take_timeout(&self) -> bool {
        let mut state = self.state.lock().expect("timer state poisoned");
        match state.timeout_at {
            Some(at) if Instant::now() >= at => {
                state.timeout_at = None;
                true
            }
            _ => false,
        }
    }

    /// True once the heartbeat deadline has passed; firing consumes it.
    fn take_heartbeat(&self) -> bool {
        let mut state = self.state.lock().expect("timer state poisoned");
        match state.heartbeat_at {
            Some(at) if Instant::now() >= at => {
                state.heartbeat_at = None;
                true
            }
            _ => false,
        }
    }
}

impl TimerControl for DeadlineTimers {
    fn set_random_timeout(&mut self) {
        let jitter = rand::thread_rng().gen_range(ELECTION_TIMEOUT_MIN_MS, ELECTION_TIMEOUT_MAX_MS);
        let mut state = self.state.lock().expect("timer state poisoned");
        state.timeout_at = Some(Instant::now() + Duration::from_millis(jitter));
    }

    fn clear_timeout(&mut self) {
        let mut state = self.state.lock().expect("timer state poisoned");
        state.timeout_at = None;
    }

    fn set_heartbeat(&mut self) {
        let mut state = self.state.lock().expect("timer state poisoned");
        state.heartbeat_at = Some(Instant::now() + HEARTBEAT_INTERVAL);
    }
}

/// One member of a replica group.
pub struct PaxosReplica<J, A> {
    network: UdpNetworkNode,
    engine: Engine<J, SimpleMajority, DeadlineTimers, A>,
    timers: DeadlineTimers,
}

impl<J, A> PaxosReplica<J, A>
where
    J: Journal,
    A: ReplicatedStateMachine,
{
    pub fn new(node_id: u8, cluster: &[u8], journal: J, app: A) -> Result<Self, JournalError> {
        let mut network = UdpNetworkNode::new(node_id)?;
        network.discover(cluster);
        let timers = DeadlineTimers::new();
        let engine = Engine::new(
            node_id,
            journal,
            SimpleMajority::new(cluster.len()),
            timers.clone(),
            app,
        )?;
        Ok(Self {
            network,
            engine,
            timers,
        })
    }

    /// Arms the initial election timeout.
    pub fn start(&self) {
        self.engine.start();
    }

    /// One iteration of the replica loop: drain the socket, then fire any
    /// due timers.
    pub fn tick(&mut self) {
        match self.network.recv(POLL_INTERVAL) {
            Ok(Inbound::Protocol(msg)) => match self.engine.paxos(vec![msg]) {
                Ok(result) => self.transmit(result.messages),
                Err(e) => error!("paxos batch failed: {}", e),
            },
            Ok(Inbound::Client(command)) => match self.engine.command(vec![command]) {
                Ok(messages) => self.transmit(messages),
                Err(e) => error!("client proposal failed: {}", e),
            },
            // nothing on the wire this interval
            Err(_) => {}
        }

        if self.timers.take_timeout() {
            match self.engine.timeout() {
                Ok(Some(prepare)) => self.network.broadcast(&Message::Prepare(prepare)),
                Ok(None) => {}
                Err(e) => error!("election timeout failed: {}", e),
            }
        }

        if self.timers.take_heartbeat() {
            match self.engine.heartbeat() {
                Ok(messages) => self.transmit(messages),
                Err(e) => error!("heartbeat failed: {}", e),
            }
        }
    }

    fn transmit(&self, messages: Vec<Message>) {
        for msg in messages {
            match msg.to_node() {
                Some(to) => {
                    self.network.send(to, &msg);
                }
                None => self.network.broadcast(&msg),
            }
        }
    }
}
