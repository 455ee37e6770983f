// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! A network implementation that uses UDP for sending messages.
//!
//! Protocol messages travel in the wire codec. Client submissions are framed
//! by a leading zero byte (message discriminators start at 0x01) followed by
//! a bincode-encoded request envelope.

use std::collections::HashSet;
use std::io;
use std::net::UdpSocket;
use std::time::Duration;

use rand::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{decode_message, encode_message};
use crate::network::{Inbound, NetworkNode};
use crate::protocol::{Command, Message};

const MAX_MSG_SIZE: usize = 64 * 1024;

/// First UDP port of the replica group; node `n` listens on `BASE_PORT + n`.
pub const BASE_PORT: u16 = 41000;

const CLIENT_FRAME: u8 = 0x00;

/// What a client sends to any replica to get a command replicated.
#[derive(Serialize, Deserialize, Clone, Debug)]
struct ClientRequest {
    uuid: Vec<u8>,
    payload: Vec<u8>,
}

#[derive(Debug)]
pub struct UdpNetworkNode {
    pub socket: UdpSocket,
    pub peers: HashSet<u8>,
    node_id: u8,
}

impl UdpNetworkNode {
    /// Creates the network node for a replica, listening on its well-known
    /// port.
    pub fn new(node_id: u8) -> io::Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", node_port(node_id)))?;
        Ok(Self {
            socket,
            peers: HashSet::new(),
            node_id,
        })
    }

    /// Adds the other cluster members to this node's list of known peers.
    pub fn discover(&mut self, other_nodes: &[u8]) {
        for node in other_nodes {
            if *node == self.node_id {
                continue;
            }
            self.peers.insert(*node);
        }
    }

    pub fn id(&self) -> u8 {
        self.node_id
    }

    /// Submits a client command to the replica with ID dst, from an
    /// ephemeral socket.
    pub fn submit(dst: u8, uuid: Vec<u8>, payload: Vec<u8>) -> io::Result<()> {
        // loop until we find an unused port
        let socket = loop {
            let port = rand::thread_rng().gen_range(1024, 65535);
            if let Ok(socket) = UdpSocket::bind(("127.0.0.1", port)) {
                break socket;
            }
        };
        let request = ClientRequest { uuid, payload };
        let mut frame = vec![CLIENT_FRAME];
        frame.extend(bincode::serialize(&request).map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, e)
        })?);
        socket.send_to(&frame, ("127.0.0.1", node_port(dst)))?;
        Ok(())
    }
}

impl NetworkNode for UdpNetworkNode {
    /// Try to receive a new inbound item from this node's UDP socket.
    /// Blocks until the next datagram arrives.
    /// If this takes longer than timeout an `io::Error` is returned instead.
    fn recv(&self, timeout: Duration) -> io::Result<Inbound> {
        self.socket
            .set_read_timeout(Some(timeout))
            .expect("set_read_timeout call failed");

        let mut buf = [0; MAX_MSG_SIZE];
        let (n, _from) = self.socket.recv_from(&mut buf)?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty datagram"));
        }

        if buf[0] == CLIENT_FRAME {
            let request: ClientRequest = bincode::deserialize(&buf[1..n])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            return Ok(Inbound::Client(Command::App {
                uuid: request.uuid,
                payload: request.payload,
            }));
        }

        match decode_message(&buf[..n]) {
            Ok(msg) => Ok(Inbound::Protocol(msg)),
            Err(e) => {
                warn!("dropping undecodable datagram: {}", e);
                Err(io::Error::new(io::ErrorKind::InvalidData, e))
            }
        }
    }

    /// Sends the Paxos message to all other replicas.
    fn broadcast(&self, msg: &Message) {
        for peer in self.peers.clone() {
            self.send(peer, msg);
        }
    }

    /// Sends the Paxos message to another replica.
    fn send(&self, dst: u8, msg: &Message) -> bool {
        let serialized = encode_message(msg);
        assert!(serialized.len() <= MAX_MSG_SIZE);
        self.socket
            .send_to(&serialized, ("127.0.0.1", node_port(dst)))
            .is_ok()
    }
}

fn node_port(node_id: u8) -> u16 {
    BASE_PORT + node_id as u16
}
