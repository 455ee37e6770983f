// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Contains code for abstracting multiple possible network implementations.

use std::io;
use std::time::Duration;

use crate::protocol::{Command, Message};

/// Anything a transport can hand to the replica loop: protocol traffic from
/// a peer, or a command submitted by a client.
#[derive(Clone, Debug)]
pub enum Inbound {
    Protocol(Message),
    Client(Command),
}

pub trait NetworkNode: Sized {
    /// Receives the next inbound item from any peer or client.
    /// Returns `io::Error` if nothing is received within timeout.
    fn recv(&self, timeout: Duration) -> io::Result<Inbound>;

    /// Sends the message to all known peers.
    fn broadcast(&self, msg: &Message);

    /// Tries to send the message to the peer with ID dst.
    /// Returns `true` on success `false` on failure.
    fn send(&self, dst: u8, msg: &Message) -> bool;
}
