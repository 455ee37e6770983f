// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Bit-exact wire encoding of protocol messages and the progress record.
//!
//! All integers are big-endian and fixed-width. Every message starts with a
//! stable one-byte discriminator, lists are `u32`-count-prefixed and optional
//! fields carry a leading boolean byte. Decoding is strict: unknown tags,
//! short buffers and trailing bytes are all errors.

use thiserror::Error;

use crate::progress::Progress;
use crate::protocol::*;

pub const TAG_PREPARE: u8 = 0x01;
pub const TAG_PREPARE_RESPONSE: u8 = 0x02;
pub const TAG_ACCEPT: u8 = 0x03;
pub const TAG_ACCEPT_RESPONSE: u8 = 0x04;
pub const TAG_FIXED: u8 = 0x05;
pub const TAG_CATCHUP: u8 = 0x06;
pub const TAG_CATCHUP_RESPONSE: u8 = 0x07;

const CMD_NOOP: u8 = 0x00;
const CMD_APP: u8 = 0x01;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("buffer too short")]
    Truncated,
    #[error("unknown message tag {0:#04x}")]
    UnknownMessageTag(u8),
    #[error("unknown command tag {0:#04x}")]
    UnknownCommandTag(u8),
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Encodes a message into its wire representation.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        Message::Prepare(m) => {
            buf.push(TAG_PREPARE);
            buf.push(m.from);
            put_u64(&mut buf, m.slot);
            put_ballot(&mut buf, m.ballot);
        }
        Message::PrepareResponse(m) => {
            buf.push(TAG_PREPARE_RESPONSE);
            buf.push(m.from);
            buf.push(m.to);
            put_vote(&mut buf, &m.vote);
            put_u64(&mut buf, m.voter_highest_fixed);
            put_u64(&mut buf, m.voter_highest_accepted);
            match &m.journalled_accept {
                Some(a) => {
                    buf.push(1);
                    put_accept(&mut buf, a);
                }
                None => buf.push(0),
            }
        }
        Message::Accept(m) => {
            buf.push(TAG_ACCEPT);
            put_accept(&mut buf, m);
        }
        Message::AcceptResponse(m) => {
            buf.push(TAG_ACCEPT_RESPONSE);
            buf.push(m.from);
            buf.push(m.to);
            put_vote(&mut buf, &m.vote);
            put_u64(&mut buf, m.voter_highest_fixed);
        }
        Message::Fixed(m) => {
            buf.push(TAG_FIXED);
            buf.push(m.from);
            put_u64(&mut buf, m.fixed_slot);
            put_ballot(&mut buf, m.fixed_ballot);
        }
        Message::Catchup(m) => {
            buf.push(TAG_CATCHUP);
            buf.push(m.from);
            buf.push(m.to);
            put_u32(&mut buf, m.slots.len() as u32);
            for s in &m.slots {
                put_u64(&mut buf, *s);
            }
        }
        Message::CatchupResponse(m) => {
            buf.push(TAG_CATCHUP_RESPONSE);
            buf.push(m.from);
            buf.push(m.to);
            put_u32(&mut buf, m.accepts.len() as u32);
            for a in &m.accepts {
                put_accept(&mut buf, a);
            }
        }
    }
    buf
}

/// Decodes a message from its wire representation, requiring the buffer to
/// contain exactly one message.
pub fn decode_message(buf: &[u8]) -> Result<Message, DecodeError> {
    let mut r = Reader::new(buf);
    let msg = match r.u8()? {
        TAG_PREPARE => Message::Prepare(Prepare {
            from: r.u8()?,
            slot: r.u64()?,
            ballot: r.ballot()?,
        }),
        TAG_PREPARE_RESPONSE => {
            let from = r.u8()?;
            let to = r.u8()?;
            let vote = r.vote()?;
            let voter_highest_fixed = r.u64()?;
            let voter_highest_accepted = r.u64()?;
            let journalled_accept = if r.bool()? { Some(r.accept()?) } else { None };
            Message::PrepareResponse(PrepareResponse {
                from,
                to,
                vote,
                voter_highest_fixed,
                voter_highest_accepted,
                journalled_accept,
            })
        }
        TAG_ACCEPT => Message::Accept(r.accept()?),
        TAG_ACCEPT_RESPONSE => Message::AcceptResponse(AcceptResponse {
            from: r.u8()?,
            to: r.u8()?,
            vote: r.vote()?,
            voter_highest_fixed: r.u64()?,
        }),
        TAG_FIXED => Message::Fixed(Fixed {
            from: r.u8()?,
            fixed_slot: r.u64()?,
            fixed_ballot: r.ballot()?,
        }),
        TAG_CATCHUP => {
            let from = r.u8()?;
            let to = r.u8()?;
            let count = r.u32()?;
            let mut slots = Vec::new();
            for _ in 0..count {
                slots.push(r.u64()?);
            }
            Message::Catchup(Catchup { from, to, slots })
        }
        TAG_CATCHUP_RESPONSE => {
            let from = r.u8()?;
            let to = r.u8()?;
            let count = r.u32()?;
            let mut accepts = Vec::new();
            for _ in 0..count {
                accepts.push(r.accept()?);
            }
            Message::CatchupResponse(CatchupResponse { from, to, accepts })
        }
        tag => return Err(DecodeError::UnknownMessageTag(tag)),
    };
    r.finish()?;
    Ok(msg)
}

/// Encodes a standalone accept record, as stored in the journal.
pub fn encode_accept(accept: &Accept) -> Vec<u8> {
    let mut buf = Vec::new();
    put_accept(&mut buf, accept);
    buf
}

/// Decodes a standalone accept record.
pub fn decode_accept(buf: &[u8]) -> Result<Accept, DecodeError> {
    let mut r = Reader::new(buf);
    let accept = r.accept()?;
    r.finish()?;
    Ok(accept)
}

/// Encodes the progress record:
/// `node_id || counter || ballot_node_id || highest_accepted || highest_fixed`.
pub fn encode_progress(progress: &Progress) -> Vec<u8> {
    let mut buf = Vec::with_capacity(22);
    buf.push(progress.node_id);
    put_u32(&mut buf, progress.highest_promised.counter);
    buf.push(progress.highest_promised.node_id);
    put_u64(&mut buf, progress.highest_accepted);
    put_u64(&mut buf, progress.highest_fixed);
    buf
}

/// Decodes the progress record.
pub fn decode_progress(buf: &[u8]) -> Result<Progress, DecodeError> {
    let mut r = Reader::new(buf);
    let node_id = r.u8()?;
    let counter = r.u32()?;
    let ballot_node_id = r.u8()?;
    let highest_accepted = r.u64()?;
    let highest_fixed = r.u64()?;
    r.finish()?;
    Ok(Progress {
        node_id,
        highest_promised: BallotNumber::new(counter, ballot_node_id),
        highest_accepted,
        highest_fixed,
    })
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_ballot(buf: &mut Vec<u8>, b: BallotNumber) {
    put_u32(buf, b.counter);
    buf.push(b.node_id);
}

fn put_vote(buf: &mut Vec<u8>, v: &Vote) {
    buf.push(v.voter);
    buf.push(v.voted_for);
    put_u64(buf, v.slot);
    buf.push(v.yes as u8);
    put_ballot(buf, v.ballot);
}

fn put_command(buf: &mut Vec<u8>, c: &Command) {
    match c {
        Command::NoOp => buf.push(CMD_NOOP),
        Command::App { uuid, payload } => {
            assert!(uuid.len() <= u16::max_value() as usize, "client uuid too long");
            assert!(payload.len() <= u32::max_value() as usize, "payload too long");
            buf.push(CMD_APP);
            buf.extend_from_slice(&(uuid.len() as u16).to_be_bytes());
            buf.extend_from_slice(uuid);
            put_u32(buf, payload.len() as u32);
            buf.extend_from_slice(payload);
        }
    }
}

fn put_accept(buf: &mut Vec<u8>, a: &Accept) {
    buf.push(a.proposer);
    put_u64(buf, a.slot);
    put_ballot(buf, a.ballot);
    put_command(buf, &a.command);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() - self.pos < n {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        let b = self.bytes(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn bool(&mut self) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            b => Err(DecodeError::InvalidBool(b)),
        }
    }

    fn ballot(&mut self) -> Result<BallotNumber, DecodeError> {
        let counter = self.u32()?;
        let node_id = self.u8()?;
        Ok(BallotNumber::new(counter, node_id))
    }

    fn vote(&mut self) -> Result<Vote, DecodeError> {
        Ok(Vote {
            voter: self.u8()?,
            voted_for: self.u8()?,
            slot: self.u64()?,
            yes: self.bool()?,
            ballot: self.ballot()?,
        })
    }

    fn command(&mut self) -> Result<Command, DecodeError> {
        match self.u8()? {
            CMD_NOOP => Ok(Command::NoOp),
            CMD_APP => {
                let uuid_len = self.u16()? as usize;
                let uuid = self.bytes(uuid_len)?.to_vec();
                let payload_len = self.u32()? as usize;
                let payload = self.bytes(payload_len)?.to_vec();
                Ok(Command::App { uuid, payload })
            }
            tag => Err(DecodeError::UnknownCommandTag(tag)),
        }
    }

    fn accept(&mut self) -> Result<Accept, DecodeError> {
        Ok(Accept {
            proposer: self.u8()?,
            slot: self.u64()?,
            ballot: self.ballot()?,
            command: self.command()?,
        })
    }

    fn finish(&self) -> Result<(), DecodeError> {
        if self.pos != self.buf.len() {
            return Err(DecodeError::TrailingBytes(self.buf.len() - self.pos));
        }
        Ok(())
    }
}
