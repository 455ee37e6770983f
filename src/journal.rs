// Copyright (C) 2020 Quentin M. Kniep <hello@quentinkniep.com>
// Distributed under terms of the MIT license.

//! Crash-durable storage contract consumed by the Paxos core.
//!
//! The engine writes accepts keyed by slot and a single progress record, then
//! calls [`Journal::sync`] before any outbound message is released. An accept
//! may be overwritten up to the moment its slot is fixed; after that the
//! record is immutable from this node's perspective.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::debug;

use crate::codec::{self, DecodeError};
use crate::progress::Progress;
use crate::protocol::{Accept, Slot};

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("journal i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt journal record: {0}")]
    Corrupt(#[from] DecodeError),
}

pub trait Journal {
    /// Loads the progress record, or a blank one for a node that has never
    /// run. Called once at startup.
    fn load_progress(&mut self, node_id: u8) -> Result<Progress, JournalError>;

    /// Durably appends or overwrites the accept at its slot.
    /// Re-journalling an identical accept is observable only as a redundant
    /// sync.
    fn journal_accept(&mut self, accept: &Accept) -> Result<(), JournalError>;

    /// The accept journalled at `slot`, if any.
    fn load_accept(&self, slot: Slot) -> Result<Option<Accept>, JournalError>;

    /// Durably overwrites the progress record.
    fn save_progress(&mut self, progress: &Progress) -> Result<(), JournalError>;

    /// Blocks until all prior writes are on stable storage. This is the only
    /// durability barrier the engine relies on.
    fn sync(&mut self) -> Result<(), JournalError>;
}

/// Heap-backed journal for tests and simulations.
///
/// Clones share the same backing store, so a "restarted" node can reopen the
/// journal its predecessor wrote.
#[derive(Clone, Debug, Default)]
pub struct MemoryJournal {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    accepts: BTreeMap<Slot, Accept>,
    progress: Option<Progress>,
    syncs: usize,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of sync barriers so far, for contract tests.
    pub fn sync_count(&self) -> usize {
        self.state.lock().expect("memory journal poisoned").syncs
    }
}

impl Journal for MemoryJournal {
    fn load_progress(&mut self, node_id: u8) -> Result<Progress, JournalError> {
        let state = self.state.lock().expect("memory journal poisoned");
        Ok(state.progress.unwrap_or_else(|| Progress::new(node_id)))
    }

    fn journal_accept(&mut self, accept: &Accept) -> Result<(), JournalError> {
        let mut state = self.state.lock().expect("memory journal poisoned");
        state.accepts.insert(accept.slot, accept.clone());
        Ok(())
    }

    fn load_accept(&self, slot: Slot) -> Result<Option<Accept>, JournalError> {
        let state = self.state.lock().expect("memory journal poisoned");
        Ok(state.accepts.get(&slot).cloned())
    }

    fn save_progress(&mut self, progress: &Progress) -> Result<(), JournalError> {
        let mut state = self.state.lock().expect("memory journal poisoned");
        state.progress = Some(*progress);
        Ok(())
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        let mut state = self.state.lock().expect("memory journal poisoned");
        state.syncs += 1;
        Ok(())
    }
}

/// Directory-backed journal: one `accept-<slot>.bin` file per slot plus a
/// `progress.bin` record, all in the wire encoding. Writes are buffered by
/// the OS until [`Journal::sync`] fsyncs every dirty file and the directory.
#[derive(Debug)]
pub struct FileJournal {
    dir: PathBuf,
    dirty: Vec<PathBuf>,
}

impl FileJournal {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self, JournalError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            dirty: Vec::new(),
        })
    }

    fn accept_path(&self, slot: Slot) -> PathBuf {
        self.dir.join(format!("accept-{}.bin", slot))
    }

    fn progress_path(&self) -> PathBuf {
        self.dir.join("progress.bin")
    }

    fn write(&mut self, path: PathBuf, bytes: &[u8]) -> Result<(), JournalError> {
        fs::write(&path, bytes)?;
        if !self.dirty.contains(&path) {
            self.dirty.push(path);
        }
        Ok(())
    }
}

impl Journal for FileJournal {
    fn load_progress(&mut self, node_id: u8) -> Result<Progress, JournalError> {
        let path = self.progress_path();
        if !path.exists() {
            return Ok(Progress::new(node_id));
        }
        let bytes = fs::read(&path)?;
        Ok(codec::decode_progress(&bytes)?)
    }

    fn journal_accept(&mut self, accept: &Accept) -> Result<(), JournalError> {
        self.write(self.accept_path(accept.slot), &codec::encode_accept(accept))
    }

    fn load_accept(&self, slot: Slot) -> Result<Option<Accept>, JournalError> {
        let path = self.accept_path(slot);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path)?;
        Ok(Some(codec::decode_accept(&bytes)?))
    }

    fn save_progress(&mut self, progress: &Progress) -> Result<(), JournalError> {
        self.write(self.progress_path(), &codec::encode_progress(progress))
    }

    fn sync(&mut self) -> Result<(), JournalError> {
        for path in self.dirty.drain(..) {
            fs::File::open(&path)?.sync_all()?;
        }
        fs::File::open(&self.dir)?.sync_all()?;
        debug!("journal synced at {:?}", self.dir);
        Ok(())
    }
}
