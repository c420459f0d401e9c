//! Per-key mutual exclusion, within a process and across processes.

use fs4::FileExt;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::error::Result;
use crate::weights::WeightArtifact;

/// What a computation leader hands to the threads that waited on it.
pub(crate) type Outcome = Result<Arc<WeightArtifact>>;

#[derive(Debug)]
enum SlotState {
    Running,
    Done(Outcome),
    Abandoned,
}

#[derive(Debug)]
struct Slot {
    state: Mutex<SlotState>,
    settled: Condvar,
}

impl Slot {
    fn state(&self) -> MutexGuard<'_, SlotState> {
        // A panicking holder leaves the state consistent; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settle(&self, next: SlotState) {
        let mut state = self.state();
        if matches!(*state, SlotState::Running) {
            *state = next;
        }
        self.settled.notify_all();
    }
}

/// Keys currently being computed by threads of this process.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    active: Mutex<HashMap<String, Arc<Slot>>>,
}

/// Result of [`InFlight::claim`].
pub(crate) enum Claim<'a> {
    /// The caller computes and must [`InFlightGuard::finish`].
    Leader(InFlightGuard<'a>),
    /// Another thread is computing.
    Follower(Waiter),
}

pub(crate) struct InFlightGuard<'a> {
    owner: &'a InFlight,
    key: String,
    slot: Arc<Slot>,
}

pub(crate) struct Waiter {
    slot: Arc<Slot>,
}

impl InFlight {
    fn active(&self) -> MutexGuard<'_, HashMap<String, Arc<Slot>>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Become the leader for `key`, or a follower of the current leader.
    pub(crate) fn claim(&self, key: &str) -> Claim<'_> {
        let mut active = self.active();
        if let Some(slot) = active.get(key) {
            return Claim::Follower(Waiter {
                slot: Arc::clone(slot),
            });
        }
        let slot = Arc::new(Slot {
            state: Mutex::new(SlotState::Running),
            settled: Condvar::new(),
        });
        active.insert(key.to_string(), Arc::clone(&slot));
        Claim::Leader(InFlightGuard {
            owner: self,
            key: key.to_string(),
            slot,
        })
    }
}

impl InFlightGuard<'_> {
    /// Publish the outcome to every follower and release the key.
    pub(crate) fn finish(self, outcome: &Outcome) {
        self.slot.settle(SlotState::Done(outcome.clone()));
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        {
            let mut active = self.owner.active();
            if active.get(&self.key).is_some_and(|s| Arc::ptr_eq(s, &self.slot)) {
                active.remove(&self.key);
            }
        }
        // No-op after `finish`.
        self.slot.settle(SlotState::Abandoned);
    }
}

impl Waiter {
    /// Block until the leader finishes.
    ///
    /// `None` if it went away without an outcome; the caller should claim again.
    pub(crate) fn wait(self) -> Option<Outcome> {
        let mut state = self.slot.state();
        loop {
            match &*state {
                SlotState::Running => {
                    state = self
                        .slot
                        .settled
                        .wait(state)
                        .unwrap_or_else(|e| e.into_inner());
                }
                SlotState::Done(outcome) => return Some(outcome.clone()),
                SlotState::Abandoned => return None,
            }
        }
    }
}

/// Advisory exclusive lock on `locks/<key>.lock`, released on drop.
#[derive(Debug)]
pub(crate) struct FileLock {
    file: File,
}

impl FileLock {
    fn open(path: &Path) -> io::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
    }

    pub(crate) fn acquire(path: &Path) -> io::Result<Self> {
        let file = Self::open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    /// `None` if another process holds the lock.
    pub(crate) fn try_acquire(path: &Path) -> io::Result<Option<Self>> {
        let file = Self::open(path)?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Self { file })),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}
