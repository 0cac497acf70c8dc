use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Duration;

use crate::{CloseCallback, HandleId, Reactor, ReactorError, ReadyCallback};

/// What a handle of the manual reactor was registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Readable(RawFd),
    Timer { initial: Duration, period: Duration },
}

struct Entry {
    registration: Registration,
    callback: Option<ReadyCallback>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    entries: BTreeMap<HandleId, Entry>,
    closing: Vec<(HandleId, CloseCallback)>,
    late: BTreeSet<HandleId>,
    // Callbacks of closed handles marked for late delivery
    zombies: BTreeMap<HandleId, ReadyCallback>,
}

/// Reactor driven by hand from tests: nothing fires until `fire` is called
/// and closes only complete on `complete_closes`.
#[derive(Default)]
pub struct TestReactor {
    state: RefCell<State>,
}

impl TestReactor {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Live handles, in registration order
    pub fn handles(&self) -> Vec<HandleId> {
        self.state.borrow().entries.keys().copied().collect()
    }

    pub fn registration(&self, handle: HandleId) -> Option<Registration> {
        self.state
            .borrow()
            .entries
            .get(&handle)
            .map(|entry| entry.registration)
    }

    /// Runs the callback of `handle`; false when it is closed
    pub fn fire(&self, handle: HandleId) -> bool {
        let callback = self
            .state
            .borrow_mut()
            .entries
            .get_mut(&handle)
            .and_then(|entry| entry.callback.take());

        let Some(mut callback) = callback else {
            return false;
        };
        callback();

        if let Some(entry) = self.state.borrow_mut().entries.get_mut(&handle) {
            entry.callback.get_or_insert(callback);
        }
        true
    }

    /// Fires every live handle once
    pub fn fire_all(&self) -> usize {
        self.handles()
            .into_iter()
            .filter(|handle| self.fire(*handle))
            .count()
    }

    /// Keeps the callback of `handle` around after it is closed, as a reactor
    /// that already queued an event for it would
    pub fn deliver_late(&self, handle: HandleId) {
        self.state.borrow_mut().late.insert(handle);
    }

    /// Runs the kept callback of a closed handle; false when there is none
    pub fn fire_late(&self, handle: HandleId) -> bool {
        let callback = self.state.borrow_mut().zombies.remove(&handle);
        let Some(mut callback) = callback else {
            return false;
        };
        callback();
        self.state.borrow_mut().zombies.insert(handle, callback);
        true
    }

    pub fn pending_closes(&self) -> usize {
        self.state.borrow().closing.len()
    }

    /// Delivers every queued close completion, including ones queued while
    /// delivering
    pub fn complete_closes(&self) -> usize {
        let mut completed = 0;
        loop {
            let closing = std::mem::take(&mut self.state.borrow_mut().closing);
            if closing.is_empty() {
                return completed;
            }
            for (_, on_closed) in closing {
                on_closed();
                completed += 1;
            }
        }
    }
}

impl Reactor for TestReactor {
    fn watch_readable(&self, fd: RawFd, callback: ReadyCallback) -> Result<HandleId, ReactorError> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd(fd));
        }
        Ok(self.add(Registration::Readable(fd), callback))
    }

    fn start_timer(&self, initial: Duration, period: Duration, callback: ReadyCallback) -> HandleId {
        self.add(Registration::Timer { initial, period }, callback)
    }

    fn close(&self, handle: HandleId, on_closed: CloseCallback) {
        let mut state = self.state.borrow_mut();
        if let Some(entry) = state.entries.remove(&handle) {
            if state.late.contains(&handle) {
                if let Some(callback) = entry.callback {
                    state.zombies.insert(handle, callback);
                }
            }
        }
        state.closing.push((handle, on_closed));
    }
}

impl TestReactor {
    fn add(&self, registration: Registration, callback: ReadyCallback) -> HandleId {
        let mut state = self.state.borrow_mut();
        state.next_id += 1;
        let id = HandleId(state.next_id);
        state.entries.insert(
            id,
            Entry {
                registration,
                callback: Some(callback),
            },
        );
        id
    }
}
