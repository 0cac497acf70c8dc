use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::ReactorError;

/// Identifies one registration with a reactor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId(pub(crate) u64);

/// Invoked once per readiness event or timer expiry
pub type ReadyCallback = Box<dyn FnMut()>;

/// Invoked once when a closed handle is fully torn down
pub type CloseCallback = Box<dyn FnOnce()>;

/// Event loop the streams register with.
///
/// Implementations never run two callbacks of the same handle at once, and
/// never invoke a readiness callback after `close` was called for its handle.
/// Close completions are delivered asynchronously, never from within `close`.
pub trait Reactor {
    /// Calls `callback` whenever `fd` becomes readable
    fn watch_readable(&self, fd: RawFd, callback: ReadyCallback) -> Result<HandleId, ReactorError>;

    /// Calls `callback` after `initial`, then every `period` (once when the
    /// period is zero)
    fn start_timer(&self, initial: Duration, period: Duration, callback: ReadyCallback) -> HandleId;

    /// Stops the handle and calls `on_closed` once it is torn down
    fn close(&self, handle: HandleId, on_closed: CloseCallback);
}

enum SourceKind {
    Readable(RawFd),
    Timer {
        deadline: Option<Instant>,
        period: Duration,
    },
}

struct Source {
    kind: SourceKind,
    // Taken out while the callback runs
    callback: Option<ReadyCallback>,
}

#[derive(Default)]
struct LoopState {
    next_id: u64,
    sources: BTreeMap<HandleId, Source>,
    closing: Vec<CloseCallback>,
    quit: bool,
}

impl LoopState {
    fn add(&mut self, kind: SourceKind, callback: ReadyCallback) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.sources.insert(
            id,
            Source {
                kind,
                callback: Some(callback),
            },
        );
        id
    }
}

/// Single-threaded reactor built on `poll(2)` and a list of timers
#[derive(Default)]
pub struct MainLoop {
    state: RefCell<LoopState>,
}

impl MainLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `run` return after the current iteration
    pub fn quit(&self) {
        self.state.borrow_mut().quit = true;
    }

    /// True when no handle is registered and no close is pending
    pub fn is_idle(&self) -> bool {
        let state = self.state.borrow();
        state.sources.is_empty() && state.closing.is_empty()
    }

    /// Runs until `quit` is called or nothing is left to wait for
    pub fn run(&self) -> Result<(), ReactorError> {
        loop {
            {
                let mut state = self.state.borrow_mut();
                if state.quit {
                    state.quit = false;
                    return Ok(());
                }
            }
            if self.is_idle() {
                return Ok(());
            }
            self.iterate(None)?;
        }
    }

    /// Waits for at most `max_wait` (forever when `None`) and dispatches
    /// everything that became ready. Returns the number of callbacks run.
    pub fn iterate(&self, max_wait: Option<Duration>) -> Result<usize, ReactorError> {
        // Completions of handles closed since the last turn
        let closing = mem::take(&mut self.state.borrow_mut().closing);
        let mut dispatched = closing.len();
        for on_closed in closing {
            on_closed();
        }

        let (mut pollfds, ids, timeout) = {
            let state = self.state.borrow();
            let now = Instant::now();
            let mut pollfds = Vec::new();
            let mut ids = Vec::new();
            let mut timeout = max_wait;

            for (id, source) in &state.sources {
                match source.kind {
                    SourceKind::Readable(fd) => {
                        pollfds.push(libc::pollfd {
                            fd,
                            events: libc::POLLIN,
                            revents: 0,
                        });
                        ids.push(*id);
                    }
                    SourceKind::Timer {
                        deadline: Some(deadline),
                        ..
                    } => {
                        let wait = deadline.saturating_duration_since(now);
                        timeout = Some(timeout.map_or(wait, |t| t.min(wait)));
                    }
                    SourceKind::Timer { deadline: None, .. } => {}
                }
            }

            if !state.closing.is_empty() {
                timeout = Some(Duration::ZERO);
            }
            (pollfds, ids, timeout)
        };

        // Nothing could ever wake us up
        if pollfds.is_empty() && timeout.is_none() {
            return Ok(dispatched);
        }

        let timeout_ms = match timeout {
            None => -1,
            Some(wait) => wait.as_nanos().div_ceil(1_000_000).min(i32::MAX as u128) as libc::c_int,
        };

        let ret = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(dispatched);
            }
            return Err(ReactorError::Poll(err));
        }

        let mut ready: Vec<HandleId> = pollfds
            .iter()
            .zip(ids)
            .filter(|(pollfd, _)| pollfd.revents != 0)
            .map(|(_, id)| id)
            .collect();

        {
            let mut state = self.state.borrow_mut();
            let now = Instant::now();
            for (id, source) in state.sources.iter_mut() {
                if let SourceKind::Timer { deadline, period } = &mut source.kind {
                    match *deadline {
                        Some(due) if due <= now => {
                            *deadline = if period.is_zero() {
                                None
                            } else if due + *period > now {
                                Some(due + *period)
                            } else {
                                // Fell behind, skip the missed expiries
                                Some(now + *period)
                            };
                            ready.push(*id);
                        }
                        _ => {}
                    }
                }
            }
        }

        for id in ready {
            if self.dispatch(id) {
                dispatched += 1;
            }
        }

        Ok(dispatched)
    }

    fn dispatch(&self, id: HandleId) -> bool {
        let callback = self
            .state
            .borrow_mut()
            .sources
            .get_mut(&id)
            .and_then(|source| source.callback.take());

        // Closed by an earlier callback of this turn
        let Some(mut callback) = callback else {
            return false;
        };

        trace!("mainloop: dispatching {:?}", id);
        callback();

        if let Some(source) = self.state.borrow_mut().sources.get_mut(&id) {
            source.callback.get_or_insert(callback);
        }
        true
    }
}

impl Reactor for MainLoop {
    fn watch_readable(&self, fd: RawFd, callback: ReadyCallback) -> Result<HandleId, ReactorError> {
        if fd < 0 {
            return Err(ReactorError::InvalidFd(fd));
        }
        let id = self
            .state
            .borrow_mut()
            .add(SourceKind::Readable(fd), callback);
        debug!("mainloop: watching fd {} as {:?}", fd, id);
        Ok(id)
    }

    fn start_timer(&self, initial: Duration, period: Duration, callback: ReadyCallback) -> HandleId {
        let kind = SourceKind::Timer {
            deadline: Some(Instant::now() + initial),
            period,
        };
        let id = self.state.borrow_mut().add(kind, callback);
        debug!("mainloop: timer {:?} every {:?}", id, period);
        id
    }

    fn close(&self, handle: HandleId, on_closed: CloseCallback) {
        let mut state = self.state.borrow_mut();
        if state.sources.remove(&handle).is_none() {
            warn!("mainloop: closing unknown handle {:?}", handle);
        }
        state.closing.push(on_closed);
    }
}
