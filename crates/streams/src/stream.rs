use std::cell::RefCell;
use std::mem;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use log::{debug, info, trace};

use crate::{Backend, HandleId, Reactor, ReadyCallback, StreamError, StreamKind};

/// What wakes a stream up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadySource {
    Readable(RawFd),
    Timer(Duration),
}

/// Lifecycle of a stream. `Closing` counts the handles whose close has not
/// completed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    Closing(usize),
    Closed,
}

struct StreamInner {
    reactor: Rc<dyn Reactor>,
    kind: StreamKind,
    per_context: bool,
    state: StreamState,
    ref_count: usize,
    backend: Option<Backend>,
    handles: Vec<HandleId>,
    on_closed: Option<Box<dyn FnOnce()>>,
    // The backend is out of `backend` while it runs
    dispatching: bool,
    finish_deferred: bool,
}

/// A live source of samples registered with a reactor.
///
/// Clones share the stream. Closing is asynchronous: `close` stops the
/// reactor handles and the backend is released once every handle reports
/// it is torn down. The last clone must not be dropped before then.
///
/// Backend callbacks may close or query their own stream. While a callback
/// runs the backend itself is out of reach: `with_backend` returns `None` and
/// `read_samples` does nothing.
pub struct Stream {
    inner: Rc<RefCell<StreamInner>>,
}

impl Stream {
    pub(crate) fn open(
        reactor: Rc<dyn Reactor>,
        backend: Backend,
        ready: ReadySource,
        per_context: bool,
    ) -> Result<Stream, StreamError> {
        let kind = backend.kind();
        let inner = Rc::new(RefCell::new(StreamInner {
            reactor: Rc::clone(&reactor),
            kind,
            per_context,
            state: StreamState::Open,
            ref_count: 1,
            backend: Some(backend),
            handles: Vec::new(),
            on_closed: None,
            dispatching: false,
            finish_deferred: false,
        }));

        let weak = Rc::downgrade(&inner);
        let callback: ReadyCallback = Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                on_ready(&inner);
            }
        });

        let handle = match ready {
            ReadySource::Readable(fd) => reactor.watch_readable(fd, callback)?,
            ReadySource::Timer(period) => reactor.start_timer(period, period, callback),
        };
        inner.borrow_mut().handles.push(handle);

        info!("opened {} stream ({:?})", kind, ready);
        Ok(Stream { inner })
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.borrow().kind
    }

    pub fn state(&self) -> StreamState {
        self.inner.borrow().state
    }

    pub fn is_closed(&self) -> bool {
        self.state() == StreamState::Closed
    }

    /// Whether the stream samples a single GPU context
    pub fn is_per_context(&self) -> bool {
        self.inner.borrow().per_context
    }

    /// Number of live clones
    pub fn ref_count(&self) -> usize {
        self.inner.borrow().ref_count
    }

    /// Consumes available samples without waiting for the reactor
    pub fn read_samples(&self) {
        dispatch(&self.inner, |backend| {
            backend.drain();
        });
    }

    pub fn has_pending_data(&self) -> bool {
        self.inner
            .borrow()
            .backend
            .as_ref()
            .is_some_and(Backend::has_pending_data)
    }

    /// Runs `f` on the backend; `None` once it has been released
    pub fn with_backend<R>(&self, f: impl FnOnce(&Backend) -> R) -> Option<R> {
        self.inner.borrow().backend.as_ref().map(f)
    }

    pub fn with_backend_mut<R>(&self, f: impl FnOnce(&mut Backend) -> R) -> Option<R> {
        self.inner.borrow_mut().backend.as_mut().map(f)
    }

    /// Starts closing the stream; `on_closed` runs once everything is
    /// released.
    ///
    /// # Panics
    ///
    /// When the stream is already closing or closed.
    pub fn close(&self, on_closed: impl FnOnce() + 'static) {
        let (reactor, handles) = {
            let mut inner = self.inner.borrow_mut();
            assert_eq!(
                inner.state,
                StreamState::Open,
                "{} stream closed twice",
                inner.kind
            );
            inner.on_closed = Some(Box::new(on_closed));
            let handles = mem::take(&mut inner.handles);
            inner.state = StreamState::Closing(handles.len());
            (Rc::clone(&inner.reactor), handles)
        };

        debug!("closing stream, {} handles", handles.len());
        if handles.is_empty() {
            finish_close(&self.inner);
            return;
        }

        for handle in handles {
            let inner = Rc::clone(&self.inner);
            reactor.close(handle, Box::new(move || handle_closed(&inner)));
        }
    }
}

fn on_ready(inner: &Rc<RefCell<StreamInner>>) {
    dispatch(inner, Backend::on_ready);
}

/// Runs `f` on the backend with the stream unborrowed
fn dispatch(inner: &Rc<RefCell<StreamInner>>, f: impl FnOnce(&mut Backend)) {
    let mut backend = {
        let mut state = inner.borrow_mut();
        if state.state != StreamState::Open {
            trace!("ignoring readiness of {} stream being closed", state.kind);
            return;
        }
        let Some(backend) = state.backend.take() else {
            return;
        };
        state.dispatching = true;
        backend
    };

    f(&mut backend);

    let finish = {
        let mut state = inner.borrow_mut();
        state.backend = Some(backend);
        state.dispatching = false;
        mem::take(&mut state.finish_deferred)
    };
    if finish {
        finish_close(inner);
    }
}

fn handle_closed(inner: &Rc<RefCell<StreamInner>>) {
    let remaining = {
        let mut inner = inner.borrow_mut();
        match inner.state {
            StreamState::Closing(n) if n > 1 => {
                inner.state = StreamState::Closing(n - 1);
                n - 1
            }
            StreamState::Closing(_) => 0,
            state => {
                debug!("spurious close completion in state {:?}", state);
                return;
            }
        }
    };

    if remaining == 0 {
        finish_close(inner);
    }
}

fn finish_close(inner: &Rc<RefCell<StreamInner>>) {
    let (backend, kind) = {
        let mut inner = inner.borrow_mut();
        if inner.dispatching {
            // Finished by `dispatch` once the backend is back
            inner.finish_deferred = true;
            return;
        }
        (inner.backend.take(), inner.kind)
    };
    if let Some(backend) = backend {
        backend.release();
    }

    let on_closed = {
        let mut inner = inner.borrow_mut();
        inner.state = StreamState::Closed;
        inner.on_closed.take()
    };
    info!("closed {} stream", kind);

    if let Some(on_closed) = on_closed {
        on_closed();
    }
}

impl Clone for Stream {
    fn clone(&self) -> Self {
        self.inner.borrow_mut().ref_count += 1;
        Stream {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        let mut inner = self.inner.borrow_mut();
        inner.ref_count -= 1;
        if inner.ref_count == 0 && !thread::panicking() {
            assert_eq!(
                inner.state,
                StreamState::Closed,
                "last reference to a {} stream dropped before it was closed",
                inner.kind
            );
        }
    }
}
