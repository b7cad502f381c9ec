//! Readiness notification over the `polling` crate.
//!
//! One registration per wait: a suspending operation arms its descriptor
//! with the wait id as the key, and the registration is removed when the
//! wait completes, times out, or is cancelled.

use polling::{Event, Poller};
use std::cell::RefCell;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Readiness interest flags for a suspended wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

pub(crate) struct Reactor {
    poller: Arc<Poller>,
    buf: RefCell<Vec<Event>>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            buf: RefCell::new(Vec::with_capacity(64)),
        })
    }

    /// Shared poller for wakers that may fire off-thread; `notify`
    /// interrupts a blocking wait.
    pub fn poller_arc(&self) -> Arc<Poller> {
        self.poller.clone()
    }

    pub fn add(&self, fd: RawFd, key: usize, interest: Interest) -> io::Result<()> {
        self.poller.add(fd, Self::event(key, interest))
    }

    /// Removal is best-effort: the kernel drops registrations itself when
    /// the descriptor closes.
    pub fn delete(&self, fd: RawFd) {
        let _ = self.poller.delete(fd);
    }

    /// Blocks until an event, notification, or timeout; fills `out` with
    /// (wait id, readiness) pairs in delivery order.
    pub fn wait(
        &self,
        out: &mut Vec<(usize, Interest)>,
        timeout: Option<Duration>,
    ) -> io::Result<usize> {
        let mut buf = self.buf.borrow_mut();
        buf.clear();
        let n = self.poller.wait(&mut buf, timeout)?;
        out.extend(buf.iter().map(|ev| (ev.key, Self::interest_of(ev))));
        Ok(n)
    }

    fn event(key: usize, interest: Interest) -> Event {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => Event::all(key),
            (true, false) => Event::readable(key),
            (false, true) => Event::writable(key),
            (false, false) => Event::none(key),
        }
    }

    fn interest_of(ev: &Event) -> Interest {
        let mut interest = Interest::NONE;
        if ev.readable {
            interest = interest.add(Interest::READABLE);
        }
        if ev.writable {
            interest = interest.add(Interest::WRITABLE);
        }
        interest
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}
