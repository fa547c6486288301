use std::{
    any::Any,
    os::fd::RawFd,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU8, Ordering},
    },
};

use mio::{Interest, Token};
use tracing::debug;

use crate::{Ready, event_loop::LoopHandle};

/// Dispatch priority of a channel within one poll batch.
///
/// High channels (the timer fd) drain strictly before Normal (I/O
/// connections), Normal strictly before Low (signals).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

pub type EventCallback = Box<dyn FnMut() + Send>;

#[derive(Default)]
struct Handlers {
    read: Option<EventCallback>,
    write: Option<EventCallback>,
    close: Option<EventCallback>,
    error: Option<EventCallback>,
}

const INTEREST_READ: u8 = 1 << 0;
const INTEREST_WRITE: u8 = 1 << 1;

/// Binds one file descriptor to event callbacks on one event loop.
///
/// The channel does not own the fd; whoever opened it (socket, timerfd,
/// eventfd, signalfd) closes it, and must `remove()` the channel first.
/// Every mutation happens on the owning loop's thread.
pub struct Channel {
    loop_: LoopHandle,
    fd: RawFd,
    token: Token,
    weak_self: Weak<Channel>,
    priority: AtomicU8,
    interest: AtomicU8,
    registered: AtomicBool,
    handling: AtomicBool,
    handlers: Mutex<Handlers>,
    tie: Mutex<Option<Weak<dyn Any + Send + Sync>>>,
}

impl Channel {
    pub fn new(loop_: &LoopHandle, fd: RawFd) -> Arc<Self> {
        let token = loop_.alloc_token();
        Arc::new_cyclic(|weak_self| Self {
            loop_: loop_.clone(),
            fd,
            token,
            weak_self: weak_self.clone(),
            priority: AtomicU8::new(Priority::Normal as u8),
            interest: AtomicU8::new(0),
            registered: AtomicBool::new(false),
            handling: AtomicBool::new(false),
            handlers: Mutex::new(Handlers::default()),
            tie: Mutex::new(None),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn priority(&self) -> Priority {
        match self.priority.load(Ordering::Relaxed) {
            0 => Priority::Low,
            2 => Priority::High,
            _ => Priority::Normal,
        }
    }

    pub fn set_priority(&self, priority: Priority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    pub fn set_read_callback(&self, callback: EventCallback) {
        self.handlers.lock().unwrap().read = Some(callback);
    }

    pub fn set_write_callback(&self, callback: EventCallback) {
        self.handlers.lock().unwrap().write = Some(callback);
    }

    pub fn set_close_callback(&self, callback: EventCallback) {
        self.handlers.lock().unwrap().close = Some(callback);
    }

    pub fn set_error_callback(&self, callback: EventCallback) {
        self.handlers.lock().unwrap().error = Some(callback);
    }

    /// Ties the channel to its owner. While tied, events are dispatched
    /// only if the owner is still alive at dispatch time.
    pub fn tie(&self, owner: Weak<dyn Any + Send + Sync>) {
        *self.tie.lock().unwrap() = Some(owner);
    }

    pub fn enable_reading(&self) {
        self.interest.fetch_or(INTEREST_READ, Ordering::AcqRel);
        self.update();
    }

    pub fn enable_writing(&self) {
        self.interest.fetch_or(INTEREST_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_writing(&self) {
        self.interest.fetch_and(!INTEREST_WRITE, Ordering::AcqRel);
        self.update();
    }

    pub fn disable_all(&self) {
        self.interest.store(0, Ordering::Release);
        self.update();
    }

    #[inline]
    pub fn is_writing(&self) -> bool {
        self.interest.load(Ordering::Acquire) & INTEREST_WRITE != 0
    }

    #[inline]
    pub fn is_reading(&self) -> bool {
        self.interest.load(Ordering::Acquire) & INTEREST_READ != 0
    }

    pub(crate) fn interest(&self) -> Option<Interest> {
        let bits = self.interest.load(Ordering::Acquire);
        match (bits & INTEREST_READ != 0, bits & INTEREST_WRITE != 0) {
            (false, false) => None,
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        }
    }

    #[inline]
    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    pub(crate) fn set_registered(&self, registered: bool) {
        self.registered.store(registered, Ordering::Release);
    }

    fn update(&self) {
        self.loop_.assert_in_loop_thread();
        let this = self.weak_self.upgrade().expect("channel updated during teardown");
        crate::event_loop::with_current_loop(|inner| {
            inner.poller().borrow_mut().update_channel(&this);
        });
    }

    /// Detaches the channel from the poller. Must run on the loop thread
    /// before the fd is closed.
    pub fn remove(&self) {
        self.loop_.assert_in_loop_thread();
        let this = self.weak_self.upgrade().expect("channel removed during teardown");
        crate::event_loop::with_current_loop(|inner| {
            inner.poller().borrow_mut().remove_channel(&this);
        });
    }

    pub(crate) fn handle_event(self: &Arc<Self>, ready: Ready) {
        let tie = self.tie.lock().unwrap().clone();
        if let Some(owner) = tie {
            let Some(_guard) = owner.upgrade() else {
                debug!(fd = self.fd, "tied owner gone, dropping event");
                return;
            };
            self.handle_event_guarded(ready);
        } else {
            self.handle_event_guarded(ready);
        }
    }

    fn handle_event_guarded(&self, ready: Ready) {
        self.handling.store(true, Ordering::Release);
        let mut handlers = self.handlers.lock().unwrap();

        if ready.is_hup() && !ready.is_readable() {
            debug!(fd = self.fd, "channel hup");
            if let Some(cb) = handlers.close.as_mut() {
                cb();
            }
        }
        if ready.is_error() {
            if let Some(cb) = handlers.error.as_mut() {
                cb();
            }
        }
        if ready.is_readable() {
            if let Some(cb) = handlers.read.as_mut() {
                cb();
            }
        }
        if ready.is_writable() {
            if let Some(cb) = handlers.write.as_mut() {
                cb();
            }
        }

        self.handling.store(false, Ordering::Release);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        debug_assert!(!self.handling.load(Ordering::Acquire), "channel dropped mid-dispatch");
    }
}
