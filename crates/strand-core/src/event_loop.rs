use std::{
    cell::RefCell,
    io,
    os::fd::RawFd,
    rc::Rc,
    sync::{
        Arc, Mutex, Once,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    thread::{self, ThreadId},
    time::{Duration, Instant},
};

use mio::Token;
use tracing::{debug, warn};

use crate::{
    Ready,
    channel::{Channel, Priority},
    poller::Poller,
    timer::{TimerCallback, TimerEntry, TimerId, TimerQueue},
};

const POLL_TIMEOUT: Duration = Duration::from_millis(10);

thread_local! {
    static CURRENT_LOOP: RefCell<Option<Rc<LoopInner>>> = const { RefCell::new(None) };
}

static IGNORE_SIGPIPE: Once = Once::new();

struct PendingTask {
    trace: Option<strand_trace::TraceContext>,
    task: Box<dyn FnOnce() + Send>,
}

pub(crate) struct LoopShared {
    owner: ThreadId,
    wake_fd: RawFd,
    quit: AtomicBool,
    looping: AtomicBool,
    pending: Mutex<Vec<PendingTask>>,
    next_timer_id: AtomicU64,
    next_token: AtomicUsize,
}

pub(crate) struct LoopInner {
    poller: RefCell<Poller>,
    timers: RefCell<TimerQueue>,
}

impl LoopInner {
    pub(crate) fn poller(&self) -> &RefCell<Poller> {
        &self.poller
    }
}

/// Runs `f` against the loop installed on the current thread.
///
/// Only reachable from code already running on a loop thread; channels
/// and timers are mutated exclusively through here.
pub(crate) fn with_current_loop<R>(f: impl FnOnce(&LoopInner) -> R) -> R {
    let inner = CURRENT_LOOP
        .with(|cur| cur.borrow().clone())
        .expect("no event loop on this thread");
    f(&inner)
}

fn drain_wakeup(fd: RawFd) {
    let mut one = 0u64;
    let n = unsafe { libc::read(fd, (&raw mut one).cast::<libc::c_void>(), 8) };
    if n != 8 {
        warn!(n, "short read from wakeup fd");
    }
}

/// Drains the timerfd, fires due timers, re-arms. Installed as the read
/// callback of the High-priority timer channel.
fn process_timers() {
    let now = Instant::now();
    let due = with_current_loop(|inner| {
        inner.timers.borrow().drain_fd();
        inner.timers.borrow_mut().extract_due(now)
    });
    // The queue is unborrowed here: callbacks may add or cancel freely.
    for entry in due {
        let mut callback = entry.callback.lock().unwrap();
        (*callback)();
    }
    with_current_loop(|inner| inner.timers.borrow_mut().rearm());
}

/// Single-threaded reactor: one poller, one timer queue, one wake-up
/// eventfd, a mutex-guarded cross-thread task list. At most one per
/// thread; every callback it dispatches runs on the thread that built it.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    inner: Rc<LoopInner>,
    wake_channel: Arc<Channel>,
    timer_channel: Arc<Channel>,
}

impl EventLoop {
    pub fn new() -> Self {
        IGNORE_SIGPIPE.call_once(|| unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        });

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        assert!(wake_fd >= 0, "eventfd failed: {}", io::Error::last_os_error());

        let timers = TimerQueue::new();
        let timer_fd = timers.fd();

        let shared = Arc::new(LoopShared {
            owner: thread::current().id(),
            wake_fd,
            quit: AtomicBool::new(false),
            looping: AtomicBool::new(false),
            pending: Mutex::new(Vec::new()),
            next_timer_id: AtomicU64::new(1),
            next_token: AtomicUsize::new(0),
        });
        let inner = Rc::new(LoopInner {
            poller: RefCell::new(Poller::new()),
            timers: RefCell::new(timers),
        });

        CURRENT_LOOP.with(|cur| {
            let mut cur = cur.borrow_mut();
            assert!(cur.is_none(), "another event loop already lives on this thread");
            *cur = Some(Rc::clone(&inner));
        });

        let handle = LoopHandle { shared: Arc::clone(&shared) };

        let wake_channel = Channel::new(&handle, wake_fd);
        wake_channel.set_read_callback(Box::new(move || drain_wakeup(wake_fd)));
        wake_channel.enable_reading();

        let timer_channel = Channel::new(&handle, timer_fd);
        timer_channel.set_priority(Priority::High);
        timer_channel.set_read_callback(Box::new(process_timers));
        timer_channel.enable_reading();

        debug!(owner = ?shared.owner, "event loop created");
        Self { shared, inner, wake_channel, timer_channel }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: Arc::clone(&self.shared) }
    }

    /// Enters the loop on the calling thread; blocks until `quit`.
    ///
    /// Each iteration polls for at most 10 ms, dispatches ready channels
    /// in descending priority order, then drains pending tasks.
    pub fn run(&self) {
        self.assert_in_loop_thread();
        assert!(!self.shared.looping.swap(true, Ordering::AcqRel), "event loop already running");
        debug!("event loop starts");

        let mut active: Vec<(Arc<Channel>, Ready)> = Vec::with_capacity(64);
        while !self.shared.quit.load(Ordering::Acquire) {
            active.clear();
            self.inner.poller.borrow_mut().poll(POLL_TIMEOUT, &mut active);
            // Stable sort: within a band, poller harvest order is kept.
            active.sort_by_key(|(channel, _)| std::cmp::Reverse(channel.priority()));
            for (channel, ready) in &active {
                channel.handle_event(*ready);
            }
            self.run_pending_tasks();
        }

        self.shared.looping.store(false, Ordering::Release);
        debug!("event loop stops");
    }

    pub fn quit(&self) {
        self.handle().quit();
    }

    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().run_in_loop(task);
    }

    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.handle().post(task);
    }

    pub fn run_at(&self, at: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_at(at, callback)
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_after(delay, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.handle().run_every(interval, callback)
    }

    pub fn cancel(&self, id: TimerId) {
        self.handle().cancel(id);
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(self.is_in_loop_thread(), "not on the owning loop thread");
    }

    fn run_pending_tasks(&self) {
        let tasks = {
            let mut pending = self.shared.pending.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for task in tasks {
            let prev = strand_trace::trace_context();
            strand_trace::restore_trace_context(task.trace);
            (task.task)();
            strand_trace::restore_trace_context(prev);
        }
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.wake_channel.disable_all();
        self.wake_channel.remove();
        self.timer_channel.disable_all();
        self.timer_channel.remove();
        CURRENT_LOOP.with(|cur| {
            *cur.borrow_mut() = None;
        });
        unsafe { libc::close(self.shared.wake_fd) };
        debug!("event loop destroyed");
    }
}

/// Cheap, cloneable, `Send` surface of an event loop: task posting,
/// timer registration, quitting. The loop itself never crosses threads.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    /// Runs `task` now when called on the loop thread, otherwise appends
    /// it to the pending list and wakes the loop.
    pub fn run_in_loop(&self, task: impl FnOnce() + Send + 'static) {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.post(task);
        }
    }

    /// Unconditionally queues `task` behind the current I/O batch. The
    /// poster's trace context is captured and restored around execution.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(PendingTask {
                trace: strand_trace::trace_context(),
                task: Box::new(task),
            });
        }
        self.wakeup();
    }

    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn run_at(&self, at: Instant, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(at, None, callback)
    }

    pub fn run_after(&self, delay: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Instant::now() + delay, None, callback)
    }

    pub fn run_every(&self, interval: Duration, callback: impl FnMut() + Send + 'static) -> TimerId {
        self.add_timer(Instant::now() + interval, Some(interval), callback)
    }

    pub fn cancel(&self, id: TimerId) {
        self.run_in_loop(move || {
            with_current_loop(|inner| inner.timers.borrow_mut().cancel(id.0));
        });
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.owner
    }

    pub fn assert_in_loop_thread(&self) {
        assert!(self.is_in_loop_thread(), "not on the owning loop thread");
    }

    fn add_timer(
        &self,
        expiration: Instant,
        interval: Option<Duration>,
        callback: impl FnMut() + Send + 'static,
    ) -> TimerId {
        let id = self.shared.next_timer_id.fetch_add(1, Ordering::Relaxed);
        let callback: TimerCallback = Arc::new(Mutex::new(callback));
        let entry = TimerEntry { id, expiration, interval, callback };
        self.run_in_loop(move || {
            with_current_loop(|inner| inner.timers.borrow_mut().add(entry));
        });
        TimerId(id)
    }

    pub(crate) fn alloc_token(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed))
    }

    fn wakeup(&self) {
        let one = 1u64;
        let n = unsafe { libc::write(self.shared.wake_fd, (&raw const one).cast::<libc::c_void>(), 8) };
        if n != 8 {
            warn!(n, "wakeup write was short");
        }
    }
}
