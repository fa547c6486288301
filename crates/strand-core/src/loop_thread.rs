use std::{
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
        mpsc,
    },
    thread::JoinHandle,
};

use tracing::debug;

use crate::{EventLoop, LoopHandle};

/// One OS thread running one event loop. The loop is constructed on the
/// spawned thread (it is pinned to its creation thread) and its handle
/// is passed back to the caller.
pub struct LoopThread {
    handle: LoopHandle,
    join: Option<JoinHandle<()>>,
}

impl LoopThread {
    pub fn start(name: impl Into<String>) -> Self {
        let name = name.into();
        let (tx, rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let event_loop = EventLoop::new();
                tx.send(event_loop.handle()).expect("loop thread handoff");
                event_loop.run();
            })
            .expect("couldn't spawn loop thread");
        let handle = rx.recv().expect("loop thread never came up");
        debug!(name, "loop thread started");
        Self { handle, join: Some(join) }
    }

    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Pool of I/O loop threads fronted by a base loop.
///
/// `next_loop` hands out loops round-robin; with zero threads every
/// caller gets the base loop back.
pub struct LoopThreadPool {
    base: LoopHandle,
    name: String,
    thread_count: AtomicUsize,
    next: AtomicUsize,
    threads: Mutex<Vec<LoopThread>>,
    handles: Mutex<Vec<LoopHandle>>,
    started: AtomicBool,
}

impl LoopThreadPool {
    pub fn new(base: LoopHandle, name: impl Into<String>) -> Self {
        Self {
            base,
            name: name.into(),
            thread_count: AtomicUsize::new(0),
            next: AtomicUsize::new(0),
            threads: Mutex::new(Vec::new()),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Only meaningful before `start`.
    pub fn set_thread_count(&self, count: usize) {
        self.thread_count.store(count, Ordering::Relaxed);
    }

    pub fn start(&self) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let count = self.thread_count.load(Ordering::Relaxed);
        let mut threads = self.threads.lock().unwrap();
        let mut handles = self.handles.lock().unwrap();
        for i in 0..count {
            let thread = LoopThread::start(format!("{}-io-{i}", self.name));
            handles.push(thread.handle().clone());
            threads.push(thread);
        }
        debug!(name = %self.name, count, "loop pool started");
    }

    pub fn next_loop(&self) -> LoopHandle {
        let handles = self.handles.lock().unwrap();
        if handles.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % handles.len();
        handles[i].clone()
    }

    pub fn base_loop(&self) -> &LoopHandle {
        &self.base
    }
}
