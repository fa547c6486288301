use std::{
    collections::HashMap,
    io, mem,
    os::fd::RawFd,
    sync::{Arc, Mutex},
};

use tracing::{error, warn};

use crate::{
    LoopHandle,
    channel::{Channel, Priority},
};

type SignalCallback = Box<dyn FnMut() + Send>;

/// signalfd-backed signal dispatch on one event loop.
///
/// Added signals are blocked for the calling thread (spawn loops after
/// installing handlers so the mask is inherited) and delivered through a
/// Low-priority channel, after timers and I/O.
pub struct SignalSet {
    loop_: LoopHandle,
    fd: RawFd,
    channel: Arc<Channel>,
    mask: Mutex<libc::sigset_t>,
    callbacks: Arc<Mutex<HashMap<i32, SignalCallback>>>,
}

fn empty_sigset() -> libc::sigset_t {
    unsafe {
        let mut set = mem::zeroed::<libc::sigset_t>();
        libc::sigemptyset(&mut set);
        set
    }
}

impl SignalSet {
    pub fn new(loop_: &LoopHandle) -> Arc<Self> {
        let mask = empty_sigset();
        let fd = unsafe { libc::signalfd(-1, &mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) };
        assert!(fd >= 0, "signalfd failed: {}", io::Error::last_os_error());

        let channel = Channel::new(loop_, fd);
        channel.set_priority(Priority::Low);

        let this = Arc::new(Self {
            loop_: loop_.clone(),
            fd,
            channel,
            mask: Mutex::new(mask),
            callbacks: Arc::new(Mutex::new(HashMap::new())),
        });

        let callbacks = Arc::clone(&this.callbacks);
        this.channel.set_read_callback(Box::new(move || {
            Self::drain(fd, &callbacks);
        }));
        let me = Arc::clone(&this);
        loop_.run_in_loop(move || me.channel.enable_reading());
        this
    }

    /// Registers `callback` for `signo` and blocks the signal so the
    /// signalfd sees it.
    pub fn add(&self, signo: i32, callback: impl FnMut() + Send + 'static) {
        let mut mask = self.mask.lock().unwrap();
        unsafe {
            libc::sigaddset(&mut *mask, signo);
            if libc::pthread_sigmask(libc::SIG_BLOCK, &*mask, std::ptr::null_mut()) != 0 {
                error!(signo, "pthread_sigmask failed");
            }
            if libc::signalfd(self.fd, &*mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) < 0 {
                error!(signo, err = %io::Error::last_os_error(), "signalfd update failed");
            }
        }
        self.callbacks.lock().unwrap().insert(signo, Box::new(callback));
    }

    pub fn remove(&self, signo: i32) {
        let mut mask = self.mask.lock().unwrap();
        unsafe {
            libc::sigdelset(&mut *mask, signo);
            if libc::signalfd(self.fd, &*mask, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC) < 0 {
                error!(signo, err = %io::Error::last_os_error(), "signalfd update failed");
            }
        }
        self.callbacks.lock().unwrap().remove(&signo);
    }

    fn drain(fd: RawFd, callbacks: &Mutex<HashMap<i32, SignalCallback>>) {
        loop {
            let mut info = unsafe { mem::zeroed::<libc::signalfd_siginfo>() };
            let n = unsafe {
                libc::read(fd, (&raw mut info).cast::<libc::c_void>(), mem::size_of::<libc::signalfd_siginfo>())
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    warn!(%err, "signalfd read failed");
                }
                return;
            }
            if n as usize != mem::size_of::<libc::signalfd_siginfo>() {
                warn!(n, "short read from signalfd");
                return;
            }
            let signo = info.ssi_signo as i32;
            if let Some(cb) = callbacks.lock().unwrap().get_mut(&signo) {
                cb();
            } else {
                warn!(signo, "signal with no handler");
            }
        }
    }

    /// Detach from the loop; must run before the set is dropped.
    pub fn shutdown(self: &Arc<Self>) {
        let me = Arc::clone(self);
        self.loop_.run_in_loop(move || {
            me.channel.disable_all();
            me.channel.remove();
        });
    }
}

impl Drop for SignalSet {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
