use std::{
    io,
    net::SocketAddr,
    os::fd::AsRawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
    time::Duration,
};

use rand::Rng;
use strand_core::{Channel, LoopHandle, TimerId};
use tracing::{debug, info, warn};

pub type NewStreamCallback = Box<dyn Fn(mio::net::TcpStream) + Send>;

const INIT_RETRY_DELAY_MS: u64 = 500;
const MAX_RETRY_DELAY_MS: u64 = 30 * 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ConnectorState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

struct Attempt {
    stream: mio::net::TcpStream,
    channel: Arc<Channel>,
}

/// Retrying non-blocking connect.
///
/// An in-progress connect parks the socket behind a writable-interest
/// channel; writability resolves it via `take_error`. Failures reconnect
/// with randomised exponential back-off, 500 ms doubling to 30 s.
pub struct Connector {
    loop_: LoopHandle,
    server_addr: SocketAddr,
    enabled: AtomicBool,
    state: AtomicU8,
    retry_delay_ms: AtomicU64,
    attempt: Mutex<Option<Attempt>>,
    on_connected: Mutex<Option<NewStreamCallback>>,
    retry_timer: Mutex<Option<TimerId>>,
}

impl Connector {
    pub fn new(loop_: &LoopHandle, server_addr: SocketAddr) -> Arc<Self> {
        Arc::new(Self {
            loop_: loop_.clone(),
            server_addr,
            enabled: AtomicBool::new(false),
            state: AtomicU8::new(ConnectorState::Disconnected as u8),
            retry_delay_ms: AtomicU64::new(INIT_RETRY_DELAY_MS),
            attempt: Mutex::new(None),
            on_connected: Mutex::new(None),
            retry_timer: Mutex::new(None),
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// Receives the connected socket; the connector is done with it.
    pub fn set_new_stream_callback(&self, callback: NewStreamCallback) {
        *self.on_connected.lock().unwrap() = Some(callback);
    }

    pub fn start(self: &Arc<Self>) {
        self.enabled.store(true, Ordering::Release);
        let me = Arc::clone(self);
        self.loop_.run_in_loop(move || me.start_in_loop());
    }

    /// Fresh connect round with the back-off reset; used after an
    /// established connection drops.
    pub fn restart(self: &Arc<Self>) {
        self.retry_delay_ms.store(INIT_RETRY_DELAY_MS, Ordering::Relaxed);
        self.enabled.store(true, Ordering::Release);
        let me = Arc::clone(self);
        self.loop_.run_in_loop(move || {
            me.set_state(ConnectorState::Disconnected);
            me.start_in_loop();
        });
    }

    pub fn stop(self: &Arc<Self>) {
        self.enabled.store(false, Ordering::Release);
        let me = Arc::clone(self);
        self.loop_.run_in_loop(move || me.stop_in_loop());
    }

    fn state(&self) -> ConnectorState {
        match self.state.load(Ordering::Acquire) {
            1 => ConnectorState::Connecting,
            2 => ConnectorState::Connected,
            _ => ConnectorState::Disconnected,
        }
    }

    fn set_state(&self, state: ConnectorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn start_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if !self.enabled.load(Ordering::Acquire) {
            debug!(addr = %self.server_addr, "connect disabled");
            return;
        }
        if self.state() != ConnectorState::Disconnected {
            return;
        }
        match mio::net::TcpStream::connect(self.server_addr) {
            Ok(stream) => self.connecting(stream),
            Err(err) => {
                warn!(addr = %self.server_addr, ?err, "connect failed");
                self.retry();
            }
        }
    }

    fn stop_in_loop(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if let Some(timer) = self.retry_timer.lock().unwrap().take() {
            self.loop_.cancel(timer);
        }
        if let Some(attempt) = self.attempt.lock().unwrap().take() {
            attempt.channel.disable_all();
            attempt.channel.remove();
        }
        self.set_state(ConnectorState::Disconnected);
    }

    fn connecting(self: &Arc<Self>, stream: mio::net::TcpStream) {
        self.set_state(ConnectorState::Connecting);
        let channel = Channel::new(&self.loop_, stream.as_raw_fd());

        let weak = Arc::downgrade(self);
        channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(connector) = weak.upgrade() {
                    connector.handle_write();
                }
            }
        }));
        channel.set_error_callback(Box::new(move || {
            if let Some(connector) = weak.upgrade() {
                connector.handle_write();
            }
        }));

        *self.attempt.lock().unwrap() = Some(Attempt { stream, channel: Arc::clone(&channel) });
        channel.enable_writing();
    }

    /// Writability on a connecting socket means the connect resolved,
    /// one way or the other.
    fn handle_write(self: &Arc<Self>) {
        self.loop_.assert_in_loop_thread();
        if self.state() != ConnectorState::Connecting {
            return;
        }
        let Some(attempt) = self.attempt.lock().unwrap().take() else {
            return;
        };
        attempt.channel.disable_all();
        attempt.channel.remove();

        match Self::verdict(&attempt.stream) {
            Ok(()) => {
                self.set_state(ConnectorState::Connected);
                info!(addr = %self.server_addr, "connected");
                if self.enabled.load(Ordering::Acquire) {
                    let callbacks = self.on_connected.lock().unwrap();
                    if let Some(cb) = callbacks.as_ref() {
                        cb(attempt.stream);
                    }
                } else {
                    drop(attempt.stream);
                }
            }
            Err(err) => {
                warn!(addr = %self.server_addr, ?err, "connect resolved with error");
                drop(attempt.stream);
                self.retry();
            }
        }
    }

    fn verdict(stream: &mio::net::TcpStream) -> io::Result<()> {
        if let Some(err) = stream.take_error()? {
            return Err(err);
        }
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        if peer == local {
            return Err(io::Error::other("self connection"));
        }
        Ok(())
    }

    fn retry(self: &Arc<Self>) {
        self.set_state(ConnectorState::Disconnected);
        if !self.enabled.load(Ordering::Acquire) {
            return;
        }
        let delay = self.retry_delay_ms.load(Ordering::Relaxed);
        let jitter = rand::rng().random_range(0..=delay / 4);
        self.retry_delay_ms.store((delay * 2).min(MAX_RETRY_DELAY_MS), Ordering::Relaxed);
        info!(addr = %self.server_addr, delay_ms = delay + jitter, "reconnect scheduled");

        let weak = Arc::downgrade(self);
        let timer = self.loop_.run_after(Duration::from_millis(delay + jitter), move || {
            if let Some(connector) = weak.upgrade() {
                connector.start_in_loop();
            }
        });
        *self.retry_timer.lock().unwrap() = Some(timer);
    }
}
