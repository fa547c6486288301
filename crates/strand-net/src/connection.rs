use std::{
    any::Any,
    collections::VecDeque,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering},
    },
};

use strand_core::{Channel, LoopHandle};
use tracing::{debug, error, trace, warn};

use crate::{Buffer, Socket};

pub type TcpConnectionPtr = Arc<TcpConnection>;
pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, usize) + Send + Sync>;
pub(crate) type CloseCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;

const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Connection lifecycle; transitions are monotonic per direction and
/// happen only on the owning loop's thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

struct Callbacks {
    connection: ConnectionCallback,
    message: MessageCallback,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

impl Default for Callbacks {
    fn default() -> Self {
        Self {
            connection: Arc::new(|conn| {
                debug!(name = %conn.name(), state = ?conn.state(), "connection");
            }),
            message: Arc::new(|_conn, buffer| buffer.consume_all()),
            write_complete: None,
            high_water_mark: None,
            close: None,
        }
    }
}

struct ConnInner {
    /// Taken out of the slot while the message callback runs, so the
    /// callback can send on the same connection without deadlocking.
    input: Option<Buffer>,
    output: VecDeque<Buffer>,
    callbacks: Callbacks,
}

/// Buffered, stateful duplex TCP stream bound to one event loop.
///
/// Shared as `Arc` between the framework and user callbacks; the
/// channel holds a weak tie so events racing teardown are skipped.
pub struct TcpConnection {
    loop_: LoopHandle,
    id: u64,
    name: String,
    socket: Socket,
    channel: Arc<Channel>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    high_water_mark: AtomicUsize,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    inner: Mutex<ConnInner>,
    context: Mutex<Option<Box<dyn Any + Send + Sync>>>,
}

fn fallback_addr() -> SocketAddr {
    "0.0.0.0:0".parse().unwrap()
}

impl TcpConnection {
    pub(crate) fn new(
        loop_: LoopHandle,
        id: u64,
        name: String,
        stream: mio::net::TcpStream,
    ) -> TcpConnectionPtr {
        let socket = Socket::from_stream(stream);
        let local_addr = socket.local_addr().unwrap_or_else(|_| fallback_addr());
        let peer_addr = socket.peer_addr().unwrap_or_else(|_| fallback_addr());
        let channel = Channel::new(&loop_, socket.fd());
        socket.set_keep_alive(true);
        debug!(name = %name, %local_addr, %peer_addr, fd = socket.fd(), "connection created");

        Arc::new(Self {
            loop_,
            id,
            name,
            socket,
            channel,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            inner: Mutex::new(ConnInner {
                input: Some(Buffer::new()),
                output: VecDeque::new(),
                callbacks: Callbacks::default(),
            }),
            context: Mutex::new(None),
        })
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.loop_
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.inner.lock().unwrap().callbacks.connection = callback;
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.inner.lock().unwrap().callbacks.message = callback;
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.inner.lock().unwrap().callbacks.write_complete = Some(callback);
    }

    pub fn set_high_water_mark_callback(&self, callback: HighWaterMarkCallback, mark: usize) {
        self.high_water_mark.store(mark, Ordering::Relaxed);
        self.inner.lock().unwrap().callbacks.high_water_mark = Some(callback);
    }

    pub(crate) fn set_close_callback(&self, callback: CloseCallback) {
        self.inner.lock().unwrap().callbacks.close = Some(callback);
    }

    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        *self.context.lock().unwrap() = Some(Box::new(value));
    }

    pub fn with_context<T: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut slot = self.context.lock().unwrap();
        slot.as_mut()?.downcast_mut::<T>().map(f)
    }

    pub fn clear_context(&self) {
        *self.context.lock().unwrap() = None;
    }

    /// Sends a copy of `data`. In-loop with an idle output path this is
    /// one direct write; anything unwritten is queued and write interest
    /// enabled. From other threads the payload is copied and scheduled.
    pub fn send(self: &TcpConnectionPtr, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_in_loop(data);
        } else {
            let conn = Arc::clone(self);
            let owned = data.to_vec();
            self.loop_.run_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Sends an already-framed buffer without re-copying when the output
    /// path is busy.
    pub fn send_buffer(self: &TcpConnectionPtr, buffer: Buffer) {
        if self.state() != ConnectionState::Connected {
            return;
        }
        if self.loop_.is_in_loop_thread() {
            self.send_buffer_in_loop(buffer);
        } else {
            let conn = Arc::clone(self);
            self.loop_.run_in_loop(move || conn.send_buffer_in_loop(buffer));
        }
    }

    fn send_buffer_in_loop(self: &TcpConnectionPtr, mut buffer: Buffer) {
        self.loop_.assert_in_loop_thread();
        let queue_busy = {
            let inner = self.inner.lock().unwrap();
            self.channel.is_writing() || !inner.output.is_empty()
        };
        if queue_busy {
            let mut inner = self.inner.lock().unwrap();
            inner.output.push_back(buffer);
        } else {
            self.send_in_loop(buffer.peek());
            buffer.consume_all();
        }
    }

    fn send_in_loop(self: &TcpConnectionPtr, data: &[u8]) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            warn!(name = %self.name, "disconnected, giving up the write");
            return;
        }

        let mut write_complete = None;
        let mut high_water = None;
        {
            let mut inner = self.inner.lock().unwrap();
            let mut nwrote = 0;
            let mut fault = false;

            if !self.channel.is_writing() && inner.output.is_empty() {
                match self.socket.write(data) {
                    Ok(n) => {
                        nwrote = n;
                        self.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        error!(name = %self.name, ?err, "write failed");
                        if matches!(err.kind(), io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset)
                        {
                            fault = true;
                        }
                    }
                }
            }

            let remaining = data.len() - nwrote;
            if fault {
                // The read path or the poller will notice the close.
            } else if remaining == 0 {
                write_complete = inner.callbacks.write_complete.clone();
            } else {
                trace!(name = %self.name, remaining, "queueing remainder");
                let queued: usize = inner.output.iter().map(Buffer::readable_bytes).sum();
                let mark = self.high_water_mark.load(Ordering::Relaxed);
                if queued < mark && queued + remaining >= mark {
                    high_water = inner
                        .callbacks
                        .high_water_mark
                        .clone()
                        .map(|cb| (cb, queued + remaining));
                }
                if inner.output.is_empty() {
                    inner.output.push_back(Buffer::new());
                }
                inner.output.back_mut().unwrap().append(&data[nwrote..]);
                if !self.channel.is_writing() {
                    self.channel.enable_writing();
                }
            }
        }

        if let Some(cb) = write_complete {
            cb(self);
        }
        if let Some((cb, queued)) = high_water {
            let conn = Arc::clone(self);
            self.loop_.post(move || cb(&conn, queued));
        }
    }

    /// Half-close once all queued output has drained.
    pub fn shutdown(self: &TcpConnectionPtr) {
        if self
            .state
            .compare_exchange(
                ConnectionState::Connected as u8,
                ConnectionState::Disconnecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            let conn = Arc::clone(self);
            self.loop_.run_in_loop(move || conn.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            self.socket.shutdown_write();
        }
    }

    /// Tears the connection down without waiting for output to drain.
    pub fn force_close(self: &TcpConnectionPtr) {
        let state = self.state();
        if state == ConnectionState::Connected || state == ConnectionState::Disconnecting {
            self.set_state(ConnectionState::Disconnecting);
            let conn = Arc::clone(self);
            self.loop_.run_in_loop(move || conn.handle_close());
        }
    }

    /// Installs the channel callbacks and flips to connected. Runs on
    /// the owning loop right after the server/client adopts the socket.
    pub(crate) fn connect_established(self: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        debug_assert_eq!(self.state(), ConnectionState::Connecting);
        self.set_state(ConnectionState::Connected);

        let tie: Arc<dyn Any + Send + Sync> = Arc::clone(self) as Arc<dyn Any + Send + Sync>;
        self.channel.tie(Arc::downgrade(&tie));

        let weak = Arc::downgrade(self);
        self.channel.set_read_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_read();
                }
            }
        }));
        self.channel.set_write_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_write();
                }
            }
        }));
        self.channel.set_close_callback(Box::new({
            let weak = weak.clone();
            move || {
                if let Some(conn) = weak.upgrade() {
                    conn.handle_close();
                }
            }
        }));
        self.channel.set_error_callback(Box::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.handle_error();
            }
        }));
        self.channel.enable_reading();

        let connection_cb = self.inner.lock().unwrap().callbacks.connection.clone();
        connection_cb(self);
    }

    /// Final teardown on the owning loop; the last thing that happens to
    /// a connection.
    pub(crate) fn connect_destroyed(self: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
            self.channel.disable_all();
            let connection_cb = self.inner.lock().unwrap().callbacks.connection.clone();
            connection_cb(self);
        }
        self.channel.remove();
    }

    fn handle_read(self: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        let result = {
            let mut inner = self.inner.lock().unwrap();
            let input = inner.input.as_mut().expect("input buffer in use");
            input.read_from_fd(self.socket.fd())
        };
        match result {
            Ok(0) => self.handle_close(),
            Ok(n) => {
                self.received_bytes.fetch_add(n as u64, Ordering::Relaxed);
                let (message_cb, mut input) = {
                    let mut inner = self.inner.lock().unwrap();
                    (inner.callbacks.message.clone(), inner.input.take().expect("input buffer in use"))
                };
                message_cb(self, &mut input);
                self.inner.lock().unwrap().input = Some(input);
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => {
                // Leave the close to hup detection on the next poll.
                error!(name = %self.name, ?err, "read failed");
            }
        }
    }

    fn handle_write(self: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        if !self.channel.is_writing() {
            trace!(name = %self.name, "connection is down, no more writing");
            return;
        }

        let mut write_complete = None;
        let mut half_close = false;
        {
            let mut inner = self.inner.lock().unwrap();
            while let Some(front) = inner.output.front_mut() {
                match self.socket.write(front.peek()) {
                    Ok(n) => {
                        self.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
                        front.consume(n);
                        if front.readable_bytes() == 0 {
                            inner.output.pop_front();
                        } else {
                            break;
                        }
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) => {
                        error!(name = %self.name, ?err, "drain failed");
                        break;
                    }
                }
            }
            if inner.output.is_empty() {
                self.channel.disable_writing();
                write_complete = inner.callbacks.write_complete.clone();
                if self.state() == ConnectionState::Disconnecting {
                    half_close = true;
                }
            }
        }

        if half_close {
            self.socket.shutdown_write();
        }
        if let Some(cb) = write_complete {
            cb(self);
        }
    }

    fn handle_close(self: &TcpConnectionPtr) {
        self.loop_.assert_in_loop_thread();
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        debug!(name = %self.name, state = ?self.state(), "closing");
        self.set_state(ConnectionState::Disconnected);
        self.channel.disable_all();

        let (connection_cb, close_cb) = {
            let inner = self.inner.lock().unwrap();
            (inner.callbacks.connection.clone(), inner.callbacks.close.clone())
        };
        connection_cb(self);
        if let Some(cb) = close_cb {
            cb(self);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => error!(name = %self.name, ?err, "connection error"),
            Ok(None) => {}
            Err(err) => error!(name = %self.name, ?err, "couldn't fetch socket error"),
        }
    }
}
