use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use strand_core::LoopHandle;
use tracing::debug;

use crate::{
    Connector, TcpConnection, TcpConnectionPtr,
    connection::{ConnectionCallback, MessageCallback, WriteCompleteCallback},
};

#[derive(Default)]
struct ClientCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

struct ClientCore {
    loop_: LoopHandle,
    name: String,
    connector: Arc<Connector>,
    connection: Mutex<Option<TcpConnectionPtr>>,
    next_conn_id: AtomicU64,
    retry: AtomicBool,
    want_connect: AtomicBool,
    callbacks: Mutex<ClientCallbacks>,
}

/// At most one live connection to one server, rebuilt through the
/// connector's back-off when `set_retry(true)` and the peer goes away.
pub struct TcpClient {
    core: Arc<ClientCore>,
}

impl TcpClient {
    pub fn new(loop_: &LoopHandle, server_addr: SocketAddr, name: impl Into<String>) -> Self {
        let core = Arc::new(ClientCore {
            loop_: loop_.clone(),
            name: name.into(),
            connector: Connector::new(loop_, server_addr),
            connection: Mutex::new(None),
            next_conn_id: AtomicU64::new(1),
            retry: AtomicBool::new(false),
            want_connect: AtomicBool::new(false),
            callbacks: Mutex::new(ClientCallbacks::default()),
        });

        let weak = Arc::downgrade(&core);
        core.connector.set_new_stream_callback(Box::new(move |stream| {
            if let Some(core) = weak.upgrade() {
                core.new_connection(stream);
            }
        }));
        Self { core }
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.core.connector.server_addr()
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.core.loop_
    }

    /// Reconnect after an established connection drops.
    pub fn set_retry(&self, retry: bool) {
        self.core.retry.store(retry, Ordering::Relaxed);
    }

    pub fn set_connection_callback(&self, callback: ConnectionCallback) {
        self.core.callbacks.lock().unwrap().connection = Some(callback);
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        self.core.callbacks.lock().unwrap().message = Some(callback);
    }

    pub fn set_write_complete_callback(&self, callback: WriteCompleteCallback) {
        self.core.callbacks.lock().unwrap().write_complete = Some(callback);
    }

    pub fn connect(&self) {
        self.core.want_connect.store(true, Ordering::Release);
        self.core.connector.start();
    }

    /// Graceful: half-close the current connection, keep the client
    /// usable.
    pub fn disconnect(&self) {
        self.core.want_connect.store(false, Ordering::Release);
        let conn = self.core.connection.lock().unwrap().clone();
        if let Some(conn) = conn {
            conn.shutdown();
        }
    }

    /// Abandons any in-flight connect attempt.
    pub fn stop(&self) {
        self.core.want_connect.store(false, Ordering::Release);
        self.core.connector.stop();
    }

    pub fn connection(&self) -> Option<TcpConnectionPtr> {
        self.core.connection.lock().unwrap().clone()
    }
}

impl ClientCore {
    /// Runs on the loop thread, straight from the connector.
    fn new_connection(self: &Arc<Self>, stream: mio::net::TcpStream) {
        self.loop_.assert_in_loop_thread();
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let peer = stream.peer_addr().map_or_else(|_| "?".to_owned(), |a| a.to_string());
        let name = format!("{}-{}#{}", self.name, peer, id);
        let _ = stream.set_nodelay(true);

        let conn = TcpConnection::new(self.loop_.clone(), id, name, stream);
        {
            let callbacks = self.callbacks.lock().unwrap();
            if let Some(cb) = callbacks.connection.clone() {
                conn.set_connection_callback(cb);
            }
            if let Some(cb) = callbacks.message.clone() {
                conn.set_message_callback(cb);
            }
            if let Some(cb) = callbacks.write_complete.clone() {
                conn.set_write_complete_callback(cb);
            }
        }
        let weak = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(core) = weak.upgrade() {
                core.remove_connection(conn);
            }
        }));

        *self.connection.lock().unwrap() = Some(Arc::clone(&conn));
        conn.connect_established();
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        debug!(name = %conn.name(), "client connection down");
        *self.connection.lock().unwrap() = None;
        let conn = Arc::clone(conn);
        let loop_ = conn.owner_loop().clone();
        loop_.post(move || conn.connect_destroyed());

        if self.retry.load(Ordering::Relaxed) && self.want_connect.load(Ordering::Acquire) {
            self.connector.restart();
        }
    }
}
