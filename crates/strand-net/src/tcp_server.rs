use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use strand_core::{LoopHandle, LoopThreadPool};
use tracing::{debug, info};

use crate::{
    Acceptor, TcpConnection, TcpConnectionPtr,
    connection::{ConnectionCallback, MessageCallback, WriteCompleteCallback},
};

#[derive(Default)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
}

struct ServerCore {
    loop_: LoopHandle,
    name: String,
    acceptor: Arc<Acceptor>,
    pool: LoopThreadPool,
    connections: Mutex<HashMap<u64, TcpConnectionPtr>>,
    next_conn_id: AtomicU64,
    callbacks: Mutex<ServerCallbacks>,
    started: AtomicBool,
}

/// Accepts connections on the base loop and parks each one on an I/O
/// loop from the pool, round-robin. Owns the id-keyed connection map.
pub struct TcpServer {
    core: Arc<ServerCore>,
}

impl TcpServer {
    pub fn new(loop_: &LoopHandle, listen_addr: SocketAddr, name: impl Into<String>) -> io::Result<Self> {
        let name = name.into();
        let acceptor = Acceptor::new(loop_, listen_addr)?;
        let core = Arc::new(ServerCore {
            loop_: loop_.clone(),
            pool: LoopThreadPool::new(loop_.clone(), name.clone()),
            name,
            acceptor,
            connections: Mutex::new(HashMap::new()),
            next_conn_id: AtomicU64::new(1),
            callbacks: Mutex::new(ServerCallbacks::default()),
            started: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&core);
        core.acceptor.set_new_connection_callback(Box::new(move |stream, peer_addr| {
            if let Some(core) = weak.upgrade() {
                core.new_connection(stream, peer_addr);
            }
        }));
        Ok(Self { core })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.core.acceptor.listen_addr()
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn owner_loop(&self) -> &LoopHandle {
        &self.core.loop_
    }

    /// Number of I/O loop threads; 0 keeps everything on the base loop.
    /// Only meaningful before `start`.
    pub fn set_thread_count(&self, count: usize) {
        self.core.pool.set_thread_count(count);
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

    pub fn start(&self) {
        if self.core.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(name = %self.core.name, addr = %self.listen_addr(), "server starting");
        self.core.pool.start();
        self.core.acceptor.listen();
    }

    /// Stops accepting and force-closes every live connection.
    pub fn stop(&self) {
        self.core.acceptor.stop();
        let connections: Vec<TcpConnectionPtr> =
            self.core.connections.lock().unwrap().drain().map(|(_, conn)| conn).collect();
        for conn in connections {
            conn.force_close();
        }
    }

    pub fn connection(&self, id: u64) -> Option<TcpConnectionPtr> {
        self.core.connections.lock().unwrap().get(&id).cloned()
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().unwrap().len()
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ServerCore {
    fn new_connection(self: &Arc<Self>, stream: mio::net::TcpStream, peer_addr: SocketAddr) {
        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let io_loop = self.pool.next_loop();
        let name = format!("{}-{}#{}", self.name, peer_addr, id);
        let _ = stream.set_nodelay(true);

        let conn = TcpConnection::new(io_loop.clone(), id, name, stream);
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
        let weak: Weak<Self> = Arc::downgrade(self);
        conn.set_close_callback(Arc::new(move |conn| {
            if let Some(core) = weak.upgrade() {
                core.remove_connection(conn);
            }
        }));

        self.connections.lock().unwrap().insert(id, Arc::clone(&conn));
        io_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(&self, conn: &TcpConnectionPtr) {
        debug!(name = %conn.name(), "removing connection");
        self.connections.lock().unwrap().remove(&conn.id());
        let conn = Arc::clone(conn);
        let loop_ = conn.owner_loop().clone();
        // Destruction is deferred past the current dispatch.
        loop_.post(move || conn.connect_destroyed());
    }
}
