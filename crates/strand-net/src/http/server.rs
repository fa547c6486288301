use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

use strand_core::LoopHandle;
use tracing::debug;

use crate::{Buffer, TcpConnectionPtr, TcpServer};
use crate::http::{
    HttpConnection, HttpConnectionPtr, HttpRole,
    connection::HeadersCallback,
};

struct HttpServerCore {
    server: TcpServer,
    connections: Mutex<HashMap<u64, HttpConnectionPtr>>,
    headers_cb: Mutex<Option<HeadersCallback>>,
}

/// TCP server speaking the HTTP framing shim; keeps an id-keyed
/// registry so replies can be routed back by connection id long after
/// the request callback returned.
pub struct HttpServer {
    core: Arc<HttpServerCore>,
}

impl HttpServer {
    pub fn new(loop_: &LoopHandle, listen_addr: SocketAddr, name: impl Into<String>) -> io::Result<Self> {
        let server = TcpServer::new(loop_, listen_addr, name)?;
        let core = Arc::new(HttpServerCore {
            server,
            connections: Mutex::new(HashMap::new()),
            headers_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        core.server.set_connection_callback(Arc::new(move |conn| {
            if let Some(core) = weak.upgrade() {
                core.on_connection(conn);
            }
        }));
        core.server.set_message_callback(Arc::new(|conn, buffer| {
            HttpServerCore::on_message(conn, buffer);
        }));
        Ok(Self { core })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.core.server.listen_addr()
    }

    pub fn set_thread_count(&self, count: usize) {
        self.core.server.set_thread_count(count);
    }

    /// Fires once per message when a header block completes, on
    /// whichever I/O loop owns the connection.
    pub fn set_headers_callback(&self, callback: HeadersCallback) {
        *self.core.headers_cb.lock().unwrap() = Some(callback);
    }

    pub fn start(&self) {
        self.core.server.start();
    }

    pub fn stop(&self) {
        self.core.server.stop();
    }

    pub fn connection(&self, id: u64) -> Option<HttpConnectionPtr> {
        self.core.connections.lock().unwrap().get(&id).cloned()
    }

    /// Routes a reply to the originating connection; silently dropped
    /// when it is already gone.
    pub fn send_buffer_by_id(&self, id: u64, buffer: Buffer) {
        if let Some(conn) = self.connection(id) {
            conn.send_buffer(buffer);
        } else {
            debug!(id, "reply for a connection that is gone");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.core.connections.lock().unwrap().len()
    }
}

impl HttpServerCore {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        if conn.connected() {
            let http = HttpConnection::new(Arc::clone(conn), HttpRole::Server);
            if let Some(cb) = self.headers_cb.lock().unwrap().clone() {
                http.set_headers_callback(cb);
            }
            // The TCP context holds a weak ref; the registry keeps the
            // connection alive.
            conn.set_context::<Weak<HttpConnection>>(Arc::downgrade(&http));
            self.connections.lock().unwrap().insert(conn.id(), http);
        } else {
            self.connections.lock().unwrap().remove(&conn.id());
            conn.clear_context();
        }
    }

    fn on_message(conn: &TcpConnectionPtr, buffer: &mut Buffer) {
        let http = conn
            .with_context::<Weak<HttpConnection>, _>(|weak| weak.upgrade())
            .flatten();
        match http {
            Some(http) => http.handle_message(buffer),
            None => buffer.consume_all(),
        }
    }
}
