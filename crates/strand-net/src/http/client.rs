use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, Weak},
};

use strand_core::LoopHandle;

use crate::{Buffer, TcpClient, TcpConnectionPtr};
use crate::http::{HttpConnection, HttpConnectionPtr, HttpRole};

/// `connected == false` announces the connection went away.
pub type HttpClientConnectionCallback = Arc<dyn Fn(&HttpConnectionPtr, bool) + Send + Sync>;

struct HttpClientCore {
    client: TcpClient,
    connection: Mutex<Option<HttpConnectionPtr>>,
    connection_cb: Mutex<Option<HttpClientConnectionCallback>>,
}

/// TCP client wrapped in the HTTP framing shim; one connection at a
/// time, rebuilt by the underlying retry machinery.
pub struct HttpClient {
    core: Arc<HttpClientCore>,
}

impl HttpClient {
    pub fn new(loop_: &LoopHandle, server_addr: SocketAddr, name: impl Into<String>) -> Self {
        let client = TcpClient::new(loop_, server_addr, name);
        let core = Arc::new(HttpClientCore {
            client,
            connection: Mutex::new(None),
            connection_cb: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        core.client.set_connection_callback(Arc::new(move |conn| {
            if let Some(core) = weak.upgrade() {
                core.on_connection(conn);
            }
        }));
        core.client.set_message_callback(Arc::new(|conn, buffer| {
            HttpClientCore::on_message(conn, buffer);
        }));
        Self { core }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.core.client.server_addr()
    }

    pub fn set_retry(&self, retry: bool) {
        self.core.client.set_retry(retry);
    }

    pub fn set_connection_callback(&self, callback: HttpClientConnectionCallback) {
        *self.core.connection_cb.lock().unwrap() = Some(callback);
    }

    pub fn connect(&self) {
        self.core.client.connect();
    }

    pub fn disconnect(&self) {
        self.core.client.disconnect();
    }

    pub fn stop(&self) {
        self.core.client.stop();
    }

    pub fn connection(&self) -> Option<HttpConnectionPtr> {
        self.core.connection.lock().unwrap().clone()
    }

    pub fn connected(&self) -> bool {
        self.connection().is_some_and(|conn| conn.connected())
    }

    pub fn send_buffer(&self, buffer: Buffer) {
        if let Some(conn) = self.connection() {
            conn.send_buffer(buffer);
        }
    }
}

impl HttpClientCore {
    fn on_connection(&self, conn: &TcpConnectionPtr) {
        if conn.connected() {
            let http = HttpConnection::new(Arc::clone(conn), HttpRole::Client);
            conn.set_context::<Weak<HttpConnection>>(Arc::downgrade(&http));
            *self.connection.lock().unwrap() = Some(Arc::clone(&http));
            if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                cb(&http, true);
            }
        } else {
            let http = self.connection.lock().unwrap().take();
            conn.clear_context();
            if let Some(http) = http {
                if let Some(cb) = self.connection_cb.lock().unwrap().clone() {
                    cb(&http, false);
                }
            }
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
