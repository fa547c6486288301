use std::{
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use tracing::warn;

use crate::{Buffer, TcpConnectionPtr};
use crate::http::{
    HttpParseError, HttpParser, HttpRequest, HttpResponse, HttpRole,
};

pub type HttpConnectionPtr = Arc<HttpConnection>;
pub type HeadersCallback = Arc<dyn Fn(&HttpConnectionPtr) + Send + Sync>;
pub type BodyCallback = Arc<dyn Fn(&HttpConnectionPtr, &mut Buffer) + Send + Sync>;
pub type HttpMessageCallback = Arc<dyn Fn(&HttpConnectionPtr) + Send + Sync>;

/// HTTP view over one TCP connection.
///
/// The headers callback fires once per message when the header block is
/// in; if a body callback is installed afterwards, every subsequent
/// byte is handed to it raw — the long-lived RPC tunnel mode. Without
/// one, the parser frames the body and the complete callback fires per
/// message.
pub struct HttpConnection {
    conn: TcpConnectionPtr,
    parser: Mutex<HttpParser>,
    headers_seen: AtomicBool,
    headers_cb: Mutex<Option<HeadersCallback>>,
    body_cb: Mutex<Option<BodyCallback>>,
    complete_cb: Mutex<Option<HttpMessageCallback>>,
}

impl HttpConnection {
    pub(crate) fn new(conn: TcpConnectionPtr, role: HttpRole) -> HttpConnectionPtr {
        Arc::new(Self {
            conn,
            parser: Mutex::new(HttpParser::new(role)),
            headers_seen: AtomicBool::new(false),
            headers_cb: Mutex::new(None),
            body_cb: Mutex::new(None),
            complete_cb: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.conn.id()
    }

    pub fn tcp(&self) -> &TcpConnectionPtr {
        &self.conn
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn connected(&self) -> bool {
        self.conn.connected()
    }

    pub fn set_headers_callback(&self, callback: HeadersCallback) {
        *self.headers_cb.lock().unwrap() = Some(callback);
    }

    /// Switches the connection into streaming mode: framing stops and
    /// raw fragments flow to `callback`.
    pub fn set_body_callback(&self, callback: BodyCallback) {
        *self.body_cb.lock().unwrap() = Some(callback);
    }

    pub fn set_complete_callback(&self, callback: HttpMessageCallback) {
        *self.complete_cb.lock().unwrap() = Some(callback);
    }

    pub fn with_request<R>(&self, f: impl FnOnce(&HttpRequest) -> R) -> R {
        f(self.parser.lock().unwrap().request())
    }

    pub fn with_response<R>(&self, f: impl FnOnce(&HttpResponse) -> R) -> R {
        f(self.parser.lock().unwrap().response())
    }

    pub fn send(self: &Arc<Self>, data: &[u8]) {
        self.conn.send(data);
    }

    pub fn send_buffer(self: &Arc<Self>, buffer: Buffer) {
        self.conn.send_buffer(buffer);
    }

    pub fn send_response(self: &Arc<Self>, response: &HttpResponse) {
        let mut buffer = Buffer::new();
        response.encode(&mut buffer);
        self.conn.send_buffer(buffer);
    }

    pub fn shutdown(self: &Arc<Self>) {
        self.conn.shutdown();
    }

    /// Sends an error status and closes; used for protocol violations.
    pub fn on_error(self: &Arc<Self>, status: u16, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(peer = %self.peer_addr(), status, reason, "failing http connection");
        let response = HttpResponse::new(status, reason.clone()).with_body(reason);
        self.send_response(&response);
        self.conn.shutdown();
    }

    /// Feeds freshly-read bytes through the parser and callbacks; wired
    /// as the TCP message callback by the server/client wrappers.
    pub(crate) fn handle_message(self: &Arc<Self>, buffer: &mut Buffer) {
        loop {
            if !self.headers_seen.load(Ordering::Acquire) {
                let outcome = {
                    let mut parser = self.parser.lock().unwrap();
                    parser.parse(buffer).map(|()| parser.headers_done())
                };
                match outcome {
                    Ok(true) => {
                        self.headers_seen.store(true, Ordering::Release);
                        let callback = self.headers_cb.lock().unwrap().clone();
                        if let Some(cb) = callback {
                            cb(self);
                        }
                    }
                    Ok(false) => return,
                    Err(err) => {
                        self.fail_parse(&err);
                        return;
                    }
                }
            }

            let body_cb = self.body_cb.lock().unwrap().clone();
            if let Some(cb) = body_cb {
                if buffer.readable_bytes() > 0 {
                    cb(self, buffer);
                }
                return;
            }

            let outcome = {
                let mut parser = self.parser.lock().unwrap();
                parser.parse(buffer).map(|()| parser.is_complete())
            };
            match outcome {
                Ok(true) => {
                    let callback = self.complete_cb.lock().unwrap().clone();
                    if let Some(cb) = callback {
                        cb(self);
                    }
                    // Keep-alive: rewind for the next message.
                    self.parser.lock().unwrap().reset();
                    self.headers_seen.store(false, Ordering::Release);
                    if buffer.readable_bytes() == 0 {
                        return;
                    }
                }
                Ok(false) => return,
                Err(err) => {
                    self.fail_parse(&err);
                    return;
                }
            }
        }
    }

    fn fail_parse(self: &Arc<Self>, err: &HttpParseError) {
        self.on_error(400, err.to_string());
    }
}
