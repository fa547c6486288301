use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Instant,
};

use once_cell::sync::OnceCell;
use strand_core::LoopHandle;
use strand_net::{
    Buffer,
    http::{HttpConnectionPtr, HttpMethod, HttpServer},
};
use strand_trace::{Annotation, Endpoint, Span, TraceContextGuard};
use tracing::{debug, error, warn};

use crate::{
    BuiltinService, CompressKind, MessageKind, RPC_TUNNEL_PATH, RpcCodec, RpcController,
    RpcControllerPtr, RpcDoneCallback, RpcError, RpcMessage, Service,
};

const SERVER_HANDSHAKE: &[u8] = b"HTTP/1.1 200 OK\r\nConnection: Keep-Alive\r\n\r\n";

/// Server knobs. The inspection pages the disable flags govern live
/// outside this crate; `disable_builtin_service` is the one the core
/// acts on.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcServerOptions {
    pub disable_form: bool,
    pub disable_json: bool,
    pub disable_flags: bool,
    pub disable_pprof: bool,
    pub disable_statistics: bool,
    pub disable_builtin_service: bool,
    pub thread_count: usize,
}

/// Travels with the controller from dispatch to completion so the reply
/// finds its way back to the originating connection.
#[derive(Clone, Copy, Debug)]
struct ServerContext {
    id: i64,
    received_at: Instant,
    connection_id: u64,
}

struct ServerCore {
    http: HttpServer,
    codec: OnceCell<Arc<RpcCodec>>,
    services: Mutex<HashMap<String, Arc<dyn Service>>>,
    builtin: Arc<BuiltinService>,
    started: AtomicBool,
}

/// Accepts framed connections, decodes requests, dispatches to the
/// registered service implementations and serialises the replies.
pub struct RpcServer {
    core: Arc<ServerCore>,
}

impl RpcServer {
    pub fn new(loop_: &LoopHandle, listen_addr: SocketAddr, options: RpcServerOptions) -> io::Result<Self> {
        debug!(?options, "rpc server options");
        let http = HttpServer::new(loop_, listen_addr, "RpcServer")?;
        http.set_thread_count(options.thread_count);

        let core = Arc::new(ServerCore {
            http,
            codec: OnceCell::new(),
            services: Mutex::new(HashMap::new()),
            builtin: Arc::new(BuiltinService::default()),
            started: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&core);
        let codec = Arc::new(RpcCodec::new(Box::new(move |conn, message| {
            if let Some(core) = weak.upgrade() {
                core.on_request(conn, message);
            }
        })));
        core.codec.set(codec).ok();

        let weak = Arc::downgrade(&core);
        core.http.set_headers_callback(Arc::new(move |conn| {
            if let Some(core) = weak.upgrade() {
                core.on_headers(conn);
            }
        }));

        let server = Self { core };
        if !options.disable_builtin_service {
            server.register_service(Arc::clone(&server.core.builtin) as Arc<dyn Service>);
        }
        Ok(server)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.core.http.listen_addr()
    }

    /// Legal only before `start`; the registry is read-only afterwards.
    pub fn register_service(&self, service: Arc<dyn Service>) {
        assert!(
            !self.core.started.load(Ordering::Acquire),
            "service registration after start"
        );
        let name = service.descriptor().full_name;
        debug!(name, "service registered");
        self.core.services.lock().unwrap().insert(name.to_owned(), service);
    }

    pub fn start(&self) {
        if self.core.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let snapshot: Vec<(String, &'static str)> = self
            .core
            .services
            .lock()
            .unwrap()
            .values()
            .map(|service| {
                let descriptor = service.descriptor();
                (descriptor.full_name.to_owned(), descriptor.file)
            })
            .collect();
        self.core.builtin.set_services(snapshot);
        self.core.http.start();
    }

    pub fn stop(&self) {
        self.core.http.stop();
    }
}

impl ServerCore {
    /// The bootstrap handshake: a POST to the tunnel path flips the
    /// connection into frame-streaming mode, anything else bounces.
    fn on_headers(self: &Arc<Self>, conn: &HttpConnectionPtr) {
        let (method, path) = conn.with_request(|req| (req.method, req.path.clone()));
        if method == HttpMethod::Post && path == RPC_TUNNEL_PATH {
            conn.send(SERVER_HANDSHAKE);
            if let Some(codec) = self.codec.get() {
                let codec = Arc::clone(codec);
                conn.set_body_callback(Arc::new(move |conn, buffer| {
                    codec.parse_from_buffer(conn, buffer);
                }));
            }
        } else {
            conn.on_error(404, "Not Found");
        }
    }

    fn on_request(self: &Arc<Self>, conn: &HttpConnectionPtr, message: RpcMessage) {
        if message.kind != MessageKind::Request {
            warn!(id = message.id, "response frame on the server side");
            conn.shutdown();
            return;
        }

        let controller = RpcController::new();
        controller.set_context(ServerContext {
            id: message.id,
            received_at: Instant::now(),
            connection_id: conn.id(),
        });
        if let Some(compress) = message.compress {
            controller.set_compress_kind(compress);
        }

        let _guard = match message.trace {
            Some(t) => {
                controller.set_trace(t);
                let span = Span::factory_get(
                    &message.method,
                    t.trace_id,
                    t.span_id,
                    t.parent_span_id.unwrap_or(0),
                );
                span.set_host(Endpoint::from_socket_addr(
                    conn.local_addr(),
                    message.service.clone(),
                ));
                let guard = TraceContextGuard::new(t.trace_id, t.span_id);
                strand_trace::record_annotation(Annotation::server_recv());
                guard
            }
            None => TraceContextGuard::cleared(),
        };

        let Some(request_bytes) = message.request else {
            controller.set_failed(RpcError::InvalidRequest);
            self.complete(&controller, None);
            return;
        };

        let service = self.services.lock().unwrap().get(&message.service).cloned();
        let Some(service) = service else {
            controller.set_failed(RpcError::InvalidService);
            self.complete(&controller, None);
            return;
        };
        let Some(method) = service.descriptor().method(&message.method) else {
            controller.set_failed(RpcError::InvalidMethod);
            self.complete(&controller, None);
            return;
        };

        let weak = Arc::downgrade(self);
        let done: RpcDoneCallback = Box::new(move |controller, response| {
            if let Some(core) = weak.upgrade() {
                core.complete(controller, response);
            }
        });
        service.call_method(method, controller, &request_bytes, done);
    }

    /// Builds and ships the RESPONSE frame; a reply whose connection is
    /// gone is dropped silently.
    fn complete(self: &Arc<Self>, controller: &RpcControllerPtr, response: Option<Vec<u8>>) {
        let Some(context) = controller.with_context::<ServerContext, _>(|c| *c) else {
            error!("completion without a server context");
            return;
        };

        let mut message = RpcMessage::new_response(context.id);
        match (controller.failed(), response) {
            (true, _) => {
                message.error = controller.error();
                message.reason = Some(controller.error_text());
            }
            (false, Some(bytes)) => {
                message.response = Some(bytes);
                if controller.compress_kind() != CompressKind::None {
                    message.compress = Some(controller.compress_kind());
                }
            }
            (false, None) => {
                message.error = Some(RpcError::InternalError);
                message.reason = Some("service produced no response".to_owned());
            }
        }

        let _guard = match controller.trace() {
            Some(t) => {
                message.trace = Some(t);
                TraceContextGuard::new(t.trace_id, t.span_id)
            }
            None => TraceContextGuard::cleared(),
        };

        let mut buffer = Buffer::new();
        match RpcCodec::serialize_to_buffer(&mut message, &mut buffer) {
            Ok(()) => {
                self.http.send_buffer_by_id(context.connection_id, buffer);
                strand_trace::record_annotation(Annotation::server_send());
            }
            Err(err) => error!(%err, id = context.id, "response encode failed"),
        }
        debug!(
            id = context.id,
            latency_us = context.received_at.elapsed().as_micros() as u64,
            failed = controller.failed(),
            "request completed"
        );
        strand_trace::erase_current();
    }
}
