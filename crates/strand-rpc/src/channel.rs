use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::{Duration, Instant},
};

use once_cell::sync::OnceCell;
use strand_core::{LoopHandle, TimerId};
use strand_net::{
    Buffer, LoadBalancer, LoadBalancerFactory, RequestResult, Resolver, ResolverFactory,
    http::{HttpClient, HttpConnectionPtr},
};
use strand_trace::{Annotation, Endpoint, Span, TraceContextGuard};
use tracing::{debug, error, warn};

use crate::{
    BUILTIN_SERVICE, HeartBeatRequest, HeartBeatResponse, MessageKind, MethodDescriptor,
    RPC_TUNNEL_PATH, RpcCodec, RpcController, RpcControllerPtr, RpcError, RpcMessage,
    ServiceDescriptor, TraceRef, decode_payload, encode_payload,
};

/// Client channel knobs; `trace_rate` samples one trace every N calls
/// (0 = always, negative = never).
pub struct RpcChannelOptions {
    pub resolver: String,
    pub loadbalancer: String,
    pub trace_rate: i32,
    pub heartbeat_interval: Option<Duration>,
}

impl Default for RpcChannelOptions {
    fn default() -> Self {
        Self {
            resolver: "static".to_owned(),
            loadbalancer: "random".to_owned(),
            trace_rate: 1000,
            heartbeat_interval: None,
        }
    }
}

/// Completion for one issued call; `None` bytes when the controller
/// carries the failure instead.
pub type ResponseCallback = Box<dyn FnOnce(&RpcControllerPtr, Option<Vec<u8>>) + Send>;

struct OutstandingCall {
    controller: RpcControllerPtr,
    done: ResponseCallback,
    timer: Option<TimerId>,
    sent_at: Instant,
    /// Kept so the client-recv annotation outlives the registry entry,
    /// which the server side erases when it completes.
    span: Option<Arc<Span>>,
}

/// Outstanding and parked requests live under one lock: completion may
/// arrive on an I/O loop while issuance comes from any thread.
#[derive(Default)]
struct CallMaps {
    outstanding: HashMap<i64, OutstandingCall>,
    pending: HashMap<i64, RpcMessage>,
}

struct ChannelCore {
    loop_: LoopHandle,
    options: RpcChannelOptions,
    next_id: AtomicI64,
    resolver: Box<dyn Resolver>,
    balancer: Mutex<Box<dyn LoadBalancer>>,
    codec: OnceCell<Arc<RpcCodec>>,
    clients: Mutex<Vec<HttpClient>>,
    connections: Mutex<HashMap<SocketAddr, HttpConnectionPtr>>,
    calls: Mutex<CallMaps>,
    connected: AtomicBool,
    heartbeat_timer: Mutex<Option<TimerId>>,
}

/// Issues typed calls against a resolved set of backends over
/// long-lived framed connections: assigns ids, registers outstanding
/// calls, arms timeouts, matches replies, propagates traces, feeds the
/// balancer, reconnects.
pub struct RpcChannel {
    core: Arc<ChannelCore>,
}

impl RpcChannel {
    pub fn new(loop_: &LoopHandle, options: RpcChannelOptions) -> Self {
        let resolver = ResolverFactory::create(&options.resolver)
            .unwrap_or_else(|| panic!("unknown resolver {:?}", options.resolver));
        let balancer = LoadBalancerFactory::create(&options.loadbalancer)
            .unwrap_or_else(|| panic!("unknown load balancer {:?}", options.loadbalancer));

        let core = Arc::new(ChannelCore {
            loop_: loop_.clone(),
            options,
            next_id: AtomicI64::new(1),
            resolver,
            balancer: Mutex::new(balancer),
            codec: OnceCell::new(),
            clients: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            calls: Mutex::new(CallMaps::default()),
            connected: AtomicBool::new(false),
            heartbeat_timer: Mutex::new(None),
        });

        let weak = Arc::downgrade(&core);
        let codec = Arc::new(RpcCodec::new(Box::new(move |conn, message| {
            if let Some(core) = weak.upgrade() {
                core.on_response(conn, message);
            }
        })));
        core.codec.set(codec).ok();
        Self { core }
    }

    /// Resolves `name` through the configured resolver and opens one
    /// retrying connection per endpoint.
    pub fn connect(&self, name: &str) {
        let weak = Arc::downgrade(&self.core);
        self.core.resolver.resolve(
            name,
            Box::new(move |addrs| {
                if let Some(core) = weak.upgrade() {
                    for addr in addrs {
                        core.make_connection(addr);
                    }
                }
            }),
        );
    }

    pub fn connect_addr(&self, addr: SocketAddr) {
        self.core.make_connection(addr);
    }

    pub fn connected(&self) -> bool {
        self.core.connected.load(Ordering::Acquire)
    }

    /// The generated stubs land here with the serialised request.
    pub fn call_method(
        &self,
        service: &'static ServiceDescriptor,
        method: &MethodDescriptor,
        controller: RpcControllerPtr,
        request: Vec<u8>,
        done: ResponseCallback,
    ) {
        self.core.call_method(service, method, controller, request, done);
    }

    /// Half-closes every backend connection.
    pub fn shutdown(&self) {
        for client in self.core.clients.lock().unwrap().iter() {
            client.disconnect();
        }
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        if let Some(timer) = self.core.heartbeat_timer.lock().unwrap().take() {
            self.core.loop_.cancel(timer);
        }
        for client in self.core.clients.lock().unwrap().iter() {
            client.stop();
        }
    }
}

impl ChannelCore {
    fn make_connection(self: &Arc<Self>, addr: SocketAddr) {
        debug!(%addr, "opening backend connection");
        let client = HttpClient::new(&self.loop_, addr, "RpcChannel");
        client.set_retry(true);
        let weak = Arc::downgrade(self);
        client.set_connection_callback(Arc::new(move |conn, connected| {
            if let Some(core) = weak.upgrade() {
                core.on_connection(addr, conn, connected);
            }
        }));
        client.connect();
        self.clients.lock().unwrap().push(client);
    }

    fn on_connection(self: &Arc<Self>, addr: SocketAddr, conn: &HttpConnectionPtr, connected: bool) {
        if connected {
            conn.send(
                format!("POST {RPC_TUNNEL_PATH} HTTP/1.1\r\nConnection: Keep-Alive\r\n\r\n")
                    .as_bytes(),
            );
            let weak = Arc::downgrade(self);
            conn.set_headers_callback(Arc::new(move |conn| {
                if let Some(core) = weak.upgrade() {
                    core.on_headers(addr, conn);
                }
            }));
        } else {
            let mut connections = self.connections.lock().unwrap();
            connections.remove(&addr);
            self.connected.store(!connections.is_empty(), Ordering::Release);
            drop(connections);
            self.balancer.lock().unwrap().release_backend(addr);
        }
    }

    /// Bootstrap reply came in; past this point the connection carries
    /// nothing but RPC frames.
    fn on_headers(self: &Arc<Self>, addr: SocketAddr, conn: &HttpConnectionPtr) {
        let (status, reason) = conn.with_response(|r| (r.status, r.reason.clone()));
        if status != 200 {
            error!(%addr, status, reason, "rpc tunnel refused");
            conn.shutdown();
            return;
        }

        if let Some(codec) = self.codec.get() {
            let codec = Arc::clone(codec);
            conn.set_body_callback(Arc::new(move |conn, buffer| {
                codec.parse_from_buffer(conn, buffer);
            }));
        }
        self.connections.lock().unwrap().insert(addr, Arc::clone(conn));
        self.balancer.lock().unwrap().add_backend(addr, 1);
        self.connected.store(true, Ordering::Release);
        self.maybe_start_heartbeat();
        self.dispatch_pending();
    }

    fn call_method(
        self: &Arc<Self>,
        service: &'static ServiceDescriptor,
        method: &MethodDescriptor,
        controller: RpcControllerPtr,
        request: Vec<u8>,
        done: ResponseCallback,
    ) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut message = RpcMessage::new_request(id, service.full_name, method.name, request);
        let compress = controller.compress_kind();
        if compress != crate::CompressKind::None {
            message.compress = Some(compress);
        }

        self.register_call(service, method, &controller, done, id);

        let _guard = TraceContextGuard::cleared();
        let parent_trace = controller.parent().and_then(|parent| parent.trace());
        let rate = self.options.trace_rate;
        if parent_trace.is_some() || rate == 0 || (rate > 0 && id % i64::from(rate) == 0) {
            let span = match parent_trace {
                Some(t) => strand_trace::registry()
                    .find(t.trace_id, t.span_id)
                    .map_or_else(
                        || Span::factory_get(method.name, t.trace_id, t.span_id + 1, t.span_id),
                        |parent_span| parent_span.make_child(method.name),
                    ),
                None => Span::factory_new(method.name),
            };
            message.trace = Some(TraceRef {
                trace_id: span.trace_id(),
                span_id: span.span_id(),
                parent_span_id: span.has_parent().then(|| span.parent_span_id()),
            });
            strand_trace::set_trace_context(span.trace_id(), span.span_id());
            if let Some(call) = self.calls.lock().unwrap().outstanding.get_mut(&id) {
                call.span = Some(span);
            }
        }

        if !self.connected.load(Ordering::Acquire) {
            self.calls.lock().unwrap().pending.insert(id, message);
            return;
        }
        let core = Arc::clone(self);
        self.loop_.run_in_loop(move || core.send_in_loop(message));
    }

    fn register_call(
        self: &Arc<Self>,
        service: &ServiceDescriptor,
        method: &MethodDescriptor,
        controller: &RpcControllerPtr,
        done: ResponseCallback,
        id: i64,
    ) {
        let timer = service.timeout_for(method).map(|timeout| {
            let weak = Arc::downgrade(self);
            self.loop_.run_after(timeout, move || {
                if let Some(core) = weak.upgrade() {
                    core.on_timeout(id);
                }
            })
        });
        self.calls.lock().unwrap().outstanding.insert(
            id,
            OutstandingCall {
                controller: Arc::clone(controller),
                done,
                timer,
                sent_at: Instant::now(),
                span: None,
            },
        );
    }

    fn dispatch_pending(self: &Arc<Self>) {
        let requests = {
            let mut calls = self.calls.lock().unwrap();
            std::mem::take(&mut calls.pending)
        };
        if !requests.is_empty() {
            debug!(count = requests.len(), "flushing parked requests");
        }
        for (_, message) in requests {
            self.send_in_loop(message);
        }
    }

    fn send_in_loop(self: &Arc<Self>, mut message: RpcMessage) {
        self.loop_.assert_in_loop_thread();
        let backend = self.balancer.lock().unwrap().next_backend();
        let conn = backend.and_then(|addr| self.connections.lock().unwrap().get(&addr).cloned());
        let Some(conn) = conn else {
            warn!(id = message.id, "no usable backend, parking request");
            self.calls.lock().unwrap().pending.insert(message.id, message);
            return;
        };

        let _guard = message.trace.map(|t| {
            let guard = TraceContextGuard::new(t.trace_id, t.span_id);
            strand_trace::set_current_host(Endpoint::from_socket_addr(
                conn.local_addr(),
                message.service.clone(),
            ));
            strand_trace::record_annotation(Annotation::client_send());
            guard
        });

        let mut buffer = Buffer::new();
        match RpcCodec::serialize_to_buffer(&mut message, &mut buffer) {
            Ok(()) => conn.send_buffer(buffer),
            Err(err) => error!(%err, id = message.id, "request encode failed"),
        }
    }

    fn on_response(self: &Arc<Self>, conn: &HttpConnectionPtr, message: RpcMessage) {
        let _guard = match message.trace {
            Some(t) => TraceContextGuard::new(t.trace_id, t.span_id),
            None => TraceContextGuard::cleared(),
        };

        if message.kind != MessageKind::Response {
            error!(id = message.id, "request frame on the client side");
            conn.shutdown();
            return;
        }

        let call = self.calls.lock().unwrap().outstanding.remove(&message.id);
        let Some(call) = call else {
            // Late reply after a timeout already consumed the record.
            debug!(id = message.id, "reply with no outstanding call");
            return;
        };
        if let Some(timer) = call.timer {
            self.loop_.cancel(timer);
        }
        if let Some(span) = &call.span {
            span.record(Annotation::client_recv());
        }

        if let Some(error) = message.error {
            match message.reason {
                Some(reason) => call.controller.set_failed_with(error, reason),
                None => call.controller.set_failed(error),
            }
        }
        let response_bytes = if call.controller.failed() {
            None
        } else if message.response.is_some() {
            message.response
        } else {
            call.controller
                .set_failed_with(RpcError::InternalError, "response payload missing");
            None
        };
        (call.done)(&call.controller, response_bytes);

        let result = if call.controller.failed() { RequestResult::Failed } else { RequestResult::Success };
        self.balancer.lock().unwrap().add_request_result(
            conn.peer_addr(),
            result,
            call.sent_at.elapsed(),
        );
        strand_trace::erase_current();
    }

    /// Exactly one of reply or timeout consumes the outstanding record;
    /// whichever loses finds the map empty and backs off.
    fn on_timeout(self: &Arc<Self>, id: i64) {
        let call = {
            let mut calls = self.calls.lock().unwrap();
            let call = calls.outstanding.remove(&id);
            if call.is_some() {
                calls.pending.remove(&id);
            }
            call
        };
        let Some(call) = call else {
            return;
        };
        warn!(id, "call timed out");
        if let Some(span) = &call.span {
            strand_trace::registry().erase(span.trace_id(), span.span_id());
        }
        call.controller.set_failed(RpcError::RequestTimeout);
        (call.done)(&call.controller, None);
    }

    fn maybe_start_heartbeat(self: &Arc<Self>) {
        let Some(interval) = self.options.heartbeat_interval else {
            return;
        };
        let mut slot = self.heartbeat_timer.lock().unwrap();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        *slot = Some(self.loop_.run_every(interval, move || {
            if let Some(core) = weak.upgrade() {
                core.send_heart_beats();
            }
        }));
    }

    /// Probes every connected backend with the built-in service; a
    /// failed or non-Ok answer releases the backend from rotation.
    fn send_heart_beats(self: &Arc<Self>) {
        let method = BUILTIN_SERVICE.method("HeartBeat").expect("builtin heartbeat method");
        let connections: Vec<(SocketAddr, HttpConnectionPtr)> = self
            .connections
            .lock()
            .unwrap()
            .iter()
            .map(|(addr, conn)| (*addr, Arc::clone(conn)))
            .collect();

        for (addr, conn) in connections {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let mut message = RpcMessage::new_request(
                id,
                BUILTIN_SERVICE.full_name,
                method.name,
                encode_payload(&HeartBeatRequest::default()),
            );
            let controller = RpcController::new();
            let weak = Arc::downgrade(self);
            let done: ResponseCallback = Box::new(move |controller, bytes| {
                let Some(core) = weak.upgrade() else { return };
                let healthy = !controller.failed()
                    && bytes
                        .as_deref()
                        .and_then(|b| decode_payload::<HeartBeatResponse>(b).ok())
                        .is_some_and(|reply| reply.status == "Ok");
                if !healthy {
                    warn!(%addr, "heartbeat failed, releasing backend");
                    core.balancer.lock().unwrap().release_backend(addr);
                }
            });
            self.register_call(&BUILTIN_SERVICE, method, &controller, done, id);

            let mut buffer = Buffer::new();
            match RpcCodec::serialize_to_buffer(&mut message, &mut buffer) {
                Ok(()) => conn.send_buffer(buffer),
                Err(err) => error!(%err, "heartbeat encode failed"),
            }
        }
    }
}
