//! Hand-expanded output of the schema compiler for a little Echo
//! service, plus cluster plumbing shared by the integration tests.
#![allow(dead_code)]

use std::{
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use strand_core::LoopThread;
use strand_rpc::{
    MethodDescriptor, RpcChannel, RpcChannelOptions, RpcController, RpcControllerPtr,
    RpcDoneCallback, RpcError, RpcServer, RpcServerOptions, Service, ServiceDescriptor,
    decode_payload, encode_payload,
};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EchoResponse {
    pub text: String,
}

pub static ECHO_METHODS: &[MethodDescriptor] = &[
    MethodDescriptor { name: "Echo", timeout_ms: None },
    MethodDescriptor { name: "SlowEcho", timeout_ms: Some(500) },
];

pub static ECHO_SERVICE: ServiceDescriptor = ServiceDescriptor {
    full_name: "test.EchoService",
    methods: ECHO_METHODS,
    default_timeout_ms: Some(10_000),
    file: "service EchoService {\n  rpc Echo (EchoRequest) returns (EchoResponse);\n  rpc SlowEcho (EchoRequest) returns (EchoResponse);\n}\n",
};

/// Server-side base the generator would emit: one method per schema
/// method, completion by callback.
pub trait Echo: Send + Sync + 'static {
    fn echo(
        &self,
        controller: &RpcControllerPtr,
        request: EchoRequest,
        done: Box<dyn FnOnce(EchoResponse) + Send>,
    );

    fn slow_echo(
        &self,
        controller: &RpcControllerPtr,
        request: EchoRequest,
        done: Box<dyn FnOnce(EchoResponse) + Send>,
    ) {
        self.echo(controller, request, done);
    }
}

/// Generated glue binding an [`Echo`] impl to the service contract.
pub struct EchoDispatcher<T: Echo>(pub T);

impl<T: Echo> Service for EchoDispatcher<T> {
    fn descriptor(&self) -> &'static ServiceDescriptor {
        &ECHO_SERVICE
    }

    fn call_method(
        &self,
        method: &MethodDescriptor,
        controller: RpcControllerPtr,
        request: &[u8],
        done: RpcDoneCallback,
    ) {
        let request = match decode_payload::<EchoRequest>(request) {
            Ok(request) => request,
            Err(_) => {
                controller.set_failed(RpcError::ParseFail);
                done(&controller, None);
                return;
            }
        };
        let finish = {
            let controller = Arc::clone(&controller);
            Box::new(move |response: EchoResponse| {
                done(&controller, Some(encode_payload(&response)));
            })
        };
        match method.name {
            "Echo" => self.0.echo(&controller, request, finish),
            "SlowEcho" => self.0.slow_echo(&controller, request, finish),
            // The server resolves methods against the descriptor before
            // dispatching, so nothing else can arrive here.
            other => unreachable!("dispatcher driven with foreign method {other}"),
        }
    }
}

/// Generated client stub over a channel.
pub struct EchoStub<'a> {
    pub channel: &'a RpcChannel,
}

impl EchoStub<'_> {
    pub fn echo(
        &self,
        controller: RpcControllerPtr,
        request: &EchoRequest,
        done: impl FnOnce(&RpcControllerPtr, Option<EchoResponse>) + Send + 'static,
    ) {
        self.call("Echo", controller, request, done);
    }

    pub fn slow_echo(
        &self,
        controller: RpcControllerPtr,
        request: &EchoRequest,
        done: impl FnOnce(&RpcControllerPtr, Option<EchoResponse>) + Send + 'static,
    ) {
        self.call("SlowEcho", controller, request, done);
    }

    fn call(
        &self,
        method: &str,
        controller: RpcControllerPtr,
        request: &EchoRequest,
        done: impl FnOnce(&RpcControllerPtr, Option<EchoResponse>) + Send + 'static,
    ) {
        let method = ECHO_SERVICE.method(method).unwrap();
        self.channel.call_method(
            &ECHO_SERVICE,
            method,
            controller,
            encode_payload(request),
            Box::new(move |controller, bytes| {
                let response = bytes.and_then(|bytes| match decode_payload::<EchoResponse>(&bytes) {
                    Ok(response) => Some(response),
                    Err(_) => {
                        controller.set_failed(RpcError::ParseFail);
                        None
                    }
                });
                done(controller, response);
            }),
        );
    }
}

pub struct ImmediateEcho;

impl Echo for ImmediateEcho {
    fn echo(
        &self,
        _controller: &RpcControllerPtr,
        request: EchoRequest,
        done: Box<dyn FnOnce(EchoResponse) + Send>,
    ) {
        done(EchoResponse { text: request.text });
    }
}

/// Replies off-thread after `delay`; exercises late completions.
pub struct DelayedEcho(pub Duration);

impl Echo for DelayedEcho {
    fn echo(
        &self,
        _controller: &RpcControllerPtr,
        request: EchoRequest,
        done: Box<dyn FnOnce(EchoResponse) + Send>,
    ) {
        let delay = self.0;
        std::thread::spawn(move || {
            std::thread::sleep(delay);
            done(EchoResponse { text: request.text });
        });
    }
}

// Field order is drop order: server and channel go down while their
// loops are still alive to run the teardown tasks.
pub struct Cluster {
    pub server: RpcServer,
    pub channel: RpcChannel,
    pub server_loop: LoopThread,
    pub client_loop: LoopThread,
    pub addr: SocketAddr,
}

pub fn start_cluster(service: Arc<dyn Service>, options: RpcChannelOptions) -> Cluster {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let server_loop = LoopThread::start("rpc-srv");
    let server = RpcServer::new(
        server_loop.handle(),
        "127.0.0.1:0".parse().unwrap(),
        RpcServerOptions::default(),
    )
    .unwrap();
    server.register_service(service);
    server.start();
    let addr = server.listen_addr();

    let client_loop = LoopThread::start("rpc-cli");
    let channel = RpcChannel::new(client_loop.handle(), options);
    channel.connect_addr(addr);
    assert!(
        wait_until(Duration::from_secs(10), || channel.connected()),
        "channel never connected"
    );

    Cluster { server_loop, client_loop, server, channel, addr }
}

pub fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

pub fn new_controller() -> RpcControllerPtr {
    RpcController::new()
}
