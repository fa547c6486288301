mod builtin;
mod channel;
mod codec;
mod controller;
mod error;
mod message;
mod server;
mod service;

pub use builtin::{
    BUILTIN_SERVICE, BuiltinService, GetFileSetRequest, GetFileSetResponse, HeartBeatRequest,
    HeartBeatResponse, SchemaFile, ServiceName, ServicesRequest, ServicesResponse,
};
pub use channel::{ResponseCallback, RpcChannel, RpcChannelOptions};
pub use codec::{CodecError, RpcCodec};
pub use controller::{RpcController, RpcControllerPtr};
pub use error::RpcError;
pub use message::{CompressKind, MessageKind, RpcMessage, TraceRef};
pub use server::{RpcServer, RpcServerOptions};
pub use service::{
    MethodDescriptor, RpcDoneCallback, Service, ServiceDescriptor, decode_payload, encode_payload,
};

/// Path identifying the RPC tunnel inside the HTTP bootstrap handshake.
pub const RPC_TUNNEL_PATH: &str = "/__protorpc__";
