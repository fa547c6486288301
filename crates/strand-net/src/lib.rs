mod acceptor;
mod balancer;
mod buffer;
mod connection;
mod connector;
pub mod http;
mod resolver;
mod socket;
mod tcp_client;
mod tcp_server;

pub use acceptor::Acceptor;
pub use balancer::{
    ConnectResult, LoadBalancer, LoadBalancerFactory, RandomLoadBalancer, RequestResult,
    RoundRobinLoadBalancer,
};
pub use buffer::Buffer;
pub use connection::{
    ConnectionCallback, ConnectionState, HighWaterMarkCallback, MessageCallback, TcpConnection,
    TcpConnectionPtr, WriteCompleteCallback,
};
pub use connector::Connector;
pub use resolver::{DnsResolver, ResolveCallback, Resolver, ResolverFactory, StaticAddressResolver};
pub use socket::Socket;
pub use tcp_client::TcpClient;
pub use tcp_server::TcpServer;
