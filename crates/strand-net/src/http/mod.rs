mod client;
mod connection;
mod message;
mod parser;
mod server;

pub use client::{HttpClient, HttpClientConnectionCallback};
pub use connection::{
    BodyCallback, HeadersCallback, HttpConnection, HttpConnectionPtr, HttpMessageCallback,
};
pub use message::{Headers, HttpMethod, HttpRequest, HttpResponse, HttpVersion};
pub use parser::{HttpParseError, HttpParser, HttpRole, ParseState};
pub use server::HttpServer;
