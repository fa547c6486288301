use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;

use crate::{recorder, sink};

/// Random positive 56-bit identifier for traces and spans.
pub fn unique_id() -> i64 {
    rand::rng().random_range(1..=(1i64 << 56))
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Network location a span annotation was produced at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Endpoint {
    pub ipv4: u32,
    pub port: u16,
    pub service_name: String,
}

impl Endpoint {
    pub fn new(ipv4: u32, port: u16, service_name: impl Into<String>) -> Self {
        Self { ipv4, port, service_name: service_name.into() }
    }

    /// Ipv6 peers are recorded without an address.
    pub fn from_socket_addr(addr: SocketAddr, service_name: impl Into<String>) -> Self {
        let ipv4 = match addr {
            SocketAddr::V4(v4) => u32::from_be_bytes(v4.ip().octets()),
            SocketAddr::V6(_) => 0,
        };
        Self::new(ipv4, addr.port(), service_name)
    }

    pub fn is_valid(&self) -> bool {
        self.ipv4 != 0
    }
}

/// Timestamped event on a span.
#[derive(Clone, Debug)]
pub struct Annotation {
    pub timestamp_us: u64,
    pub value: String,
    pub host: Option<Endpoint>,
}

impl Annotation {
    pub fn new(value: impl Into<String>) -> Self {
        Self { timestamp_us: now_micros(), value: value.into(), host: None }
    }

    pub fn client_send() -> Self {
        Self::new("cs")
    }

    pub fn client_recv() -> Self {
        Self::new("cr")
    }

    pub fn server_send() -> Self {
        Self::new("ss")
    }

    pub fn server_recv() -> Self {
        Self::new("sr")
    }
}

/// Key/value payload attached to a span.
#[derive(Clone, Debug)]
pub struct BinaryAnnotation {
    pub name: String,
    pub value: String,
    pub annotation_type: String,
    pub host: Option<Endpoint>,
}

impl BinaryAnnotation {
    pub fn message(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            annotation_type: "string".to_owned(),
            host: None,
        }
    }
}

/// One unit of a distributed trace, identified by `(trace_id, span_id)`.
///
/// Spans are created through the factory functions, which register them
/// in the global registry and dedup on the id pair: an existing span
/// wins, the new one is discarded.
pub struct Span {
    name: String,
    trace_id: i64,
    span_id: i64,
    parent_span_id: i64,
    host: Mutex<Endpoint>,
}

impl Span {
    /// New root span with freshly sampled ids.
    pub fn factory_new(name: impl Into<String>) -> Arc<Self> {
        Self::factory_get(name, unique_id(), unique_id(), 0)
    }

    /// Span with caller-supplied ids (the server side restoring a trace
    /// carried in a frame). `parent_span_id` of 0 means "no parent".
    pub fn factory_get(
        name: impl Into<String>,
        trace_id: i64,
        span_id: i64,
        parent_span_id: i64,
    ) -> Arc<Self> {
        let span = Arc::new(Self {
            name: name.into(),
            trace_id,
            span_id,
            parent_span_id,
            host: Mutex::new(Endpoint::default()),
        });
        recorder::registry().register_or_existing(span)
    }

    /// Child span: same trace, next span id, this span as parent.
    pub fn make_child(&self, name: impl Into<String>) -> Arc<Self> {
        Self::factory_get(name, self.trace_id, self.span_id + 1, self.span_id)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn trace_id(&self) -> i64 {
        self.trace_id
    }

    pub fn span_id(&self) -> i64 {
        self.span_id
    }

    pub fn parent_span_id(&self) -> i64 {
        self.parent_span_id
    }

    pub fn has_parent(&self) -> bool {
        self.parent_span_id > 0
    }

    pub fn set_host(&self, host: Endpoint) {
        *self.host.lock().unwrap() = host;
    }

    pub fn host(&self) -> Endpoint {
        self.host.lock().unwrap().clone()
    }

    /// Fire-and-forget to the installed sink; the span's endpoint is
    /// filled in when the annotation carries none.
    pub fn record(&self, mut annotation: Annotation) {
        tracing::debug!(
            trace_id = self.trace_id,
            span_id = self.span_id,
            value = %annotation.value,
            "span annotation"
        );
        if annotation.host.is_none() {
            let host = self.host();
            if host.is_valid() {
                annotation.host = Some(host);
            }
        }
        if let Some(sink) = sink::sink() {
            sink.record(self, &annotation);
        }
    }

    pub fn record_binary(&self, mut annotation: BinaryAnnotation) {
        if annotation.host.is_none() {
            let host = self.host();
            if host.is_valid() {
                annotation.host = Some(host);
            }
        }
        if let Some(sink) = sink::sink() {
            sink.record_binary(self, &annotation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_ids_are_positive_and_bounded() {
        for _ in 0..1000 {
            let id = unique_id();
            assert!(id > 0);
            assert!(id <= 1i64 << 56);
        }
    }

    #[test]
    fn child_span_increments_and_links() {
        let parent = Span::factory_get("parent", 42, 7, 0);
        let child = parent.make_child("child");
        assert_eq!(child.trace_id(), 42);
        assert_eq!(child.span_id(), 8);
        assert_eq!(child.parent_span_id(), 7);
        crate::registry().erase(42, 7);
        crate::registry().erase(42, 8);
    }

    #[test]
    fn endpoint_from_v4_addr() {
        let endpoint = Endpoint::from_socket_addr("127.0.0.1:80".parse().unwrap(), "svc");
        assert_eq!(endpoint.ipv4, 0x7f00_0001);
        assert_eq!(endpoint.port, 80);
        assert!(endpoint.is_valid());
    }
}
