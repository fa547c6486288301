use serde::{Deserialize, Serialize};

use crate::RpcError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    Request,
    Response,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressKind {
    #[default]
    None,
    Snappy,
}

/// Trace identifiers carried on the wire to thread a call chain across
/// processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceRef {
    pub trace_id: i64,
    pub span_id: i64,
    pub parent_span_id: Option<i64>,
}

/// The schema record inside every frame.
///
/// `service`, `method` and `request` are present on requests;
/// `response`, `error` and `reason` on responses. Payload presence is
/// modelled, not inferred: an error response carries no `response` at
/// all. When `compress` says snappy, only the payload bytes are
/// compressed, never the record itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub kind: MessageKind,
    pub id: i64,
    pub service: String,
    pub method: String,
    pub request: Option<Vec<u8>>,
    pub response: Option<Vec<u8>>,
    pub error: Option<RpcError>,
    pub reason: Option<String>,
    pub compress: Option<CompressKind>,
    pub trace: Option<TraceRef>,
}

impl RpcMessage {
    pub fn new_request(id: i64, service: impl Into<String>, method: impl Into<String>, request: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Request,
            id,
            service: service.into(),
            method: method.into(),
            request: Some(request),
            response: None,
            error: None,
            reason: None,
            compress: None,
            trace: None,
        }
    }

    pub fn new_response(id: i64) -> Self {
        Self {
            kind: MessageKind::Response,
            id,
            service: String::new(),
            method: String::new(),
            request: None,
            response: None,
            error: None,
            reason: None,
            compress: None,
            trace: None,
        }
    }
}
