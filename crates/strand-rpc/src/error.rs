use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-level error taxonomy; travels in the response `error` field.
/// Success is the absence of a code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum RpcError {
    #[error("invalid request")]
    InvalidRequest,
    #[error("invalid service")]
    InvalidService,
    #[error("invalid method")]
    InvalidMethod,
    #[error("parse fail")]
    ParseFail,
    #[error("invalid checksum")]
    InvalidChecksum,
    #[error("request timeout")]
    RequestTimeout,
    #[error("internal error")]
    InternalError,
}
