use std::{
    any::Any,
    sync::{Arc, Mutex, Weak},
};

use crate::{CompressKind, RpcError, TraceRef};

pub type RpcControllerPtr = Arc<RpcController>;

#[derive(Default)]
struct ControllerInner {
    error: Option<RpcError>,
    reason: Option<String>,
    compress: CompressKind,
    parent: Option<Weak<RpcController>>,
    trace: Option<TraceRef>,
    context: Option<Box<dyn Any + Send + Sync>>,
}

/// Per-call control block, created before a call is issued and owned by
/// the caller until the completion callback returns.
///
/// A sub-call made from inside a server handler links to the inbound
/// call's controller via `set_parent`, which chains the trace.
#[derive(Default)]
pub struct RpcController {
    inner: Mutex<ControllerInner>,
}

impl RpcController {
    pub fn new() -> RpcControllerPtr {
        Arc::new(Self::default())
    }

    pub fn set_failed(&self, error: RpcError) {
        let mut inner = self.inner.lock().unwrap();
        inner.error = Some(error);
        inner.reason = None;
    }

    pub fn set_failed_with(&self, error: RpcError, reason: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap();
        inner.error = Some(error);
        inner.reason = Some(reason.into());
    }

    pub fn failed(&self) -> bool {
        self.inner.lock().unwrap().error.is_some()
    }

    pub fn error(&self) -> Option<RpcError> {
        self.inner.lock().unwrap().error
    }

    pub fn error_text(&self) -> String {
        let inner = self.inner.lock().unwrap();
        match (&inner.reason, inner.error) {
            (Some(reason), _) => reason.clone(),
            (None, Some(error)) => error.to_string(),
            (None, None) => String::new(),
        }
    }

    pub fn set_compress_kind(&self, compress: CompressKind) {
        self.inner.lock().unwrap().compress = compress;
    }

    pub fn compress_kind(&self) -> CompressKind {
        self.inner.lock().unwrap().compress
    }

    /// The link is weak: a parent that already completed simply stops
    /// chaining the trace.
    pub fn set_parent(&self, parent: &RpcControllerPtr) {
        self.inner.lock().unwrap().parent = Some(Arc::downgrade(parent));
    }

    pub fn parent(&self) -> Option<RpcControllerPtr> {
        self.inner.lock().unwrap().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn set_trace(&self, trace: TraceRef) {
        self.inner.lock().unwrap().trace = Some(trace);
    }

    pub fn trace(&self) -> Option<TraceRef> {
        self.inner.lock().unwrap().trace
    }

    pub fn set_context<T: Any + Send + Sync>(&self, value: T) {
        self.inner.lock().unwrap().context = Some(Box::new(value));
    }

    pub fn with_context<T: Any + Send + Sync, R>(&self, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let mut inner = self.inner.lock().unwrap();
        inner.context.as_mut()?.downcast_mut::<T>().map(f)
    }

    /// Back to a fresh state for reuse across calls.
    pub fn reset(&self) {
        *self.inner.lock().unwrap() = ControllerInner::default();
    }
}
