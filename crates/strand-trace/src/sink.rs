use once_cell::sync::OnceCell;
use tracing::warn;

use crate::span::{Annotation, BinaryAnnotation, Span};

/// Write-only endpoint span records are flushed to, fire-and-forget.
/// Installed once at program start, before any tracing occurs; its
/// lifetime brackets all RPC activity.
pub trait TraceSink: Send + Sync {
    fn record(&self, span: &Span, annotation: &Annotation);
    fn record_binary(&self, span: &Span, annotation: &BinaryAnnotation);
}

static SINK: OnceCell<Box<dyn TraceSink>> = OnceCell::new();

pub fn install_trace_sink(sink: Box<dyn TraceSink>) {
    if SINK.set(sink).is_err() {
        warn!("trace sink already installed, ignoring");
    }
}

pub(crate) fn sink() -> Option<&'static dyn TraceSink> {
    SINK.get().map(Box::as_ref)
}
