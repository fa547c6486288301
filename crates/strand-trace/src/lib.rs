mod context;
mod recorder;
mod sink;
mod span;

pub use context::{
    TraceContext, TraceContextGuard, reset_trace_context, restore_trace_context,
    set_trace_context, trace_context,
};
pub use recorder::{SpanRegistry, registry};
pub use sink::{TraceSink, install_trace_sink};
pub use span::{Annotation, BinaryAnnotation, Endpoint, Span, unique_id};

use std::sync::Arc;

/// Span registered for the calling thread's trace context, if any.
pub fn current_span() -> Option<Arc<Span>> {
    trace_context().and_then(|(trace_id, span_id)| registry().find(trace_id, span_id))
}

/// Records `annotation` on the current thread's span; no-op when the
/// thread carries no context or the span was never registered.
pub fn record_annotation(annotation: Annotation) {
    if let Some(span) = current_span() {
        span.record(annotation);
    }
}

/// Fills in the current span's endpoint, if there is one.
pub fn set_current_host(host: Endpoint) {
    if let Some(span) = current_span() {
        span.set_host(host);
    }
}

/// Drops the current thread's span from the registry; called when the
/// RPC the span describes completes.
pub fn erase_current() {
    if let Some((trace_id, span_id)) = trace_context() {
        registry().erase(trace_id, span_id);
    }
}
