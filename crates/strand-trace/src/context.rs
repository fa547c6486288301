use std::cell::Cell;

/// `(trace_id, span_id)` pair threaded through a call chain.
pub type TraceContext = (i64, i64);

thread_local! {
    static CONTEXT: Cell<Option<TraceContext>> = const { Cell::new(None) };
}

pub fn set_trace_context(trace_id: i64, span_id: i64) {
    CONTEXT.with(|c| c.set(Some((trace_id, span_id))));
}

pub fn trace_context() -> Option<TraceContext> {
    CONTEXT.with(Cell::get)
}

pub fn reset_trace_context() {
    CONTEXT.with(|c| c.set(None));
}

/// Puts back a context captured earlier with `trace_context()`; used by
/// the event loop around posted tasks.
pub fn restore_trace_context(context: Option<TraceContext>) {
    CONTEXT.with(|c| c.set(context));
}

/// Scoped context switch: installs a pair (or clears it) and restores
/// whatever was current on drop.
pub struct TraceContextGuard {
    prev: Option<TraceContext>,
}

impl TraceContextGuard {
    pub fn new(trace_id: i64, span_id: i64) -> Self {
        let prev = trace_context();
        set_trace_context(trace_id, span_id);
        Self { prev }
    }

    pub fn cleared() -> Self {
        let prev = trace_context();
        reset_trace_context();
        Self { prev }
    }
}

impl Drop for TraceContextGuard {
    fn drop(&mut self) {
        restore_trace_context(self.prev);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_prior_pair() {
        set_trace_context(1, 2);
        {
            let _guard = TraceContextGuard::new(3, 4);
            assert_eq!(trace_context(), Some((3, 4)));
        }
        assert_eq!(trace_context(), Some((1, 2)));
        reset_trace_context();
    }

    #[test]
    fn cleared_guard_blanks_and_restores() {
        set_trace_context(5, 6);
        {
            let _guard = TraceContextGuard::cleared();
            assert_eq!(trace_context(), None);
        }
        assert_eq!(trace_context(), Some((5, 6)));
        reset_trace_context();
    }
}
