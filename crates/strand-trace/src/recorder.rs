use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use once_cell::sync::Lazy;

use crate::span::Span;

/// Process-wide span registry keyed by `(trace_id, span_id)`.
///
/// Entries are created lazily on first observation of an id pair and
/// erased when the RPC they describe completes.
pub struct SpanRegistry {
    spans: Mutex<HashMap<(i64, i64), Arc<Span>>>,
}

static REGISTRY: Lazy<SpanRegistry> = Lazy::new(|| SpanRegistry { spans: Mutex::new(HashMap::new()) });

pub fn registry() -> &'static SpanRegistry {
    &REGISTRY
}

impl SpanRegistry {
    /// Registers `span` unless an identically-keyed span already exists,
    /// in which case the offered span is discarded and the existing one
    /// returned.
    pub fn register_or_existing(&self, span: Arc<Span>) -> Arc<Span> {
        let mut spans = self.spans.lock().unwrap();
        Arc::clone(spans.entry((span.trace_id(), span.span_id())).or_insert(span))
    }

    pub fn find(&self, trace_id: i64, span_id: i64) -> Option<Arc<Span>> {
        self.spans.lock().unwrap().get(&(trace_id, span_id)).cloned()
    }

    pub fn erase(&self, trace_id: i64, span_id: i64) {
        self.spans.lock().unwrap().remove(&(trace_id, span_id));
    }

    pub fn len(&self) -> usize {
        self.spans.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_returns_existing() {
        let first = Span::factory_get("first", 9001, 1, 0);
        let second = Span::factory_get("second", 9001, 1, 0);
        // Same underlying span; the second offer was discarded.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.name(), "first");
        registry().erase(9001, 1);
    }

    #[test]
    fn erase_makes_span_unfindable() {
        let _span = Span::factory_get("gone", 9002, 1, 0);
        assert!(registry().find(9002, 1).is_some());
        registry().erase(9002, 1);
        assert!(registry().find(9002, 1).is_none());
    }
}
