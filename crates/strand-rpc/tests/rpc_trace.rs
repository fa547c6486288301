mod common;

use std::{
    sync::{Arc, Mutex, mpsc},
    time::Duration,
};

use common::{
    Echo, EchoDispatcher, EchoRequest, EchoResponse, EchoStub, ImmediateEcho, new_controller,
    start_cluster,
};
use strand_rpc::{RpcChannel, RpcChannelOptions, RpcControllerPtr};
use strand_trace::{Annotation, BinaryAnnotation, Span, TraceSink, install_trace_sink};

#[derive(Clone, Debug)]
struct Recorded {
    trace_id: i64,
    span_id: i64,
    parent_span_id: i64,
    value: String,
    timestamp_us: u64,
}

#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<Recorded>>,
}

static SINK: Mutex<Option<Arc<CollectingSink>>> = Mutex::new(None);

struct SinkHandle(Arc<CollectingSink>);

impl TraceSink for SinkHandle {
    fn record(&self, span: &Span, annotation: &Annotation) {
        self.0.records.lock().unwrap().push(Recorded {
            trace_id: span.trace_id(),
            span_id: span.span_id(),
            parent_span_id: span.parent_span_id(),
            value: annotation.value.clone(),
            timestamp_us: annotation.timestamp_us,
        });
    }

    fn record_binary(&self, _span: &Span, _annotation: &BinaryAnnotation) {}
}

fn collector() -> Arc<CollectingSink> {
    let mut sink = SINK.lock().unwrap();
    if sink.is_none() {
        let collector = Arc::new(CollectingSink::default());
        install_trace_sink(Box::new(SinkHandle(Arc::clone(&collector))));
        *sink = Some(collector);
    }
    Arc::clone(sink.as_ref().unwrap())
}

/// Handler that fans a sub-call out through its own client channel,
/// chaining the inbound controller as the sub-call's parent.
struct FanOutEcho {
    channel: Arc<RpcChannel>,
}

impl Echo for FanOutEcho {
    fn echo(
        &self,
        controller: &RpcControllerPtr,
        request: EchoRequest,
        done: Box<dyn FnOnce(EchoResponse) + Send>,
    ) {
        let child = new_controller();
        child.set_parent(controller);
        let stub = EchoStub { channel: self.channel.as_ref() };
        stub.slow_echo(child, &request, move |_controller, response| {
            done(response.unwrap_or(EchoResponse { text: "sub-call failed".to_owned() }));
        });
    }

    fn slow_echo(
        &self,
        _controller: &RpcControllerPtr,
        request: EchoRequest,
        done: Box<dyn FnOnce(EchoResponse) + Send>,
    ) {
        done(EchoResponse { text: request.text });
    }
}

#[test]
fn child_span_links_to_parent_and_annotations_order() {
    let collector = collector();

    // Inner cluster serves the sub-call; trace every call.
    let inner = start_cluster(
        Arc::new(EchoDispatcher(ImmediateEcho)),
        RpcChannelOptions { trace_rate: 1, ..RpcChannelOptions::default() },
    );
    let inner_channel = Arc::new(inner.channel);

    let outer = start_cluster(
        Arc::new(EchoDispatcher(FanOutEcho { channel: Arc::clone(&inner_channel) })),
        RpcChannelOptions { trace_rate: 1, ..RpcChannelOptions::default() },
    );

    let stub = EchoStub { channel: &outer.channel };
    let (tx, rx) = mpsc::channel();
    stub.echo(new_controller(), &EchoRequest { text: "traced".to_owned() }, move |controller, response| {
        tx.send((controller.failed(), response)).unwrap();
    });
    let (failed, response) = rx.recv_timeout(Duration::from_secs(15)).unwrap();
    assert!(!failed);
    assert_eq!(response.unwrap().text, "traced");

    // Let the trailing ss/cr annotations land.
    assert!(
        common::wait_until(Duration::from_secs(5), || {
            collector.records.lock().unwrap().len() >= 8
        }),
        "annotations never all arrived"
    );

    let records = collector.records.lock().unwrap().clone();
    // Root span: the outer Echo call.
    let root: Vec<&Recorded> = records.iter().filter(|r| r.parent_span_id == 0).collect();
    assert!(!root.is_empty(), "no root span recorded");
    let root_trace = root[0].trace_id;
    let root_span = root[0].span_id;

    // Child span: same trace, next span id, parent = root.
    let children: Vec<&Recorded> =
        records.iter().filter(|r| r.parent_span_id == root_span).collect();
    assert!(!children.is_empty(), "no child span recorded");
    for child in &children {
        assert_eq!(child.trace_id, root_trace);
        assert_eq!(child.span_id, root_span + 1);
    }

    // Both spans carry the four standard annotations in timestamp order.
    for span_id in [root_span, root_span + 1] {
        let mut annotations: Vec<&Recorded> =
            records.iter().filter(|r| r.span_id == span_id && r.trace_id == root_trace).collect();
        annotations.sort_by_key(|r| r.timestamp_us);
        let values: Vec<&str> = annotations.iter().map(|r| r.value.as_str()).collect();
        assert_eq!(values, vec!["cs", "sr", "ss", "cr"], "span {span_id}");
    }
}
