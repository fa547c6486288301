mod common;

use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use common::{EchoDispatcher, ImmediateEcho, new_controller, start_cluster};
use strand_rpc::{
    BUILTIN_SERVICE, GetFileSetRequest, GetFileSetResponse, HeartBeatRequest, HeartBeatResponse,
    RpcChannelOptions, ServicesRequest, ServicesResponse, decode_payload, encode_payload,
};

fn options() -> RpcChannelOptions {
    RpcChannelOptions { trace_rate: -1, ..RpcChannelOptions::default() }
}

#[test]
fn heart_beat_answers_ok() {
    let cluster = start_cluster(Arc::new(EchoDispatcher(ImmediateEcho)), options());
    let (tx, rx) = mpsc::channel();

    cluster.channel.call_method(
        &BUILTIN_SERVICE,
        BUILTIN_SERVICE.method("HeartBeat").unwrap(),
        new_controller(),
        encode_payload(&HeartBeatRequest::default()),
        Box::new(move |controller, bytes| {
            assert!(!controller.failed(), "{}", controller.error_text());
            let reply: HeartBeatResponse = decode_payload(&bytes.unwrap()).unwrap();
            tx.send(reply.status).unwrap();
        }),
    );
    assert_eq!(rx.recv_timeout(Duration::from_secs(10)).unwrap(), "Ok");
}

#[test]
fn services_lists_registered_services_but_not_itself() {
    let cluster = start_cluster(Arc::new(EchoDispatcher(ImmediateEcho)), options());
    let (tx, rx) = mpsc::channel();

    cluster.channel.call_method(
        &BUILTIN_SERVICE,
        BUILTIN_SERVICE.method("Services").unwrap(),
        new_controller(),
        encode_payload(&ServicesRequest::default()),
        Box::new(move |controller, bytes| {
            assert!(!controller.failed(), "{}", controller.error_text());
            let reply: ServicesResponse = decode_payload(&bytes.unwrap()).unwrap();
            tx.send(reply).unwrap();
        }),
    );

    let reply = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let names: Vec<&str> = reply.services.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["test.EchoService"]);
}

#[test]
fn get_file_set_returns_schema_text() {
    let cluster = start_cluster(Arc::new(EchoDispatcher(ImmediateEcho)), options());
    let (tx, rx) = mpsc::channel();

    cluster.channel.call_method(
        &BUILTIN_SERVICE,
        BUILTIN_SERVICE.method("GetFileSet").unwrap(),
        new_controller(),
        encode_payload(&GetFileSetRequest {
            names: vec!["test.EchoService".to_owned(), "test.Unknown".to_owned()],
        }),
        Box::new(move |controller, bytes| {
            assert!(!controller.failed(), "{}", controller.error_text());
            let reply: GetFileSetResponse = decode_payload(&bytes.unwrap()).unwrap();
            tx.send(reply).unwrap();
        }),
    );

    let reply = rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(reply.file_set.len(), 1);
    assert_eq!(reply.file_set[0].name, "test.EchoService");
    assert!(reply.file_set[0].content.contains("rpc Echo"));
}
