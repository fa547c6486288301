use std::{
    sync::{Arc, mpsc},
    time::Duration,
};

use strand_core::LoopThread;
use strand_net::{TcpClient, TcpConnectionPtr, TcpServer};

fn start_echo_server(loop_thread: &LoopThread) -> TcpServer {
    let server =
        TcpServer::new(loop_thread.handle(), "127.0.0.1:0".parse().unwrap(), "echo").unwrap();
    server.set_message_callback(Arc::new(|conn, buffer| {
        let data = buffer.consume_all_as_vec();
        conn.send(&data);
    }));
    server.start();
    server
}

fn connect_client(
    loop_thread: &LoopThread,
    addr: std::net::SocketAddr,
) -> (TcpClient, TcpConnectionPtr, mpsc::Receiver<Vec<u8>>) {
    let client = TcpClient::new(loop_thread.handle(), addr, "echo-client");
    let (data_tx, data_rx) = mpsc::channel();
    client.set_message_callback(Arc::new(move |_conn, buffer| {
        data_tx.send(buffer.consume_all_as_vec()).unwrap();
    }));
    let (conn_tx, conn_rx) = mpsc::channel();
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            conn_tx.send(Arc::clone(conn)).unwrap();
        }
    }));
    client.connect();
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    (client, conn, data_rx)
}

fn collect(rx: &mpsc::Receiver<Vec<u8>>, want: usize) -> Vec<u8> {
    let mut got = Vec::new();
    while got.len() < want {
        got.extend(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }
    got
}

#[test]
fn echo_roundtrip() {
    let server_loop = LoopThread::start("echo-srv");
    let server = start_echo_server(&server_loop);
    let client_loop = LoopThread::start("echo-cli");
    let (_client, conn, data_rx) = connect_client(&client_loop, server.listen_addr());

    conn.send(b"hello strand");
    assert_eq!(collect(&data_rx, 12), b"hello strand");
    assert_eq!(conn.sent_bytes(), 12);
}

#[test]
fn large_payload_survives_partial_writes() {
    let server_loop = LoopThread::start("big-srv");
    let server = start_echo_server(&server_loop);
    let client_loop = LoopThread::start("big-cli");
    let (_client, conn, data_rx) = connect_client(&client_loop, server.listen_addr());

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    conn.send(&payload);
    let got = collect(&data_rx, payload.len());
    assert_eq!(got.len(), payload.len());
    assert_eq!(got, payload);
}

#[test]
fn many_small_messages_in_order() {
    let server_loop = LoopThread::start("many-srv");
    let server = start_echo_server(&server_loop);
    let client_loop = LoopThread::start("many-cli");
    let (_client, conn, data_rx) = connect_client(&client_loop, server.listen_addr());

    let mut expected = Vec::new();
    for i in 0..500u32 {
        let message = format!("msg-{i};");
        expected.extend_from_slice(message.as_bytes());
        conn.send(message.as_bytes());
    }
    // TCP is a byte stream: order within the connection is preserved.
    assert_eq!(collect(&data_rx, expected.len()), expected);
}

#[test]
fn client_reconnects_after_server_restart() {
    let server_loop = LoopThread::start("restart-srv");
    let server = start_echo_server(&server_loop);
    let addr = server.listen_addr();

    let client_loop = LoopThread::start("restart-cli");
    let client = TcpClient::new(client_loop.handle(), addr, "restart-client");
    client.set_retry(true);
    let (conn_tx, conn_rx) = mpsc::channel();
    let (data_tx, data_rx) = mpsc::channel();
    client.set_message_callback(Arc::new(move |_conn, buffer| {
        data_tx.send(buffer.consume_all_as_vec()).unwrap();
    }));
    client.set_connection_callback(Arc::new(move |conn| {
        if conn.connected() {
            conn_tx.send(Arc::clone(conn)).unwrap();
        }
    }));
    client.connect();
    let conn = conn_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    conn.send(b"first");
    assert_eq!(collect(&data_rx, 5), b"first");

    server.stop();
    drop(server);
    // Give the old listener time to go away, then come back up.
    let server2 = {
        let mut attempt = None;
        for _ in 0..50 {
            match TcpServer::new(server_loop.handle(), addr, "echo2") {
                Ok(server) => {
                    attempt = Some(server);
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(100)),
            }
        }
        attempt.expect("couldn't rebind the listen address")
    };
    server2.set_message_callback(Arc::new(|conn, buffer| {
        let data = buffer.consume_all_as_vec();
        conn.send(&data);
    }));
    server2.start();

    let conn2 = conn_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    conn2.send(b"second");
    assert_eq!(collect(&data_rx, 6), b"second");
}
