//! Exercises a listener against a real loopback socket: a background thread
//! plays the remote peer, writes raw framed bytes, and the test asserts on
//! what the listener delivered through the result callback.

use std::{
    io::Write,
    net::TcpListener as StdTcpListener,
    os::unix::io::AsRawFd,
    sync::Arc,
    time::{Duration, Instant},
};

use bus_listener::{Listener, ListenerConfig};
use bus_threadpool::{ThreadPool, ThreadpoolConfig};
use bus_types::{AnyUdata, BoxedMessage, BusCallbacks, MsgResult, SocketType, UnpackOutcome, UserMessage};

fn test_callbacks() -> Arc<BusCallbacks<Vec<u8>>> {
    let sink = Arc::new(|buf: &[u8], _udata: &AnyUdata| buf.len());
    let unpack = Arc::new(|buf: &[u8], _udata: &AnyUdata| -> UnpackOutcome<Vec<u8>> {
        if buf.len() < 12 {
            return UnpackOutcome::NeedMore { expected_total: 12 };
        }
        let total = u32::from_le_bytes(buf[0..4].try_into().unwrap()) as usize;
        let expected_total = 4 + total;
        if buf.len() < expected_total {
            return UnpackOutcome::NeedMore { expected_total };
        }
        let seq_id = i64::from_le_bytes(buf[4..12].try_into().unwrap());
        let response = buf[12..expected_total].to_vec();
        UnpackOutcome::Success { seq_id, response, consumed: expected_total }
    });
    let unexpected_msg = Arc::new(|_response: Vec<u8>, _seq_id: i64, _udata: &AnyUdata| {});
    Arc::new(BusCallbacks::new(sink, unpack, unexpected_msg, None, None))
}

fn frame(seq_id: i64, payload: &[u8]) -> Vec<u8> {
    let total = (8 + payload.len()) as u32;
    let mut out = Vec::with_capacity(4 + total as usize);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&seq_id.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

#[test]
fn single_round_trip_matches_by_seq_id() {
    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (mut peer, _) = server.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    let fd = client.as_raw_fd();

    let threadpool = Arc::new(ThreadPool::init(ThreadpoolConfig::default()).unwrap());
    let listener = Listener::spawn(0, ListenerConfig::default(), test_callbacks(), Arc::clone(&threadpool)).unwrap();
    let handle = listener.handle();

    let udata: AnyUdata = Arc::new(());
    let ack = handle.add_socket(fd, SocketType::Plain, udata);
    assert!(ack.recv_timeout(Duration::from_secs(1)).unwrap(), "listener rejected socket registration");

    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let user_msg = UserMessage::<Vec<u8>> {
        fd,
        seq_id: 42,
        payload: Vec::new(),
        cb: Box::new(move |result: &MsgResult<Vec<u8>>, _udata| {
            let _ = result_tx.send((result.status, result.response.clone()));
        }),
        udata: None,
        timeout: Duration::from_secs(5),
    };
    let boxed = Box::new(BoxedMessage::new(user_msg, Instant::now()));
    handle.expect_response(fd, 42, Instant::now() + Duration::from_secs(5), boxed);

    peer.write_all(&frame(42, b"pong")).unwrap();

    let (status, response) = result_rx.recv_timeout(Duration::from_secs(2)).expect("no result delivered in time");
    assert_eq!(status, bus_types::Status::Success);
    assert_eq!(response, Some(b"pong".to_vec()));

    listener.join();
    free_pool(threadpool);
    drop(client); // keep the fd alive for the whole test; closes here
}

#[test]
fn response_before_expectation_is_held_then_merged() {
    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (mut peer, _) = server.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    let fd = client.as_raw_fd();

    let threadpool = Arc::new(ThreadPool::init(ThreadpoolConfig::default()).unwrap());
    let listener = Listener::spawn(0, ListenerConfig::default(), test_callbacks(), Arc::clone(&threadpool)).unwrap();
    let handle = listener.handle();

    let udata: AnyUdata = Arc::new(());
    let ack = handle.add_socket(fd, SocketType::Plain, udata);
    assert!(ack.recv_timeout(Duration::from_secs(1)).unwrap());

    // Peer replies before we ever post the expectation.
    peer.write_all(&frame(7, b"early")).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let user_msg = UserMessage::<Vec<u8>> {
        fd,
        seq_id: 7,
        payload: Vec::new(),
        cb: Box::new(move |result: &MsgResult<Vec<u8>>, _udata| {
            let _ = result_tx.send((result.status, result.response.clone()));
        }),
        udata: None,
        timeout: Duration::from_secs(5),
    };
    let boxed = Box::new(BoxedMessage::new(user_msg, Instant::now()));
    handle.expect_response(fd, 7, Instant::now() + Duration::from_secs(5), boxed);

    let (status, response) = result_rx.recv_timeout(Duration::from_secs(2)).expect("held response never merged");
    assert_eq!(status, bus_types::Status::Success);
    assert_eq!(response, Some(b"early".to_vec()));

    listener.join();
    free_pool(threadpool);
    drop(client);
}

/// `ThreadPool::free` consumes the pool by value; the listener thread holds
/// its own clone of the `Arc` until `Listener::join` returns, so unwrapping
/// only succeeds afterward.
fn free_pool(pool: Arc<ThreadPool>) {
    match Arc::try_unwrap(pool) {
        Ok(pool) => pool.free(),
        Err(_) => panic!("threadpool still has live references after listener join"),
    }
}
