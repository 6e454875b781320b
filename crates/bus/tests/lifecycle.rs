//! End-to-end exercise of the façade: register a loopback socket, submit a
//! request, observe the matched response, then shut the whole bus down.
//! Mirrors the end-to-end scenarios in SPEC_FULL.md §8.

use std::{
    io::{Read, Write},
    net::TcpListener as StdTcpListener,
    os::unix::io::AsRawFd,
    sync::Arc,
    time::Duration,
};

use bus::{Bus, BusConfig};
use bus_types::{AnyUdata, MsgResult, SocketType, UnpackOutcome, UserMessage};

fn test_config() -> BusConfig<Vec<u8>> {
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
    BusConfig::new(sink, unpack, unexpected_msg)
}

fn frame(seq_id: i64, payload: &[u8]) -> Vec<u8> {
    let total = (8 + payload.len()) as u32;
    let mut out = Vec::with_capacity(4 + total as usize);
    out.extend_from_slice(&total.to_le_bytes());
    out.extend_from_slice(&seq_id.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

fn read_frame(peer: &mut std::net::TcpStream) -> (i64, Vec<u8>) {
    let mut header = [0u8; 12];
    peer.read_exact(&mut header).unwrap();
    let total = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
    let seq_id = i64::from_le_bytes(header[4..12].try_into().unwrap());
    let mut payload = vec![0u8; total - 8];
    peer.read_exact(&mut payload).unwrap();
    (seq_id, payload)
}

#[test]
fn single_round_trip_through_the_full_facade() {
    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (mut peer, _) = server.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    let fd = client.as_raw_fd();

    let mut bus = Bus::init(test_config()).unwrap();
    bus.register_socket(fd, SocketType::Plain, Arc::new(())).unwrap();

    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    let user_msg = UserMessage::<Vec<u8>> {
        fd,
        seq_id: 42,
        payload: frame(42, b"ping"),
        cb: Box::new(move |result: &MsgResult<Vec<u8>>, _udata| {
            let _ = result_tx.send((result.status, result.response.clone()));
        }),
        udata: None,
        timeout: Duration::from_secs(5),
    };
    bus.send_request(user_msg).unwrap();

    let (seq_id, payload) = read_frame(&mut peer);
    assert_eq!(seq_id, 42);
    assert_eq!(payload, b"ping");
    peer.write_all(&frame(42, b"pong")).unwrap();

    let (status, response) = result_rx.recv_timeout(Duration::from_secs(2)).expect("no result delivered in time");
    assert_eq!(status, bus_types::Status::Success);
    assert_eq!(response, Some(b"pong".to_vec()));

    assert!(bus.shutdown());
    assert!(bus.shutdown(), "shutdown must be idempotent");
    drop(client);
}

#[test]
fn shutdown_with_requests_in_flight_completes_every_callback() {
    let server = StdTcpListener::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let client = std::net::TcpStream::connect(addr).unwrap();
    let (_peer, _) = server.accept().unwrap();
    client.set_nonblocking(true).unwrap();
    let fd = client.as_raw_fd();

    let mut bus = Bus::init(test_config()).unwrap();
    bus.register_socket(fd, SocketType::Plain, Arc::new(())).unwrap();

    const N: usize = 20;
    let (result_tx, result_rx) = crossbeam_channel::bounded(N);
    for i in 0..N {
        let result_tx = result_tx.clone();
        let user_msg = UserMessage::<Vec<u8>> {
            fd,
            seq_id: i as i64,
            payload: frame(i as i64, b"x"),
            cb: Box::new(move |result: &MsgResult<Vec<u8>>, _udata| {
                let _ = result_tx.send(result.status);
            }),
            udata: None,
            timeout: Duration::from_secs(30),
        };
        bus.send_request(user_msg).unwrap();
    }
    drop(result_tx);

    bus.shutdown();

    let mut seen = 0;
    while let Ok(status) = result_rx.recv_timeout(Duration::from_secs(2)) {
        assert!(matches!(status, bus_types::Status::Success | bus_types::Status::Shutdown));
        seen += 1;
    }
    assert_eq!(seen, N, "every accepted submission must produce exactly one result callback");

    drop(client);
}
