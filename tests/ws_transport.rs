mod common;

use std::sync::mpsc;
use std::time::Duration;

use rpc_transport::ws::transceiver::{WS_PROTOCOL, accept_key};
use rpc_transport::{Buffer, SocketOperation, Transceiver, TransportError};

fn pair(resource: &str) -> (Box<dyn Transceiver>, Box<dyn Transceiver>) {
    let transport = common::transport();
    let endpoint = transport
        .create_endpoint(&format!("ws -h 127.0.0.1 -p 0 -r {resource}"), true)
        .unwrap()
        .unwrap();
    let mut acceptor = endpoint.acceptor("adapter").unwrap().expect("ws acceptor");
    let bound = acceptor.listen().expect("listen");
    assert!(bound.is_layered(), "listen keeps the ws layer");
    assert_eq!(bound.protocol(), "ws");
    let port = bound.port().unwrap();

    let client_endpoint = transport
        .create_endpoint(&format!("ws -h 127.0.0.1 -p {port} -r {resource}"), false)
        .unwrap()
        .unwrap();
    let (tx, rx) = mpsc::channel();
    client_endpoint.connectors_async(Box::new(move |result| tx.send(result).unwrap()));
    let connectors = rx
        .recv_timeout(Duration::from_secs(10))
        .unwrap()
        .expect("resolve");
    assert_eq!(connectors.len(), 1);
    assert_eq!(connectors[0].type_id(), 4);

    let mut client = connectors[0].connect().expect("connect");
    let mut server = None;
    common::until_done(|| match acceptor.accept().expect("accept") {
        Some(transceiver) => {
            server = Some(transceiver);
            SocketOperation::NONE
        }
        None => SocketOperation::READ,
    });
    let mut server = server.unwrap();

    common::initialize_pair(client.as_mut(), server.as_mut());
    (client, server)
}

#[test]
fn handshake_and_echo() {
    let (mut client, mut server) = pair("/chat");
    assert_eq!(client.protocol(), "ws");

    common::write_all(client.as_mut(), b"hello over websocket");
    assert_eq!(
        common::read_exact(server.as_mut(), 20),
        b"hello over websocket"
    );

    common::write_all(server.as_mut(), b"reply");
    assert_eq!(common::read_exact(client.as_mut(), 5), b"reply");

    let info = server.info();
    assert!(info.incoming);
    assert!(info.underlying.is_some());
    let header = |name: &str| {
        info.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    };
    assert_eq!(header("Sec-WebSocket-Protocol").as_deref(), Some(WS_PROTOCOL));
    assert_eq!(header("Sec-WebSocket-Version").as_deref(), Some("13"));
}

#[test]
fn message_split_across_reads() {
    let (mut client, mut server) = pair("/");

    let payload: Vec<u8> = (0..70_000).map(|i| (i % 253) as u8).collect();
    let mut out = Buffer::from_vec(payload.clone());
    let mut received = Buffer::with_len(payload.len());
    common::until_done(|| {
        let write = client.write(&mut out).expect("write");
        let mut chunk = Buffer::with_len(received.remaining().min(1000));
        let read = server.read(&mut chunk).expect("read");
        let count = chunk.position();
        received.remaining_mut()[..count].copy_from_slice(chunk.filled());
        received.advance(count);
        if received.is_full() { write } else { write | read | SocketOperation::READ }
    });
    assert_eq!(received.into_vec(), payload);
}

#[test]
fn close_frame_ends_the_connection() {
    let (mut client, mut server) = pair("/chat");

    let op = client.closing(true, None);
    assert!(!op.is_none(), "initiator waits for the peer");

    let mut buf = Buffer::with_len(1);
    let mut outcome = None;
    common::until_done(|| match server.read(&mut buf) {
        Ok(op) => op,
        Err(error) => {
            outcome = Some(error);
            SocketOperation::NONE
        }
    });
    assert!(matches!(outcome, Some(TransportError::ConnectionLost { .. })));
    client.close();
    server.close();
}

#[test]
fn accept_key_matches_rfc_sample() {
    assert_eq!(
        accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
        "s3pPLMBiTxaQ9kYtzbQBmAbxAo0="
    );
}

#[test]
fn write_after_close_frame_is_rejected() {
    let (mut client, _server) = pair("/chat");
    client.closing(true, None);

    let mut empty = Buffer::new();
    let mut late = Buffer::from_vec(b"late".to_vec());
    let mut outcome = None;
    common::until_done(|| {
        // The close frame itself may still be draining.
        if client.write(&mut empty).expect("flush close frame").is_none() {
            outcome = Some(client.write(&mut late));
            SocketOperation::NONE
        } else {
            SocketOperation::WRITE
        }
    });
    assert!(matches!(
        outcome,
        Some(Err(TransportError::ConnectionLost { source: None }))
    ));
    assert_eq!(late.position(), 0, "rejected bytes stay in the buffer");
}

#[test]
fn write_before_upgrade_is_rejected() {
    let transport = common::transport();
    let endpoint = transport
        .create_endpoint("ws -h 127.0.0.1 -p 0", true)
        .unwrap()
        .unwrap();
    let mut acceptor = endpoint.acceptor("adapter").unwrap().unwrap();
    let port = acceptor.listen().unwrap().port().unwrap();
    let client_endpoint = transport
        .create_endpoint(&format!("ws -h 127.0.0.1 -p {port}"), false)
        .unwrap()
        .unwrap();
    let address = format!("127.0.0.1:{port}").parse().unwrap();
    let connectors = client_endpoint.connectors(&[address], None);
    let mut client = connectors[0].connect().expect("connect");

    let mut buf = Buffer::from_vec(b"early".to_vec());
    assert!(matches!(
        client.write(&mut buf),
        Err(TransportError::InvalidState(_))
    ));
}

#[test]
fn pong_blocked_by_full_socket_asks_for_write() {
    use std::io::Write;
    use std::mem::ManuallyDrop;
    use std::net::TcpStream;
    use std::os::fd::FromRawFd;

    let (client, mut server) = pair("/chat");

    // Fill the server to client direction until a data frame is stuck.
    let mut stuck = false;
    for _ in 0..4096 {
        let mut chunk = Buffer::from_vec(vec![7u8; 64 * 1024]);
        if server.write(&mut chunk).expect("server write") == SocketOperation::WRITE {
            stuck = true;
            break;
        }
    }
    assert!(stuck, "socket never filled up");

    // An empty masked ping, written straight onto the client socket.
    // SAFETY: the descriptor stays owned by `client`.
    let mut raw = ManuallyDrop::new(unsafe { TcpStream::from_raw_fd(client.fd()) });
    raw.write_all(&[0x89, 0x80, 0, 0, 0, 0]).expect("send ping");

    let mut buf = Buffer::with_len(1);
    let mut last = SocketOperation::NONE;
    common::until_done(|| {
        last = server.read(&mut buf).expect("server read");
        if last.contains(SocketOperation::WRITE) {
            SocketOperation::NONE
        } else {
            SocketOperation::READ
        }
    });
    assert_eq!(last, SocketOperation::READ | SocketOperation::WRITE);
}
