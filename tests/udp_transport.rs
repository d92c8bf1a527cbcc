mod common;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use rpc_transport::{
    Buffer, SocketOperation, Transceiver, TransceiverState, TransportError, TransportInstance,
};

fn server(transport: &TransportInstance, text: &str) -> (Box<dyn Transceiver>, u16) {
    let endpoint = transport
        .create_endpoint(text, true)
        .expect("parse adapter endpoint")
        .expect("known protocol");
    assert!(endpoint.datagram());
    assert!(
        endpoint.acceptor("adapter").expect("acceptor").is_none(),
        "datagram endpoints have no acceptor"
    );

    let mut transceiver = endpoint
        .transceiver()
        .expect("create server socket")
        .expect("datagram endpoint");
    let bound = transceiver.bind().expect("bind");
    let port = bound.port().expect("ip endpoint");
    assert_ne!(port, 0, "bind should report the effective port");
    (transceiver, port)
}

fn client(transport: &TransportInstance, port: u16) -> Box<dyn Transceiver> {
    let endpoint = transport
        .create_endpoint(&format!("udp -h 127.0.0.1 -p {port}"), false)
        .expect("parse client endpoint")
        .expect("known protocol");
    let address = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let connectors = endpoint.connectors(&[address], None);
    assert_eq!(connectors.len(), 1);
    assert_eq!(connectors[0].type_id(), 3);

    let mut transceiver = connectors[0].connect().expect("create client socket");
    assert_eq!(transceiver.state(), TransceiverState::NeedConnect);
    let operation = transceiver
        .initialize(&mut Buffer::new(), &mut Buffer::new())
        .expect("initialize");
    assert_eq!(operation, SocketOperation::NONE);
    assert_eq!(transceiver.state(), TransceiverState::Connected);
    transceiver
}

fn receive(transceiver: &mut dyn Transceiver) -> Vec<u8> {
    let mut buf = Buffer::new();
    common::until_done(|| transceiver.read(&mut buf).expect("read datagram"));
    buf.filled().to_vec()
}

#[test]
fn udp_datagrams_flow_both_ways() {
    let transport = common::transport();
    let (mut server, port) = server(&transport, "udp -h 127.0.0.1 -p 0");
    assert_eq!(server.state(), TransceiverState::NotConnected);
    assert!(server.describe().contains(&format!("local address = 127.0.0.1:{port}")));

    let mut client = client(&transport, port);
    common::write_all(client.as_mut(), b"ping");
    assert_eq!(receive(server.as_mut()), b"ping");

    // Without `-c` the server keeps answering whoever sent last.
    assert_eq!(server.state(), TransceiverState::NotConnected);
    let client_local = client.info().local_address.expect("client bound");
    assert_eq!(server.info().remote_address, Some(client_local));
    assert!(server.info().incoming);
    assert!(!client.info().incoming);

    common::write_all(server.as_mut(), b"pong");
    assert_eq!(receive(client.as_mut()), b"pong");

    client.close();
    server.close();
    assert_eq!(client.state(), TransceiverState::Closed);
}

#[test]
fn udp_server_with_connect_flag_locks_onto_first_sender() {
    let transport = common::transport();
    let (mut server, port) = server(&transport, "udp -h 127.0.0.1 -p 0 -c");
    let mut client = client(&transport, port);

    common::write_all(client.as_mut(), b"hello");
    assert_eq!(receive(server.as_mut()), b"hello");
    assert_eq!(server.state(), TransceiverState::Connected);
    assert_eq!(
        server.info().remote_address,
        client.info().local_address,
        "server should be connected to the first sender"
    );

    common::write_all(server.as_mut(), b"reply");
    assert_eq!(receive(client.as_mut()), b"reply");
}

#[test]
fn udp_server_without_peer_cannot_reply() {
    let transport = common::transport();
    let (mut server, _) = server(&transport, "udp -h 127.0.0.1 -p 0");
    let mut buf = Buffer::from_vec(b"nobody".to_vec());
    assert!(server.write(&mut buf).is_err());
}

#[test]
fn udp_oversized_datagram_is_rejected() {
    let transport = common::transport();
    let (_server, port) = server(&transport, "udp -h 127.0.0.1 -p 0");
    let client = client(&transport, port);

    assert!(client.check_send_size(&Buffer::with_len(512)).is_ok());
    let error = client
        .check_send_size(&Buffer::with_len(70_000))
        .expect_err("larger than any datagram");
    match error {
        TransportError::DatagramLimit { size, limit } => {
            assert_eq!(size, 70_000);
            assert!(limit <= 65_535 - 28);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn udp_client_bind_is_rejected() {
    let transport: Arc<TransportInstance> = common::transport();
    let (_server, port) = server(&transport, "udp -h 127.0.0.1 -p 0");
    let mut client = client(&transport, port);
    assert!(matches!(
        client.bind(),
        Err(TransportError::InvalidState(_))
    ));
}

#[test]
fn udp_oversized_buffer_request_saturates() {
    let transport = common::transport();
    let (mut server, _) = server(&transport, "udp -h 127.0.0.1 -p 0");
    server
        .set_buffer_size(usize::MAX, usize::MAX)
        .expect("request clamped to the largest option value");
    assert!(server.info().rcv_size > 0);
    assert!(server.info().snd_size > 0);
}
