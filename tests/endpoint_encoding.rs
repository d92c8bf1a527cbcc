mod common;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use proptest::prelude::*;
use rpc_transport::stream::{EncodingVersion, InputStream, OutputStream};
use rpc_transport::{Endpoint, TransportError, TransportInstance};

fn hash_of(endpoint: &Endpoint) -> u64 {
    let mut hasher = DefaultHasher::new();
    endpoint.hash(&mut hasher);
    hasher.finish()
}

fn encode(endpoint: &Endpoint, encoding: EncodingVersion) -> Vec<u8> {
    let mut out = OutputStream::with_encoding(encoding);
    endpoint.stream_write(&mut out);
    out.finished().to_vec()
}

fn decode(transport: &TransportInstance, bytes: Vec<u8>) -> Arc<Endpoint> {
    let mut input = InputStream::new(bytes);
    let endpoint = transport.read_endpoint(&mut input).expect("decode endpoint");
    assert_eq!(input.remaining(), 0, "trailing bytes after endpoint");
    endpoint
}

fn host() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("127.0.0.1".to_string()),
        Just("::1".to_string()),
        Just("localhost".to_string()),
        "[a-z]{1,12}(\\.[a-z]{2,6}){0,2}",
    ]
}

fn timeout() -> impl Strategy<Value = String> {
    prop_oneof![Just("infinite".to_string()), (1..=i32::MAX).prop_map(|t| t.to_string())]
}

fn tcp_text() -> impl Strategy<Value = String> {
    (host(), any::<u16>(), timeout(), any::<bool>()).prop_map(|(host, port, timeout, z)| {
        let z = if z { " -z" } else { "" };
        format!("tcp -h \"{host}\" -p {port} -t {timeout}{z}")
    })
}

fn udp_text() -> impl Strategy<Value = String> {
    (host(), any::<u16>(), any::<bool>()).prop_map(|(host, port, z)| {
        let z = if z { " -z" } else { "" };
        format!("udp -h \"{host}\" -p {port}{z}")
    })
}

fn ws_text() -> impl Strategy<Value = String> {
    (tcp_text(), "/[a-z0-9/]{0,16}").prop_map(|(tcp, resource)| {
        format!("ws{} -r {resource}", tcp.trim_start_matches("tcp"))
    })
}

fn any_text() -> impl Strategy<Value = String> {
    prop_oneof![tcp_text(), udp_text(), ws_text()]
}

proptest! {
    #[test]
    fn text_form_round_trips(text in any_text()) {
        let transport = common::transport();
        let endpoint = transport.create_endpoint(&text, false).unwrap().unwrap();
        let reparsed = transport
            .create_endpoint(&endpoint.to_string(), false)
            .unwrap()
            .unwrap();
        prop_assert_eq!(&reparsed, &endpoint);
        prop_assert_eq!(reparsed.to_string(), endpoint.to_string());
    }

    #[test]
    fn binary_form_round_trips(text in any_text()) {
        let transport = common::transport();
        let endpoint = transport.create_endpoint(&text, false).unwrap().unwrap();
        let decoded = decode(&transport, encode(&endpoint, EncodingVersion::V1_1));
        prop_assert_eq!(&decoded, &endpoint);
        prop_assert_eq!(hash_of(&decoded), hash_of(&endpoint));
    }
}

#[test]
fn equal_endpoints_hash_equal() {
    let transport = common::transport();
    let a = transport
        .create_endpoint("tcp -h localhost -p 10 -t 100", false)
        .unwrap()
        .unwrap();
    let b = transport
        .create_endpoint("tcp -t 100 -p 10 -h localhost", false)
        .unwrap()
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(hash_of(&a), hash_of(&b));
}

#[test]
fn tcp_layout() {
    let transport = common::transport();
    let endpoint = transport
        .create_endpoint("tcp -h ab -p 258 -t 1000 -z", false)
        .unwrap()
        .unwrap();
    let bytes = encode(&endpoint, EncodingVersion::V1_1);
    assert_eq!(
        bytes,
        [
            1, 0, // type
            18, 0, 0, 0, 1, 1, // encapsulation header
            2, b'a', b'b', // host
            2, 1, 0, 0, // port
            0xe8, 3, 0, 0, // timeout
            1, // compress
        ]
    );
}

#[test]
fn udp_marker_only_under_encoding_1_0() {
    let transport = common::transport();
    let endpoint = transport
        .create_endpoint("udp -h ab -p 1", false)
        .unwrap()
        .unwrap();

    let current = encode(&endpoint, EncodingVersion::V1_1);
    let legacy = encode(&endpoint, EncodingVersion::V1_0);
    assert_eq!(legacy.len(), current.len() + 4);
    assert_eq!(&legacy[legacy.len() - 5..legacy.len() - 1], &[1, 0, 1, 0]);

    assert_eq!(decode(&transport, legacy), endpoint);
    assert_eq!(decode(&transport, current), endpoint);
}

#[test]
fn ws_resource_follows_underlying_body() {
    let transport = common::transport();
    let endpoint = transport
        .create_endpoint("ws -h ab -p 1 -t 1 -r /x", false)
        .unwrap()
        .unwrap();
    let bytes = encode(&endpoint, EncodingVersion::V1_1);
    assert_eq!(&bytes[..2], &[4, 0]);
    assert_eq!(&bytes[bytes.len() - 3..], &[2, b'/', b'x']);
}

#[test]
fn unknown_type_decodes_as_opaque() {
    let transport = common::transport();
    let bytes = vec![42, 0, 9, 0, 0, 0, 1, 1, 7, 8, 9];
    let endpoint = decode(&transport, bytes.clone());
    assert_eq!(endpoint.type_id(), 42);
    assert_eq!(endpoint.protocol(), "opaque");
    assert_eq!(encode(&endpoint, EncodingVersion::V1_1), bytes);
}

#[test]
fn truncated_encoding_is_a_marshal_error() {
    let transport = common::transport();
    let mut input = InputStream::new(vec![1, 0, 30, 0, 0, 0, 1, 1, 2]);
    assert!(matches!(
        transport.read_endpoint(&mut input),
        Err(TransportError::Marshal { .. })
    ));
}
