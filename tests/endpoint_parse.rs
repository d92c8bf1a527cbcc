mod common;

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rpc_transport::endpoint::factory::EndpointFactory;
use rpc_transport::{Endpoint, TransportError};

fn create(text: &str) -> Arc<Endpoint> {
    common::transport()
        .create_endpoint(text, false)
        .expect("parse endpoint")
        .expect("known protocol")
}

fn parse_error(text: &str, adapter: bool) -> String {
    match common::transport().create_endpoint(text, adapter) {
        Err(TransportError::EndpointParse { message }) => message,
        other => panic!("expected a parse error for `{text}', got {other:?}"),
    }
}

#[test]
fn tcp_renders_canonical_form() {
    let endpoint = create("tcp -p 4061 -z -h 127.0.0.1 -t 5000");
    assert_eq!(endpoint.to_string(), "tcp -h 127.0.0.1 -p 4061 -t 5000 -z");
    assert_eq!(endpoint.type_id(), 1);
    assert!(!endpoint.datagram());
    assert!(!endpoint.is_layered());
}

#[test]
fn tcp_infinite_timeout() {
    let endpoint = create("tcp -h localhost -p 10 -t infinite");
    assert_eq!(endpoint.timeout(), -1);
    assert_eq!(endpoint.to_string(), "tcp -h localhost -p 10 -t infinite");
}

#[test]
fn default_timeout_applies_without_option() {
    let endpoint = create("tcp -h localhost -p 10");
    assert_eq!(endpoint.timeout(), 60000);
}

#[test]
fn ipv6_host_is_quoted() {
    let endpoint = create("tcp -h ::1 -p 10 -t 1000");
    assert_eq!(endpoint.to_string(), "tcp -h \"::1\" -p 10 -t 1000");
    assert_eq!(create(&endpoint.to_string()), endpoint);
}

#[test]
fn default_protocol_is_tcp() {
    let endpoint = create("default -h localhost -p 10");
    assert_eq!(endpoint.protocol(), "tcp");
}

#[test]
fn unknown_protocol_yields_none() {
    let transport = common::transport();
    assert!(transport.create_endpoint("foo -h x", false).unwrap().is_none());
}

#[test]
fn port_out_of_range_is_rejected() {
    let message = parse_error("tcp -h localhost -p 70000", false);
    assert!(message.contains("70000"), "{message}");
    assert!(message.contains("out of range"), "{message}");
    assert!(message.contains("tcp -h localhost -p 70000"), "{message}");
}

#[test]
fn wildcard_host_only_for_adapters() {
    let message = parse_error("tcp -h * -p 10", false);
    assert!(message.contains("-h *"), "{message}");

    let transport = common::transport();
    let endpoint = transport
        .create_endpoint("tcp -h * -p 10", true)
        .unwrap()
        .unwrap();
    assert_eq!(endpoint.host(), Some(""));
}

#[test]
fn invalid_timeout_is_rejected() {
    let message = parse_error("tcp -h localhost -t abc", false);
    assert!(message.contains("invalid timeout value `abc'"), "{message}");
    parse_error("tcp -h localhost -t 0", false);
}

#[test]
fn unknown_option_is_rejected() {
    let message = parse_error("tcp -h localhost -x 3", false);
    assert!(message.contains("unrecognized argument `-x'"), "{message}");
}

#[test]
fn source_address_rejected_for_adapters() {
    let message = parse_error("tcp -h 127.0.0.1 --sourceAddress 127.0.0.1", true);
    assert!(message.contains("--sourceAddress"), "{message}");
    let endpoint = create("tcp -h 127.0.0.1 -p 10 --sourceAddress 127.0.0.1 -t 10");
    assert_eq!(
        endpoint.to_string(),
        "tcp -h 127.0.0.1 -p 10 --sourceAddress 127.0.0.1 -t 10"
    );
}

#[test]
fn udp_options() {
    let endpoint = create("udp -h 239.255.1.1 -p 10000 --ttl 5 --interface eth0 -c");
    assert_eq!(
        endpoint.to_string(),
        "udp -h 239.255.1.1 -p 10000 --interface eth0 --ttl 5 -c"
    );
    assert!(endpoint.datagram());
    assert_eq!(endpoint.timeout(), -1);

    let info = endpoint.info();
    assert_eq!(info.mcast_ttl, 5);
    assert_eq!(info.mcast_interface, "eth0");

    parse_error("udp -h localhost --ttl -1", false);
    parse_error("udp -h localhost -c yes", false);
}

#[test]
fn ws_wraps_tcp_options() {
    let endpoint = create("ws -h 127.0.0.1 -p 8080 -t 1000 -r /chat");
    assert_eq!(endpoint.to_string(), "ws -h 127.0.0.1 -p 8080 -t 1000 -r /chat");
    assert!(endpoint.is_layered());
    assert_eq!(endpoint.type_id(), 4);
    assert_eq!(endpoint.port(), Some(8080));

    let info = endpoint.info();
    assert_eq!(info.resource, "/chat");
    assert_eq!(info.underlying.as_ref().map(|u| u.port), Some(8080));
}

#[test]
fn opaque_with_unknown_type_round_trips() {
    let endpoint = create("opaque -t 99 -e 1.0 -v AQIDBA==");
    assert_eq!(endpoint.type_id(), 99);
    assert_eq!(endpoint.to_string(), "opaque -t 99 -e 1.0 -v AQIDBA==");
    assert_eq!(endpoint.info().raw_bytes, vec![1, 2, 3, 4]);
}

#[test]
fn opaque_with_known_type_decodes() {
    let tcp = create("tcp -h 127.0.0.1 -p 4061 -t 5000");
    let mut out = rpc_transport::stream::OutputStream::new();
    tcp.stream_write(&mut out);
    let bytes = out.finished();
    // type id and encapsulation header precede the body
    let body = &bytes[8..];
    let text = format!("opaque -t 1 -e 1.1 -v {}", STANDARD.encode(body));
    assert_eq!(create(&text), tcp);
}

#[test]
fn with_timeout_is_copy_on_identity() {
    let endpoint = create("tcp -h localhost -p 10 -t 5000");
    assert!(Arc::ptr_eq(&endpoint, &endpoint.with_timeout(5000)));

    let changed = endpoint.with_timeout(7000);
    assert!(!Arc::ptr_eq(&endpoint, &changed));
    assert_eq!(changed.timeout(), 7000);
    assert_eq!(changed.host(), endpoint.host());
    assert_eq!(changed.port(), endpoint.port());
    assert_eq!(changed.compress(), endpoint.compress());
    assert_eq!(changed.with_timeout(5000), endpoint);

    let ws = create("ws -h localhost -p 10 -t 5000 -r /x");
    assert!(Arc::ptr_eq(&ws, &ws.with_timeout(5000)));
    assert_eq!(ws.with_timeout(1).timeout(), 1);

    let udp = create("udp -h localhost -p 10");
    assert!(Arc::ptr_eq(&udp, &udp.with_timeout(1)));
}

#[test]
fn with_compress_and_connection_id() {
    let endpoint = create("tcp -h localhost -p 10");
    assert!(Arc::ptr_eq(&endpoint, &endpoint.with_compress(false)));
    assert!(endpoint.with_compress(true).compress());

    let tagged = endpoint.with_connection_id("abc");
    assert_eq!(tagged.connection_id(), "abc");
    assert_ne!(tagged, endpoint);
    assert!(tagged.equivalent(&endpoint));
}

#[test]
fn published_endpoint_replaces_host() {
    let transport = common::transport();
    let endpoint = transport
        .create_endpoint("tcp -h * -p 4061", true)
        .unwrap()
        .unwrap();
    let published = endpoint.to_published_endpoint("example.com");
    assert_eq!(published.host(), Some("example.com"));
    assert!(Arc::ptr_eq(&endpoint, &endpoint.to_published_endpoint("")));
}

#[test]
fn underlying_factory_layers_ws_over_another_carrier() {
    common::init_tracing();
    let transport = rpc_transport::TransportBuilder::new()
        .factory(|transport| {
            EndpointFactory::underlying(transport.protocol_instance(5, "wss", true), 4, 1)
        })
        .build()
        .expect("build transport");

    let factory = transport.factories().get(5).expect("wss registered");
    assert_eq!(factory.protocol(), "wss");
    assert!(!factory.is_layered());

    let endpoint = transport
        .create_endpoint("wss -h 127.0.0.1 -p 4064 -t 1000 -r /secure", false)
        .expect("parse endpoint")
        .expect("carrier resolved");
    assert_eq!(endpoint.type_id(), 5);
    assert!(endpoint.secure());
    assert!(endpoint.is_layered());
    assert_eq!(
        endpoint.to_string(),
        "wss -h 127.0.0.1 -p 4064 -t 1000 -r /secure"
    );
}

#[test]
fn underlying_factory_over_non_layered_type_creates_nothing() {
    common::init_tracing();
    let transport = rpc_transport::TransportBuilder::new()
        .factory(|transport| {
            EndpointFactory::underlying(transport.protocol_instance(9, "tcpx", false), 1, 3)
        })
        .build()
        .expect("build transport");

    assert!(
        transport
            .create_endpoint("tcpx -h 127.0.0.1 -p 4064", false)
            .expect("no parse error")
            .is_none()
    );
}

fn hash_of(endpoint: &Endpoint) -> u64 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    endpoint.hash(&mut hasher);
    hasher.finish()
}

#[test]
fn mixed_endpoints_sort_and_dedup_stably() {
    let texts = [
        "opaque -t 99 -e 1.0 -v AQIDBA==",
        "ws -h 127.0.0.1 -p 4061 -r /b",
        "udp -h 127.0.0.1 -p 4061",
        "tcp -h 127.0.0.1 -p 4062 -t 1000",
        "ws -h 127.0.0.1 -p 4061 -r /a",
        "tcp -h 127.0.0.1 -p 4061 -t 1000",
        "udp -h 127.0.0.1 -p 4061",
        "opaque -t 99 -e 1.0 -v AQIDBA==",
    ];
    let mut endpoints: Vec<Arc<Endpoint>> = texts.iter().map(|text| create(text)).collect();
    endpoints.sort();
    endpoints.dedup();

    let rendered: Vec<String> = endpoints.iter().map(|e| e.to_string()).collect();
    assert_eq!(
        rendered,
        [
            "tcp -h 127.0.0.1 -p 4061 -t 1000",
            "tcp -h 127.0.0.1 -p 4062 -t 1000",
            "udp -h 127.0.0.1 -p 4061",
            "ws -h 127.0.0.1 -p 4061 -t 60000 -r /a",
            "ws -h 127.0.0.1 -p 4061 -t 60000 -r /b",
            "opaque -t 99 -e 1.0 -v AQIDBA==",
        ]
    );

    let mut reversed: Vec<Arc<Endpoint>> = endpoints.iter().rev().cloned().collect();
    reversed.sort();
    assert_eq!(reversed, endpoints);
}

#[test]
fn derived_endpoints_with_same_values_are_identical() {
    let original = create("tcp -h 127.0.0.1 -p 4061 -t 1000");

    let round_trip = original.with_timeout(5000).with_timeout(1000);
    assert!(!Arc::ptr_eq(&round_trip, &original));
    assert_eq!(round_trip, original);
    assert_eq!(hash_of(&round_trip), hash_of(&original));

    let round_trip = original.with_compress(true).with_compress(false);
    assert_eq!(round_trip, original);
    assert_eq!(hash_of(&round_trip), hash_of(&original));

    let round_trip = original.with_connection_id("pool").with_connection_id("");
    assert_eq!(round_trip, original);
    assert_eq!(hash_of(&round_trip), hash_of(&original));

    let tagged = original.with_connection_id("pool");
    assert_ne!(tagged, original);
    assert_eq!(tagged, create("tcp -h 127.0.0.1 -p 4061 -t 1000").with_connection_id("pool"));
}
