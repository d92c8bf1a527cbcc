mod common;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use rpc_transport::Connector;

fn connector(text: &str) -> Connector {
    let endpoint = common::transport()
        .create_endpoint(text, false)
        .expect("parse endpoint")
        .expect("known protocol");
    let address: SocketAddr = "127.0.0.1:4061".parse().unwrap();
    let mut connectors = endpoint.connectors(&[address], None);
    assert_eq!(connectors.len(), 1);
    connectors.remove(0)
}

fn hash_of(connector: &Connector) -> u64 {
    let mut hasher = DefaultHasher::new();
    connector.hash(&mut hasher);
    hasher.finish()
}

fn assert_distinct(a: &Connector, b: &Connector) {
    assert_ne!(a, b);
    assert_ne!(a.cmp(b), std::cmp::Ordering::Equal);
    assert_eq!(a.cmp(b), b.cmp(a).reverse());
}

#[test]
fn same_options_give_equal_connectors() {
    let a = connector("tcp -h 127.0.0.1 -p 4061 -t 1000");
    let b = connector("tcp -h 127.0.0.1 -p 4061 -t 1000");
    assert_eq!(a, b);
    assert_eq!(hash_of(&a), hash_of(&b));
}

#[test]
fn tcp_connectors_differ_by_timeout_connection_id_and_source() {
    let base = connector("tcp -h 127.0.0.1 -p 4061 -t 1000");
    let timeout = connector("tcp -h 127.0.0.1 -p 4061 -t 2000");
    let source = connector("tcp -h 127.0.0.1 -p 4061 -t 1000 --sourceAddress 127.0.0.1");

    let endpoint = common::transport()
        .create_endpoint("tcp -h 127.0.0.1 -p 4061 -t 1000", false)
        .unwrap()
        .unwrap()
        .with_connection_id("pool-1");
    let address: SocketAddr = "127.0.0.1:4061".parse().unwrap();
    let tagged = endpoint.connectors(&[address], None).remove(0);

    for other in [&timeout, &source, &tagged] {
        assert_distinct(&base, other);
        assert_ne!(hash_of(&base), hash_of(other));
    }
}

#[test]
fn udp_connectors_differ_by_multicast_options() {
    let base = connector("udp -h 127.0.0.1 -p 4061");
    let interface = connector("udp -h 127.0.0.1 -p 4061 --interface 127.0.0.1");
    let ttl = connector("udp -h 127.0.0.1 -p 4061 --ttl 5");
    assert_distinct(&base, &interface);
    assert_distinct(&base, &ttl);
    assert_distinct(&interface, &ttl);
}

#[test]
fn ws_connectors_differ_by_resource() {
    let chat = connector("ws -h 127.0.0.1 -p 4061 -r /chat");
    let feed = connector("ws -h 127.0.0.1 -p 4061 -r /feed");
    assert_distinct(&chat, &feed);
    assert_eq!(chat, connector("ws -h 127.0.0.1 -p 4061 -r /chat"));
}

#[test]
fn connectors_sort_by_type_then_options() {
    let mut connectors = vec![
        connector("ws -h 127.0.0.1 -p 4061 -r /b"),
        connector("udp -h 127.0.0.1 -p 4061"),
        connector("tcp -h 127.0.0.1 -p 4061 -t 2000"),
        connector("ws -h 127.0.0.1 -p 4061 -r /a"),
        connector("tcp -h 127.0.0.1 -p 4061 -t 1000"),
        connector("udp -h 127.0.0.1 -p 4061"),
    ];
    connectors.sort();
    connectors.dedup();

    let types: Vec<i16> = connectors.iter().map(Connector::type_id).collect();
    assert_eq!(types, [1, 1, 3, 4, 4]);

    let mut reversed: Vec<Connector> = connectors.iter().rev().cloned().collect();
    reversed.sort();
    assert_eq!(reversed, connectors);
}
