mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::Duration;

use rpc_transport::{
    Endpoint, EndpointHostResolver, ThreadState, TransportConfig, TransportError,
    TransportObserver,
};

#[derive(Default)]
struct Recorder {
    started: AtomicUsize,
    failed: AtomicUsize,
    detached: AtomicUsize,
    states: Mutex<Vec<(ThreadState, ThreadState)>>,
}

impl TransportObserver for Recorder {
    fn lookup_started(&self, _endpoint: &Endpoint) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn lookup_failed(&self, _endpoint: &Endpoint, _error: &TransportError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn lookup_detached(&self, _endpoint: &Endpoint) {
        self.detached.fetch_add(1, Ordering::SeqCst);
    }

    fn thread_state_changed(&self, _thread: &str, previous: ThreadState, current: ThreadState) {
        self.states.lock().unwrap().push((previous, current));
    }
}

fn endpoint(text: &str) -> Arc<Endpoint> {
    common::transport()
        .create_endpoint(text, false)
        .expect("parse endpoint")
        .expect("known protocol")
}

fn resolver(observer: Option<Arc<Recorder>>) -> EndpointHostResolver {
    common::init_tracing();
    let observer = observer.map(|recorder| recorder as Arc<dyn TransportObserver>);
    EndpointHostResolver::new(Arc::new(TransportConfig::default()), None, observer)
        .expect("start resolver")
}

#[test]
fn numeric_host_is_answered_inline() {
    let recorder = Arc::new(Recorder::default());
    let resolver = resolver(Some(recorder.clone()));
    let endpoint = endpoint("tcp -h 127.0.0.1 -p 4061");

    let answered = Arc::new(AtomicUsize::new(0));
    let seen = answered.clone();
    resolver.resolve(
        "127.0.0.1",
        4061,
        endpoint,
        Box::new(move |result| {
            let connectors = result.expect("numeric host resolves");
            assert_eq!(connectors.len(), 1);
            assert_eq!(connectors[0].type_id(), 1);
            seen.fetch_add(1, Ordering::SeqCst);
        }),
    );

    assert_eq!(answered.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.pending(), 0);
    assert_eq!(recorder.started.load(Ordering::SeqCst), 0, "no blocking lookup");
}

#[test]
fn unknown_host_fails_with_dns_failure() {
    let recorder = Arc::new(Recorder::default());
    let resolver = resolver(Some(recorder.clone()));
    let endpoint = endpoint("tcp -h no-such-host.invalid -p 4061");

    let (tx, rx) = mpsc::channel();
    resolver.resolve(
        "no-such-host.invalid",
        4061,
        endpoint,
        Box::new(move |result| tx.send(result).expect("send result")),
    );

    let result = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("callback invoked");
    match result {
        Err(TransportError::DnsFailure { host, .. }) => assert_eq!(host, "no-such-host.invalid"),
        other => panic!("unexpected result {other:?}"),
    }
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "exactly one callback");

    resolver.destroy();
    assert_eq!(recorder.started.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.failed.load(Ordering::SeqCst), 1);
    assert_eq!(recorder.detached.load(Ordering::SeqCst), 1);
    assert_eq!(
        *recorder.states.lock().unwrap(),
        [
            (ThreadState::Idle, ThreadState::InUseForOther),
            (ThreadState::InUseForOther, ThreadState::Idle),
        ]
    );
}

#[test]
fn destroy_fails_queued_requests_once() {
    let resolver = resolver(None);
    let endpoint = endpoint("tcp -h no-such-host.invalid -p 4061");

    const REQUESTS: usize = 8;
    let (tx, rx) = mpsc::channel();
    for index in 0..REQUESTS {
        let tx = tx.clone();
        resolver.resolve(
            &format!("host-{index}.invalid"),
            4061,
            endpoint.clone(),
            Box::new(move |result| tx.send(result).expect("send result")),
        );
    }
    drop(tx);

    // Joins the worker, so every callback has run once this returns.
    resolver.destroy();
    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), REQUESTS);
    for result in results {
        assert!(matches!(
            result,
            Err(TransportError::Destroyed) | Err(TransportError::DnsFailure { .. })
        ));
    }

    let (tx, rx) = mpsc::channel();
    resolver.resolve(
        "late.invalid",
        4061,
        endpoint,
        Box::new(move |result| tx.send(result).expect("send result")),
    );
    assert!(matches!(rx.try_recv(), Ok(Err(TransportError::Destroyed))));
    resolver.destroy();
}

#[test]
fn endpoint_resolves_through_transport() {
    let transport = common::transport();
    let endpoint = transport
        .create_endpoint("tcp -h localhost -p 4061 -t 2000", false)
        .expect("parse endpoint")
        .expect("known protocol");

    let (tx, rx) = mpsc::channel();
    endpoint.connectors_async(Box::new(move |result| tx.send(result).expect("send result")));
    let connectors = rx
        .recv_timeout(Duration::from_secs(30))
        .expect("callback invoked")
        .expect("localhost resolves");
    assert!(!connectors.is_empty());
    assert!(connectors.iter().all(|connector| connector.type_id() == 1));
}

#[test]
fn destroyed_transport_refuses_new_endpoints() {
    let transport = common::transport();
    transport.destroy();
    assert!(transport.is_destroyed());
    assert!(matches!(
        transport.create_endpoint("tcp -p 4061", false),
        Err(TransportError::Destroyed)
    ));
}
