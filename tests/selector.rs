mod common;

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rpc_transport::network::native::NativeInfo;
use rpc_transport::{
    CompletionSelector, EventHandler, EventSelector, Selector, SocketOperation, TransportError,
};

struct StreamHandler {
    _stream: UnixStream,
    info: NativeInfo,
}

impl EventHandler for StreamHandler {
    fn native_info(&self) -> &NativeInfo {
        &self.info
    }
}

fn handler_pair() -> (Arc<dyn EventHandler>, UnixStream) {
    common::init_tracing();
    let (local, peer) = UnixStream::pair().expect("socket pair");
    local.set_nonblocking(true).expect("non-blocking");
    let info = NativeInfo::new(local.as_raw_fd());
    let handler: Arc<dyn EventHandler> = Arc::new(StreamHandler {
        _stream: local,
        info,
    });
    (handler, peer)
}

type Ready = Vec<(Arc<dyn EventHandler>, SocketOperation)>;

fn pass(selector: &Selector, timeout: Duration) -> Ready {
    let mut ready = Vec::new();
    selector.start_select().expect("start_select");
    selector.select(Some(timeout)).expect("select");
    selector.finish_select(&mut ready).expect("finish_select");
    ready
}

#[test]
fn writable_is_reported_once_until_enabled() {
    let selector = Selector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::WRITE)
        .expect("register");
    assert_eq!(selector.len(), 1);

    let ready = pass(&selector, Duration::from_secs(5));
    assert_eq!(ready.len(), 1);
    assert!(Arc::ptr_eq(&ready[0].0, &handler));
    assert_eq!(ready[0].1, SocketOperation::WRITE);
    assert_eq!(selector.interest(&handler), SocketOperation::NONE);

    // Still writable, but the reported bit stays disabled.
    assert!(pass(&selector, Duration::from_millis(50)).is_empty());

    selector.enable(&handler, SocketOperation::WRITE).expect("enable");
    let ready = pass(&selector, Duration::from_secs(5));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, SocketOperation::WRITE);
}

#[test]
fn readable_after_peer_writes() {
    let selector = Selector::new().expect("selector");
    let (handler, mut peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::READ)
        .expect("register");

    assert!(pass(&selector, Duration::from_millis(50)).is_empty());

    peer.write_all(b"x").expect("peer write");
    let ready = pass(&selector, Duration::from_secs(5));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, SocketOperation::READ);
}

#[test]
fn update_replaces_interest() {
    let selector = Selector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::READ)
        .expect("register");
    selector
        .update(&handler, SocketOperation::READ, SocketOperation::CONNECT)
        .expect("update");
    assert_eq!(selector.interest(&handler), SocketOperation::CONNECT);

    let ready = pass(&selector, Duration::from_secs(5));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, SocketOperation::CONNECT);
}

#[test]
fn finish_discards_collected_events() {
    let selector = Selector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::WRITE)
        .expect("register");

    selector.start_select().expect("start_select");
    let collected = selector
        .select(Some(Duration::from_secs(5)))
        .expect("select");
    assert_eq!(collected, 1);

    assert!(selector.finish(&handler, true).expect("finish"));
    assert!(selector.is_empty());

    let mut ready = Vec::new();
    selector.finish_select(&mut ready).expect("finish_select");
    assert!(ready.is_empty(), "finished handler must not be reported");
}

#[test]
fn ready_marks_skip_the_wait() {
    let selector = Selector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::READ)
        .expect("register");
    selector
        .ready(&handler, SocketOperation::READ, true)
        .expect("mark");

    let start = Instant::now();
    let ready = pass(&selector, Duration::from_secs(30));
    assert!(start.elapsed() < Duration::from_secs(5));
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].1, SocketOperation::READ);

    selector
        .ready(&handler, SocketOperation::READ, false)
        .expect("clear mark");
    selector.enable(&handler, SocketOperation::READ).expect("enable");
    assert!(pass(&selector, Duration::from_millis(50)).is_empty());
}

#[test]
fn interrupt_wakes_a_blocked_select() {
    let selector = Arc::new(Selector::new().expect("selector"));
    let waker = {
        let selector = selector.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            selector.interrupt().expect("interrupt");
        })
    };

    let start = Instant::now();
    selector.start_select().expect("start_select");
    selector
        .select(Some(Duration::from_secs(30)))
        .expect("select");
    assert!(start.elapsed() < Duration::from_secs(10));
    waker.join().expect("waker thread");
}

#[test]
fn handler_without_descriptor_is_rejected() {
    let selector = Selector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    handler.native_info().clear_fd();
    assert!(matches!(
        selector.update(&handler, SocketOperation::NONE, SocketOperation::READ),
        Err(TransportError::InvalidState(_))
    ));
}

#[test]
fn destroyed_selector_rejects_use() {
    let selector = Selector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::READ)
        .expect("register");

    selector.destroy();
    selector.destroy();
    assert!(selector.is_empty());
    assert!(matches!(selector.start_select(), Err(TransportError::Destroyed)));
    assert!(matches!(
        selector.update(&handler, SocketOperation::NONE, SocketOperation::WRITE),
        Err(TransportError::Destroyed)
    ));
    // Finishing after destroy is still allowed.
    assert!(selector.finish(&handler, true).expect("finish"));
}

fn next_completion(
    selector: &CompletionSelector,
) -> (Arc<dyn EventHandler>, SocketOperation) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(next) = selector
            .get_next_handler(Some(Duration::from_millis(100)))
            .expect("get_next_handler")
        {
            return next;
        }
        assert!(Instant::now() < deadline, "no completion in time");
    }
}

#[test]
fn completion_update_posts_initial_completion() {
    let selector = CompletionSelector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(
            &handler,
            SocketOperation::NONE,
            SocketOperation::READ | SocketOperation::WRITE,
        )
        .expect("register");

    let (completed, ops) = next_completion(&selector);
    assert!(Arc::ptr_eq(&completed, &handler));
    assert_eq!(ops, SocketOperation::READ | SocketOperation::WRITE);
}

#[test]
fn completion_start_and_finish() {
    let selector = CompletionSelector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::WRITE)
        .expect("register");
    assert_eq!(next_completion(&selector).1, SocketOperation::WRITE);

    selector
        .start_async(&handler, SocketOperation::WRITE)
        .expect("start write");
    assert!(matches!(
        selector.start_async(&handler, SocketOperation::WRITE),
        Err(TransportError::InvalidState(_))
    ));
    assert_eq!(selector.pending(&handler), SocketOperation::WRITE);

    assert_eq!(next_completion(&selector).1, SocketOperation::WRITE);
    selector
        .finish_async(&handler, SocketOperation::WRITE)
        .expect("finish write");
    assert_eq!(selector.pending(&handler), SocketOperation::NONE);
    assert!(matches!(
        selector.finish_async(&handler, SocketOperation::WRITE),
        Err(TransportError::InvalidState(_))
    ));
}

#[test]
fn completion_finish_defers_close_while_pending() {
    let selector = CompletionSelector::new().expect("selector");
    let (handler, mut peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::READ)
        .expect("register");
    assert_eq!(next_completion(&selector).1, SocketOperation::READ);

    selector
        .start_async(&handler, SocketOperation::READ)
        .expect("start read");
    assert!(
        !selector.finish(&handler, true).expect("finish"),
        "a pending read must delay the close"
    );
    peer.write_all(b"late").expect("peer write");
    assert!(
        selector
            .get_next_handler(Some(Duration::from_millis(50)))
            .expect("get_next_handler")
            .is_none()
    );
}

#[test]
fn completion_posted_without_os() {
    let selector = CompletionSelector::new().expect("selector");
    let (handler, _peer) = handler_pair();
    selector
        .update(&handler, SocketOperation::NONE, SocketOperation::READ)
        .expect("register");
    assert_eq!(next_completion(&selector).1, SocketOperation::READ);

    selector
        .completed(&handler, SocketOperation::READ)
        .expect("post completion");
    assert_eq!(next_completion(&selector).1, SocketOperation::READ);

    selector.destroy();
    assert!(matches!(
        selector.get_next_handler(None),
        Err(TransportError::Destroyed)
    ));
}

struct ClosableHandler {
    stream: std::sync::Mutex<Option<UnixStream>>,
    info: NativeInfo,
}

impl EventHandler for ClosableHandler {
    fn native_info(&self) -> &NativeInfo {
        &self.info
    }
}

#[test]
fn descriptor_closed_before_finish_does_not_hide_other_handlers() {
    common::init_tracing();
    let selector = Selector::new().expect("selector");

    let (ready_handler, mut ready_peer) = handler_pair();
    let (local, mut closed_peer) = UnixStream::pair().expect("socket pair");
    local.set_nonblocking(true).expect("non-blocking");
    let closable = Arc::new(ClosableHandler {
        info: NativeInfo::new(local.as_raw_fd()),
        stream: std::sync::Mutex::new(Some(local)),
    });
    let closed_handler: Arc<dyn EventHandler> = closable.clone();

    for handler in [&closed_handler, &ready_handler] {
        selector
            .update(handler, SocketOperation::NONE, SocketOperation::READ)
            .expect("register");
    }
    closed_peer.write_all(b"x").expect("peer write");
    ready_peer.write_all(b"y").expect("peer write");

    selector.start_select().expect("start_select");
    let collected = selector
        .select(Some(Duration::from_secs(5)))
        .expect("select");
    assert_eq!(collected, 2);

    // The descriptor goes away underneath the selector.
    drop(closable.stream.lock().unwrap().take());

    let mut ready = Vec::new();
    selector.finish_select(&mut ready).expect("finish_select");
    assert!(
        ready
            .iter()
            .any(|(handler, ops)| Arc::ptr_eq(handler, &ready_handler)
                && *ops == SocketOperation::READ),
        "the live handler must still be reported"
    );

    selector.finish(&closed_handler, true).expect("finish");
}
