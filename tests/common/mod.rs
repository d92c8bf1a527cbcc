#![allow(dead_code)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use rpc_transport::{
    Buffer, Properties, SocketOperation, Transceiver, TransportBuilder, TransportInstance,
};
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Routes crate logs to the test harness; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn transport() -> Arc<TransportInstance> {
    transport_with(Properties::new())
}

pub fn transport_with(properties: Properties) -> Arc<TransportInstance> {
    init_tracing();
    TransportBuilder::new()
        .properties(properties)
        .build()
        .expect("build transport")
}

const DEADLINE: Duration = Duration::from_secs(10);

/// Calls `step` until it reports `NONE`, sleeping briefly between
/// attempts instead of waiting on a selector.
pub fn until_done(mut step: impl FnMut() -> SocketOperation) {
    let start = Instant::now();
    loop {
        if step().is_none() {
            return;
        }
        assert!(start.elapsed() < DEADLINE, "operation did not complete in time");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Drives the handshakes of a client and a server transceiver until both
/// report completion.
pub fn initialize_pair(client: &mut dyn Transceiver, server: &mut dyn Transceiver) {
    let (mut client_read, mut client_write) = (Buffer::new(), Buffer::new());
    let (mut server_read, mut server_write) = (Buffer::new(), Buffer::new());
    let mut client_done = false;
    let mut server_done = false;
    until_done(|| {
        if !client_done {
            client_done = client
                .initialize(&mut client_read, &mut client_write)
                .expect("client initialize")
                .is_none();
        }
        if !server_done {
            server_done = server
                .initialize(&mut server_read, &mut server_write)
                .expect("server initialize")
                .is_none();
        }
        if client_done && server_done {
            SocketOperation::NONE
        } else {
            SocketOperation::READ
        }
    });
}

pub fn write_all(transceiver: &mut dyn Transceiver, data: &[u8]) {
    let mut buf = Buffer::from_vec(data.to_vec());
    until_done(|| transceiver.write(&mut buf).expect("write"));
}

pub fn read_exact(transceiver: &mut dyn Transceiver, len: usize) -> Vec<u8> {
    let mut buf = Buffer::with_len(len);
    until_done(|| transceiver.read(&mut buf).expect("read"));
    buf.into_vec()
}
