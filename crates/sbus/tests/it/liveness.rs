//! Retry, failure and watchdog behavior against a silent peer

use crate::{
    init_tracing,
    utils::{fast_config, wait_until, FakePcd},
};
use sbus::Node;
use sbus_core::FrameKind;
use std::time::{Duration, Instant};

#[test]
fn silent_peer_gets_retries_then_the_watchdog_bites() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let config = fast_config();
    let response_timeout = config.response_timeout;
    let watchdog = config.watchdog_timeout;
    let node = Node::new(config).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(14), pcd.port(), None)
        .expect("server");
    let register = server.registers().declare(55).expect("in range");
    node.start();

    // answer the declaration pull once so the server turns alive
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("initial pull");
    assert_eq!(&frame.payload[..], &[0x06, 0x00, 0x00, 0x37]);
    pcd.respond(from, frame.sequence, &7u32.to_be_bytes());
    assert!(wait_until(Duration::from_secs(2), || server.is_alive()));

    // then go completely silent and ask for a refresh
    register.refresh(true);
    let window = Instant::now();
    let mut copies = Vec::new();
    while window.elapsed() < Duration::from_millis(2500) {
        if let Some((frame, _)) = pcd.recv() {
            if frame.kind == FrameKind::Request && frame.payload[..] == [0x06, 0x00, 0x00, 0x37] {
                copies.push((frame.sequence, Instant::now()));
            }
        }
    }

    // the default retry budget is three transmissions of the same frame
    assert_eq!(copies.len(), 3, "expected exactly three copies, got {copies:?}");
    assert!(copies.iter().all(|(sequence, _)| *sequence == copies[0].0));
    let spread = copies[2].1 - copies[0].1;
    assert!(
        spread >= 2 * response_timeout - Duration::from_millis(60),
        "copies arrived too fast: {spread:?}"
    );

    // no traffic since: the watchdog declares the server dead and the
    // status byte unreliable
    assert!(wait_until(2 * watchdog, || !server.is_alive()));
    assert!(!server.status().is_known());

    node.stop();
}

#[test]
fn failed_read_returns_none_without_side_effects() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let node = Node::new(fast_config()).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(22), pcd.port(), None)
        .expect("server");
    let register = server.registers().declare(1).expect("in range");
    node.start();

    // nobody answers; the blocking read times out with a sentinel
    assert_eq!(register.read(Duration::from_millis(400)), None);
    assert!(!register.take_updated());
    assert!(!server.is_alive());

    node.stop();
}
