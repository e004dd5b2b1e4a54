//! Reading and writing controller memory over a loopback peer

use crate::{
    init_tracing,
    utils::{fast_config, wait_until, FakePcd},
};
use sbus::Node;
use std::time::Duration;

#[test]
fn read_register_round_trip() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let node = Node::new(fast_config()).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(12), pcd.port(), None)
        .expect("server");
    let register = server.registers().declare(100).expect("in range");
    node.start();

    // the declaration pull is the first and only data request, sequence 1
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("read request");
    assert_eq!(frame.sequence, 1);
    assert_eq!(&frame.payload[..], &[0x06, 0x00, 0x00, 0x64]);
    pcd.respond(from, frame.sequence, &0x1234_5678u32.to_be_bytes());

    assert!(wait_until(Duration::from_secs(2), || register.raw() == 0x1234_5678));
    assert!(register.age() < Duration::from_millis(100));
    assert!(register.take_updated());
    assert!(server.is_alive());

    // a differing refresh arms the changed edge
    register.refresh(true);
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("refresh request");
    assert_eq!(&frame.payload[..], &[0x06, 0x00, 0x00, 0x64]);
    pcd.respond(from, frame.sequence, &0x1234_5679u32.to_be_bytes());
    assert!(wait_until(Duration::from_secs(2), || register.raw() == 0x1234_5679));
    assert!(register.take_changed());

    node.stop();
}

#[test]
fn blocking_read_wakes_on_arrival() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let node = Node::new(fast_config()).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(18), pcd.port(), None)
        .expect("server");
    let flag = server.flags().declare(77).expect("in range");
    node.start();

    // service the peer from the test thread while read() blocks
    let reader = std::thread::spawn(move || flag.read(Duration::from_secs(3)));
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("read request");
    assert_eq!(&frame.payload[..], &[0x02, 0x00, 0x00, 0x4D]);
    pcd.respond(from, frame.sequence, &[0x01]);

    assert_eq!(reader.join().expect("reader thread"), Some(1));
    node.stop();
}

#[test]
fn write_with_confirmation() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let node = Node::new(fast_config()).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(13), pcd.port(), None)
        .expect("server");
    let register = server.registers().declare(200).expect("in range");
    node.start();

    // the declaration pull settles the cell at zero
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("initial pull");
    assert_eq!(&frame.payload[..], &[0x06, 0x00, 0x00, 0xC8]);
    pcd.respond(from, frame.sequence, &0u32.to_be_bytes());
    assert!(wait_until(Duration::from_secs(2), || register.take_updated()));

    register.set_i32(42);
    assert!(register.is_push_pending());

    // the staged push goes out as one write request
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("write request");
    assert_eq!(&frame.payload[..], &[0x0E, 0x06, 0x00, 0xC8, 0x00, 0x00, 0x00, 0x2A]);
    pcd.ack(from, frame.sequence);

    // the acknowledged write is confirmed by an urgent pull
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("confirming pull");
    assert_eq!(&frame.payload[..], &[0x06, 0x00, 0x00, 0xC8]);
    pcd.respond(from, frame.sequence, &42u32.to_be_bytes());

    assert!(wait_until(Duration::from_secs(2), || {
        register.value_i32() == 42 && !register.is_push_pending()
    }));
    assert!(register.take_changed());

    node.stop();
}

#[test]
fn nak_aborts_the_write() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let node = Node::new(fast_config()).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(19), pcd.port(), None)
        .expect("server");
    let output = server.outputs().declare(5).expect("in range");
    node.start();

    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("initial pull");
    assert_eq!(&frame.payload[..], &[0x05, 0x00, 0x00, 0x05]);
    pcd.respond(from, frame.sequence, &[0x00]);
    assert!(wait_until(Duration::from_secs(2), || output.take_updated()));

    output.on();
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("write request");
    assert_eq!(&frame.payload[..], &[0x0D, 0x04, 0x00, 0x05, 0x00, 0x01]);
    pcd.nak(from, frame.sequence);

    // the rejected push settles without a confirming pull
    assert!(wait_until(Duration::from_secs(2), || !output.is_push_pending()));
    assert!(!output.is_on());

    node.stop();
}

#[test]
fn range_reads_coalesce_into_one_request() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let node = Node::new(fast_config()).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(16), pcd.port(), None)
        .expect("server");
    let items = server.registers().declare_range(10, 16);
    assert_eq!(items.len(), 16);
    node.start();

    // sixteen consecutive declarations produce one range request
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("range request");
    assert_eq!(&frame.payload[..], &[0x06, 0x0F, 0x00, 0x0A]);

    let mut data = Vec::with_capacity(16 * 4);
    for i in 0..16u32 {
        data.extend_from_slice(&(1000 + i).to_be_bytes());
    }
    pcd.respond(from, frame.sequence, &data);

    assert!(wait_until(Duration::from_secs(2), || {
        items.iter().enumerate().all(|(i, item)| item.raw() == 1000 + i as u32)
    }));

    node.stop();
}
