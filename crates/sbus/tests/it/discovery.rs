//! Node discovery and station id bookkeeping

use crate::{
    init_tracing,
    utils::{fast_config, FakePcd},
};
use bytes::Bytes;
use sbus::Node;
use sbus_core::{Frame, UDP_DEFAULT_PORT};

fn station_response(sequence: u16, station: u8) -> Vec<u8> {
    Frame::response(sequence, Bytes::copy_from_slice(&[station])).encode().to_vec()
}

#[test]
fn discovery_declares_answering_stations() {
    init_tracing();
    let node = Node::new(fast_config()).expect("node");
    node.enable_network_scanner(true);

    // two stations answer the broadcast
    node.handle_datagram(&station_response(17, 3), "10.0.0.5:5050".parse().unwrap());
    node.handle_datagram(&station_response(18, 4), "10.0.0.6:5050".parse().unwrap());

    let first = node.get_from_lid(3).expect("station 3 declared");
    assert_eq!(first.host(), "10.0.0.5");
    let second = node.get_from_lid(4).expect("station 4 declared");
    assert_eq!(second.host(), "10.0.0.6");

    // an answering station is demonstrably there
    assert!(first.is_alive());
    assert!(second.is_alive());
    assert_eq!(node.servers().count(), 2);

    // a repeated answer from a known host declares nothing new
    node.handle_datagram(&station_response(19, 3), "10.0.0.5:5050".parse().unwrap());
    assert_eq!(node.servers().count(), 2);
}

#[test]
fn malformed_frames_are_dropped() {
    init_tracing();
    let node = Node::new(fast_config()).expect("node");

    let mut corrupted = station_response(1, 3);
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xff;
    node.handle_datagram(&corrupted, "10.0.0.9:5050".parse().unwrap());
    assert_eq!(node.servers().count(), 0);

    // truncated and oversized datagrams neither
    node.handle_datagram(&[0u8; 5], "10.0.0.9:5050".parse().unwrap());
    node.handle_datagram(&[0u8; 400], "10.0.0.9:5050".parse().unwrap());
    assert_eq!(node.servers().count(), 0);
}

#[test]
fn duplicate_lid_pauses_the_newcomer() {
    init_tracing();
    let node = Node::new(fast_config()).expect("node");

    let first = node
        .declare_server_with("127.0.0.2", Some(9), UDP_DEFAULT_PORT, None)
        .expect("first server");
    let second = node
        .declare_server_with("127.0.0.3", Some(9), UDP_DEFAULT_PORT, None)
        .expect("second server");

    // the first claimant keeps the slot
    assert_eq!(node.get_from_lid(9).expect("slot kept").host(), "127.0.0.2");
    assert_eq!(first.lid(), Some(9));
    assert_eq!(second.lid(), None);
    assert!(!first.is_paused());
    assert!(second.is_paused());

    // retrying through the public entry point changes nothing
    node.assign_server_lid(&second, 9);
    assert_eq!(node.get_from_lid(9).expect("slot kept").host(), "127.0.0.2");
    assert_eq!(second.lid(), None);
}

#[test]
fn declaring_a_known_host_returns_the_existing_server() {
    init_tracing();
    let node = Node::new(fast_config()).expect("node");
    let pcd = FakePcd::spawn();

    let first = node.declare_server_with("127.0.0.1", Some(30), pcd.port(), None).unwrap();
    let again = node.declare_server("127.0.0.1").unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &again));
    assert_eq!(node.servers().count(), 1);
}

#[test]
fn declare_range_walks_addresses_and_lids() {
    init_tracing();
    let node = Node::new(fast_config()).expect("node");

    let servers = node.declare_server_range("10.1.0.10".parse().unwrap(), 3, Some(40));
    assert_eq!(servers.len(), 3);
    assert_eq!(servers[0].host(), "10.1.0.10");
    assert_eq!(servers[2].host(), "10.1.0.12");
    assert_eq!(node.get_from_lid(41).expect("lid follows").host(), "10.1.0.11");
}
