//! Device identification, CPU control and symbol resolution

use crate::{
    init_tracing,
    utils::{fast_config, wait_until, FakePcd},
};
use sbus::{AddressSpace, Node};
use sbus_core::FrameKind;
use std::time::Duration;

#[test]
fn device_probe_reads_identification_and_loads_symbols() {
    init_tracing();
    let map_dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        map_dir.path().join("PCD-STATION-7.map"),
        "pump_speed r 118\ndooropen f 2001\n",
    )
    .expect("write map file");

    let pcd = FakePcd::spawn();
    let mut config = fast_config().with_map_file_path(map_dir.path());
    config.auto_device_info = true;
    let node = Node::new(config).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(21), pcd.port(), None)
        .expect("server");
    node.start();

    // the probe starts at block zero; a NUL-terminated block ends it
    let (frame, from) = pcd.recv_data_request(Duration::from_secs(2)).expect("info request");
    assert_eq!(&frame.payload[..], &[0x27, 0x00, 0x00]);
    let info = b"DeviceName: PCD-STATION-7\nPcdType: PCD3.M5540\nBuildDateTime: 2024/03/01 10:20:30\n\0";
    pcd.respond(from, frame.sequence, info);

    assert!(wait_until(Duration::from_secs(2), || {
        server.device_name().as_deref() == Some("PCD-STATION-7")
    }));
    assert_eq!(server.pcd_type().as_deref(), Some("PCD3.M5540"));
    assert_eq!(
        server.build_datetime().expect("parsed").to_string(),
        "2024-03-01 10:20:30"
    );

    // completing the probe loaded <deviceName>.map
    assert!(wait_until(Duration::from_secs(2), || {
        server.symbols().read().count() == 2
    }));
    let item = server.declare("pump_speed").expect("resolved by tag");
    assert_eq!(item.space(), AddressSpace::Register);
    assert_eq!(item.index(), 118);
    assert_eq!(item.tag().as_deref(), Some("pump_speed"));

    // the short prefix form needs no symbols at all
    let flag = server.declare("f2001").expect("prefix form");
    assert_eq!(flag.space(), AddressSpace::Flag);
    assert_eq!(flag.index(), 2001);

    node.stop();
}

#[test]
fn cpu_control_and_status_round_trip() {
    init_tracing();
    let pcd = FakePcd::spawn();
    let node = Node::new(fast_config()).expect("node");
    let server = node
        .declare_server_with("127.0.0.1", Some(15), pcd.port(), None)
        .expect("server");
    node.start();

    // the engine polls the CPU status on its own; report Stop
    let deadline = Duration::from_secs(2);
    let started = std::time::Instant::now();
    loop {
        assert!(started.elapsed() < deadline, "no status poll seen");
        let Some((frame, from)) = pcd.recv() else { continue };
        if frame.kind == FrameKind::Request && frame.payload.first() == Some(&0x19) {
            pcd.respond(from, frame.sequence, &[0x53]);
            break;
        }
    }
    assert!(wait_until(Duration::from_secs(2), || server.is_stopped()));
    assert!(server.is_alive());

    // drive the CPU to run; the command is plain-acknowledged
    server.run();
    let started = std::time::Instant::now();
    loop {
        assert!(started.elapsed() < deadline, "no run command seen");
        let Some((frame, from)) = pcd.recv() else { continue };
        if frame.kind == FrameKind::Request && frame.payload.first() == Some(&0x14) {
            pcd.ack(from, frame.sequence);
            break;
        }
    }

    // and confirm the new state through the next poll
    server.refresh_status();
    let started = std::time::Instant::now();
    loop {
        assert!(started.elapsed() < deadline, "no status poll seen");
        let Some((frame, from)) = pcd.recv() else { continue };
        if frame.kind == FrameKind::Request && frame.payload.first() == Some(&0x19) {
            pcd.respond(from, frame.sequence, &[0x52]);
            break;
        }
    }
    assert!(wait_until(Duration::from_secs(2), || server.is_running()));

    node.stop();
}
