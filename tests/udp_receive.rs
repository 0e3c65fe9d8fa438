//! 真实UDP回环上的帧重组与会话流程

mod common;

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use camfeed_rs::assembler::{FrameAssembler, TargetWidth};
use camfeed_rs::config::{camera_key, CameraSettings, PersistedConfig, RateWindows};
use camfeed_rs::monitor::Monitors;
use camfeed_rs::wire::encode_frame;
use camfeed_rs::Session;
use common::{free_udp_port, jpeg, FakeRemote, FirstLink};
use crossbeam_channel::bounded;

const WAIT: Duration = Duration::from_secs(5);

fn send_frame(sender: &UdpSocket, target: SocketAddr, frame_id: u32, data: &[u8]) {
    for datagram in encode_frame(frame_id, 0.0, 0.002, data, 300) {
        sender.send_to(&datagram, target).unwrap();
        // 回环缓冲区很大, 稍微放慢以免内核丢包
        thread::sleep(Duration::from_micros(200));
    }
}

#[test]
fn test_assembler_over_loopback() {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let target = socket.local_addr().unwrap();

    let monitors = Arc::new(Monitors::new(1, RateWindows::default()));
    let (tx, rx) = bounded(16);
    let stop = Arc::new(AtomicBool::new(false));
    let mut assembler = FrameAssembler::new(
        0,
        Arc::clone(&monitors),
        tx,
        TargetWidth::new(0),
        Arc::clone(&stop),
    );

    let mut socket_for_worker = socket;
    let worker = thread::spawn(move || assembler.run_with(&mut socket_for_worker));

    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let data = jpeg(80, 60);
    send_frame(&sender, target, 1, &data);
    send_frame(&sender, target, 2, &data);
    // 帧3丢失
    send_frame(&sender, target, 4, &data);

    let ids: Vec<u32> = (0..3)
        .map(|_| rx.recv_timeout(WAIT).unwrap().frame.frame_id)
        .collect();
    assert_eq!(ids, vec![1, 2, 4]);

    let stats = monitors.snapshot(0);
    assert!(stats.fps > 0.0);
    assert!(stats.traffic > 0.0);
    assert!(stats.drop_rate > 0.0);

    stop.store(true, Ordering::Relaxed);
    worker.join().unwrap();
}

#[test]
fn test_session_end_to_end() {
    let remote = FakeRemote::start(FirstLink::Stays);
    let dir = tempfile::tempdir().unwrap();
    let mut settings = remote.settings(dir.path());
    settings.udp_base_port = free_udp_port();
    settings.decode_width = 160;
    let config_path = settings.config_path.clone();
    let camera_port = settings.camera_port(0).unwrap();

    let mut session = Session::new(settings, 1);
    assert!(session.connect_remote().unwrap());
    remote.messages.recv_timeout(WAIT).unwrap();

    let frames = session.frames();
    let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let target = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), camera_port);
    let data = jpeg(80, 60);

    // 接收线程绑定端口需要一点时间, 持续发送直到收到第一帧
    let mut frame_id = 0;
    let event = loop {
        frame_id += 1;
        send_frame(&sender, target, frame_id, &data);
        if let Ok(event) = frames.recv_timeout(Duration::from_millis(200)) {
            break event;
        }
        assert!(frame_id < 25, "没有收到任何帧");
    };
    assert_eq!(event.frame.camera_id, 0);
    assert_eq!((event.frame.image.width, event.frame.image.height), (160, 120));

    session
        .update_config(0, CameraSettings::new(120, 80))
        .unwrap();
    let (_, configs) = remote.messages.recv_timeout(WAIT).unwrap();
    assert_eq!(configs[&camera_key(0)], CameraSettings::new(120, 80));

    session.shutdown().unwrap();
    assert!(session.cameras().iter().all(|c| !c.is_running()));
    let saved = PersistedConfig::load(&config_path, 1);
    assert_eq!(saved.cameras[&camera_key(0)], CameraSettings::new(120, 80));
}
