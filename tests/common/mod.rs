//! 测试用的假远端: 控制端口服务端握手 + 收集配置消息

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 心跳间隔, 小于测试用的探测超时
const HEARTBEAT: Duration = Duration::from_millis(50);

/// 第一条连接的行为; 之后的连接一律保持并定期发心跳
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirstLink {
    /// 保持连接并发心跳
    Stays,
    /// 收到配置后直接关闭
    Closes,
    /// 发一个心跳字节, 收到配置后关闭
    ClosesAfterKeepAlive,
    /// 不关闭也不再发送任何数据
    GoesQuiet,
}

use camfeed_rs::config::{CameraConfigs, LinkSettings};
use camfeed_rs::control::{GREETING_LEN, MESSAGE_TERMINATOR};
use crossbeam_channel::{unbounded, Receiver, Sender};

pub struct FakeRemote {
    pub addr: SocketAddr,
    pub accepted: Arc<AtomicUsize>,
    /// (连接序号, 配置表)
    pub messages: Receiver<(usize, CameraConfigs)>,
    /// 第一条连接不再正常服务时发出
    pub first_dropped: Receiver<()>,
}

impl FakeRemote {
    pub fn start(first: FirstLink) -> Self {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let (msg_tx, messages) = unbounded();
        let (drop_tx, first_dropped) = unbounded();

        let counter = Arc::clone(&accepted);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                let mode = if n == 1 { first } else { FirstLink::Stays };
                let msg_tx = msg_tx.clone();
                let drop_tx = drop_tx.clone();
                thread::spawn(move || serve(stream, n, mode, msg_tx, drop_tx));
            }
        });

        Self {
            addr,
            accepted,
            messages,
            first_dropped,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// 指向本假远端的链路参数, 配置文件放在 `dir`
    pub fn settings(&self, dir: &Path) -> LinkSettings {
        LinkSettings {
            remote_ip: self.addr.ip(),
            control_port: self.addr.port(),
            local_control_port: None,
            udp_bind_ip: Ipv4Addr::LOCALHOST.into(),
            recv_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(500),
            probe_timeout: Duration::from_millis(500),
            reconnect_backoff: Duration::from_millis(20),
            config_path: dir.join("configs.json").to_string_lossy().into_owned(),
            ..LinkSettings::default()
        }
    }
}

fn serve(
    mut stream: TcpStream,
    n: usize,
    mode: FirstLink,
    msg_tx: Sender<(usize, CameraConfigs)>,
    drop_tx: Sender<()>,
) {
    stream.write_all(&[0u8; GREETING_LEN]).unwrap();
    let mut stamps = [0u8; 16];
    if stream.read_exact(&mut stamps).is_err() {
        return;
    }

    match mode {
        FirstLink::Stays => {}
        FirstLink::Closes | FirstLink::ClosesAfterKeepAlive => {
            if mode == FirstLink::ClosesAfterKeepAlive {
                stream.write_all(&[0u8]).unwrap();
            }
            if let Some(configs) = read_message(&mut stream) {
                let _ = msg_tx.send((n, configs));
            }
            drop(stream);
            let _ = drop_tx.send(());
            return;
        }
        FirstLink::GoesQuiet => {
            if let Some(configs) = read_message(&mut stream) {
                let _ = msg_tx.send((n, configs));
            }
            let _ = drop_tx.send(());
            // 保持打开直到客户端放弃这条连接
            while read_message(&mut stream).is_some() {}
            return;
        }
    }

    // 客户端探测会消费字节, 需要持续发送心跳
    if let Ok(mut writer) = stream.try_clone() {
        thread::spawn(move || {
            while writer.write_all(&[0u8]).is_ok() {
                thread::sleep(HEARTBEAT);
            }
        });
    }
    while let Some(configs) = read_message(&mut stream) {
        if msg_tx.send((n, configs)).is_err() {
            return;
        }
    }
}

/// 读到结束符为止并解析; 连接关闭返回 None
fn read_message(stream: &mut TcpStream) -> Option<CameraConfigs> {
    let mut message = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return None,
            Ok(_) if byte[0] == MESSAGE_TERMINATOR => break,
            Ok(_) => message.push(byte[0]),
        }
    }
    serde_json::from_slice(&message).ok()
}

/// 找一个当前空闲的UDP端口
pub fn free_udp_port() -> u16 {
    let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    socket.local_addr().unwrap().port()
}

/// 测试用JPEG
pub fn jpeg(width: u32, height: u32) -> Vec<u8> {
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;

    let img = ImageBuffer::from_fn(width, height, |x, y| {
        Rgb([(x % 256) as u8, (y % 256) as u8, 90u8])
    });
    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, image::ImageFormat::Jpeg).unwrap();
    buf.into_inner()
}
