//! 帧重组 (FrameAssembler)
//! 职责: UDP数据报 → 校验分包序号 → JPEG解码 → 发送FrameEvent
//!
//! 每路摄像头一个独立线程。任何可恢复错误都只记一次丢帧并继续扫描下一个帧头,
//! 线程只会因为停止标志退出。

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, error, info, trace, warn};

use crate::codec::{FrameDecoder, RgbImage};
use crate::config::{LinkSettings, ReconnectTrigger};
use crate::error::{Error, Result};
use crate::monitor::Monitors;
use crate::wire::{FrameHeader, Packet, DATAGRAM_SIZE, MAX_PAYLOAD};

/// 数据报来源 (UDP套接字, 或测试中的内存队列)
pub trait DatagramSource {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

impl DatagramSource for UdpSocket {
    fn recv_datagram(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.recv(buf)
    }
}

/// 链路停滞时的通知对象 (控制通道实现)
pub trait LinkProbe: Send + Sync {
    /// UDP接收超时; 实现方必须立即返回或自行保证单飞
    fn transport_stalled(&self);
}

/// 目标解码宽度, 界面线程随时可改, 接收线程每帧读取一次
#[derive(Clone, Debug)]
pub struct TargetWidth(Arc<AtomicU32>);

impl TargetWidth {
    pub fn new(width: u32) -> Self {
        Self(Arc::new(AtomicU32::new(width)))
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }

    /// 0 表示不缩放
    pub fn set(&self, width: u32) {
        self.0.store(width, Ordering::Relaxed);
    }
}

/// 延迟分解 (毫秒, 保留两位小数)
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LatencyBreakdown {
    pub total_ms: f64,  // 采集 → 本地解码完成
    pub server_ms: f64, // 远端编码耗时
    pub client_ms: f64, // 本地接收分包 + 解码
}

impl LatencyBreakdown {
    fn new(total: f64, server: f64, client: f64) -> Self {
        Self {
            total_ms: round2(total * 1000.0),
            server_ms: round2(server * 1000.0),
            client_ms: round2(client * 1000.0),
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// 当前Unix时间 (秒)
pub fn unix_now() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// 解码帧 (接收线程 → 界面)
#[derive(Clone, Debug)]
pub struct DecodedFrame {
    pub camera_id: usize,
    pub frame_id: u32,
    pub image: RgbImage,
    pub encoded_len: usize,
}

/// 发给消费者的事件: 一帧图像 + 延迟
#[derive(Clone, Debug)]
pub struct FrameEvent {
    pub frame: DecodedFrame,
    pub latency: LatencyBreakdown,
}

/// 单次接收的结果
#[derive(Debug)]
pub enum FrameOutcome {
    /// 成功解码并发出
    Emitted(u32),
    /// 丢帧 (已计数)
    Dropped(Error),
    /// 等待帧头时超时
    Timeout,
    /// 收到停止信号
    Stopped,
}

/// 单路摄像头的帧重组器
pub struct FrameAssembler {
    camera_id: usize,
    monitors: Arc<Monitors>,
    tx: Sender<FrameEvent>,
    target_width: TargetWidth,
    stop: Arc<AtomicBool>,
    link: Option<Arc<dyn LinkProbe>>,
    trigger: ReconnectTrigger,
    decoder: FrameDecoder,
    buf: Vec<u8>,

    last_frame_id: u32,
    received_any: bool,
    /// 读分包时遇到的下一帧帧头
    pending_header: Option<FrameHeader>,
}

impl FrameAssembler {
    pub fn new(
        camera_id: usize,
        monitors: Arc<Monitors>,
        tx: Sender<FrameEvent>,
        target_width: TargetWidth,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            camera_id,
            monitors,
            tx,
            target_width,
            stop,
            link: None,
            trigger: ReconnectTrigger::default(),
            decoder: FrameDecoder::new(),
            buf: vec![0u8; DATAGRAM_SIZE],
            last_frame_id: 0,
            received_any: false,
            pending_header: None,
        }
    }

    /// 接收超时时通知的控制通道
    pub fn with_link(mut self, link: Arc<dyn LinkProbe>, trigger: ReconnectTrigger) -> Self {
        self.link = Some(link);
        self.trigger = trigger;
        self
    }

    pub fn camera_id(&self) -> usize {
        self.camera_id
    }

    pub fn last_frame_id(&self) -> u32 {
        self.last_frame_id
    }

    /// 绑定 `udp_base_port + camera_id` 并一直接收, 直到停止标志置位
    pub fn run(&mut self, settings: &LinkSettings) {
        let Some(port) = settings.camera_port(self.camera_id) else {
            error!(
                "❌ 摄像头{} 的UDP端口超出范围 (基础端口 {})",
                self.camera_id, settings.udp_base_port
            );
            return;
        };
        let addr = SocketAddr::new(settings.udp_bind_ip, port);

        let mut socket = loop {
            if self.stopped() {
                return;
            }
            match bind_socket(addr, settings.recv_timeout) {
                Ok(s) => break s,
                Err(e) => {
                    error!("❌ 摄像头{} 绑定 {} 失败: {}, 1秒后重试", self.camera_id, addr, e);
                    std::thread::sleep(Duration::from_secs(1));
                }
            }
        };
        info!("✅ 摄像头{} UDP已绑定 {}", self.camera_id, addr);

        self.run_with(&mut socket);
    }

    /// 在给定的数据源上循环接收
    pub fn run_with<S: DatagramSource>(&mut self, src: &mut S) {
        while !self.stopped() {
            if let FrameOutcome::Stopped = self.receive_frame(src) {
                break;
            }
        }
        info!("📹 摄像头{} 接收线程退出", self.camera_id);
    }

    /// 接收一帧: 扫描帧头 → 读取分包 → 解码 → 发出
    pub fn receive_frame<S: DatagramSource>(&mut self, src: &mut S) -> FrameOutcome {
        let header = match self.scan_header(src) {
            Ok(Some(header)) => header,
            Ok(None) => return FrameOutcome::Stopped,
            Err(e) if e.is_timeout() => {
                self.on_timeout();
                return FrameOutcome::Timeout;
            }
            Err(e) => return self.drop_frame(e),
        };
        self.received_any = true;
        self.check_sequence(header.frame_id);

        match self.assemble(src, &header) {
            Ok(event) => {
                let frame_id = event.frame.frame_id;
                self.emit(event);
                FrameOutcome::Emitted(frame_id)
            }
            Err(e) => {
                if e.is_timeout() {
                    self.on_timeout();
                }
                self.drop_frame(e)
            }
        }
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    /// 丢弃非帧头数据报, 直到遇到帧起始标记
    fn scan_header<S: DatagramSource>(&mut self, src: &mut S) -> Result<Option<FrameHeader>> {
        loop {
            if self.stopped() {
                return Ok(None);
            }
            if let Some(header) = self.pending_header.take() {
                return Ok(Some(header));
            }
            let n = src.recv_datagram(&mut self.buf)?;
            let datagram = &self.buf[..n];
            if FrameHeader::is_header(datagram) {
                return FrameHeader::parse(datagram).map(Some);
            }
            trace!("摄像头{} 跳过 {} 字节的非帧头数据报", self.camera_id, n);
        }
    }

    /// 帧序号连续性: 任何间断只记一次丢帧, 并同步到新序号
    fn check_sequence(&mut self, frame_id: u32) {
        let expected = self.last_frame_id.wrapping_add(1);
        if frame_id != expected {
            debug!(
                "摄像头{}: {}",
                self.camera_id,
                Error::Sequencing {
                    expected,
                    got: frame_id
                }
            );
            self.monitors.record_drop(self.camera_id);
        }
        self.last_frame_id = frame_id;
    }

    fn assemble<S: DatagramSource>(
        &mut self,
        src: &mut S,
        header: &FrameHeader,
    ) -> Result<FrameEvent> {
        let client_started = Instant::now();

        let capacity = (header.packet_count as usize).min(4096) * MAX_PAYLOAD;
        let mut payload = Vec::with_capacity(capacity);
        let mut first_bad: Option<u32> = None;

        for i in 0..header.packet_count {
            let n = src.recv_datagram(&mut self.buf)?;
            let datagram = &self.buf[..n];

            // 分包丢失, 下一帧已经开始: 放弃本帧, 从这个帧头重新开始
            if FrameHeader::is_header(datagram) {
                if let Ok(next) = FrameHeader::parse(datagram) {
                    self.pending_header = Some(next);
                }
                return Err(Error::Framing(format!(
                    "帧 {} 在第 {} 个分包处被下一帧头打断",
                    header.frame_id, i
                )));
            }

            match Packet::parse(datagram) {
                Ok(packet) if packet.index == i => {
                    if first_bad.is_none() {
                        payload.extend_from_slice(packet.payload);
                    }
                }
                Ok(_) | Err(_) => {
                    first_bad.get_or_insert(i);
                }
            }
        }

        if let Some(packet) = first_bad {
            return Err(Error::Corrupted {
                frame_id: header.frame_id,
                packet,
            });
        }

        let image = self.decoder.decode(&payload, self.target_width.get())?;

        self.monitors.record_frame(self.camera_id, payload.len());

        let latency = LatencyBreakdown::new(
            unix_now() - header.capture_timestamp,
            header.server_processing_time,
            client_started.elapsed().as_secs_f64(),
        );

        Ok(FrameEvent {
            frame: DecodedFrame {
                camera_id: self.camera_id,
                frame_id: header.frame_id,
                image,
                encoded_len: payload.len(),
            },
            latency,
        })
    }

    /// 发给消费者; 队列满时丢弃, 不阻塞接收
    fn emit(&self, event: FrameEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                trace!(
                    "摄像头{} 消费者队列已满, 丢弃帧 {}",
                    self.camera_id,
                    event.frame.frame_id
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!("摄像头{} 消费者已断开", self.camera_id);
            }
        }
    }

    fn drop_frame(&self, e: Error) -> FrameOutcome {
        self.monitors.record_drop(self.camera_id);
        if e.is_recoverable() {
            debug!("摄像头{} 丢帧: {}", self.camera_id, e);
        } else {
            error!("❌ 摄像头{} 未预期的错误: {}", self.camera_id, e);
        }
        FrameOutcome::Dropped(e)
    }

    /// 首次收到数据后, 接收超时被视为整条链路断开的信号
    fn on_timeout(&self) {
        if !self.received_any || self.trigger == ReconnectTrigger::Never {
            return;
        }
        if let Some(link) = &self.link {
            warn!("⚠️  摄像头{} 接收超时, 检查控制连接", self.camera_id);
            link.transport_stalled();
        }
    }
}

fn bind_socket(addr: SocketAddr, timeout: Duration) -> io::Result<UdpSocket> {
    let socket = UdpSocket::bind(addr)?;
    socket.set_read_timeout(Some(timeout))?;
    Ok(socket)
}
