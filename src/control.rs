//! 控制通道 (ControlChannel)
//!
//! 进程内唯一的TCP连接, 负责:
//! - 握手: 读取远端4字节问候, 回送两个 f64 (大端) 时间戳供远端估计时钟偏差
//! - 推送配置: JSON + `|` 结束符, 每次一次写入
//! - 单飞重连: 任意接收线程都可能触发, 同一时刻最多一个重连在进行
//! - 关闭: 持久化配置, 可重复调用
//!
//! 状态: Disconnected → Connecting → Connected → Reconnecting → Disconnected

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, SockRef, Socket, Type};

use crate::assembler::{unix_now, LinkProbe};
use crate::config::{camera_key, CameraConfigs, CameraSettings, LinkSettings, PersistedConfig};
use crate::error::{Error, Result};

/// 配置消息结束符
pub const MESSAGE_TERMINATOR: u8 = b'|';
/// 远端问候长度
pub const GREETING_LEN: usize = 4;

// ========== 状态 ==========

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl LinkState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => LinkState::Connecting,
            2 => LinkState::Connected,
            3 => LinkState::Reconnecting,
            _ => LinkState::Disconnected,
        }
    }
}

/// 对界面公开的链路状态 (无锁读取)
#[derive(Debug)]
pub struct LinkStatus {
    state: AtomicU8,
    attempts: AtomicU32,
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self {
            state: AtomicU8::new(LinkState::Disconnected as u8),
            attempts: AtomicU32::new(0),
        }
    }
}

impl LinkStatus {
    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// 是否正在重连 (界面显示 "Disconnected. Trying to reconnect")
    pub fn is_reconnecting(&self) -> bool {
        self.state() == LinkState::Reconnecting
    }

    /// 本轮重连已尝试次数
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }
}

/// `reconnect()` 的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectOutcome {
    /// 另一个调用者正在重连, 或通道已关闭
    Skipped,
    /// 探测到连接仍然正常
    Alive,
    /// 重连成功
    Reconnected,
    /// 重连过程中通道被关闭
    Aborted,
}

/// 探测结果
#[derive(Debug)]
enum Probe {
    Alive,
    Dead(String),
}

// ========== 控制通道 ==========

/// 受互斥锁保护的部分
struct Inner {
    stream: Option<TcpStream>,
    configs: CameraConfigs,
    connected: bool,
    dirty: bool, // 配置自加载以来是否修改过
}

pub struct ControlChannel {
    remote: SocketAddr,
    local_port: Option<u16>,
    connect_timeout: Duration,
    probe_timeout: Duration,
    backoff: Duration,
    config_path: PathBuf,

    guard: Mutex<Inner>,
    status: Arc<LinkStatus>,
    reconnect_in_flight: AtomicBool,
    closed: AtomicBool,
}

impl ControlChannel {
    pub fn new(settings: &LinkSettings, configs: CameraConfigs) -> Self {
        Self {
            remote: SocketAddr::new(settings.remote_ip, settings.control_port),
            local_port: settings.local_control_port,
            connect_timeout: settings.connect_timeout,
            probe_timeout: settings.probe_timeout,
            backoff: settings.reconnect_backoff,
            config_path: PathBuf::from(&settings.config_path),
            guard: Mutex::new(Inner {
                stream: None,
                configs,
                connected: false,
                dirty: false,
            }),
            status: Arc::new(LinkStatus::default()),
            reconnect_in_flight: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn status(&self) -> Arc<LinkStatus> {
        Arc::clone(&self.status)
    }

    pub fn is_connected(&self) -> bool {
        self.status.state() == LinkState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 当前配置表的副本
    pub fn configs(&self) -> CameraConfigs {
        self.guard.lock().configs.clone()
    }

    /// 建立连接并推送完整配置 (阻塞获取锁)
    ///
    /// 失败时重置套接字并返回 false, 不抛错。
    pub fn connect(&self) -> bool {
        let mut inner = self.guard.lock();
        if self.is_closed() {
            return false;
        }
        if inner.connected && inner.stream.is_some() {
            return true;
        }

        let reconnecting = self.status.is_reconnecting();
        if !reconnecting {
            self.status.set_state(LinkState::Connecting);
        }
        info!("🔗 正在连接 {}...", self.remote);

        match self.open_stream(&inner.configs) {
            Ok(stream) => {
                inner.stream = Some(stream);
                inner.connected = true;
                self.status.set_state(LinkState::Connected);
                info!("✅ 控制连接已建立 {}", self.remote);
                true
            }
            Err(e) => {
                inner.stream = None;
                inner.connected = false;
                if !reconnecting {
                    self.status.set_state(LinkState::Disconnected);
                }
                warn!("⚠️  连接 {} 失败: {}", self.remote, e);
                false
            }
        }
    }

    /// 新建套接字 → 连接 → 握手 → SO_LINGER(0) → 推送配置
    fn open_stream(&self, configs: &CameraConfigs) -> Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(self.remote), Type::STREAM, Some(Protocol::TCP))?;
        if let Some(port) = self.local_port {
            let unspecified = match self.remote.ip() {
                IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            socket.set_reuse_address(true)?;
            socket.bind(&SocketAddr::new(unspecified, port).into())?;
        }

        match socket.connect_timeout(&self.remote.into(), self.connect_timeout) {
            Ok(()) => {}
            Err(e) if is_already_connected(&e) => debug!("套接字已处于连接状态"),
            Err(e) => return Err(e.into()),
        }

        let mut stream: TcpStream = socket.into();
        stream.set_read_timeout(Some(self.connect_timeout))?;
        stream.set_write_timeout(Some(self.connect_timeout))?;
        stream.set_nodelay(true)?;

        handshake(&mut stream)?;

        // 关闭时直接RST, 不等待对端ACK
        SockRef::from(&stream).set_linger(Some(Duration::ZERO))?;

        stream.write_all(&encode_configs(configs)?)?;
        Ok(stream)
    }

    /// 单飞重连
    ///
    /// 已有重连在进行 (或锁被占用) 时立即返回 `Skipped`。
    /// 否则先探测连接是否真的断开, 断开则循环 `connect()` 直到成功。
    pub fn reconnect(&self) -> ReconnectOutcome {
        if self.is_closed() {
            return ReconnectOutcome::Skipped;
        }
        if self
            .reconnect_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return ReconnectOutcome::Skipped;
        }
        let outcome = self.run_reconnect();
        self.reconnect_in_flight.store(false, Ordering::Release);
        outcome
    }

    fn run_reconnect(&self) -> ReconnectOutcome {
        {
            let Some(mut inner) = self.guard.try_lock() else {
                return ReconnectOutcome::Skipped;
            };
            let probe = match inner.stream.as_ref() {
                Some(stream) => probe(stream, self.probe_timeout),
                None => Probe::Dead("无连接".into()),
            };
            match probe {
                Probe::Alive => return ReconnectOutcome::Alive,
                Probe::Dead(reason) => {
                    warn!("🔌 控制连接已断开 ({}), 开始重连", reason);
                    inner.stream = None;
                    inner.connected = false;
                    self.status.attempts.store(0, Ordering::Relaxed);
                    self.status.set_state(LinkState::Reconnecting);
                }
            }
        }

        loop {
            if self.is_closed() {
                self.status.set_state(LinkState::Disconnected);
                return ReconnectOutcome::Aborted;
            }
            let attempt = self.status.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            if self.connect() {
                info!("✅ 重连成功 (第{}次尝试)", attempt);
                return ReconnectOutcome::Reconnected;
            }
            std::thread::sleep(self.backoff);
        }
    }

    /// 修改一路摄像头的参数并推送完整配置
    ///
    /// 发送时连接断开会返回 `is_broken_link()` 为真的错误, 调用方应触发 `reconnect()`。
    /// 未连接时配置仍会保存, 下次连接时随握手推送。
    pub fn update_config(&self, camera_id: usize, settings: CameraSettings) -> Result<()> {
        let clamped = settings.clamped();
        if clamped != settings {
            warn!(
                "⚠️  摄像头{} 参数超出范围, 已调整为 {}/{}",
                camera_id, clamped.resolution, clamped.quality
            );
        }

        let mut inner = self.guard.lock();
        inner.configs.insert(camera_key(camera_id), clamped);
        inner.dirty = true;

        let payload = encode_configs(&inner.configs)?;
        let stream = match (inner.connected, inner.stream.as_mut()) {
            (true, Some(stream)) => stream,
            _ => return Err(Error::NotConnected),
        };
        stream.write_all(&payload)?;
        debug!("📤 已推送配置: cam{} = {:?}", camera_id, clamped);
        Ok(())
    }

    /// 关闭连接并持久化配置; 第二次起不做任何事, 返回 false
    pub fn close(&self) -> Result<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }

        let mut inner = self.guard.lock();
        let was_connected = inner.connected;
        inner.stream = None;

        let saved = if was_connected || inner.dirty {
            PersistedConfig {
                cameras: inner.configs.clone(),
            }
            .save(&self.config_path)
        } else {
            Ok(())
        };
        if was_connected {
            info!("🔌 控制连接已关闭");
        }

        inner.connected = false;
        self.status.set_state(LinkState::Disconnected);
        if let Err(e) = &saved {
            error!("❌ {}", e);
        }
        saved.map(|_| true)
    }
}

impl LinkProbe for ControlChannel {
    fn transport_stalled(&self) {
        self.reconnect();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("❌ 关闭控制通道失败: {}", e);
        }
    }
}

// ========== 协议细节 ==========

/// 配置消息: JSON + 结束符
pub fn encode_configs(configs: &CameraConfigs) -> Result<Vec<u8>> {
    let mut payload = serde_json::to_vec(configs)?;
    payload.push(MESSAGE_TERMINATOR);
    Ok(payload)
}

/// 客户端握手: 读4字节问候, 写两个大端f64时间戳
fn handshake(stream: &mut TcpStream) -> io::Result<()> {
    let mut greeting = [0u8; GREETING_LEN];
    stream.read_exact(&mut greeting)?;

    let t1 = unix_now();
    let t2 = unix_now();
    let mut stamps = [0u8; 16];
    stamps[..8].copy_from_slice(&t1.to_be_bytes());
    stamps[8..].copy_from_slice(&t2.to_be_bytes());
    stream.write_all(&stamps)
}

/// 存活探测: 先取走已缓存的字节, 没有新数据时在超时内再等一个字节
///
/// 字节会被消费, 之前的心跳不会掩盖之后的FIN。
/// 对端关闭 / 被重置 / 超时内没有任何数据都视为断开。
fn probe(stream: &TcpStream, timeout: Duration) -> Probe {
    match drain(stream) {
        Ok(0) => {}
        Ok(_) => return Probe::Alive,
        Err(reason) => return Probe::Dead(reason),
    }

    if let Err(e) = stream.set_read_timeout(Some(timeout)) {
        return Probe::Dead(e.to_string());
    }
    let mut byte = [0u8; 1];
    let mut reader = stream;
    match reader.read(&mut byte) {
        Ok(0) => Probe::Dead("对端已关闭".into()),
        Ok(_) => Probe::Alive,
        Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            Probe::Dead("探测超时".into())
        }
        Err(e) => Probe::Dead(e.to_string()),
    }
}

/// 非阻塞读空接收缓冲区, 返回读到的字节数; 遇到EOF或错误返回原因
fn drain(stream: &TcpStream) -> std::result::Result<usize, String> {
    stream.set_nonblocking(true).map_err(|e| e.to_string())?;
    let mut reader = stream;
    let mut buf = [0u8; 256];
    let mut total = 0usize;
    let result = loop {
        match reader.read(&mut buf) {
            Ok(0) => break Err("对端已关闭".to_string()),
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(total),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(e.to_string()),
        }
    };
    stream.set_nonblocking(false).map_err(|e| e.to_string())?;
    result
}

#[cfg(any(target_os = "linux", target_os = "android"))]
const EISCONN: i32 = 106;
#[cfg(windows)]
const EISCONN: i32 = 10056;
#[cfg(not(any(target_os = "linux", target_os = "android", windows)))]
const EISCONN: i32 = 56;

/// "已连接" 竞态 (EISCONN)
fn is_already_connected(e: &io::Error) -> bool {
    e.raw_os_error() == Some(EISCONN)
}
