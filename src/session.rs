//! 会话: 控制通道 + 监控 + 每路摄像头一个接收线程
//!
//! 取代全局单例: 所有共享状态在这里显式构造, 再以 `Arc` 交给各线程。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use log::{error, info, warn};

use crate::assembler::{FrameAssembler, FrameEvent, TargetWidth};
use crate::config::{CameraSettings, LinkSettings, PersistedConfig, StreamPreset};
use crate::control::{ControlChannel, LinkState};
use crate::error::{Error, Result};
use crate::monitor::{CameraStats, Monitors};

/// 帧队列容量 (每路摄像头)
const FRAME_QUEUE_PER_CAMERA: usize = 8;

/// 单路摄像头: 接收线程 + 可调的解码宽度
pub struct CameraChannel {
    camera_id: usize,
    target_width: TargetWidth,
    handle: Option<JoinHandle<()>>,
}

impl CameraChannel {
    pub fn camera_id(&self) -> usize {
        self.camera_id
    }

    pub fn target_width(&self) -> &TargetWidth {
        &self.target_width
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

/// 界面需要的全部状态数字
#[derive(Clone, Debug)]
pub struct SessionStatus {
    pub cameras: Vec<CameraStats>,
    pub totals: CameraStats,
    pub link_state: LinkState,
    pub reconnect_attempts: u32,
}

impl SessionStatus {
    pub fn is_reconnecting(&self) -> bool {
        self.link_state == LinkState::Reconnecting
    }
}

pub struct Session {
    settings: LinkSettings,
    n_camera: usize,
    control: Arc<ControlChannel>,
    monitors: Arc<Monitors>,
    stop: Arc<AtomicBool>,
    cameras: Vec<CameraChannel>,
    tx: Sender<FrameEvent>,
    rx: Receiver<FrameEvent>,
}

impl Session {
    /// 读取持久化配置并构造全部共享状态 (不连接)
    pub fn new(settings: LinkSettings, n_camera: usize) -> Self {
        let persisted = PersistedConfig::load(&settings.config_path, n_camera);
        let control = Arc::new(ControlChannel::new(&settings, persisted.cameras));
        let monitors = Arc::new(Monitors::new(n_camera, settings.windows));
        let (tx, rx) = bounded(FRAME_QUEUE_PER_CAMERA * n_camera.max(1));

        let cameras = (0..n_camera)
            .map(|camera_id| CameraChannel {
                camera_id,
                target_width: TargetWidth::new(settings.decode_width),
                handle: None,
            })
            .collect();

        Self {
            settings,
            n_camera,
            control,
            monitors,
            stop: Arc::new(AtomicBool::new(false)),
            cameras,
            tx,
            rx,
        }
    }

    pub fn control(&self) -> &Arc<ControlChannel> {
        &self.control
    }

    pub fn monitors(&self) -> &Arc<Monitors> {
        &self.monitors
    }

    pub fn cameras(&self) -> &[CameraChannel] {
        &self.cameras
    }

    /// 解码帧队列, 消费者按自己的节奏取
    pub fn frames(&self) -> Receiver<FrameEvent> {
        self.rx.clone()
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    /// 连接远端, 成功后启动所有接收线程
    pub fn connect_remote(&mut self) -> Result<bool> {
        if !self.control.connect() {
            return Ok(false);
        }
        self.start_receivers()?;
        Ok(true)
    }

    /// 启动尚未运行的接收线程
    pub fn start_receivers(&mut self) -> Result<()> {
        // 先检查所有端口, 避免只启动一部分线程
        if self.n_camera > 0 && self.settings.camera_port(self.n_camera - 1).is_none() {
            return Err(Error::Other(format!(
                "{} 路摄像头超出UDP端口范围 (基础端口 {})",
                self.n_camera, self.settings.udp_base_port
            )));
        }
        for camera in self.cameras.iter_mut() {
            if camera.handle.is_some() {
                continue;
            }
            let mut assembler = FrameAssembler::new(
                camera.camera_id,
                Arc::clone(&self.monitors),
                self.tx.clone(),
                camera.target_width.clone(),
                Arc::clone(&self.stop),
            )
            .with_link(self.control.clone(), self.settings.reconnect_trigger);
            let settings = self.settings.clone();

            let handle = thread::Builder::new()
                .name(format!("camera-{}", camera.camera_id))
                .spawn(move || assembler.run(&settings))
                .map_err(|e| Error::Other(format!("启动接收线程失败: {}", e)))?;
            camera.handle = Some(handle);
        }
        info!("📹 已启动 {} 路接收线程", self.n_camera);
        Ok(())
    }

    /// 界面尺寸变化时调整解码宽度
    pub fn set_target_width(&self, camera_id: usize, width: u32) {
        if let Some(camera) = self.cameras.get(camera_id) {
            camera.target_width.set(width);
        }
    }

    /// 推送新参数; 连接断开时在后台线程发起重连, 不阻塞调用方
    pub fn update_config(&self, camera_id: usize, settings: CameraSettings) -> Result<()> {
        match self.control.update_config(camera_id, settings) {
            Err(e) if e.is_broken_link() => {
                warn!("⚠️  推送配置失败 ({}), 后台重连", e);
                self.reconnect_in_background();
                Ok(())
            }
            other => other,
        }
    }

    pub fn apply_preset(&self, camera_id: usize, preset: StreamPreset) -> Result<()> {
        match preset.settings() {
            Some(settings) => self.update_config(camera_id, settings),
            None => Ok(()),
        }
    }

    fn reconnect_in_background(&self) {
        let control = Arc::clone(&self.control);
        let spawned = thread::Builder::new()
            .name("reconnect".to_string())
            .spawn(move || {
                control.reconnect();
            });
        if let Err(e) = spawned {
            error!("❌ 启动重连线程失败: {}", e);
        }
    }

    pub fn status(&self) -> SessionStatus {
        let link = self.control.status();
        SessionStatus {
            cameras: (0..self.n_camera)
                .map(|id| self.monitors.snapshot(id))
                .collect(),
            totals: self.monitors.totals(),
            link_state: link.state(),
            reconnect_attempts: link.attempts(),
        }
    }

    /// SIGINT / SIGTERM / SIGQUIT → 关闭控制通道并通知接收线程停止
    #[cfg(unix)]
    pub fn install_signal_handler(&self) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT])?;
        let control = Arc::clone(&self.control);
        let stop = Arc::clone(&self.stop);
        thread::Builder::new()
            .name("signal-handler".to_string())
            .spawn(move || {
                if let Some(sig) = signals.forever().next() {
                    info!("收到信号 {}, 断开连接...", sig);
                    if let Err(e) = control.close() {
                        error!("❌ {}", e);
                    }
                    stop.store(true, Ordering::Relaxed);
                }
            })
            .map_err(|e| Error::Other(format!("启动信号处理线程失败: {}", e)))?;
        Ok(())
    }

    /// 非Unix平台只置停止标志, 由主循环调用 `shutdown()` 关闭控制通道
    #[cfg(not(unix))]
    pub fn install_signal_handler(&self) -> Result<()> {
        use signal_hook::consts::{SIGINT, SIGTERM};

        signal_hook::flag::register(SIGINT, Arc::clone(&self.stop))?;
        signal_hook::flag::register(SIGTERM, Arc::clone(&self.stop))?;
        Ok(())
    }

    /// 关闭控制通道 (持久化配置), 停止并等待所有接收线程; 可重复调用
    pub fn shutdown(&mut self) -> Result<()> {
        let closed = self.control.close();
        self.stop.store(true, Ordering::Relaxed);

        for camera in self.cameras.iter_mut() {
            if let Some(handle) = camera.handle.take() {
                if handle.join().is_err() {
                    error!("❌ 摄像头{} 接收线程异常退出", camera.camera_id);
                }
            }
        }
        closed.map(|_| ())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("❌ 会话关闭失败: {}", e);
        }
    }
}
