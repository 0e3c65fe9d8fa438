/// 远端摄像头视频流接收 (UDP分包帧 + TCP控制通道)
///
/// 线程模型:
/// 1. 每路摄像头一个接收线程: UDP重组 → JPEG解码 → 发送FrameEvent
/// 2. 控制通道: 握手 / 推送配置 / 单飞重连, 由任意接收线程的超时触发
/// 3. 消费者 (界面) 线程: 读取帧队列与监控数字, 发起配置修改
pub mod assembler; // 帧重组
pub mod codec; // JPEG解码与缩放
pub mod config; // 配置与预设
pub mod control; // TCP控制通道
pub mod error;
pub mod monitor; // 流量/帧率/丢帧监控
pub mod rate; // 滑动窗口速率
pub mod session; // 会话与线程管理
pub mod wire; // UDP帧格式

pub use crate::assembler::{
    DatagramSource, DecodedFrame, FrameAssembler, FrameEvent, FrameOutcome, LatencyBreakdown,
    LinkProbe, TargetWidth,
};
pub use crate::codec::{FrameDecoder, RgbImage};
pub use crate::config::{
    CameraConfigs, CameraSettings, LinkSettings, PersistedConfig, RateWindows, ReconnectTrigger,
    StreamPreset,
};
pub use crate::control::{ControlChannel, LinkState, LinkStatus, ReconnectOutcome};
pub use crate::error::{Error, Result};
pub use crate::monitor::{CameraStats, Monitor, MonitorKind, Monitors};
pub use crate::rate::RateTracker;
pub use crate::session::{CameraChannel, Session, SessionStatus};
pub use crate::wire::FrameHeader;

/// 当前时间字符串, 用于状态行
pub fn gen_time_string(delimiter: &str) -> String {
    let t_now = chrono::Local::now();
    let fmt = format!("%H{}%M{}%S%.3f", delimiter, delimiter);
    t_now.format(&fmt).to_string()
}
