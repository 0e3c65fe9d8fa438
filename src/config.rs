//! 摄像头配置 - 通过JSON文件持久化
//!
//! 文件格式: `{ "cameras": { "cam0": { "resolution": 240, "quality": 25 }, ... } }`
//! 控制通道推送的是其中的 `cameras` 部分。

use crate::error::{Error, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::time::Duration;

// ========== 端口与默认值 ==========

pub const CONTROL_PORT: u16 = 5800;
pub const UDP_BASE_PORT: u16 = 5801;

pub const DEFAULT_RESOLUTION: u32 = 240;
pub const DEFAULT_QUALITY: u32 = 25;
pub const DEFAULT_DECODE_WIDTH: u32 = 960;

pub const RESOLUTION_RANGE: (u32, u32) = (60, 1080);
pub const QUALITY_RANGE: (u32, u32) = (1, 80);

/// 配置文件默认路径
pub const DEFAULT_CONFIG_PATH: &str = "configs.json";
/// 命令行允许的最大摄像头数量
pub const MAX_CAMERAS: usize = 64;

/// 配置表中摄像头的键名
pub fn camera_key(camera_id: usize) -> String {
    format!("cam{}", camera_id)
}

/// 单个摄像头的编码参数
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraSettings {
    pub resolution: u32, // 编码分辨率 (短边像素)
    pub quality: u32,    // JPEG质量
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            resolution: DEFAULT_RESOLUTION,
            quality: DEFAULT_QUALITY,
        }
    }
}

impl CameraSettings {
    pub fn new(resolution: u32, quality: u32) -> Self {
        Self {
            resolution,
            quality,
        }
    }

    /// 限制到远端接受的范围内
    pub fn clamped(self) -> Self {
        Self {
            resolution: self.resolution.clamp(RESOLUTION_RANGE.0, RESOLUTION_RANGE.1),
            quality: self.quality.clamp(QUALITY_RANGE.0, QUALITY_RANGE.1),
        }
    }
}

/// "cam<N>" → 编码参数
pub type CameraConfigs = BTreeMap<String, CameraSettings>;

/// 默认配置表
pub fn default_configs(n_camera: usize) -> CameraConfigs {
    (0..n_camera)
        .map(|i| (camera_key(i), CameraSettings::default()))
        .collect()
}

/// 持久化的配置文件
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfig {
    pub cameras: CameraConfigs,
}

impl PersistedConfig {
    pub fn with_defaults(n_camera: usize) -> Self {
        Self {
            cameras: default_configs(n_camera),
        }
    }

    /// 从JSON文件加载配置; 文件缺失或损坏时回退到默认值
    pub fn load(path: impl AsRef<Path>, n_camera: usize) -> Self {
        let path = path.as_ref();
        match Self::try_load(path) {
            Ok(mut config) => {
                // 文件里缺少的摄像头补上默认值
                for (key, settings) in default_configs(n_camera) {
                    config.cameras.entry(key).or_insert(settings);
                }
                info!("✅ 配置已从 {} 加载", path.display());
                config
            }
            Err(e) => {
                warn!("⚠️  {}, 使用默认配置", e);
                Self::with_defaults(n_camera)
            }
        }
    }

    fn try_load(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)
            .map_err(|e| Error::ConfigIo(format!("读取 {} 失败: {}", path.display(), e)))?;
        let config = serde_json::from_str(&json)?;
        Ok(config)
    }

    /// 保存配置到JSON文件
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
            .map_err(|e| Error::ConfigIo(format!("写入 {} 失败: {}", path.display(), e)))?;
        info!("💾 配置已保存到 {}", path.display());
        Ok(())
    }
}

// ========== 预设模式 ==========

/// 编码预设
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamPreset {
    Manual,
    TrafficAggressive,
    TrafficModerate,
    LatencyAggressive,
    LatencyModerate,
    VideoQuality,
}

impl StreamPreset {
    pub const ALL: [StreamPreset; 6] = [
        StreamPreset::Manual,
        StreamPreset::TrafficAggressive,
        StreamPreset::TrafficModerate,
        StreamPreset::LatencyAggressive,
        StreamPreset::LatencyModerate,
        StreamPreset::VideoQuality,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StreamPreset::Manual => "Manual",
            StreamPreset::TrafficAggressive => "Optimize for traffic (aggressive)",
            StreamPreset::TrafficModerate => "Optimize for traffic (moderate)",
            StreamPreset::LatencyAggressive => "Optimize for latency (aggressive)",
            StreamPreset::LatencyModerate => "Optimize for latency (moderate)",
            StreamPreset::VideoQuality => "Optimize for video quality",
        }
    }

    /// 预设对应的参数; Manual 没有固定值
    pub fn settings(&self) -> Option<CameraSettings> {
        match self {
            StreamPreset::Manual => None,
            StreamPreset::TrafficAggressive => Some(CameraSettings::new(60, 10)),
            StreamPreset::TrafficModerate => Some(CameraSettings::new(120, 25)),
            StreamPreset::LatencyAggressive => Some(CameraSettings::new(60, 80)),
            StreamPreset::LatencyModerate => Some(CameraSettings::new(120, 80)),
            StreamPreset::VideoQuality => Some(CameraSettings::new(480, 30)),
        }
    }

    /// 与给定参数完全一致的预设, 否则为 Manual
    pub fn matching(settings: CameraSettings) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.settings() == Some(settings))
            .unwrap_or(StreamPreset::Manual)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_lowercase();
        Self::ALL.iter().copied().find(|p| {
            p.name().to_lowercase() == name || format!("{:?}", p).to_lowercase() == name
        })
    }
}

// ========== 链路参数 ==========

/// 何时把UDP接收超时当作重连信号
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReconnectTrigger {
    /// 首次收到数据之后, 每次接收超时都尝试重连
    #[default]
    UdpTimeout,
    /// 从不由UDP超时触发
    Never,
}

/// 各统计窗口长度
#[derive(Clone, Copy, Debug)]
pub struct RateWindows {
    pub traffic: Duration,
    pub frame_rate: Duration,
    pub frame_drop: Duration,
}

impl Default for RateWindows {
    fn default() -> Self {
        Self {
            traffic: Duration::from_secs(2),
            frame_rate: Duration::from_secs(1),
            frame_drop: Duration::from_secs(2),
        }
    }
}

/// 链路参数
#[derive(Clone, Debug)]
pub struct LinkSettings {
    pub remote_ip: IpAddr,
    pub control_port: u16,
    pub udp_base_port: u16,
    pub udp_bind_ip: IpAddr,
    /// 控制连接的本地端口 (None 由系统分配)
    pub local_control_port: Option<u16>,
    pub recv_timeout: Duration,
    pub connect_timeout: Duration,
    pub probe_timeout: Duration,
    pub reconnect_backoff: Duration,
    pub reconnect_trigger: ReconnectTrigger,
    pub windows: RateWindows,
    pub decode_width: u32,
    pub config_path: String,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            remote_ip: IpAddr::V4(Ipv4Addr::new(10, 74, 7, 14)),
            control_port: CONTROL_PORT,
            udp_base_port: UDP_BASE_PORT,
            udp_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            local_control_port: Some(CONTROL_PORT),
            recv_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            reconnect_backoff: Duration::from_millis(100),
            reconnect_trigger: ReconnectTrigger::default(),
            windows: RateWindows::default(),
            decode_width: DEFAULT_DECODE_WIDTH,
            config_path: DEFAULT_CONFIG_PATH.to_string(),
        }
    }
}

impl LinkSettings {
    /// 第 i 路摄像头的UDP端口
    ///
    /// 超出 u16 范围时返回 None
    pub fn camera_port(&self, camera_id: usize) -> Option<u16> {
        u16::try_from(camera_id)
            .ok()
            .and_then(|offset| self.udp_base_port.checked_add(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = PersistedConfig::load(dir.path().join("nope.json"), 3);
        assert_eq!(config.cameras.len(), 3);
        assert_eq!(config.cameras["cam2"], CameraSettings::new(240, 25));
    }

    #[test]
    fn test_corrupt_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs.json");
        fs::write(&path, "{ not json").unwrap();
        let config = PersistedConfig::load(&path, 2);
        assert_eq!(config, PersistedConfig::with_defaults(2));
    }

    #[test]
    fn test_save_and_load_keeps_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("configs.json");
        let mut config = PersistedConfig::with_defaults(1);
        config
            .cameras
            .insert(camera_key(0), CameraSettings::new(480, 30));
        config.save(&path).unwrap();

        // 第二路摄像头不在文件里, 应补默认值
        let loaded = PersistedConfig::load(&path, 2);
        assert_eq!(loaded.cameras["cam0"], CameraSettings::new(480, 30));
        assert_eq!(loaded.cameras["cam1"], CameraSettings::default());
    }

    #[test]
    fn test_file_layout() {
        let json = serde_json::to_value(PersistedConfig::with_defaults(1)).unwrap();
        assert_eq!(json["cameras"]["cam0"]["resolution"], 240);
        assert_eq!(json["cameras"]["cam0"]["quality"], 25);
    }

    #[test]
    fn test_camera_port_bounds() {
        let settings = LinkSettings::default();
        assert_eq!(settings.camera_port(0), Some(5801));
        assert_eq!(settings.camera_port(3), Some(5804));
        assert_eq!(settings.camera_port(70_000), None);

        let settings = LinkSettings {
            udp_base_port: u16::MAX,
            ..LinkSettings::default()
        };
        assert_eq!(settings.camera_port(0), Some(u16::MAX));
        assert_eq!(settings.camera_port(1), None);
    }

    #[test]
    fn test_clamp() {
        let s = CameraSettings::new(5000, 0).clamped();
        assert_eq!(s, CameraSettings::new(1080, 1));
    }

    #[test]
    fn test_preset_matching() {
        assert_eq!(
            StreamPreset::matching(CameraSettings::new(120, 25)),
            StreamPreset::TrafficModerate
        );
        assert_eq!(
            StreamPreset::matching(CameraSettings::new(240, 25)),
            StreamPreset::Manual
        );
        assert_eq!(
            StreamPreset::from_name("videoquality"),
            Some(StreamPreset::VideoQuality)
        );
    }
}
