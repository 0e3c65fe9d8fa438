//! 链路监控: 流量 / 帧率 / 丢帧率
//!
//! 每个指标一个 `Monitor`, 内部按摄像头编号各持有一个 `RateTracker`。
//! 三个监控器打包成 `Monitors`, 由 `Arc` 共享给所有接收线程和界面。

use crate::config::RateWindows;
use crate::rate::RateTracker;
use log::trace;
use std::collections::HashMap;
use std::time::Duration;

/// 指标类型, 决定汇总方式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorKind {
    /// 字节/秒, 汇总为求和
    Traffic,
    /// 帧/秒, 汇总为平均
    FrameRate,
    /// 丢帧/秒, 汇总为平均
    FrameDrop,
}

/// 单个指标的监控器
#[derive(Debug)]
pub struct Monitor {
    kind: MonitorKind,
    n_camera: usize,
    trackers: HashMap<usize, RateTracker>,
}

impl Monitor {
    pub fn new(kind: MonitorKind, n_camera: usize, window: Duration) -> Self {
        let trackers = (0..n_camera)
            .map(|id| (id, RateTracker::new(window)))
            .collect();
        Self {
            kind,
            n_camera,
            trackers,
        }
    }

    pub fn kind(&self) -> MonitorKind {
        self.kind
    }

    pub fn record(&self, camera_id: usize, value: f64) {
        match self.trackers.get(&camera_id) {
            Some(tracker) => tracker.record(value),
            None => trace!("{:?}: 未知摄像头 {}", self.kind, camera_id),
        }
    }

    pub fn value(&self, camera_id: usize) -> f64 {
        self.trackers
            .get(&camera_id)
            .map(RateTracker::rate)
            .unwrap_or(0.0)
    }

    /// 所有摄像头的汇总值; 没有摄像头时为 0
    pub fn total(&self) -> f64 {
        if self.n_camera == 0 {
            return 0.0;
        }
        let sum: f64 = (0..self.n_camera).map(|id| self.value(id)).sum();
        match self.kind {
            MonitorKind::Traffic => sum,
            MonitorKind::FrameRate | MonitorKind::FrameDrop => sum / self.n_camera as f64,
        }
    }

    pub fn tracker(&self, camera_id: usize) -> Option<&RateTracker> {
        self.trackers.get(&camera_id)
    }
}

/// 单路摄像头的状态快照
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CameraStats {
    pub traffic: f64, // 字节/秒
    pub fps: f64,
    pub drop_rate: f64,
}

/// 全部指标
#[derive(Debug)]
pub struct Monitors {
    pub traffic: Monitor,
    pub frame_rate: Monitor,
    pub frame_drop: Monitor,
}

impl Monitors {
    pub fn new(n_camera: usize, windows: RateWindows) -> Self {
        Self {
            traffic: Monitor::new(MonitorKind::Traffic, n_camera, windows.traffic),
            frame_rate: Monitor::new(MonitorKind::FrameRate, n_camera, windows.frame_rate),
            frame_drop: Monitor::new(MonitorKind::FrameDrop, n_camera, windows.frame_drop),
        }
    }

    /// 一帧成功: 记录字节数和一帧
    pub fn record_frame(&self, camera_id: usize, bytes: usize) {
        self.traffic.record(camera_id, bytes as f64);
        self.frame_rate.record(camera_id, 1.0);
    }

    /// 一次丢帧
    pub fn record_drop(&self, camera_id: usize) {
        self.frame_drop.record(camera_id, 1.0);
    }

    pub fn snapshot(&self, camera_id: usize) -> CameraStats {
        CameraStats {
            traffic: self.traffic.value(camera_id),
            fps: self.frame_rate.value(camera_id),
            drop_rate: self.frame_drop.value(camera_id),
        }
    }

    pub fn totals(&self) -> CameraStats {
        CameraStats {
            traffic: self.traffic.total(),
            fps: self.frame_rate.total(),
            drop_rate: self.frame_drop.total(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_total_without_cameras_is_zero() {
        let monitors = Monitors::new(0, RateWindows::default());
        assert_eq!(monitors.traffic.total(), 0.0);
        assert_eq!(monitors.frame_rate.total(), 0.0);
        assert_eq!(monitors.frame_drop.total(), 0.0);
    }

    #[test]
    fn test_traffic_total_is_sum() {
        let monitor = Monitor::new(MonitorKind::Traffic, 2, Duration::from_secs(60));
        monitor.record(0, 100.0);
        monitor.record(1, 50.0);
        // 单样本返回原值
        assert_eq!(monitor.total(), 150.0);
    }

    #[test]
    fn test_frame_rate_total_is_mean() {
        let monitor = Monitor::new(MonitorKind::FrameRate, 2, Duration::from_secs(60));
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let tracker = monitor.tracker(0).unwrap();
        tracker.record_at(t0, 1.0);
        tracker.record_at(t1, 1.0);
        // cam0: 2帧/1秒 = 2, cam1: 0
        let cam0 = tracker.rate_at(t1);
        assert!((cam0 - 2.0).abs() < 1e-9);
        monitor.tracker(1).unwrap().record_at(t1, 4.0);
        // (2 + 4) / 2
        assert!((monitor.total() - 3.0).abs() < 1e-9);
        assert_eq!(monitor.kind(), MonitorKind::FrameRate);
    }

    #[test]
    fn test_unknown_camera_is_ignored() {
        let monitors = Monitors::new(1, RateWindows::default());
        monitors.record_drop(7);
        assert_eq!(monitors.frame_drop.value(7), 0.0);
        assert_eq!(monitors.snapshot(7), CameraStats::default());
    }

    #[test]
    fn test_record_frame_feeds_traffic_and_fps() {
        let monitors = Monitors::new(1, RateWindows::default());
        monitors.record_frame(0, 2048);
        let stats = monitors.snapshot(0);
        assert_eq!(stats.traffic, 2048.0);
        assert_eq!(stats.fps, 1.0);
        assert_eq!(stats.drop_rate, 0.0);
    }
}
