//! 滑动时间窗速率统计
//!
//! 写入端阻塞加锁, 读取端只尝试加锁: 锁被占用时直接返回 0,
//! 保证界面线程和接收循环永远不会卡在统计上。

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// 单个指标的滑动窗口
///
/// 样本按写入时间从新到旧排列 (队首最新)。
#[derive(Debug)]
pub struct RateTracker {
    window: Duration,
    samples: Mutex<VecDeque<(Instant, f64)>>,
}

impl RateTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// 记录一个样本 (时间戳取当前时间)
    pub fn record(&self, value: f64) {
        self.record_at(Instant::now(), value);
    }

    pub fn record_at(&self, ts: Instant, value: f64) {
        self.samples.lock().push_front((ts, value));
    }

    /// 当前速率 (每秒)
    pub fn rate(&self) -> f64 {
        self.rate_at(Instant::now())
    }

    /// 以 `now` 为基准计算速率
    ///
    /// - 锁被占用: 0
    /// - 窗口内只剩一个样本: 返回该样本原值 (刚开始统计时的特殊情况)
    /// - 否则: 样本总和 / (最新时间 - 最旧时间)
    pub fn rate_at(&self, now: Instant) -> f64 {
        let Some(mut samples) = self.samples.try_lock() else {
            return 0.0;
        };

        // 从队尾淘汰过期样本
        while let Some(&(ts, _)) = samples.back() {
            if now.saturating_duration_since(ts) > self.window {
                samples.pop_back();
            } else {
                break;
            }
        }

        match (samples.front(), samples.back()) {
            (None, _) | (_, None) => 0.0,
            (Some(&(_, value)), _) if samples.len() == 1 => value,
            (Some(&(newest, _)), Some(&(oldest, _))) => {
                let span = newest.saturating_duration_since(oldest).as_secs_f64();
                if span <= 0.0 {
                    return 0.0;
                }
                let sum: f64 = samples.iter().map(|&(_, v)| v).sum();
                sum / span
            }
        }
    }

    /// 当前缓存的样本数 (含尚未淘汰的过期样本)
    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }
}
