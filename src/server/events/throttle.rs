//! 进度事件节流器
//!
//! 每个传输尝试一个实例：间隔未到且进度变化不大时不发布，1.0 总是放行

use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 超过该进度跳变时无视时间间隔
const MIN_RATIO_JUMP: f64 = 0.05;

#[derive(Debug)]
pub struct ProgressThrottler {
    interval: Duration,
    last_emit: Option<(Instant, f64)>,
}

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
        }
    }

    pub fn default_interval() -> Self {
        Self::new(Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS))
    }

    /// 判断当前进度是否需要发布，需要时记录本次发布
    pub fn should_emit(&mut self, ratio: f64) -> bool {
        let now = Instant::now();
        let emit = match self.last_emit {
            None => true,
            Some((_, last_ratio)) if ratio >= 1.0 && last_ratio < 1.0 => true,
            Some((at, last_ratio)) => {
                ratio > last_ratio
                    && (now.duration_since(at) >= self.interval || ratio - last_ratio >= MIN_RATIO_JUMP)
            }
        };
        if emit {
            self.last_emit = Some((now, ratio));
        }
        emit
    }

    /// 新的尝试开始时重置
    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}
