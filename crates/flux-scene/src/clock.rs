//! 时钟与 NTP 偏移
//!
//! 消息路径只读取缓存的偏移；偏移由后台任务按间隔刷新，刷新失败沿用上次结果。

use async_trait::async_trait;
use flux_scene_core::Result;
use flux_scene_types::time::epoch_now;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 纪元秒时钟
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

pub type SharedClock = Arc<dyn Clock>;

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        epoch_now()
    }
}

/// 手动推进的时钟，测试用
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    pub fn new(now: f64) -> Self {
        Self { now: Mutex::new(now) }
    }

    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}

/// 参考时间源，返回本地时钟相对参考时间的修正量（秒）
#[async_trait]
pub trait TimeSource: Send + Sync {
    async fn offset(&self) -> Result<f64>;
}

/// 本地时钟加上定期同步的偏移
pub struct ClockSync {
    base: SharedClock,
    offset: RwLock<f64>,
    source: Option<Arc<dyn TimeSource>>,
    interval: Duration,
}

impl ClockSync {
    pub fn new(base: SharedClock, source: Option<Arc<dyn TimeSource>>, interval: Duration) -> Self {
        Self {
            base,
            offset: RwLock::new(0.0),
            source,
            interval,
        }
    }

    pub fn offset(&self) -> f64 {
        *self.offset.read()
    }

    /// 查询一次时间源
    pub async fn refresh(&self) {
        let Some(source) = &self.source else { return };
        match source.offset().await {
            Ok(offset) => {
                *self.offset.write() = offset;
                debug!(offset = offset, "Clock offset updated");
            }
            Err(e) => warn!(error = %e, "Time sync failed, keeping last offset"),
        }
    }

    /// 启动后台刷新任务；没有时间源时不启动
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        self.source.as_ref()?;
        let this = Arc::clone(self);
        info!(interval_secs = this.interval.as_secs(), "Clock sync started");
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.interval);
            loop {
                ticker.tick().await;
                this.refresh().await;
            }
        }))
    }
}

impl Clock for ClockSync {
    fn now(&self) -> f64 {
        self.base.now() + self.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flux_scene_core::FusionError;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FixedSource {
        fail: AtomicBool,
    }

    #[async_trait]
    impl TimeSource for FixedSource {
        async fn offset(&self) -> Result<f64> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(FusionError::Internal("timeout".into()));
            }
            Ok(2.5)
        }
    }

    #[tokio::test]
    async fn test_offset_applied_and_kept_on_failure() {
        let source = Arc::new(FixedSource { fail: AtomicBool::new(false) });
        let sync = ClockSync::new(Arc::new(ManualClock::new(100.0)), Some(source.clone()), Duration::from_secs(300));
        assert_eq!(sync.now(), 100.0);

        sync.refresh().await;
        assert_eq!(sync.now(), 102.5);

        source.fail.store(true, Ordering::SeqCst);
        sync.refresh().await;
        assert_eq!(sync.offset(), 2.5);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1.0);
        clock.advance(0.5);
        assert_eq!(clock.now(), 1.5);
        clock.set(10.0);
        assert_eq!(clock.now(), 10.0);
    }
}
