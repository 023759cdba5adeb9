use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// 重试策略配置（指数退避 + 随机抖动）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 基础重试间隔（毫秒）
    pub base_delay_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_delay_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_delay_ms == 0 {
            return Err(anyhow::anyhow!("基础重试间隔必须大于0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(anyhow::anyhow!("最大重试间隔不能小于基础重试间隔"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1.0"));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!("抖动范围必须在0.0到1.0之间"));
        }
        Ok(())
    }

    /// 第 `attempt` 次重试（从0开始）前的等待时间
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped * self.jitter_factor;
            rand::rng().random_range(-range..=range)
        } else {
            0.0
        };

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}
