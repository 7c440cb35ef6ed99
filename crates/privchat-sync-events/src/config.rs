//! 对账上下文配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// 清理任务即发即忘
    Production,
    /// 清理任务立即冲刷并等待完成（CI / 测试）
    Test,
}

/// 批处理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// 最长等待时间（毫秒）
    pub max_wait_ms: u64,
    /// 单批最大条数
    pub max_size: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_wait_ms: 250,
            max_size: 30,
        }
    }
}

impl BatcherConfig {
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// 同步事件对账配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEventConfig {
    /// 已发送协议清理批处理
    pub cleanup_batch: BatcherConfig,
    pub execution_mode: ExecutionMode,
    /// 早到事件最长保留时间（秒），None 表示永不淘汰
    pub pending_event_max_age_secs: Option<u64>,
    /// 后台淘汰任务间隔（秒）
    pub sweep_interval_secs: u64,
    /// 通知广播通道容量
    pub event_channel_capacity: usize,
}

impl Default for SyncEventConfig {
    fn default() -> Self {
        Self {
            cleanup_batch: BatcherConfig::default(),
            execution_mode: ExecutionMode::Production,
            pending_event_max_age_secs: Some(24 * 60 * 60), // 24 小时
            sweep_interval_secs: 10 * 60,
            event_channel_capacity: 256,
        }
    }
}

impl SyncEventConfig {
    pub fn builder() -> SyncEventConfigBuilder {
        SyncEventConfigBuilder::default()
    }

    pub fn pending_event_max_age(&self) -> Option<Duration> {
        self.pending_event_max_age_secs.map(Duration::from_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn is_test_mode(&self) -> bool {
        self.execution_mode == ExecutionMode::Test
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct SyncEventConfigBuilder {
    config: SyncEventConfig,
}

impl SyncEventConfigBuilder {
    pub fn cleanup_batch(mut self, max_wait_ms: u64, max_size: usize) -> Self {
        self.config.cleanup_batch = BatcherConfig {
            max_wait_ms,
            max_size: max_size.max(1),
        };
        self
    }

    pub fn execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.config.execution_mode = mode;
        self
    }

    pub fn pending_event_max_age_secs(mut self, secs: Option<u64>) -> Self {
        self.config.pending_event_max_age_secs = secs;
        self
    }

    pub fn sweep_interval_secs(mut self, secs: u64) -> Self {
        self.config.sweep_interval_secs = secs;
        self
    }

    pub fn event_channel_capacity(mut self, capacity: usize) -> Self {
        self.config.event_channel_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> SyncEventConfig {
        self.config
    }
}
