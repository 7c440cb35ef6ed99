//! 回执开关
//!
//! 普通已读回执与故事查看回执各自独立开关。
//! 开关在缓冲期间可能被用户修改，因此每个事件处理时都重新读取，不做缓存。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 回执设置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptSettings {
    /// 全局已读回执
    pub read_receipts: bool,
    /// 故事查看回执
    pub story_view_receipts: bool,
}

impl Default for ReceiptSettings {
    fn default() -> Self {
        Self {
            read_receipts: true,
            story_view_receipts: true,
        }
    }
}

/// 回执设置来源
pub trait ReceiptSettingsSource: Send + Sync {
    fn read_receipts_enabled(&self) -> bool;

    fn story_view_receipts_enabled(&self) -> bool;
}

/// 可在运行时修改的共享设置
#[derive(Debug, Clone, Default)]
pub struct SharedReceiptSettings {
    inner: Arc<RwLock<ReceiptSettings>>,
}

impl SharedReceiptSettings {
    pub fn new(settings: ReceiptSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    pub fn get(&self) -> ReceiptSettings {
        *self.inner.read()
    }

    pub fn set_read_receipts(&self, enabled: bool) {
        self.inner.write().read_receipts = enabled;
    }

    pub fn set_story_view_receipts(&self, enabled: bool) {
        self.inner.write().story_view_receipts = enabled;
    }
}

impl ReceiptSettingsSource for SharedReceiptSettings {
    fn read_receipts_enabled(&self) -> bool {
        self.inner.read().read_receipts
    }

    fn story_view_receipts_enabled(&self) -> bool {
        self.inner.read().story_view_receipts
    }
}

impl ReceiptSettingsSource for ReceiptSettings {
    fn read_receipts_enabled(&self) -> bool {
        self.read_receipts
    }

    fn story_view_receipts_enabled(&self) -> bool {
        self.story_view_receipts
    }
}
