//! 发送状态格（send-state lattice）
//!
//! 每个收件人（按会话 ID 区分）在一条消息上都有独立的发送状态。
//! 回执只会让状态沿着格向上移动：
//!
//! ```text
//! Pending / Sent  <  Delivered  <  Read  <  Viewed
//! ```
//!
//! `Failed` 只能由发送管线显式写入，回执对它不起作用。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 单个收件人的发送状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStatus {
    Pending,
    Sent,
    Failed,
    Delivered,
    Read,
    Viewed,
}

impl SendStatus {
    /// 在回执格中的位置；`Failed` 不在格内
    pub fn rank(self) -> Option<u8> {
        match self {
            SendStatus::Pending | SendStatus::Sent => Some(0),
            SendStatus::Delivered => Some(1),
            SendStatus::Read => Some(2),
            SendStatus::Viewed => Some(3),
            SendStatus::Failed => None,
        }
    }

    pub fn is_delivered_or_better(self) -> bool {
        self.rank().map_or(false, |rank| rank >= 1)
    }

    pub fn is_read_or_better(self) -> bool {
        self.rank().map_or(false, |rank| rank >= 2)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, SendStatus::Failed)
    }

    /// 取两者中格序较高的一个；任一方为 `Failed` 时保留 `Failed`
    pub fn max_status(a: SendStatus, b: SendStatus) -> SendStatus {
        match (a.rank(), b.rank()) {
            (Some(ra), Some(rb)) => {
                if rb > ra {
                    b
                } else {
                    a
                }
            }
            (None, _) => a,
            (_, None) => b,
        }
    }
}

/// 收件人发送状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendState {
    pub status: SendStatus,
    /// 最近一次状态变化的时间（毫秒时间戳）
    pub updated_at: Option<u64>,
}

impl SendState {
    pub fn new(status: SendStatus, updated_at: Option<u64>) -> Self {
        Self { status, updated_at }
    }

    /// 映射中缺失的收件人按“已发送、无时间”处理
    pub fn sent() -> Self {
        Self::new(SendStatus::Sent, None)
    }
}

/// 会话 ID → 发送状态
pub type SendStateByConversationId = BTreeMap<String, SendState>;

/// 回执带来的状态动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendAction {
    GotDeliveryReceipt { updated_at: u64 },
    GotReadReceipt { updated_at: u64 },
    GotViewedReceipt { updated_at: u64 },
}

impl SendAction {
    /// 该动作试图把状态推到的位置
    pub fn target_status(&self) -> SendStatus {
        match self {
            SendAction::GotDeliveryReceipt { .. } => SendStatus::Delivered,
            SendAction::GotReadReceipt { .. } => SendStatus::Read,
            SendAction::GotViewedReceipt { .. } => SendStatus::Viewed,
        }
    }

    pub fn updated_at(&self) -> u64 {
        match *self {
            SendAction::GotDeliveryReceipt { updated_at }
            | SendAction::GotReadReceipt { updated_at }
            | SendAction::GotViewedReceipt { updated_at } => updated_at,
        }
    }
}

/// 合并旧状态与回执动作（纯函数）
///
/// - 动作格序更高：升级状态，`updated_at` 取新旧较大者
/// - 格序相同：状态不变，新时间不早于旧时间时才更新 `updated_at`
/// - 格序更低或旧状态为 `Failed`：原样返回
pub fn merge(old: &SendState, action: SendAction) -> SendState {
    let Some(old_rank) = old.status.rank() else {
        return *old;
    };
    let target = action.target_status();
    let target_rank = target.rank().unwrap_or(0);
    let timestamp = action.updated_at();

    if target_rank > old_rank {
        let updated_at = match old.updated_at {
            Some(previous) => previous.max(timestamp),
            None => timestamp,
        };
        return SendState::new(target, Some(updated_at));
    }

    if target_rank == old_rank {
        let newer = old.updated_at.map_or(true, |previous| timestamp >= previous);
        if newer {
            return SendState::new(old.status, Some(timestamp));
        }
    }

    *old
}

/// 把回执合并进映射，返回新映射（旧映射不变）
pub fn merge_into(
    states: &SendStateByConversationId,
    conversation_id: &str,
    action: SendAction,
) -> SendStateByConversationId {
    let old = states
        .get(conversation_id)
        .copied()
        .unwrap_or_else(SendState::sent);
    let mut updated = states.clone();
    updated.insert(conversation_id.to_string(), merge(&old, action));
    updated
}
