//! 事件系统模块 - 对账结果通知
//!
//! 对账核心不直接驱动 UI，而是把结果以 [`ReconcileEvent`] 广播出去，
//! 宿主应用订阅后自行决定如何刷新（例如对会话最后一条消息的摘要做防抖重绘）。
//!
//! 功能包括：
//! - 发送状态变更事件
//! - 一次性消息已查看事件
//! - 会话更新事件（消息请求响应）
//! - 手机号分享失效事件
//! - 广播订阅与发布统计

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::storage::MessageRequestResponseType;
use crate::utils::now_millis;

/// 对账事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconcileEvent {
    /// 消息的发送状态（顶层或编辑版本）发生变化
    MessageSendStateChanged {
        message_id: String,
        conversation_id: String,
        timestamp: u64,
    },
    /// 会话的最后一条消息摘要可能需要重绘
    ConversationLastMessageStale {
        conversation_id: String,
        timestamp: u64,
    },
    /// 一次性消息已在其他设备上查看
    ViewOnceOpened {
        message_id: String,
        conversation_id: String,
        timestamp: u64,
    },
    /// 会话因消息请求响应而更新
    ConversationUpdated {
        conversation_id: String,
        response: MessageRequestResponseType,
        timestamp: u64,
    },
    /// 向该会话分享的手机号已失效
    PhoneNumberShareCleared {
        conversation_id: String,
        timestamp: u64,
    },
}

impl ReconcileEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            ReconcileEvent::MessageSendStateChanged { .. } => "message_send_state_changed",
            ReconcileEvent::ConversationLastMessageStale { .. } => "conversation_last_message_stale",
            ReconcileEvent::ViewOnceOpened { .. } => "view_once_opened",
            ReconcileEvent::ConversationUpdated { .. } => "conversation_updated",
            ReconcileEvent::PhoneNumberShareCleared { .. } => "phone_number_share_cleared",
        }
    }

    pub fn timestamp(&self) -> u64 {
        match self {
            ReconcileEvent::MessageSendStateChanged { timestamp, .. }
            | ReconcileEvent::ConversationLastMessageStale { timestamp, .. }
            | ReconcileEvent::ViewOnceOpened { timestamp, .. }
            | ReconcileEvent::ConversationUpdated { timestamp, .. }
            | ReconcileEvent::PhoneNumberShareCleared { timestamp, .. } => *timestamp,
        }
    }

    pub fn conversation_id(&self) -> &str {
        match self {
            ReconcileEvent::MessageSendStateChanged { conversation_id, .. }
            | ReconcileEvent::ConversationLastMessageStale { conversation_id, .. }
            | ReconcileEvent::ViewOnceOpened { conversation_id, .. }
            | ReconcileEvent::ConversationUpdated { conversation_id, .. }
            | ReconcileEvent::PhoneNumberShareCleared { conversation_id, .. } => conversation_id,
        }
    }
}

/// 通知统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStats {
    /// 累计发布数
    pub emitted: u64,
    /// 发布时没有任何订阅者的次数
    pub unobserved: u64,
    pub by_type: BTreeMap<&'static str, u64>,
    /// 最近一次发布的事件时间戳
    pub last_emitted_at: Option<u64>,
}

/// 对账通知广播
///
/// 订阅者各自持有一个 [`broadcast::Receiver`]；落后太多的订阅者会收到
/// `Lagged`，由宿主决定是否整体刷新。
pub struct EventManager {
    sender: broadcast::Sender<ReconcileEvent>,
    stats: tokio::sync::RwLock<EventStats>,
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: tokio::sync::RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件；没有订阅者不算错误
    pub async fn emit(&self, event: ReconcileEvent) {
        let kind = event.event_type();
        let at = event.timestamp();
        let delivered = self.sender.send(event).map(|receivers| receivers > 0).unwrap_or(false);
        trace!("📡 发布对账通知: type={}, delivered={}", kind, delivered);

        let mut stats = self.stats.write().await;
        stats.emitted += 1;
        if !delivered {
            stats.unobserved += 1;
        }
        *stats.by_type.entry(kind).or_default() += 1;
        stats.last_emitted_at = Some(at);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReconcileEvent> {
        self.sender.subscribe()
    }

    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn message_send_state_changed(message_id: &str, conversation_id: &str) -> ReconcileEvent {
        ReconcileEvent::MessageSendStateChanged {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn conversation_last_message_stale(conversation_id: &str) -> ReconcileEvent {
        ReconcileEvent::ConversationLastMessageStale {
            conversation_id: conversation_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn view_once_opened(message_id: &str, conversation_id: &str) -> ReconcileEvent {
        ReconcileEvent::ViewOnceOpened {
            message_id: message_id.to_string(),
            conversation_id: conversation_id.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn conversation_updated(
        conversation_id: &str,
        response: MessageRequestResponseType,
    ) -> ReconcileEvent {
        ReconcileEvent::ConversationUpdated {
            conversation_id: conversation_id.to_string(),
            response,
            timestamp: now_millis(),
        }
    }

    pub fn phone_number_share_cleared(conversation_id: &str) -> ReconcileEvent {
        ReconcileEvent::PhoneNumberShareCleared {
            conversation_id: conversation_id.to_string(),
            timestamp: now_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_subscribers() {
        let manager = EventManager::new(16);
        let mut receiver = manager.subscribe();
        assert_eq!(manager.subscriber_count(), 1);

        manager.emit(event_builders::view_once_opened("m1", "c1")).await;

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "view_once_opened");
        assert_eq!(received.conversation_id(), "c1");
    }

    #[tokio::test]
    async fn test_stats_track_unobserved_events() {
        let manager = EventManager::new(16);

        manager.emit(event_builders::conversation_last_message_stale("c1")).await;
        let receiver = manager.subscribe();
        manager.emit(event_builders::conversation_last_message_stale("c1")).await;
        manager.emit(event_builders::phone_number_share_cleared("c2")).await;
        drop(receiver);

        let stats = manager.get_stats().await;
        assert_eq!(stats.emitted, 3);
        assert_eq!(stats.unobserved, 1);
        assert_eq!(stats.by_type.get("conversation_last_message_stale"), Some(&2));
        assert_eq!(stats.by_type.get("phone_number_share_cleared"), Some(&1));
        assert!(stats.last_emitted_at.is_some());
    }
}
