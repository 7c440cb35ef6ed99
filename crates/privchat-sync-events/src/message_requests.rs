//! 消息请求响应同步
//!
//! 用户在其他设备上接受 / 删除 / 屏蔽 / 举报了某个消息请求，本端据此更新会话。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::buffer::PendingBuffer;
use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::matcher::ConversationMatcher;
use crate::storage::{Conversation, MessageRequestResponseType, SyncStore};
use crate::utils::format_timestamp;

/// 消息请求响应同步事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRequestResponseEvent {
    pub thread_e164: Option<String>,
    pub thread_service_id: Option<String>,
    pub group_id: Option<String>,
    pub response: MessageRequestResponseType,
    /// 信封时间戳
    pub timestamp: u64,
}

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRequestOutcome {
    Applied {
        conversation_id: String,
        deleted_messages: usize,
    },
    Unchanged {
        conversation_id: String,
    },
    /// 只有群 ID 且群尚不存在，留在缓冲区
    Buffered,
    Failed,
}

impl MessageRequestOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, MessageRequestOutcome::Applied { .. })
    }
}

/// 消息请求响应控制器
pub struct MessageRequestController {
    buffer: PendingBuffer<MessageRequestResponseEvent>,
    matcher: ConversationMatcher,
    store: Arc<dyn SyncStore>,
    events: Arc<EventManager>,
}

impl MessageRequestController {
    pub fn new(store: Arc<dyn SyncStore>, events: Arc<EventManager>) -> Self {
        Self {
            buffer: PendingBuffer::new("message_requests"),
            matcher: ConversationMatcher::new(store.clone()),
            store,
            events,
        }
    }

    pub fn buffer(&self) -> &PendingBuffer<MessageRequestResponseEvent> {
        &self.buffer
    }

    pub async fn on_response(&self, event: MessageRequestResponseEvent) -> MessageRequestOutcome {
        let pending_id = self.buffer.add(event.clone());

        let conversation = match self.matcher.find_for_response(&event).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                warn!(
                    "消息请求响应找不到会话，保留等待: group_id={:?}, response={:?}",
                    event.group_id, event.response
                );
                return MessageRequestOutcome::Buffered;
            }
            Err(e) => {
                error!("❌ 查找消息请求会话失败: response={:?}, error={}", event.response, e);
                self.buffer.remove(pending_id);
                return MessageRequestOutcome::Failed;
            }
        };

        let outcome = match self.apply(conversation, &event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("❌ 消息请求响应处理失败: response={:?}, error={}", event.response, e);
                MessageRequestOutcome::Failed
            }
        };

        self.buffer.remove(pending_id);
        outcome
    }

    /// 对已定位的会话应用响应
    pub async fn apply(
        &self,
        mut conversation: Conversation,
        event: &MessageRequestResponseEvent,
    ) -> Result<MessageRequestOutcome> {
        if event.response == MessageRequestResponseType::Unknown {
            warn!("未知的消息请求响应类型，忽略: conversation_id={}", conversation.id);
            return Ok(MessageRequestOutcome::Unchanged {
                conversation_id: conversation.id,
            });
        }

        let effects = conversation.apply_message_request_response(event.response, event.timestamp);

        let deleted_messages = if effects.delete_messages {
            self.store.delete_messages_in_conversation(&conversation.id).await?
        } else {
            0
        };

        if !effects.changed && deleted_messages == 0 {
            debug!("消息请求响应无变化: conversation_id={}", conversation.id);
            return Ok(MessageRequestOutcome::Unchanged {
                conversation_id: conversation.id,
            });
        }

        if effects.changed {
            self.store.save_conversation(&conversation).await?;
        }

        info!(
            "📨 消息请求响应已应用: conversation_id={}, response={:?}, deleted_messages={}, at={}",
            conversation.id,
            event.response,
            deleted_messages,
            format_timestamp(event.timestamp)
        );
        self.events
            .emit(event_builders::conversation_updated(&conversation.id, event.response))
            .await;

        Ok(MessageRequestOutcome::Applied {
            conversation_id: conversation.id,
            deleted_messages,
        })
    }

    /// 取走指向该会话的早到响应：手机号 → 身份 → 群 ID
    pub fn for_conversation(&self, conversation: &Conversation) -> Option<MessageRequestResponseEvent> {
        if let Some(e164) = conversation.e164.as_deref() {
            let found = self
                .buffer
                .take_first_where(|event| event.thread_e164.as_deref() == Some(e164));
            if found.is_some() {
                return found;
            }
        }

        if let Some(service_id) = conversation.service_id.as_deref() {
            let found = self
                .buffer
                .take_first_where(|event| event.thread_service_id.as_deref() == Some(service_id));
            if found.is_some() {
                return found;
            }
        }

        let group_id = conversation.group_id.as_deref()?;
        self.buffer
            .take_first_where(|event| event.group_id.as_deref() == Some(group_id))
    }
}
