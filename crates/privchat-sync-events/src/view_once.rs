//! 一次性消息查看同步
//!
//! 其他设备查看了一次性消息后会同步一条事件，本端据此抹掉消息内容。

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::buffer::PendingBuffer;
use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::matcher::MessageMatcher;
use crate::storage::{Message, SyncStore};

/// 一次性消息已查看同步事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewOnceOpenEvent {
    /// 原消息发送者身份
    pub source_service_id: Option<String>,
    /// 原消息发送者会话 ID
    pub source_conversation_id: Option<String>,
    pub target_sent_at: u64,
}

/// 处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewOnceOutcome {
    /// 消息内容已抹除
    Opened { message_id: String },
    /// 消息早已是已查看状态
    AlreadyOpened { message_id: String },
    Buffered,
    Failed,
}

impl ViewOnceOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ViewOnceOutcome::Opened { .. })
    }
}

/// 一次性消息同步控制器
pub struct ViewOnceSyncController {
    buffer: PendingBuffer<ViewOnceOpenEvent>,
    matcher: MessageMatcher,
    store: Arc<dyn SyncStore>,
    events: Arc<EventManager>,
}

impl ViewOnceSyncController {
    pub fn new(store: Arc<dyn SyncStore>, events: Arc<EventManager>) -> Self {
        Self {
            buffer: PendingBuffer::new("view_once"),
            matcher: MessageMatcher::new(store.clone()),
            store,
            events,
        }
    }

    pub fn buffer(&self) -> &PendingBuffer<ViewOnceOpenEvent> {
        &self.buffer
    }

    pub async fn on_sync(&self, event: ViewOnceOpenEvent) -> ViewOnceOutcome {
        let pending_id = self.buffer.add(event.clone());

        let outcome = match self.reconcile(&event).await {
            Ok(ViewOnceOutcome::Buffered) => {
                warn!(
                    "一次性消息同步暂无目标，保留等待: sent_at={}, source={:?}",
                    event.target_sent_at, event.source_service_id
                );
                return ViewOnceOutcome::Buffered;
            }
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "❌ 一次性消息同步失败: sent_at={}, error={}",
                    event.target_sent_at, e
                );
                ViewOnceOutcome::Failed
            }
        };

        self.buffer.remove(pending_id);
        outcome
    }

    async fn reconcile(&self, event: &ViewOnceOpenEvent) -> Result<ViewOnceOutcome> {
        let Some(mut message) = self.matcher.find_view_once_target(event).await? else {
            return Ok(ViewOnceOutcome::Buffered);
        };

        if !message.mark_view_once_opened() {
            debug!("一次性消息已是已查看状态: message_id={}", message.id);
            return Ok(ViewOnceOutcome::AlreadyOpened { message_id: message.id });
        }

        self.store.save_message(&message).await?;
        info!("👁️ 一次性消息已在其他设备查看: message_id={}", message.id);
        self.events
            .emit(event_builders::view_once_opened(&message.id, &message.conversation_id))
            .await;

        Ok(ViewOnceOutcome::Opened { message_id: message.id })
    }

    /// 取走指向该消息的早到同步：先按发送者身份，再按发送者会话
    pub fn for_message(&self, message: &Message) -> Option<ViewOnceOpenEvent> {
        if !message.is_view_once {
            return None;
        }

        let at_sent_at = |event: &ViewOnceOpenEvent| event.target_sent_at == message.sent_at;

        if let Some(service_id) = message.source_service_id.as_deref() {
            let found = self.buffer.take_first_where(|event| {
                at_sent_at(event) && event.source_service_id.as_deref() == Some(service_id)
            });
            if found.is_some() {
                return found;
            }
        }

        let conversation_id = message.source_conversation_id.as_deref()?;
        self.buffer.take_first_where(|event| {
            at_sent_at(event) && event.source_conversation_id.as_deref() == Some(conversation_id)
        })
    }

    /// 消息落库前应用早到同步，返回是否有变化
    pub fn apply_pending(&self, message: &mut Message) -> bool {
        match self.for_message(message) {
            Some(_) => message.mark_view_once_opened(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    fn controller(store: Arc<MemoryStore>) -> (ViewOnceSyncController, Arc<EventManager>) {
        let events = Arc::new(EventManager::new(16));
        (ViewOnceSyncController::new(store, events.clone()), events)
    }

    fn view_once_message(id: &str, sent_at: u64) -> Message {
        let mut message = Message::incoming(id, "alice", sent_at, Some("aci-alice".to_string()));
        message.is_view_once = true;
        message.body = Some("secret".to_string());
        message.attachments.push("photo.jpg".to_string());
        message
    }

    fn sync_event(sent_at: u64) -> ViewOnceOpenEvent {
        ViewOnceOpenEvent {
            source_service_id: Some("aci-alice".to_string()),
            source_conversation_id: Some("alice".to_string()),
            target_sent_at: sent_at,
        }
    }

    #[tokio::test]
    async fn test_sync_erases_message() {
        let store = Arc::new(MemoryStore::new());
        store.insert_message(view_once_message("m1", 100));
        let (controller, events) = controller(store.clone());
        let mut receiver = events.subscribe();

        let outcome = controller.on_sync(sync_event(100)).await;
        assert!(outcome.changed());

        let stored = store.message("m1").unwrap();
        assert!(stored.view_once_opened);
        assert!(stored.body.is_none());
        assert!(stored.attachments.is_empty());
        assert_eq!(receiver.recv().await.unwrap().event_type(), "view_once_opened");
        assert!(controller.buffer().is_empty());

        let again = controller.on_sync(sync_event(100)).await;
        assert_eq!(again, ViewOnceOutcome::AlreadyOpened { message_id: "m1".to_string() });
        assert_eq!(store.message_writes(), 1);
    }

    #[tokio::test]
    async fn test_early_sync_applied_on_arrival() {
        let store = Arc::new(MemoryStore::new());
        let (controller, _events) = controller(store);

        assert_eq!(controller.on_sync(sync_event(100)).await, ViewOnceOutcome::Buffered);

        let mut message = view_once_message("m1", 100);
        assert!(controller.apply_pending(&mut message));
        assert!(message.body.is_none());
        assert!(controller.for_message(&message).is_none());
    }

    #[tokio::test]
    async fn test_for_message_falls_back_to_conversation() {
        let store = Arc::new(MemoryStore::new());
        let (controller, _events) = controller(store);
        controller
            .on_sync(ViewOnceOpenEvent {
                source_service_id: None,
                source_conversation_id: Some("alice".to_string()),
                target_sent_at: 100,
            })
            .await;

        let other_time = view_once_message("m0", 99);
        assert!(controller.for_message(&other_time).is_none());

        let message = view_once_message("m1", 100);
        assert!(controller.for_message(&message).is_some());
    }

    #[tokio::test]
    async fn test_ordinary_message_never_erased() {
        let store = Arc::new(MemoryStore::new());
        let mut ordinary = Message::incoming("m1", "alice", 100, Some("aci-alice".to_string()));
        ordinary.body = Some("hello, not view-once".to_string());
        store.insert_message(ordinary.clone());
        let (controller, _events) = controller(store.clone());

        assert_eq!(controller.on_sync(sync_event(100)).await, ViewOnceOutcome::Buffered);
        let stored = store.message("m1").unwrap();
        assert_eq!(stored.body.as_deref(), Some("hello, not view-once"));
        assert!(!stored.view_once_opened);
        assert_eq!(store.message_writes(), 0);

        assert!(!controller.apply_pending(&mut ordinary));
        assert_eq!(ordinary.body.as_deref(), Some("hello, not view-once"));
        assert_eq!(controller.buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_view_once_copy_chosen_over_ordinary_at_same_time() {
        let store = Arc::new(MemoryStore::new());
        store.insert_message(Message::incoming("m0", "alice", 100, Some("aci-alice".to_string())));
        store.insert_message(view_once_message("m1", 100));
        let (controller, _events) = controller(store.clone());

        let outcome = controller.on_sync(sync_event(100)).await;
        assert_eq!(outcome, ViewOnceOutcome::Opened { message_id: "m1".to_string() });
        assert!(!store.message("m0").unwrap().view_once_opened);
    }

    #[tokio::test]
    async fn test_storage_failure_removes_event() {
        let store = Arc::new(MemoryStore::new());
        store.insert_message(view_once_message("m1", 100));
        store.set_fail_writes(true);
        let (controller, _events) = controller(store);

        assert_eq!(controller.on_sync(sync_event(100)).await, ViewOnceOutcome::Failed);
        assert!(controller.buffer().is_empty());
    }
}
