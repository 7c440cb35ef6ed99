//! 回执对账
//!
//! 送达 / 已读 / 查看回执到达时：
//! 1. 先进入缓冲区，再向存储查找目标消息
//! 2. 按当前回执开关逐个目标判断是否生效
//! 3. 合并进顶层发送状态映射及匹配的编辑版本，只有结构性变化才写回并通知
//! 4. 满足条件时把已发送协议清理请求交给批处理器
//!
//! 找不到目标的回执留在缓冲区，等消息落库时由 [`ReceiptController::for_message`] 取走。

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::batcher::DeleteSentProtoBatcher;
use crate::buffer::{PendingBuffer, PendingId};
use crate::config::ExecutionMode;
use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::matcher::MessageMatcher;
use crate::send_state::{merge_into, SendAction};
use crate::settings::ReceiptSettingsSource;
use crate::storage::{DeleteSentProtoRecipient, Message, SyncStore};

/// 回执类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptKind {
    Delivery,
    Read,
    View,
}

impl ReceiptKind {
    /// 对应的发送状态动作
    pub fn to_action(self, updated_at: u64) -> SendAction {
        match self {
            ReceiptKind::Delivery => SendAction::GotDeliveryReceipt { updated_at },
            ReceiptKind::Read => SendAction::GotReadReceipt { updated_at },
            ReceiptKind::View => SendAction::GotViewedReceipt { updated_at },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptKind::Delivery => "delivery",
            ReceiptKind::Read => "read",
            ReceiptKind::View => "view",
        }
    }
}

/// 回执同步事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    /// 回执指向的消息发送时间戳
    pub target_sent_at: u64,
    /// 回执本身的时间戳
    pub receipt_timestamp: u64,
    /// 回执发送者身份
    pub source_service_id: String,
    /// 回执发送者会话 ID
    pub source_conversation_id: String,
    pub source_device_id: u32,
    pub kind: ReceiptKind,
    pub was_sent_with_sealed_sender: bool,
}

impl ReceiptEvent {
    pub fn action(&self) -> SendAction {
        self.kind.to_action(self.receipt_timestamp)
    }
}

/// 回执处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptOutcome {
    /// 至少一条消息的发送状态发生了变化
    Applied { changed_messages: Vec<String> },
    /// 命中目标，但状态无变化（重复 / 更旧的回执）
    Unchanged,
    /// 被回执开关屏蔽
    Dropped,
    /// 暂无目标，留在缓冲区
    Buffered,
    /// 处理期间目标消息已落库，回执由落库流程合并
    AppliedOnArrival,
    /// 存储出错且没有任何目标被更新，事件已移除
    Failed,
}

impl ReceiptOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, ReceiptOutcome::Applied { .. })
    }
}

enum TargetResult {
    Dropped,
    Unchanged,
    Changed(String),
}

/// 回执控制器
pub struct ReceiptController {
    buffer: PendingBuffer<ReceiptEvent>,
    matcher: MessageMatcher,
    store: Arc<dyn SyncStore>,
    settings: Arc<dyn ReceiptSettingsSource>,
    events: Arc<EventManager>,
    cleanup: Arc<DeleteSentProtoBatcher>,
    execution_mode: ExecutionMode,
    /// 消息 ID → 写回锁，同一条消息上的合并与写回串行执行
    message_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ReceiptController {
    pub fn new(
        store: Arc<dyn SyncStore>,
        settings: Arc<dyn ReceiptSettingsSource>,
        events: Arc<EventManager>,
        cleanup: Arc<DeleteSentProtoBatcher>,
        execution_mode: ExecutionMode,
    ) -> Self {
        Self {
            buffer: PendingBuffer::new("receipts"),
            matcher: MessageMatcher::new(store.clone()),
            store,
            settings,
            events,
            cleanup,
            execution_mode,
            message_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn buffer(&self) -> &PendingBuffer<ReceiptEvent> {
        &self.buffer
    }

    /// 处理一条回执；从不向调用方返回错误
    pub async fn on_receipt(&self, event: ReceiptEvent) -> ReceiptOutcome {
        let pending_id = self.buffer.add(event.clone());

        let outcome = match self.reconcile(&event, pending_id).await {
            Ok(ReceiptOutcome::Buffered) => {
                warn!(
                    "回执暂无目标，保留等待: kind={}, sent_at={}, source={}",
                    event.kind.as_str(),
                    event.target_sent_at,
                    event.source_conversation_id
                );
                return ReceiptOutcome::Buffered;
            }
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "❌ 回执处理失败: kind={}, sent_at={}, error={}",
                    event.kind.as_str(),
                    event.target_sent_at,
                    e
                );
                ReceiptOutcome::Failed
            }
        };

        self.buffer.remove(pending_id);
        outcome
    }

    async fn reconcile(&self, event: &ReceiptEvent, pending_id: PendingId) -> Result<ReceiptOutcome> {
        let targets = self.matcher.find_receipt_targets(event).await?.into_messages();
        if targets.is_empty() {
            return Ok(ReceiptOutcome::Buffered);
        }

        // 认领事件：已被 for_message 取走的回执不再产生任何副作用
        if self.buffer.remove(pending_id).is_none() {
            debug!(
                "回执已由消息落库流程合并: kind={}, sent_at={}",
                event.kind.as_str(),
                event.target_sent_at
            );
            return Ok(ReceiptOutcome::AppliedOnArrival);
        }

        let mut changed_messages = Vec::new();
        let mut all_dropped = true;
        let mut last_error = None;
        for message in &targets {
            match self.apply_to_target(event, message).await {
                Ok(TargetResult::Dropped) => {}
                Ok(TargetResult::Unchanged) => all_dropped = false,
                Ok(TargetResult::Changed(message_id)) => {
                    all_dropped = false;
                    changed_messages.push(message_id);
                }
                Err(e) => {
                    all_dropped = false;
                    error!(
                        "❌ 回执写回失败: kind={}, message_id={}, error={}",
                        event.kind.as_str(),
                        message.id,
                        e
                    );
                    last_error = Some(e);
                }
            }
        }

        if !changed_messages.is_empty() {
            return Ok(ReceiptOutcome::Applied { changed_messages });
        }
        if let Some(e) = last_error {
            return Err(e);
        }
        if all_dropped {
            return Ok(ReceiptOutcome::Dropped);
        }
        Ok(ReceiptOutcome::Unchanged)
    }

    async fn apply_to_target(&self, event: &ReceiptEvent, message: &Message) -> Result<TargetResult> {
        if !self.should_apply(event, message) {
            debug!(
                "回执已关闭，丢弃: kind={}, message_id={}",
                event.kind.as_str(),
                message.id
            );
            return Ok(TargetResult::Dropped);
        }

        let lock = self.message_lock(&message.id);
        let result = {
            let _guard = lock.lock().await;
            self.merge_latest(event, &message.id).await
        };
        self.release_message_lock(&message.id, lock);

        let result = result?;
        self.schedule_cleanup(event, message).await;
        Ok(result)
    }

    /// 在写回锁内重新读取最新快照再合并
    async fn merge_latest(&self, event: &ReceiptEvent, message_id: &str) -> Result<TargetResult> {
        let latest = self
            .store
            .get_messages_by_sent_at(event.target_sent_at)
            .await?
            .into_iter()
            .find(|m| m.id == message_id);
        let Some(latest) = latest else {
            debug!("回执目标已不存在: message_id={}", message_id);
            return Ok(TargetResult::Unchanged);
        };

        let Some(updated) = merge_receipt(&latest, event) else {
            return Ok(TargetResult::Unchanged);
        };

        self.store.save_message(&updated).await?;
        info!(
            "✅ 回执已应用: kind={}, message_id={}, recipient={}",
            event.kind.as_str(),
            updated.id,
            event.source_conversation_id
        );
        self.events
            .emit(event_builders::message_send_state_changed(&updated.id, &updated.conversation_id))
            .await;
        self.events
            .emit(event_builders::conversation_last_message_stale(&updated.conversation_id))
            .await;
        Ok(TargetResult::Changed(updated.id))
    }

    fn message_lock(&self, message_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.message_locks
            .lock()
            .entry(message_id.to_string())
            .or_default()
            .clone()
    }

    fn release_message_lock(&self, message_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.message_locks.lock();
        drop(lock);
        if locks.get(message_id).map_or(false, |l| Arc::strong_count(l) == 1) {
            locks.remove(message_id);
        }
    }

    /// 回执开关在每个事件、每个目标上重新读取
    fn should_apply(&self, event: &ReceiptEvent, message: &Message) -> bool {
        match event.kind {
            ReceiptKind::Delivery => true,
            ReceiptKind::Read => self.settings.read_receipts_enabled(),
            ReceiptKind::View if message.is_story() => self.settings.story_view_receipts_enabled(),
            ReceiptKind::View => self.settings.read_receipts_enabled(),
        }
    }

    /// sealed sender 送达或任一已读回执：对方已收到，已发送协议可以清理
    async fn schedule_cleanup(&self, event: &ReceiptEvent, message: &Message) {
        let qualifies = match event.kind {
            ReceiptKind::Delivery => {
                event.was_sent_with_sealed_sender
                    && message.was_delivered_with_sealed_sender(&event.source_conversation_id)
            }
            ReceiptKind::Read => true,
            ReceiptKind::View => false,
        };
        if !qualifies {
            return;
        }

        if event.source_service_id.is_empty() || event.source_device_id == 0 {
            warn!(
                "回执缺少身份或设备号，跳过协议清理: sent_at={}, service_id={:?}, device_id={}",
                message.sent_at, event.source_service_id, event.source_device_id
            );
            return;
        }

        let ticket = self.cleanup.add(DeleteSentProtoRecipient {
            timestamp: message.sent_at,
            recipient_service_id: event.source_service_id.clone(),
            device_id: event.source_device_id,
        });

        if self.execution_mode == ExecutionMode::Test {
            self.cleanup.flush_and_wait().await;
            if let Err(e) = ticket.wait().await {
                warn!("协议清理失败: sent_at={}, error={}", message.sent_at, e);
            }
        }
    }

    /// 消息落库前取走指向它的早到回执（已按开关过滤）
    pub fn for_message(&self, message: &Message) -> Vec<ReceiptEvent> {
        if !message.is_outgoing_or_story() {
            return Vec::new();
        }

        self.buffer
            .take_where(|event| message.matches_sent_timestamp(event.target_sent_at))
            .into_iter()
            .filter(|event| {
                let apply = self.should_apply(event, message);
                if !apply {
                    debug!("早到回执已关闭，丢弃: kind={}, message_id={}", event.kind.as_str(), message.id);
                }
                apply
            })
            .collect()
    }

    /// 把早到回执合并进即将保存的消息，返回是否有变化
    pub async fn apply_pending(&self, message: &mut Message) -> bool {
        let receipts = self.for_message(message);
        if receipts.is_empty() {
            return false;
        }

        let mut changed = false;
        for event in &receipts {
            if let Some(updated) = merge_receipt(message, event) {
                *message = updated;
                changed = true;
            }
            self.schedule_cleanup(event, message).await;
        }

        debug!(
            "合并早到回执: message_id={}, receipts={}, changed={}",
            message.id,
            receipts.len(),
            changed
        );
        changed
    }
}

/// 把回执合并进消息，状态无结构性变化时返回 None
fn merge_receipt(message: &Message, event: &ReceiptEvent) -> Option<Message> {
    let action = event.action();
    let timestamp = event.target_sent_at;
    let recipient = event.source_conversation_id.as_str();
    let mut updated = message.clone();

    if message.sent_at == timestamp || message.edited_at == Some(timestamp) {
        updated.send_state_by_conversation_id =
            merge_into(&message.send_state_by_conversation_id, recipient, action);
    }

    for revision in updated.edit_history.iter_mut().filter(|r| r.timestamp == timestamp) {
        revision.send_state_by_conversation_id =
            merge_into(&revision.send_state_by_conversation_id, recipient, action);
    }

    if updated == *message {
        None
    } else {
        Some(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{Batcher, DeleteSentProtoProcessor};
    use crate::config::BatcherConfig;
    use crate::send_state::{SendState, SendStatus};
    use crate::settings::SharedReceiptSettings;
    use crate::storage::{EditRevision, MemoryStore};

    struct Harness {
        store: Arc<MemoryStore>,
        settings: SharedReceiptSettings,
        events: Arc<EventManager>,
        cleanup: Arc<DeleteSentProtoBatcher>,
        controller: ReceiptController,
    }

    fn harness(mode: ExecutionMode) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let settings = SharedReceiptSettings::default();
        let events = Arc::new(EventManager::new(64));
        let cleanup = Arc::new(Batcher::new(
            "delete_sent_proto",
            BatcherConfig::default(),
            Arc::new(DeleteSentProtoProcessor::new(store.clone(), events.clone())),
        ));
        let controller = ReceiptController::new(
            store.clone(),
            Arc::new(settings.clone()),
            events.clone(),
            cleanup.clone(),
            mode,
        );
        Harness {
            store,
            settings,
            events,
            cleanup,
            controller,
        }
    }

    fn receipt(kind: ReceiptKind, sent_at: u64, at: u64) -> ReceiptEvent {
        ReceiptEvent {
            target_sent_at: sent_at,
            receipt_timestamp: at,
            source_service_id: "aci-bob".to_string(),
            source_conversation_id: "bob".to_string(),
            source_device_id: 1,
            kind,
            was_sent_with_sealed_sender: false,
        }
    }

    fn bob_state(store: &MemoryStore, id: &str) -> Option<SendState> {
        store
            .message(id)
            .and_then(|m| m.send_state_by_conversation_id.get("bob").copied())
    }

    #[tokio::test]
    async fn test_delivery_then_older_read() {
        let h = harness(ExecutionMode::Production);
        h.store.insert_message(Message::outgoing("m1", "bob", 1000));

        let first = h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        assert!(first.changed());
        let second = h.controller.on_receipt(receipt(ReceiptKind::Read, 1000, 90)).await;
        assert!(second.changed());

        assert_eq!(
            bob_state(&h.store, "m1"),
            Some(SendState::new(SendStatus::Read, Some(100)))
        );
        assert!(h.controller.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_receipt_is_unchanged() {
        let h = harness(ExecutionMode::Production);
        h.store.insert_message(Message::outgoing("m1", "bob", 1000));

        h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        let writes = h.store.message_writes();
        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;

        assert_eq!(outcome, ReceiptOutcome::Unchanged);
        assert_eq!(h.store.message_writes(), writes);
    }

    #[tokio::test]
    async fn test_change_emits_notifications() {
        let h = harness(ExecutionMode::Production);
        let mut receiver = h.events.subscribe();
        h.store.insert_message(Message::outgoing("m1", "bob", 1000));

        h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;

        assert_eq!(receiver.recv().await.unwrap().event_type(), "message_send_state_changed");
        assert_eq!(receiver.recv().await.unwrap().event_type(), "conversation_last_message_stale");
    }

    #[tokio::test]
    async fn test_early_receipt_retrieved_exactly_once() {
        let h = harness(ExecutionMode::Production);

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Read, 1000, 50)).await;
        assert_eq!(outcome, ReceiptOutcome::Buffered);
        assert_eq!(h.controller.buffer().len(), 1);

        let mut message = Message::outgoing("m1", "bob", 1000);
        assert!(h.controller.apply_pending(&mut message).await);
        assert_eq!(
            message.send_state_by_conversation_id.get("bob"),
            Some(&SendState::new(SendStatus::Read, Some(50)))
        );

        assert!(h.controller.for_message(&message).is_empty());
        assert!(h.controller.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_for_message_ignores_incoming() {
        let h = harness(ExecutionMode::Production);
        h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 50)).await;

        let incoming = Message::incoming("m1", "bob", 1000, Some("aci-bob".to_string()));
        assert!(h.controller.for_message(&incoming).is_empty());
        assert_eq!(h.controller.buffer().len(), 1);
    }

    #[tokio::test]
    async fn test_read_dropped_when_disabled() {
        let h = harness(ExecutionMode::Production);
        h.settings.set_read_receipts(false);
        h.store.insert_message(Message::outgoing("m1", "bob", 1000));

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Read, 1000, 100)).await;
        assert_eq!(outcome, ReceiptOutcome::Dropped);
        assert_eq!(bob_state(&h.store, "m1"), None);
        assert!(h.controller.buffer().is_empty());

        // 送达回执不受开关影响
        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        assert!(outcome.changed());
    }

    #[tokio::test]
    async fn test_view_policy_depends_on_target_kind() {
        let h = harness(ExecutionMode::Production);
        h.settings.set_story_view_receipts(false);
        let mut story = Message::story("s1", "bob", 1000, "list-a");
        story.send_state_by_conversation_id.insert("bob".to_string(), SendState::sent());
        h.store.insert_message(story);
        h.store.insert_message(Message::outgoing("m2", "bob", 2000));

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::View, 1000, 100)).await;
        assert_eq!(outcome, ReceiptOutcome::Dropped);

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::View, 2000, 100)).await;
        assert!(outcome.changed());
        assert_eq!(bob_state(&h.store, "m2").map(|s| s.status), Some(SendStatus::Viewed));
    }

    #[tokio::test]
    async fn test_early_receipt_dropped_when_disabled_meanwhile() {
        let h = harness(ExecutionMode::Production);
        h.controller.on_receipt(receipt(ReceiptKind::Read, 1000, 50)).await;
        h.settings.set_read_receipts(false);

        let message = Message::outgoing("m1", "bob", 1000);
        assert!(h.controller.for_message(&message).is_empty());
        assert!(h.controller.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_storage_failure_removes_event() {
        let h = harness(ExecutionMode::Production);
        h.store.insert_message(Message::outgoing("m1", "bob", 1000));
        h.store.set_fail_writes(true);

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        assert_eq!(outcome, ReceiptOutcome::Failed);
        assert!(h.controller.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_edit_revisions_merge_by_timestamp() {
        let h = harness(ExecutionMode::Production);
        let mut message = Message::outgoing("m1", "bob", 1000);
        message.edited_at = Some(3000);
        message.edit_history.push(EditRevision::new(3000));
        message.edit_history.push(EditRevision::new(1000));
        h.store.insert_message(message);

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        assert!(outcome.changed());

        let stored = h.store.message("m1").unwrap();
        assert_eq!(
            stored.send_state_by_conversation_id.get("bob").map(|s| s.status),
            Some(SendStatus::Delivered)
        );
        assert!(stored.edit_history[0].send_state_by_conversation_id.is_empty());
        assert_eq!(
            stored.edit_history[1].send_state_by_conversation_id.get("bob").map(|s| s.status),
            Some(SendStatus::Delivered)
        );
    }

    #[tokio::test]
    async fn test_story_copies_updated_together() {
        let h = harness(ExecutionMode::Production);
        for (id, list) in [("s1", "list-a"), ("s2", "list-b")] {
            let mut story = Message::story(id, "me", 1000, list);
            story.send_state_by_conversation_id.insert("bob".to_string(), SendState::sent());
            h.store.insert_message(story);
        }

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        assert_eq!(
            outcome,
            ReceiptOutcome::Applied {
                changed_messages: vec!["s1".to_string(), "s2".to_string()]
            }
        );
    }

    #[tokio::test]
    async fn test_story_copy_write_failure_keeps_other_copy() {
        let h = harness(ExecutionMode::Production);
        for (id, list) in [("s1", "list-a"), ("s2", "list-b")] {
            let mut story = Message::story(id, "me", 1000, list);
            story.send_state_by_conversation_id.insert("bob".to_string(), SendState::sent());
            h.store.insert_message(story);
        }
        h.store.fail_writes_for_message("s2");

        let outcome = h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        assert_eq!(
            outcome,
            ReceiptOutcome::Applied {
                changed_messages: vec!["s1".to_string()]
            }
        );
        assert_eq!(bob_state(&h.store, "s1").map(|s| s.status), Some(SendStatus::Delivered));
        assert_eq!(bob_state(&h.store, "s2").map(|s| s.status), Some(SendStatus::Sent));
        assert!(h.controller.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_receipts_keep_every_recipient() {
        let h = harness(ExecutionMode::Production);
        h.store.insert_message(Message::outgoing("m1", "g1", 1000));
        h.store.add_group_member("g1", "aci-bob");
        h.store.add_group_member("g1", "aci-alice");
        h.store.set_yield_reads(true);

        let from_bob = receipt(ReceiptKind::Delivery, 1000, 100);
        let from_alice = ReceiptEvent {
            source_service_id: "aci-alice".to_string(),
            source_conversation_id: "alice".to_string(),
            ..receipt(ReceiptKind::Delivery, 1000, 110)
        };

        let (first, second) = tokio::join!(
            h.controller.on_receipt(from_bob),
            h.controller.on_receipt(from_alice)
        );
        assert!(first.changed());
        assert!(second.changed());

        let stored = h.store.message("m1").unwrap();
        assert_eq!(
            stored.send_state_by_conversation_id.get("bob").map(|s| s.status),
            Some(SendStatus::Delivered)
        );
        assert_eq!(
            stored.send_state_by_conversation_id.get("alice").map(|s| s.status),
            Some(SendStatus::Delivered)
        );
        assert_eq!(h.store.message_writes(), 2);
    }

    #[tokio::test]
    async fn test_receipt_taken_on_arrival_is_not_applied_twice() {
        let h = harness(ExecutionMode::Production);
        h.store.insert_message(Message::outgoing("m1", "bob", 1000));
        h.store.set_yield_reads(true);

        let in_flight = h.controller.on_receipt(receipt(ReceiptKind::Read, 1000, 100));
        tokio::pin!(in_flight);
        assert!(futures::poll!(in_flight.as_mut()).is_pending());

        let mut arriving = Message::outgoing("m1", "bob", 1000);
        assert!(h.controller.apply_pending(&mut arriving).await);
        assert_eq!(
            arriving.send_state_by_conversation_id.get("bob").map(|s| s.status),
            Some(SendStatus::Read)
        );

        assert_eq!(in_flight.await, ReceiptOutcome::AppliedOnArrival);
        assert_eq!(h.store.message_writes(), 0);
        assert_eq!(h.cleanup.pending_len(), 1);
        assert!(h.controller.buffer().is_empty());
    }

    #[tokio::test]
    async fn test_test_mode_awaits_cleanup() {
        let h = harness(ExecutionMode::Test);
        let mut message = Message::outgoing("m1", "bob", 1000);
        message.unidentified_deliveries.insert("bob".to_string());
        h.store.insert_message(message);
        h.store.insert_sent_proto(1000, false, &[("aci-bob", 1)]);

        let mut event = receipt(ReceiptKind::Delivery, 1000, 100);
        event.was_sent_with_sealed_sender = true;
        h.controller.on_receipt(event).await;

        assert_eq!(h.store.sent_proto_batches().len(), 1);
        assert_eq!(h.store.remaining_sent_protos(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_skipped_without_sealed_sender_or_device() {
        let h = harness(ExecutionMode::Test);
        h.store.insert_message(Message::outgoing("m1", "bob", 1000));

        h.controller.on_receipt(receipt(ReceiptKind::Delivery, 1000, 100)).await;
        assert!(h.store.sent_proto_batches().is_empty());

        let mut read = receipt(ReceiptKind::Read, 1000, 200);
        read.source_device_id = 0;
        h.controller.on_receipt(read).await;
        assert!(h.store.sent_proto_batches().is_empty());

        h.controller.on_receipt(receipt(ReceiptKind::Read, 1000, 300)).await;
        assert_eq!(h.store.sent_proto_batches().len(), 1);
    }
}
