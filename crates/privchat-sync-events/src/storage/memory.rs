//! 进程内存储实现
//!
//! 保持插入顺序，按时间戳查询时返回顺序与写入顺序一致。
//! 提供故障注入开关，便于验证控制器的错误边界。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::debug;

use super::{
    Conversation, DeleteSentProtoRecipient, DeleteSentProtoResult, Message, SyncStore,
};
use crate::error::{Result, SyncEventError};

/// 已发送协议记录（用于重发/清理）
#[derive(Debug, Clone)]
struct SentProto {
    timestamp: u64,
    has_pni_signature: bool,
    /// 收件人身份 → 尚未确认的设备
    recipients: BTreeMap<String, BTreeSet<u32>>,
}

#[derive(Debug, Default)]
struct Inner {
    messages: Vec<Message>,
    conversations: Vec<Conversation>,
    /// 群会话 ID → 成员身份
    group_members: HashMap<String, BTreeSet<String>>,
    sent_protos: Vec<SentProto>,
    /// 每次 delete_sent_proto_recipient 收到的批次
    sent_proto_batches: Vec<Vec<DeleteSentProtoRecipient>>,
    /// 写回时注入失败的消息 ID
    failing_message_ids: BTreeSet<String>,
}

/// 内存存储
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    yield_reads: AtomicBool,
    message_writes: AtomicUsize,
    conversation_writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接写入消息（不计入写回次数）
    pub fn insert_message(&self, message: Message) {
        let mut inner = self.inner.lock();
        upsert_message(&mut inner.messages, message);
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        let mut inner = self.inner.lock();
        upsert_conversation(&mut inner.conversations, conversation);
    }

    pub fn add_group_member(&self, group_conversation_id: &str, service_id: &str) {
        self.inner
            .lock()
            .group_members
            .entry(group_conversation_id.to_string())
            .or_default()
            .insert(service_id.to_string());
    }

    /// 记录一条已发送协议及其收件设备
    pub fn insert_sent_proto(&self, timestamp: u64, has_pni_signature: bool, recipients: &[(&str, u32)]) {
        let mut map: BTreeMap<String, BTreeSet<u32>> = BTreeMap::new();
        for (service_id, device_id) in recipients {
            map.entry(service_id.to_string()).or_default().insert(*device_id);
        }
        self.inner.lock().sent_protos.push(SentProto {
            timestamp,
            has_pni_signature,
            recipients: map,
        });
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.inner.lock().messages.iter().find(|m| m.id == id).cloned()
    }

    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.inner.lock().conversations.iter().find(|c| c.id == id).cloned()
    }

    pub fn conversation_count(&self) -> usize {
        self.inner.lock().conversations.len()
    }

    pub fn sent_proto_batches(&self) -> Vec<Vec<DeleteSentProtoRecipient>> {
        self.inner.lock().sent_proto_batches.clone()
    }

    pub fn remaining_sent_protos(&self) -> usize {
        self.inner.lock().sent_protos.len()
    }

    pub fn message_writes(&self) -> usize {
        self.message_writes.load(Ordering::SeqCst)
    }

    pub fn conversation_writes(&self) -> usize {
        self.conversation_writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// 只让指定消息的写回失败
    pub fn fail_writes_for_message(&self, message_id: &str) {
        self.inner.lock().failing_message_ids.insert(message_id.to_string());
    }

    /// 按时间戳查询消息前先让出一次执行权，用于构造并发交错
    pub fn set_yield_reads(&self, enabled: bool) {
        self.yield_reads.store(enabled, Ordering::SeqCst);
    }

    fn check_read(&self) -> Result<()> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(SyncEventError::storage("injected read failure"));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncEventError::storage("injected write failure"));
        }
        Ok(())
    }
}

fn upsert_message(messages: &mut Vec<Message>, message: Message) {
    match messages.iter_mut().find(|m| m.id == message.id) {
        Some(existing) => *existing = message,
        None => messages.push(message),
    }
}

fn upsert_conversation(conversations: &mut Vec<Conversation>, conversation: Conversation) {
    match conversations.iter_mut().find(|c| c.id == conversation.id) {
        Some(existing) => *existing = conversation,
        None => conversations.push(conversation),
    }
}

#[async_trait]
impl SyncStore for MemoryStore {
    async fn get_messages_by_sent_at(&self, sent_at: u64) -> Result<Vec<Message>> {
        if self.yield_reads.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        self.check_read()?;
        let inner = self.inner.lock();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.matches_sent_timestamp(sent_at))
            .cloned()
            .collect())
    }

    async fn get_all_groups_involving_service_id(&self, service_id: &str) -> Result<Vec<String>> {
        self.check_read()?;
        let inner = self.inner.lock();
        let mut groups: Vec<String> = inner
            .group_members
            .iter()
            .filter(|(_, members)| members.contains(service_id))
            .map(|(group, _)| group.clone())
            .collect();
        groups.sort();
        Ok(groups)
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        if inner.failing_message_ids.contains(&message.id) {
            return Err(SyncEventError::storage(format!("injected write failure: {}", message.id)));
        }
        upsert_message(&mut inner.messages, message.clone());
        self.message_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.check_read()?;
        Ok(self.conversation(conversation_id))
    }

    async fn find_conversation_by_e164(&self, e164: &str) -> Result<Option<Conversation>> {
        self.check_read()?;
        let inner = self.inner.lock();
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.e164.as_deref() == Some(e164))
            .cloned())
    }

    async fn find_conversation_by_service_id(&self, service_id: &str) -> Result<Option<Conversation>> {
        self.check_read()?;
        let inner = self.inner.lock();
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.service_id.as_deref() == Some(service_id))
            .cloned())
    }

    async fn find_conversation_by_group_id(&self, group_id: &str) -> Result<Option<Conversation>> {
        self.check_read()?;
        let inner = self.inner.lock();
        Ok(inner
            .conversations
            .iter()
            .find(|c| c.group_id.as_deref() == Some(group_id))
            .cloned())
    }

    async fn lookup_or_create_conversation(
        &self,
        e164: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<Conversation> {
        self.check_read()?;
        if e164.is_none() && service_id.is_none() {
            return Err(SyncEventError::InvalidData(
                "lookup_or_create_conversation 需要手机号或身份".to_string(),
            ));
        }

        let mut inner = self.inner.lock();
        let existing = inner.conversations.iter().find(|c| {
            (e164.is_some() && c.e164.as_deref() == e164)
                || (service_id.is_some() && c.service_id.as_deref() == service_id)
        });
        if let Some(conversation) = existing {
            return Ok(conversation.clone());
        }

        self.check_write()?;
        let conversation = Conversation::private(
            uuid::Uuid::new_v4().to_string(),
            e164.map(str::to_string),
            service_id.map(str::to_string),
        );
        debug!("创建新会话: id={}, e164={:?}, service_id={:?}", conversation.id, e164, service_id);
        inner.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        upsert_conversation(&mut inner.conversations, conversation.clone());
        self.conversation_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_messages_in_conversation(&self, conversation_id: &str) -> Result<usize> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.conversation_id != conversation_id);
        Ok(before - inner.messages.len())
    }

    async fn delete_sent_proto_recipient(
        &self,
        batch: &[DeleteSentProtoRecipient],
    ) -> Result<DeleteSentProtoResult> {
        self.check_write()?;
        let mut inner = self.inner.lock();
        inner.sent_proto_batches.push(batch.to_vec());

        let mut result = DeleteSentProtoResult::default();
        for item in batch {
            let mut fully_acknowledged = false;
            for proto in inner.sent_protos.iter_mut().filter(|p| p.timestamp == item.timestamp) {
                let Some(devices) = proto.recipients.get_mut(&item.recipient_service_id) else {
                    continue;
                };
                devices.remove(&item.device_id);
                if devices.is_empty() {
                    proto.recipients.remove(&item.recipient_service_id);
                    fully_acknowledged |= proto.has_pni_signature;
                }
            }
            if fully_acknowledged {
                result
                    .successful_phone_number_shares
                    .insert(item.recipient_service_id.clone());
            }
        }
        inner.sent_protos.retain(|p| !p.recipients.is_empty());

        Ok(result)
    }

    async fn clear_share_my_phone_number_cached(&self, service_id: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let conversation = inner
            .conversations
            .iter_mut()
            .find(|c| c.service_id.as_deref() == Some(service_id));
        Ok(conversation.map(|c| {
            c.share_my_phone_number = false;
            c.id.clone()
        }))
    }
}
