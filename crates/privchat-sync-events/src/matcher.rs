//! 目标匹配器
//!
//! 给定一个同步事件，向存储查询候选目标并按键优先级挑出正确的那一个：
//! - 回执：出站/故事消息，先按来源会话，再按来源身份所在的群；都没有时退回到故事分发列表的副本
//! - 一次性消息：只看一次性消息，先按发送者身份，再按发送者会话
//! - 消息请求响应：手机号 → 身份 → 群 ID；前两者可查找或创建会话，群 ID 从不自动创建

use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::message_requests::MessageRequestResponseEvent;
use crate::receipts::ReceiptEvent;
use crate::storage::{Conversation, Message, SyncStore};
use crate::view_once::ViewOnceOpenEvent;

/// 回执的匹配结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptTargets {
    /// 唯一的主目标
    Primary(Message),
    /// 故事分发列表副本，整体处理
    Secondary(Vec<Message>),
    None,
}

impl ReceiptTargets {
    pub fn is_none(&self) -> bool {
        matches!(self, ReceiptTargets::None)
    }

    pub fn into_messages(self) -> Vec<Message> {
        match self {
            ReceiptTargets::Primary(message) => vec![message],
            ReceiptTargets::Secondary(messages) => messages,
            ReceiptTargets::None => Vec::new(),
        }
    }
}

/// 消息匹配器
#[derive(Clone)]
pub struct MessageMatcher {
    store: Arc<dyn SyncStore>,
}

impl MessageMatcher {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// 查找回执目标
    pub async fn find_receipt_targets(&self, event: &ReceiptEvent) -> Result<ReceiptTargets> {
        let messages = self.store.get_messages_by_sent_at(event.target_sent_at).await?;
        if messages.is_empty() {
            return Ok(ReceiptTargets::None);
        }

        if let Some(message) = messages.iter().find(|m| {
            m.is_outgoing_or_story() && m.conversation_id == event.source_conversation_id
        }) {
            return Ok(ReceiptTargets::Primary(message.clone()));
        }

        if !event.source_service_id.is_empty() {
            let groups = self
                .store
                .get_all_groups_involving_service_id(&event.source_service_id)
                .await?;
            if let Some(message) = messages
                .iter()
                .find(|m| m.is_outgoing_or_story() && groups.contains(&m.conversation_id))
            {
                return Ok(ReceiptTargets::Primary(message.clone()));
            }
        }

        let story_copies: Vec<Message> = messages
            .into_iter()
            .filter(|m| is_story_copy_for(m, &event.source_conversation_id))
            .collect();
        if story_copies.is_empty() {
            return Ok(ReceiptTargets::None);
        }

        debug!(
            "回执匹配到 {} 个故事副本: sent_at={}, source={}",
            story_copies.len(),
            event.target_sent_at,
            event.source_conversation_id
        );
        Ok(ReceiptTargets::Secondary(story_copies))
    }

    /// 查找一次性消息已查看同步的目标
    pub async fn find_view_once_target(&self, event: &ViewOnceOpenEvent) -> Result<Option<Message>> {
        let messages = self.store.get_messages_by_sent_at(event.target_sent_at).await?;
        Ok(pick_view_once_target(&messages, event).cloned())
    }
}

/// 故事分发列表中仍有该收件人发送状态、且未被撤回的消息
fn is_story_copy_for(message: &Message, source_conversation_id: &str) -> bool {
    message.story_distribution_list_id.is_some()
        && !message.deleted_for_everyone
        && message
            .send_state_by_conversation_id
            .contains_key(source_conversation_id)
}

fn pick_view_once_target<'a>(messages: &'a [Message], event: &ViewOnceOpenEvent) -> Option<&'a Message> {
    let target_sent_at = event.target_sent_at;
    let mut candidates = messages
        .iter()
        .filter(move |m| m.is_view_once && m.sent_at == target_sent_at);

    if let Some(service_id) = event.source_service_id.as_deref() {
        if let Some(message) = candidates
            .clone()
            .find(|m| m.source_service_id.as_deref() == Some(service_id))
        {
            return Some(message);
        }
    }

    let conversation_id = event.source_conversation_id.as_deref()?;
    candidates.find(|m| m.source_conversation_id.as_deref() == Some(conversation_id))
}

/// 会话匹配器
#[derive(Clone)]
pub struct ConversationMatcher {
    store: Arc<dyn SyncStore>,
}

impl ConversationMatcher {
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self { store }
    }

    /// 查找消息请求响应指向的会话
    ///
    /// 已有会话按 手机号 → 身份 → 群 ID 查找；均未命中时，
    /// 有手机号或身份则查找或创建私聊会话，只有群 ID 时返回 None。
    pub async fn find_for_response(
        &self,
        event: &MessageRequestResponseEvent,
    ) -> Result<Option<Conversation>> {
        if let Some(e164) = event.thread_e164.as_deref() {
            if let Some(conversation) = self.store.find_conversation_by_e164(e164).await? {
                return Ok(Some(conversation));
            }
        }

        if let Some(service_id) = event.thread_service_id.as_deref() {
            if let Some(conversation) = self.store.find_conversation_by_service_id(service_id).await? {
                return Ok(Some(conversation));
            }
        }

        if let Some(group_id) = event.group_id.as_deref() {
            if let Some(conversation) = self.store.find_conversation_by_group_id(group_id).await? {
                return Ok(Some(conversation));
            }
        }

        if event.thread_e164.is_none() && event.thread_service_id.is_none() {
            return Ok(None);
        }

        let conversation = self
            .store
            .lookup_or_create_conversation(
                event.thread_e164.as_deref(),
                event.thread_service_id.as_deref(),
            )
            .await?;
        Ok(Some(conversation))
    }
}
