//! 数据实体定义 - 存储协作方返回的内存投影
//!
//! 对账核心只持有短生命周期的快照：从存储读出、修改、整条写回。

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::send_state::SendStateByConversationId;

/// 消息方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Incoming,
    Outgoing,
    Story,
}

/// 编辑历史中的一个版本，每个版本有独立的发送状态映射
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditRevision {
    /// 该版本的发送时间戳
    pub timestamp: u64,
    pub body: Option<String>,
    #[serde(default)]
    pub send_state_by_conversation_id: SendStateByConversationId,
}

impl EditRevision {
    pub fn new(timestamp: u64) -> Self {
        Self {
            timestamp,
            body: None,
            send_state_by_conversation_id: SendStateByConversationId::new(),
        }
    }
}

/// 消息快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// 所属会话（私聊为对方会话，群聊为群会话，故事为分发列表所在会话）
    pub conversation_id: String,
    pub kind: MessageKind,
    /// 毫秒时间戳
    pub sent_at: u64,
    /// 当前编辑版本的时间戳
    pub edited_at: Option<u64>,
    /// 发送者服务端身份（入站消息）
    pub source_service_id: Option<String>,
    /// 发送者会话 ID（入站消息）
    pub source_conversation_id: Option<String>,
    #[serde(default)]
    pub send_state_by_conversation_id: SendStateByConversationId,
    #[serde(default)]
    pub edit_history: Vec<EditRevision>,
    pub story_distribution_list_id: Option<String>,
    #[serde(default)]
    pub deleted_for_everyone: bool,
    /// 以 sealed sender 方式投递的收件人会话 ID
    #[serde(default)]
    pub unidentified_deliveries: BTreeSet<String>,
    #[serde(default)]
    pub is_view_once: bool,
    #[serde(default)]
    pub view_once_opened: bool,
    pub body: Option<String>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl Message {
    /// 创建出站消息
    pub fn outgoing(id: impl Into<String>, conversation_id: impl Into<String>, sent_at: u64) -> Self {
        Self::with_kind(id, conversation_id, MessageKind::Outgoing, sent_at)
    }

    /// 创建入站消息
    pub fn incoming(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sent_at: u64,
        source_service_id: Option<String>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        let mut message = Self::with_kind(id, conversation_id.clone(), MessageKind::Incoming, sent_at);
        message.source_service_id = source_service_id;
        message.source_conversation_id = Some(conversation_id);
        message
    }

    /// 创建故事消息
    pub fn story(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        sent_at: u64,
        distribution_list_id: impl Into<String>,
    ) -> Self {
        let mut message = Self::with_kind(id, conversation_id, MessageKind::Story, sent_at);
        message.story_distribution_list_id = Some(distribution_list_id.into());
        message
    }

    fn with_kind(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        kind: MessageKind,
        sent_at: u64,
    ) -> Self {
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            kind,
            sent_at,
            edited_at: None,
            source_service_id: None,
            source_conversation_id: None,
            send_state_by_conversation_id: SendStateByConversationId::new(),
            edit_history: Vec::new(),
            story_distribution_list_id: None,
            deleted_for_everyone: false,
            unidentified_deliveries: BTreeSet::new(),
            is_view_once: false,
            view_once_opened: false,
            body: None,
            attachments: Vec::new(),
        }
    }

    pub fn is_outgoing(&self) -> bool {
        matches!(self.kind, MessageKind::Outgoing)
    }

    pub fn is_story(&self) -> bool {
        matches!(self.kind, MessageKind::Story)
    }

    /// 回执只作用于我们自己发出的内容
    pub fn is_outgoing_or_story(&self) -> bool {
        self.is_outgoing() || self.is_story()
    }

    /// 该时间戳是否指向这条消息（原始发送、当前编辑或任一历史版本）
    pub fn matches_sent_timestamp(&self, timestamp: u64) -> bool {
        self.sent_at == timestamp
            || self.edited_at == Some(timestamp)
            || self.edit_history.iter().any(|revision| revision.timestamp == timestamp)
    }

    /// 该收件人是否通过 sealed sender 收到了这条消息
    pub fn was_delivered_with_sealed_sender(&self, conversation_id: &str) -> bool {
        self.unidentified_deliveries.contains(conversation_id)
    }

    /// 标记一次性消息已被（其他设备）查看：抹掉内容
    ///
    /// 返回 true 表示消息发生了变化；普通消息从不修改
    pub fn mark_view_once_opened(&mut self) -> bool {
        if !self.is_view_once || self.view_once_opened {
            return false;
        }
        self.view_once_opened = true;
        self.body = None;
        self.attachments.clear();
        for revision in &mut self.edit_history {
            revision.body = None;
        }
        true
    }
}

/// 会话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Private,
    Group,
}

/// 会话快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    /// 手机号（E.164）
    pub e164: Option<String>,
    pub service_id: Option<String>,
    pub group_id: Option<String>,
    /// 是否向对方分享了我的手机号
    #[serde(default)]
    pub share_my_phone_number: bool,
    #[serde(default)]
    pub message_request_accepted: bool,
    #[serde(default)]
    pub blocked: bool,
    #[serde(default)]
    pub profile_sharing: bool,
    #[serde(default)]
    pub reported_spam: bool,
    #[serde(default)]
    pub left_group: bool,
    /// 为 None 时会话不在列表中显示
    pub active_at: Option<u64>,
}

impl Conversation {
    pub fn private(
        id: impl Into<String>,
        e164: Option<String>,
        service_id: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: ConversationKind::Private,
            e164,
            service_id,
            group_id: None,
            share_my_phone_number: false,
            message_request_accepted: false,
            blocked: false,
            profile_sharing: false,
            reported_spam: false,
            left_group: false,
            active_at: None,
        }
    }

    pub fn group(id: impl Into<String>, group_id: impl Into<String>) -> Self {
        let mut conversation = Self::private(id, None, None);
        conversation.kind = ConversationKind::Group;
        conversation.group_id = Some(group_id.into());
        conversation
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, ConversationKind::Group)
    }

    /// 应用消息请求响应，返回需要执行的副作用
    pub fn apply_message_request_response(
        &mut self,
        response: MessageRequestResponseType,
        timestamp: u64,
    ) -> MessageRequestEffects {
        let before = self.clone();
        let mut effects = MessageRequestEffects::default();

        match response {
            MessageRequestResponseType::Accept => {
                self.blocked = false;
                self.message_request_accepted = true;
                self.profile_sharing = true;
                self.active_at = Some(self.active_at.map_or(timestamp, |at| at.max(timestamp)));
            }
            MessageRequestResponseType::Delete => {
                self.hide_and_leave();
                effects.delete_messages = true;
            }
            MessageRequestResponseType::Block => {
                self.blocked = true;
                self.profile_sharing = false;
            }
            MessageRequestResponseType::BlockAndDelete => {
                self.blocked = true;
                self.hide_and_leave();
                effects.delete_messages = true;
            }
            MessageRequestResponseType::Spam => {
                self.reported_spam = true;
                self.hide_and_leave();
                effects.delete_messages = true;
            }
            MessageRequestResponseType::BlockAndSpam => {
                self.blocked = true;
                self.reported_spam = true;
                self.hide_and_leave();
                effects.delete_messages = true;
            }
            MessageRequestResponseType::Unknown => {}
        }

        effects.changed = *self != before;
        effects
    }

    fn hide_and_leave(&mut self) {
        self.profile_sharing = false;
        self.active_at = None;
        if self.is_group() {
            self.left_group = true;
        }
    }
}

/// 消息请求响应类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRequestResponseType {
    Unknown,
    Accept,
    Delete,
    Block,
    BlockAndDelete,
    Spam,
    BlockAndSpam,
}

impl MessageRequestResponseType {
    /// 协议中的数值编码
    pub fn from_code(code: u32) -> Self {
        match code {
            1 => Self::Accept,
            2 => Self::Delete,
            3 => Self::Block,
            4 => Self::BlockAndDelete,
            5 => Self::Spam,
            6 => Self::BlockAndSpam,
            _ => Self::Unknown,
        }
    }
}

/// 应用消息请求响应后需要的副作用
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageRequestEffects {
    /// 会话属性发生了变化，需要写回
    pub changed: bool,
    /// 需要删除会话内的消息
    pub delete_messages: bool,
}

/// 需要清理的已发送协议记录（按时间戳 + 收件人 + 设备）
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeleteSentProtoRecipient {
    pub timestamp: u64,
    pub recipient_service_id: String,
    pub device_id: u32,
}

/// 清理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSentProtoResult {
    /// 待分享手机号已失效（所有设备均已确认）的收件人
    pub successful_phone_number_shares: BTreeSet<String>,
}
