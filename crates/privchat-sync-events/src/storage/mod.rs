//! 存储模块 - 对账核心依赖的存储协作方接口
//!
//! 对账核心本身不拥有任何持久化数据，只通过 [`SyncStore`] 读写：
//! - MemoryStore: 进程内实现，用于嵌入和测试
//! - SqliteStore: 基于 rusqlite 的实现，消息/会话以 JSON 列保存

use async_trait::async_trait;

use crate::error::Result;

pub mod entities;
pub mod memory;
pub mod sqlite;

pub use entities::*;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// 存储协作方
///
/// 所有读取返回的都是快照；写回以整条实体为单位。
#[async_trait]
pub trait SyncStore: Send + Sync {
    /// 查询发送时间戳（含编辑版本时间戳）等于 `sent_at` 的所有本地消息
    async fn get_messages_by_sent_at(&self, sent_at: u64) -> Result<Vec<Message>>;

    /// 查询该身份参与的所有群会话 ID
    async fn get_all_groups_involving_service_id(&self, service_id: &str) -> Result<Vec<String>>;

    async fn save_message(&self, message: &Message) -> Result<()>;

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>>;

    async fn find_conversation_by_e164(&self, e164: &str) -> Result<Option<Conversation>>;

    async fn find_conversation_by_service_id(&self, service_id: &str) -> Result<Option<Conversation>>;

    async fn find_conversation_by_group_id(&self, group_id: &str) -> Result<Option<Conversation>>;

    /// 按手机号 / 身份查找私聊会话，不存在时创建
    async fn lookup_or_create_conversation(
        &self,
        e164: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<Conversation>;

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()>;

    /// 删除会话内的全部消息，返回删除条数
    async fn delete_messages_in_conversation(&self, conversation_id: &str) -> Result<usize>;

    /// 批量删除已发送协议记录的收件人
    async fn delete_sent_proto_recipient(
        &self,
        batch: &[DeleteSentProtoRecipient],
    ) -> Result<DeleteSentProtoResult>;

    /// 在内存中清除会话的“分享手机号”标记
    ///
    /// 持久化数据已由 [`SyncStore::delete_sent_proto_recipient`] 更新，这里不应再写库。
    /// 返回受影响的会话 ID。
    async fn clear_share_my_phone_number_cached(&self, service_id: &str) -> Result<Option<String>>;
}
