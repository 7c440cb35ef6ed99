//! SQLite 存储实现
//!
//! 本模块提供：
//! - 消息 / 会话以 JSON 列保存，常用查询字段单独建列和索引
//! - message_timestamps 索引表：原始发送时间 + 所有编辑版本时间
//! - 已发送协议记录（sent_protos / sent_proto_recipients）的批量清理

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{
    Conversation, DeleteSentProtoRecipient, DeleteSentProtoResult, Message, SyncStore,
};
use crate::error::{Result, SyncEventError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL,
    sent_at INTEGER NOT NULL,
    json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id);

CREATE TABLE IF NOT EXISTS message_timestamps (
    message_id TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (message_id, timestamp)
);
CREATE INDEX IF NOT EXISTS idx_message_timestamps_ts ON message_timestamps(timestamp);

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    e164 TEXT,
    service_id TEXT,
    group_id TEXT,
    json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_conversations_e164 ON conversations(e164);
CREATE INDEX IF NOT EXISTS idx_conversations_service_id ON conversations(service_id);
CREATE INDEX IF NOT EXISTS idx_conversations_group_id ON conversations(group_id);

CREATE TABLE IF NOT EXISTS group_members (
    group_conversation_id TEXT NOT NULL,
    service_id TEXT NOT NULL,
    PRIMARY KEY (group_conversation_id, service_id)
);

CREATE TABLE IF NOT EXISTS sent_protos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER NOT NULL,
    has_pni_signature INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_sent_protos_timestamp ON sent_protos(timestamp);

CREATE TABLE IF NOT EXISTS sent_proto_recipients (
    payload_id INTEGER NOT NULL,
    recipient_service_id TEXT NOT NULL,
    device_id INTEGER NOT NULL,
    PRIMARY KEY (payload_id, recipient_service_id, device_id)
);
";

/// SQLite 存储组件
#[derive(Debug, Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let store = Self::from_connection(conn)?;
        info!("同步事件存储已打开: {}", path.display());
        Ok(store)
    }

    /// 内存数据库（测试用）
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub async fn add_group_member(&self, group_conversation_id: &str, service_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO group_members (group_conversation_id, service_id) VALUES (?1, ?2)",
            params![group_conversation_id, service_id],
        )?;
        Ok(())
    }

    /// 记录一条已发送协议及其收件设备
    pub async fn insert_sent_proto(
        &self,
        timestamp: u64,
        has_pni_signature: bool,
        recipients: &[(&str, u32)],
    ) -> Result<i64> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO sent_protos (timestamp, has_pni_signature) VALUES (?1, ?2)",
            params![timestamp as i64, has_pni_signature],
        )?;
        let payload_id = tx.last_insert_rowid();
        for (service_id, device_id) in recipients {
            tx.execute(
                "INSERT OR IGNORE INTO sent_proto_recipients (payload_id, recipient_service_id, device_id)
                 VALUES (?1, ?2, ?3)",
                params![payload_id, service_id, device_id],
            )?;
        }
        tx.commit()?;
        Ok(payload_id)
    }

    pub async fn sent_proto_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sent_protos", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    async fn find_conversation_where(&self, column: &str, value: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT json FROM conversations WHERE {} = ?1 LIMIT 1", column);
        let json: Option<String> = conn
            .query_row(&sql, params![value], |row| row.get(0))
            .optional()?;
        json.map(|j| serde_json::from_str(&j).map_err(SyncEventError::from))
            .transpose()
    }
}

fn write_conversation(conn: &Connection, conversation: &Conversation) -> Result<()> {
    let json = serde_json::to_string(conversation)?;
    conn.execute(
        "INSERT INTO conversations (id, e164, service_id, group_id, json) VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
            e164 = excluded.e164,
            service_id = excluded.service_id,
            group_id = excluded.group_id,
            json = excluded.json",
        params![
            conversation.id,
            conversation.e164,
            conversation.service_id,
            conversation.group_id,
            json
        ],
    )?;
    Ok(())
}

#[async_trait]
impl SyncStore for SqliteStore {
    async fn get_messages_by_sent_at(&self, sent_at: u64) -> Result<Vec<Message>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT json FROM messages
             WHERE id IN (SELECT message_id FROM message_timestamps WHERE timestamp = ?1)
             ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![sent_at as i64], |row| row.get::<_, String>(0))?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(serde_json::from_str(&row?)?);
        }
        Ok(messages)
    }

    async fn get_all_groups_involving_service_id(&self, service_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT group_conversation_id FROM group_members WHERE service_id = ?1
             ORDER BY group_conversation_id",
        )?;
        let rows = stmt.query_map(params![service_id], |row| row.get::<_, String>(0))?;

        let mut groups = Vec::new();
        for row in rows {
            groups.push(row?);
        }
        Ok(groups)
    }

    async fn save_message(&self, message: &Message) -> Result<()> {
        let json = serde_json::to_string(message)?;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages (id, conversation_id, sent_at, json) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                conversation_id = excluded.conversation_id,
                sent_at = excluded.sent_at,
                json = excluded.json",
            params![message.id, message.conversation_id, message.sent_at as i64, json],
        )?;

        let mut timestamps = BTreeSet::new();
        timestamps.insert(message.sent_at);
        timestamps.extend(message.edited_at);
        timestamps.extend(message.edit_history.iter().map(|revision| revision.timestamp));

        tx.execute(
            "DELETE FROM message_timestamps WHERE message_id = ?1",
            params![message.id],
        )?;
        for timestamp in timestamps {
            tx.execute(
                "INSERT INTO message_timestamps (message_id, timestamp) VALUES (?1, ?2)",
                params![message.id, timestamp as i64],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<Option<Conversation>> {
        self.find_conversation_where("id", conversation_id).await
    }

    async fn find_conversation_by_e164(&self, e164: &str) -> Result<Option<Conversation>> {
        self.find_conversation_where("e164", e164).await
    }

    async fn find_conversation_by_service_id(&self, service_id: &str) -> Result<Option<Conversation>> {
        self.find_conversation_where("service_id", service_id).await
    }

    async fn find_conversation_by_group_id(&self, group_id: &str) -> Result<Option<Conversation>> {
        self.find_conversation_where("group_id", group_id).await
    }

    async fn lookup_or_create_conversation(
        &self,
        e164: Option<&str>,
        service_id: Option<&str>,
    ) -> Result<Conversation> {
        if e164.is_none() && service_id.is_none() {
            return Err(SyncEventError::InvalidData(
                "lookup_or_create_conversation 需要手机号或身份".to_string(),
            ));
        }

        let conn = self.conn.lock().await;
        let json: Option<String> = conn
            .query_row(
                "SELECT json FROM conversations
                 WHERE (?1 IS NOT NULL AND e164 = ?1) OR (?2 IS NOT NULL AND service_id = ?2)
                 ORDER BY rowid ASC LIMIT 1",
                params![e164, service_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(json) = json {
            return Ok(serde_json::from_str(&json)?);
        }

        let conversation = Conversation::private(
            uuid::Uuid::new_v4().to_string(),
            e164.map(str::to_string),
            service_id.map(str::to_string),
        );
        write_conversation(&conn, &conversation)?;
        debug!("创建新会话: id={}, e164={:?}, service_id={:?}", conversation.id, e164, service_id);
        Ok(conversation)
    }

    async fn save_conversation(&self, conversation: &Conversation) -> Result<()> {
        let conn = self.conn.lock().await;
        write_conversation(&conn, conversation)
    }

    async fn delete_messages_in_conversation(&self, conversation_id: &str) -> Result<usize> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM message_timestamps WHERE message_id IN
                (SELECT id FROM messages WHERE conversation_id = ?1)",
            params![conversation_id],
        )?;
        let deleted = tx.execute(
            "DELETE FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    async fn delete_sent_proto_recipient(
        &self,
        batch: &[DeleteSentProtoRecipient],
    ) -> Result<DeleteSentProtoResult> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let mut result = DeleteSentProtoResult::default();

        for item in batch {
            let payloads: Vec<(i64, bool)> = {
                let mut stmt =
                    tx.prepare("SELECT id, has_pni_signature FROM sent_protos WHERE timestamp = ?1")?;
                let rows = stmt.query_map(params![item.timestamp as i64], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?))
                })?;
                let collected = rows.collect::<rusqlite::Result<Vec<_>>>()?;
                collected
            };

            for (payload_id, has_pni_signature) in payloads {
                let deleted = tx.execute(
                    "DELETE FROM sent_proto_recipients
                     WHERE payload_id = ?1 AND recipient_service_id = ?2 AND device_id = ?3",
                    params![payload_id, item.recipient_service_id, item.device_id],
                )?;
                if deleted == 0 {
                    continue;
                }

                let remaining_devices: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM sent_proto_recipients
                     WHERE payload_id = ?1 AND recipient_service_id = ?2",
                    params![payload_id, item.recipient_service_id],
                    |row| row.get(0),
                )?;
                if remaining_devices == 0 && has_pni_signature {
                    result
                        .successful_phone_number_shares
                        .insert(item.recipient_service_id.clone());
                }

                let remaining_recipients: i64 = tx.query_row(
                    "SELECT COUNT(*) FROM sent_proto_recipients WHERE payload_id = ?1",
                    params![payload_id],
                    |row| row.get(0),
                )?;
                if remaining_recipients == 0 {
                    tx.execute("DELETE FROM sent_protos WHERE id = ?1", params![payload_id])?;
                }
            }
        }

        // 持久化层同步清除分享标记，内存层由调用方处理
        for service_id in &result.successful_phone_number_shares {
            let json: Option<String> = tx
                .query_row(
                    "SELECT json FROM conversations WHERE service_id = ?1",
                    params![service_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(json) = json {
                let mut conversation: Conversation = serde_json::from_str(&json)?;
                conversation.share_my_phone_number = false;
                write_conversation(&tx, &conversation)?;
            }
        }

        tx.commit()?;
        Ok(result)
    }

    async fn clear_share_my_phone_number_cached(&self, service_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().await;
        let id = conn
            .query_row(
                "SELECT id FROM conversations WHERE service_id = ?1",
                params![service_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(id)
    }
}
