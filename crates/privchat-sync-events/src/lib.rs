//! Privchat 同步事件对账
//!
//! 同步事件（送达 / 已读 / 查看回执、一次性消息已查看、消息请求响应）可能先于
//! 它们指向的消息或会话到达。本库负责：
//! - 🗂️ 缓冲早到事件，目标出现时取走
//! - 🎯 按键优先级把事件匹配到正确的本地实体
//! - 📈 在发送状态格上单调合并回执，乱序 / 重复回执不会让状态倒退
//! - 🧹 防抖批量清理已发送协议记录
//! - 📡 通过事件管理器通知界面刷新
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use privchat_sync_events::{
//!     Message, MemoryStore, ReceiptEvent, ReceiptKind, SharedReceiptSettings,
//!     SyncEventConfig, SyncEventContext,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     privchat_sync_events::init_tracing("info");
//!
//!     let store = Arc::new(MemoryStore::new());
//!     store.insert_message(Message::outgoing("m1", "bob", 1_000));
//!
//!     let context = SyncEventContext::new(
//!         SyncEventConfig::default(),
//!         store,
//!         Arc::new(SharedReceiptSettings::default()),
//!     );
//!
//!     let outcome = context
//!         .on_receipt(ReceiptEvent {
//!             target_sent_at: 1_000,
//!             receipt_timestamp: 1_200,
//!             source_service_id: "aci-bob".to_string(),
//!             source_conversation_id: "bob".to_string(),
//!             source_device_id: 1,
//!             kind: ReceiptKind::Delivery,
//!             was_sent_with_sealed_sender: false,
//!         })
//!         .await;
//!     assert!(outcome.changed());
//! }
//! ```

pub mod batcher;
pub mod buffer;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod matcher;
pub mod message_requests;
pub mod receipts;
pub mod send_state;
pub mod settings;
pub mod storage;
pub mod utils;
pub mod version;
pub mod view_once;

pub use batcher::{BatchProcessor, BatchTicket, Batcher, BatcherStats, DeleteSentProtoBatcher, DeleteSentProtoProcessor};
pub use buffer::{BufferStats, PendingBuffer, PendingId};
pub use config::{BatcherConfig, ExecutionMode, SyncEventConfig, SyncEventConfigBuilder};
pub use context::{PendingCounts, SyncEventContext};
pub use error::{Result, SyncEventError};
pub use events::{EventManager, EventStats, ReconcileEvent};
pub use matcher::{ConversationMatcher, MessageMatcher, ReceiptTargets};
pub use message_requests::{MessageRequestController, MessageRequestOutcome, MessageRequestResponseEvent};
pub use receipts::{ReceiptController, ReceiptEvent, ReceiptKind, ReceiptOutcome};
pub use send_state::{merge, merge_into, SendAction, SendState, SendStateByConversationId, SendStatus};
pub use settings::{ReceiptSettings, ReceiptSettingsSource, SharedReceiptSettings};
pub use storage::{
    Conversation, ConversationKind, DeleteSentProtoRecipient, DeleteSentProtoResult, EditRevision,
    MemoryStore, Message, MessageKind, MessageRequestResponseType, SqliteStore, SyncStore,
};
pub use version::VERSION;
pub use view_once::{ViewOnceOpenEvent, ViewOnceOutcome, ViewOnceSyncController};

/// 初始化日志输出
///
/// 优先使用 `RUST_LOG` 环境变量，未设置时使用 `default_filter`。
/// 重复调用是安全的，只有第一次生效。
pub fn init_tracing(default_filter: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
