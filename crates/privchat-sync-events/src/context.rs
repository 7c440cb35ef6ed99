//! 同步事件对账上下文
//!
//! 由应用根对象显式构造并持有，每个进程一份：
//! 三个控制器、清理批处理器、通知管理器共享同一个存储协作方与回执开关。
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use privchat_sync_events::{
//!     MemoryStore, SharedReceiptSettings, SyncEventConfig, SyncEventContext,
//! };
//!
//! # async fn run() {
//! let context = SyncEventContext::new(
//!     SyncEventConfig::default(),
//!     Arc::new(MemoryStore::new()),
//!     Arc::new(SharedReceiptSettings::default()),
//! );
//! let _sweeper = context.start_sweeper();
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::batcher::{Batcher, DeleteSentProtoBatcher, DeleteSentProtoProcessor};
use crate::config::SyncEventConfig;
use crate::events::EventManager;
use crate::message_requests::{MessageRequestController, MessageRequestOutcome, MessageRequestResponseEvent};
use crate::receipts::{ReceiptController, ReceiptEvent, ReceiptOutcome};
use crate::settings::ReceiptSettingsSource;
use crate::storage::{Conversation, Message, SyncStore};
use crate::view_once::{ViewOnceOpenEvent, ViewOnceOutcome, ViewOnceSyncController};

/// 各缓冲区当前待处理数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingCounts {
    pub receipts: usize,
    pub view_once: usize,
    pub message_requests: usize,
}

impl PendingCounts {
    pub fn total(&self) -> usize {
        self.receipts + self.view_once + self.message_requests
    }
}

/// 同步事件对账上下文
pub struct SyncEventContext {
    config: SyncEventConfig,
    store: Arc<dyn SyncStore>,
    events: Arc<EventManager>,
    cleanup: Arc<DeleteSentProtoBatcher>,
    receipts: Arc<ReceiptController>,
    view_once: Arc<ViewOnceSyncController>,
    message_requests: Arc<MessageRequestController>,
}

impl SyncEventContext {
    pub fn new(
        config: SyncEventConfig,
        store: Arc<dyn SyncStore>,
        settings: Arc<dyn ReceiptSettingsSource>,
    ) -> Self {
        let events = Arc::new(EventManager::new(config.event_channel_capacity));
        let cleanup = Arc::new(Batcher::new(
            "delete_sent_proto",
            config.cleanup_batch.clone(),
            Arc::new(DeleteSentProtoProcessor::new(store.clone(), events.clone())),
        ));
        let receipts = Arc::new(ReceiptController::new(
            store.clone(),
            settings,
            events.clone(),
            cleanup.clone(),
            config.execution_mode,
        ));
        let view_once = Arc::new(ViewOnceSyncController::new(store.clone(), events.clone()));
        let message_requests = Arc::new(MessageRequestController::new(store.clone(), events.clone()));

        info!(
            "🔄 同步事件对账上下文已创建: version={}, mode={:?}, max_age={:?}",
            crate::version::VERSION,
            config.execution_mode,
            config.pending_event_max_age()
        );

        Self {
            config,
            store,
            events,
            cleanup,
            receipts,
            view_once,
            message_requests,
        }
    }

    pub fn config(&self) -> &SyncEventConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SyncStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn receipts(&self) -> &ReceiptController {
        &self.receipts
    }

    pub fn view_once(&self) -> &ViewOnceSyncController {
        &self.view_once
    }

    pub fn message_requests(&self) -> &MessageRequestController {
        &self.message_requests
    }

    pub fn cleanup_batcher(&self) -> &DeleteSentProtoBatcher {
        &self.cleanup
    }

    pub async fn on_receipt(&self, event: ReceiptEvent) -> ReceiptOutcome {
        self.receipts.on_receipt(event).await
    }

    pub async fn on_view_once_sync(&self, event: ViewOnceOpenEvent) -> ViewOnceOutcome {
        self.view_once.on_sync(event).await
    }

    pub async fn on_message_request_response(&self, event: MessageRequestResponseEvent) -> MessageRequestOutcome {
        self.message_requests.on_response(event).await
    }

    /// 新消息落库前调用：合并早到的回执与一次性消息同步
    ///
    /// 返回 true 表示消息被修改，调用方保存的应是修改后的版本。
    pub async fn prepare_message(&self, message: &mut Message) -> bool {
        let receipts_changed = self.receipts.apply_pending(message).await;
        let view_once_changed = self.view_once.apply_pending(message);
        receipts_changed || view_once_changed
    }

    /// 新会话出现后调用：应用早到的消息请求响应
    pub async fn prepare_conversation(&self, conversation: &Conversation) -> Option<MessageRequestOutcome> {
        let event = self.message_requests.for_conversation(conversation)?;
        let outcome = match self.message_requests.apply(conversation.clone(), &event).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    "❌ 早到消息请求响应处理失败: conversation_id={}, error={}",
                    conversation.id,
                    e
                );
                MessageRequestOutcome::Failed
            }
        };
        Some(outcome)
    }

    pub fn pending_counts(&self) -> PendingCounts {
        PendingCounts {
            receipts: self.receipts.buffer().len(),
            view_once: self.view_once.buffer().len(),
            message_requests: self.message_requests.buffer().len(),
        }
    }

    /// 立即处理所有排队的协议清理请求
    pub async fn flush_cleanup(&self) {
        self.cleanup.flush_and_wait().await;
    }

    /// 淘汰超龄的早到事件；未配置最长保留时间时不做任何事
    pub fn evict_expired(&self) -> PendingCounts {
        match self.config.pending_event_max_age() {
            Some(max_age) => evict_all(&self.receipts, &self.view_once, &self.message_requests, max_age),
            None => PendingCounts::default(),
        }
    }

    /// 启动后台淘汰任务；未配置最长保留时间时返回 None
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        let max_age = self.config.pending_event_max_age()?;
        let sweep_interval = self.config.sweep_interval();
        let receipts = self.receipts.clone();
        let view_once = self.view_once.clone();
        let message_requests = self.message_requests.clone();

        Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_interval);
            loop {
                interval.tick().await;
                let evicted = evict_all(&receipts, &view_once, &message_requests, max_age);
                if evicted.total() > 0 {
                    debug!("后台淘汰完成: {:?}", evicted);
                }
            }
        }))
    }
}

fn evict_all(
    receipts: &ReceiptController,
    view_once: &ViewOnceSyncController,
    message_requests: &MessageRequestController,
    max_age: Duration,
) -> PendingCounts {
    PendingCounts {
        receipts: receipts.buffer().evict_older_than(max_age),
        view_once: view_once.buffer().evict_older_than(max_age),
        message_requests: message_requests.buffer().evict_older_than(max_age),
    }
}
