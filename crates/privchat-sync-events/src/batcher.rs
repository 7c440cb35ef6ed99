//! 防抖批处理器
//!
//! 请求先入队，满足以下任一条件时合并成一批交给处理器：
//! - 队首请求等待超过 `max_wait`
//! - 队列达到 `max_size`（立即冲刷恰好 `max_size` 条）
//!
//! `flush_and_wait` 会排空当前所有请求（并等待进行中的批次）后才返回，
//! 供测试 / CI 模式获得确定性行为。
//!
//! 批次串行执行：所有批次都在 `run_lock` 下取队列、调用处理器。

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use crate::config::BatcherConfig;
use crate::error::{Result, SyncEventError};
use crate::events::{event_builders, EventManager};
use crate::storage::{DeleteSentProtoRecipient, SyncStore};

/// 批处理器的实际工作
#[async_trait]
pub trait BatchProcessor<T: Send + 'static>: Send + Sync + 'static {
    async fn process_batch(&self, items: Vec<T>) -> Result<()>;
}

type BatchOutcome = std::result::Result<(), String>;

/// 单个请求的完成凭据；丢弃即“即发即忘”
#[derive(Debug)]
pub struct BatchTicket {
    receiver: oneshot::Receiver<BatchOutcome>,
}

impl BatchTicket {
    /// 等待该请求所在批次处理完成
    pub async fn wait(self) -> Result<()> {
        match self.receiver.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(message)) => Err(SyncEventError::Batch(message)),
            Err(_) => Err(SyncEventError::batch("batch was dropped before completion")),
        }
    }
}

/// 批处理统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatcherStats {
    pub batches: u64,
    pub items: u64,
    pub failed_batches: u64,
}

struct Queued<T> {
    item: T,
    done: oneshot::Sender<BatchOutcome>,
}

struct State<T> {
    queue: VecDeque<Queued<T>>,
    timer_armed: bool,
}

struct Shared<T: Send + 'static> {
    name: &'static str,
    config: BatcherConfig,
    processor: Arc<dyn BatchProcessor<T>>,
    state: Mutex<State<T>>,
    run_lock: tokio::sync::Mutex<()>,
    stats: Mutex<BatcherStats>,
}

impl<T: Send + 'static> Shared<T> {
    fn take_batch(&self) -> Vec<Queued<T>> {
        let mut state = self.state.lock();
        let count = state.queue.len().min(self.config.max_size.max(1));
        state.queue.drain(..count).collect()
    }

    /// 处理恰好一批（最多 max_size 条）
    async fn run_one_batch(&self) {
        let _running = self.run_lock.lock().await;
        let batch = self.take_batch();
        if !batch.is_empty() {
            self.process(batch).await;
        }
    }

    /// 排空队列
    async fn drain_all(&self) {
        let _running = self.run_lock.lock().await;
        loop {
            let batch = self.take_batch();
            if batch.is_empty() {
                break;
            }
            self.process(batch).await;
        }
    }

    async fn process(&self, batch: Vec<Queued<T>>) {
        let size = batch.len();
        let (items, senders): (Vec<T>, Vec<_>) =
            batch.into_iter().map(|queued| (queued.item, queued.done)).unzip();

        debug!("[{}] 处理批次: size={}", self.name, size);
        let outcome = self.processor.process_batch(items).await;

        {
            let mut stats = self.stats.lock();
            stats.batches += 1;
            stats.items += size as u64;
            if outcome.is_err() {
                stats.failed_batches += 1;
            }
        }

        let outcome = match outcome {
            Ok(()) => Ok(()),
            Err(e) => {
                error!("[{}] 批次处理失败: size={}, error={}", self.name, size, e);
                Err(e.to_string())
            }
        };
        for sender in senders {
            // 接收方已丢弃属于即发即忘，忽略
            let _ = sender.send(outcome.clone());
        }
    }
}

/// 防抖批处理器
pub struct Batcher<T: Send + 'static> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Batcher<T> {
    pub fn new(name: &'static str, config: BatcherConfig, processor: Arc<dyn BatchProcessor<T>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                config,
                processor,
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    timer_armed: false,
                }),
                run_lock: tokio::sync::Mutex::new(()),
                stats: Mutex::new(BatcherStats::default()),
            }),
        }
    }

    /// 入队；需要在 tokio 运行时内调用
    pub fn add(&self, item: T) -> BatchTicket {
        let (done, receiver) = oneshot::channel();
        let (arm_timer, flush_now) = {
            let mut state = self.shared.state.lock();
            state.queue.push_back(Queued { item, done });
            let arm_timer = !state.timer_armed;
            state.timer_armed = true;
            // 只在刚好凑满一批时触发，超出部分等下一个窗口或下一次凑满
            let len = state.queue.len();
            (arm_timer, len % self.shared.config.max_size.max(1) == 0)
        };

        if flush_now {
            let shared = self.shared.clone();
            tokio::spawn(async move {
                shared.run_one_batch().await;
            });
        }

        if arm_timer {
            let shared = self.shared.clone();
            let wait = shared.config.max_wait();
            tokio::spawn(async move {
                tokio::time::sleep(wait).await;
                shared.state.lock().timer_armed = false;
                shared.drain_all().await;
            });
        }

        BatchTicket { receiver }
    }

    /// 立即处理当前所有请求，全部完成后返回
    pub async fn flush_and_wait(&self) {
        debug!("[{}] flush_and_wait: pending={}", self.shared.name, self.pending_len());
        self.shared.drain_all().await;
    }

    pub fn pending_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn stats(&self) -> BatcherStats {
        self.shared.stats.lock().clone()
    }
}

/// 清理已发送协议记录：收件人所有设备都确认后，待分享的手机号随之失效
pub struct DeleteSentProtoProcessor {
    store: Arc<dyn SyncStore>,
    events: Arc<EventManager>,
}

impl DeleteSentProtoProcessor {
    pub fn new(store: Arc<dyn SyncStore>, events: Arc<EventManager>) -> Self {
        Self { store, events }
    }
}

#[async_trait]
impl BatchProcessor<DeleteSentProtoRecipient> for DeleteSentProtoProcessor {
    async fn process_batch(&self, items: Vec<DeleteSentProtoRecipient>) -> Result<()> {
        let result = self.store.delete_sent_proto_recipient(&items).await?;

        for service_id in &result.successful_phone_number_shares {
            match self.store.clear_share_my_phone_number_cached(service_id).await {
                Ok(Some(conversation_id)) => {
                    info!(
                        "📵 手机号分享已失效，清除会话标记: service_id={}, conversation_id={}",
                        service_id, conversation_id
                    );
                    self.events
                        .emit(event_builders::phone_number_share_cleared(&conversation_id))
                        .await;
                }
                Ok(None) => {
                    debug!("手机号分享已失效，但本地无对应会话: service_id={}", service_id);
                }
                Err(e) => {
                    warn!("清除手机号分享标记失败: service_id={}, error={}", service_id, e);
                }
            }
        }

        Ok(())
    }
}

/// 已发送协议清理批处理器
pub type DeleteSentProtoBatcher = Batcher<DeleteSentProtoRecipient>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{Conversation, MemoryStore};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingProcessor {
        batches: Mutex<Vec<Vec<u32>>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl BatchProcessor<u32> for RecordingProcessor {
        async fn process_batch(&self, items: Vec<u32>) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.batches.lock().push(items);
            if self.fail.load(Ordering::SeqCst) {
                return Err(SyncEventError::storage("boom"));
            }
            Ok(())
        }
    }

    fn batcher(processor: Arc<RecordingProcessor>) -> Batcher<u32> {
        Batcher::new("test", BatcherConfig::default(), processor)
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_limit_splits_batches() {
        let processor = Arc::new(RecordingProcessor::default());
        let batcher = batcher(processor.clone());

        let tickets: Vec<BatchTicket> = (0..31).map(|i| batcher.add(i)).collect();
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }

        let batches = processor.batches.lock().clone();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 30);
        assert_eq!(batches[1], vec![30]);
        assert_eq!(batcher.stats().items, 31);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_item_waits_for_window() {
        let processor = Arc::new(RecordingProcessor::default());
        let batcher = batcher(processor.clone());

        let tickets: Vec<BatchTicket> = (0..31).map(|i| batcher.add(i)).collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processor.batches.lock().len(), 1);
        assert_eq!(batcher.pending_len(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        assert_eq!(processor.batches.lock()[1], vec![30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_window_flushes_single_batch() {
        let processor = Arc::new(RecordingProcessor::default());
        let batcher = batcher(processor.clone());

        let tickets: Vec<BatchTicket> = (0..5).map(|i| batcher.add(i)).collect();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(processor.batches.lock().is_empty());
        assert_eq!(batcher.pending_len(), 5);

        tokio::time::sleep(Duration::from_millis(100)).await;
        for ticket in tickets {
            ticket.wait().await.unwrap();
        }
        assert_eq!(processor.batches.lock().clone(), vec![vec![0, 1, 2, 3, 4]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_and_wait_completes_before_returning() {
        let processor = Arc::new(RecordingProcessor::default());
        let batcher = batcher(processor.clone());

        batcher.add(1);
        batcher.add(2);
        batcher.flush_and_wait().await;

        assert_eq!(processor.batches.lock().clone(), vec![vec![1, 2]]);
        assert_eq!(batcher.pending_len(), 0);

        // 计时器到期时队列已空，不会产生新批次
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(processor.batches.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_reported_to_tickets() {
        let processor = Arc::new(RecordingProcessor::default());
        processor.fail.store(true, Ordering::SeqCst);
        let batcher = batcher(processor.clone());

        let ticket = batcher.add(9);
        batcher.flush_and_wait().await;

        assert!(matches!(ticket.wait().await, Err(SyncEventError::Batch(_))));
        assert_eq!(batcher.stats().failed_batches, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_sent_proto_clears_share_flag() {
        let store = Arc::new(MemoryStore::new());
        let mut conversation = Conversation::private("c1", None, Some("aci-1".to_string()));
        conversation.share_my_phone_number = true;
        store.insert_conversation(conversation);
        store.insert_sent_proto(100, true, &[("aci-1", 1)]);

        let events = Arc::new(EventManager::new(16));
        let mut receiver = events.subscribe();
        let batcher: DeleteSentProtoBatcher = Batcher::new(
            "delete_sent_proto",
            BatcherConfig::default(),
            Arc::new(DeleteSentProtoProcessor::new(store.clone(), events.clone())),
        );

        let ticket = batcher.add(DeleteSentProtoRecipient {
            timestamp: 100,
            recipient_service_id: "aci-1".to_string(),
            device_id: 1,
        });
        batcher.flush_and_wait().await;
        ticket.wait().await.unwrap();

        assert!(!store.conversation("c1").unwrap().share_my_phone_number);
        assert_eq!(store.conversation_writes(), 0);
        assert_eq!(receiver.recv().await.unwrap().event_type(), "phone_number_share_cleared");
    }
}
