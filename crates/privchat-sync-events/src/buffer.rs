//! 待处理事件缓冲区
//!
//! 同步事件可能比它指向的消息/会话先到达。缓冲区按到达顺序保存这些事件，
//! 目标实体出现时由其所有者通过谓词扫描取走。
//!
//! - 不去重：重复回执合法，由发送状态格的幂等合并消化
//! - 出口只有移除：匹配消费、策略丢弃、或超龄淘汰

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// 缓冲区内条目的标识，仅在所属缓冲区内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingId(u64);

impl PendingId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
struct PendingEntry<E> {
    id: PendingId,
    received_at: Instant,
    event: E,
}

#[derive(Debug)]
struct Inner<E> {
    entries: VecDeque<PendingEntry<E>>,
    next_id: u64,
    stats: BufferStats,
}

/// 缓冲区统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufferStats {
    /// 累计入队数
    pub buffered: u64,
    /// 被目标匹配取走的数量
    pub matched: u64,
    /// 超龄淘汰的数量
    pub evicted: u64,
    /// 按 ID 直接移除的数量（已处理 / 策略丢弃 / 出错）
    pub removed: u64,
}

/// 单一事件类型的待处理缓冲区
#[derive(Debug)]
pub struct PendingBuffer<E> {
    name: &'static str,
    inner: Mutex<Inner<E>>,
}

impl<E: Clone> PendingBuffer<E> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
                stats: BufferStats::default(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// 追加事件，O(1)
    pub fn add(&self, event: E) -> PendingId {
        let mut inner = self.inner.lock();
        let id = PendingId(inner.next_id);
        inner.next_id += 1;
        inner.entries.push_back(PendingEntry {
            id,
            received_at: Instant::now(),
            event,
        });
        inner.stats.buffered += 1;
        debug!("[{}] 事件入缓冲: id={}, pending={}", self.name, id.0, inner.entries.len());
        id
    }

    /// 按 ID 移除；已被别处取走时返回 None
    pub fn remove(&self, id: PendingId) -> Option<E> {
        let mut inner = self.inner.lock();
        let index = inner.entries.iter().position(|entry| entry.id == id)?;
        let entry = inner.entries.remove(index)?;
        inner.stats.removed += 1;
        Some(entry.event)
    }

    pub fn contains(&self, id: PendingId) -> bool {
        self.inner.lock().entries.iter().any(|entry| entry.id == id)
    }

    /// 取走所有满足谓词的事件，按到达顺序返回
    pub fn take_where<F>(&self, mut predicate: F) -> Vec<E>
    where
        F: FnMut(&E) -> bool,
    {
        let mut inner = self.inner.lock();
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(inner.entries.len());
        for entry in inner.entries.drain(..) {
            if predicate(&entry.event) {
                taken.push(entry.event);
            } else {
                kept.push_back(entry);
            }
        }
        inner.entries = kept;
        inner.stats.matched += taken.len() as u64;
        if !taken.is_empty() {
            debug!("[{}] 目标出现，取走 {} 个早到事件", self.name, taken.len());
        }
        taken
    }

    /// 取走最早一个满足谓词的事件
    pub fn take_first_where<F>(&self, predicate: F) -> Option<E>
    where
        F: Fn(&E) -> bool,
    {
        let mut inner = self.inner.lock();
        let index = inner.entries.iter().position(|entry| predicate(&entry.event))?;
        let entry = inner.entries.remove(index)?;
        inner.stats.matched += 1;
        Some(entry.event)
    }

    /// 淘汰停留超过 `max_age` 的事件，返回淘汰数量
    pub fn evict_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner
            .entries
            .retain(|entry| now.saturating_duration_since(entry.received_at) <= max_age);
        let evicted = before - inner.entries.len();
        inner.stats.evicted += evicted as u64;
        if evicted > 0 {
            info!("🧹 [{}] 淘汰超龄事件 {} 个，剩余 {} 个", self.name, evicted, inner.entries.len());
        }
        evicted
    }

    /// 当前缓冲内容（按到达顺序）
    pub fn snapshot(&self) -> Vec<E> {
        self.inner
            .lock()
            .entries
            .iter()
            .map(|entry| entry.event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    pub fn stats(&self) -> BufferStats {
        self.inner.lock().stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_allows_duplicates() {
        let buffer = PendingBuffer::new("test");
        let first = buffer.add(7);
        let second = buffer.add(7);
        assert_ne!(first, second);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_remove_by_id_once() {
        let buffer = PendingBuffer::new("test");
        let id = buffer.add("a");
        buffer.add("b");

        assert_eq!(buffer.remove(id), Some("a"));
        assert_eq!(buffer.remove(id), None);
        assert_eq!(buffer.snapshot(), vec!["b"]);
    }

    #[test]
    fn test_take_where_returns_in_arrival_order() {
        let buffer = PendingBuffer::new("test");
        for value in [1, 2, 3, 4, 5] {
            buffer.add(value);
        }

        let even = buffer.take_where(|v| v % 2 == 0);
        assert_eq!(even, vec![2, 4]);
        assert_eq!(buffer.snapshot(), vec![1, 3, 5]);
        assert!(buffer.take_where(|v| v % 2 == 0).is_empty());
        assert_eq!(buffer.stats().matched, 2);
    }

    #[test]
    fn test_take_first_where_takes_oldest() {
        let buffer = PendingBuffer::new("test");
        buffer.add((1, "old"));
        buffer.add((1, "new"));

        assert_eq!(buffer.take_first_where(|(k, _)| *k == 1), Some((1, "old")));
        assert_eq!(buffer.len(), 1);
    }

    #[test]
    fn test_evict_older_than() {
        let buffer = PendingBuffer::new("test");
        buffer.add(1);
        std::thread::sleep(Duration::from_millis(20));
        buffer.add(2);

        assert_eq!(buffer.evict_older_than(Duration::from_millis(10)), 1);
        assert_eq!(buffer.snapshot(), vec![2]);
        assert_eq!(buffer.stats().evicted, 1);
    }
}
