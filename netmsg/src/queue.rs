//! 线程安全双端队列
//!
//! IO 执行上下文与应用线程之间唯一共享的数据结构。
//! 所有操作互斥；`wait` 通过条件变量阻塞等待，不忙轮询。

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{NetError, Result};

/// 线程安全双端队列
///
/// 对消息和连接一无所知，仅提供并发安全的双端存取与阻塞等待。
pub struct TsQueue<T> {
    items: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> TsQueue<T> {
    /// 创建空队列
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    // 队列本体是普通 VecDeque，持锁线程 panic 也不会留下结构性损坏，
    // 因此毒锁直接取回内部数据继续使用。
    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 追加到队尾，唤醒一个阻塞等待者
    pub fn push_back(&self, item: T) {
        self.lock().push_back(item);
        self.ready.notify_one();
    }

    /// 追加到队首，唤醒一个阻塞等待者
    pub fn push_front(&self, item: T) {
        self.lock().push_front(item);
        self.ready.notify_one();
    }

    /// 非阻塞弹出队首元素，空队列返回 [`NetError::QueueEmpty`]
    pub fn pop_front(&self) -> Result<T> {
        self.lock().pop_front().ok_or(NetError::QueueEmpty)
    }

    /// 非阻塞弹出队尾元素，空队列返回 [`NetError::QueueEmpty`]
    pub fn pop_back(&self) -> Result<T> {
        self.lock().pop_back().ok_or(NetError::QueueEmpty)
    }

    /// 队列是否为空
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// 当前元素个数
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// 清空队列
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// 阻塞当前线程直到队列非空
    ///
    /// 由任意一次 push 唤醒。返回后元素可能已被其他消费者取走，
    /// 调用方仍需处理 `pop_front` 失败。
    pub fn wait(&self) {
        let mut items = self.lock();
        while items.is_empty() {
            items = self
                .ready
                .wait(items)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl<T> Default for TsQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}
