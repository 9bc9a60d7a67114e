use core::sync::atomic::{AtomicUsize, Ordering};
use std::collections::HashSet;

use bytes::BytesMut;
use spin::Mutex;

/// `BufferAllocator` 描述池获取与归还原始内存的策略钩子。
///
/// # 设计初衷（Why）
/// - 池只负责租借、引用计数与回收的簿记；内存究竟来自堆、DMA 区域还是设备映射，
///   交由策略实现决定。
///
/// # 契约定义（What）
/// - `allocate_buffers(size)`：产出零个或多个**恰好** `size` 字节的缓冲，池获得其所有权；
///   失败时可通过 [`AllocationError::partial`] 交回已产出的部分缓冲，池会先登记它们再报告失败；
/// - `destroy_buffer(buffer)`：释放单个缓冲，不得失败、不得 panic（可能在 `Drop` 路径上调用）；
/// - 两个方法都在池锁内被调用，实现不得反向调用同一池的任何方法。
pub trait BufferAllocator: Send + Sync + 'static {
    /// 按给定字节数批量分配缓冲。
    fn allocate_buffers(&self, size: usize) -> Result<Vec<BytesMut>, AllocationError>;

    /// 销毁一个由本分配器产出、或经 `add_new_buffer` 登记的缓冲。
    fn destroy_buffer(&self, buffer: BytesMut);
}

/// 分配钩子的失败结果。
///
/// `partial` 携带失败前已经成功产出的缓冲；池会登记它们以降级容量继续工作。
#[derive(Debug, Default)]
pub struct AllocationError {
    reason: String,
    partial: Vec<BytesMut>,
}

impl AllocationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            partial: Vec::new(),
        }
    }

    /// 附带已成功分配的部分缓冲。
    pub fn with_partial(mut self, partial: Vec<BytesMut>) -> Self {
        self.partial = partial;
        self
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn partial(&self) -> &[BytesMut] {
        &self.partial
    }

    /// 拆分为失败原因与部分缓冲。
    pub fn into_parts(self) -> (String, Vec<BytesMut>) {
        (self.reason, self.partial)
    }
}

/// 基于堆内存的默认分配策略：每次分配固定数量、以零填充的缓冲。
///
/// # 行为描述（How）
/// - `buffer_count`：每次 `allocate_buffers` 产出的缓冲个数；
/// - `max_total_bytes`：可选的存活字节预算，超出预算时返回部分分配结果；
/// - `live_buffers`/`live_bytes`：以原子计数跟踪尚未销毁的缓冲，便于诊断泄漏；
/// - `owned`：本分配器产出缓冲的存储地址。经 `add_new_buffer` 登记的外部缓冲同样会交给
///   `destroy_buffer`，但不在该集合中，既不计入存活统计也不占用预算。
#[derive(Debug)]
pub struct HeapAllocator {
    buffer_count: usize,
    max_total_bytes: Option<usize>,
    live_buffers: AtomicUsize,
    live_bytes: AtomicUsize,
    owned: Mutex<HashSet<usize>>,
}

impl HeapAllocator {
    pub fn new(buffer_count: usize) -> Self {
        Self {
            buffer_count,
            max_total_bytes: None,
            live_buffers: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            owned: Mutex::new(HashSet::new()),
        }
    }

    /// 设置存活字节上限。
    pub fn with_max_total_bytes(mut self, limit: usize) -> Self {
        self.max_total_bytes = Some(limit);
        self
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// 尚未被销毁的缓冲数量。
    pub fn live_buffers(&self) -> usize {
        self.live_buffers.load(Ordering::Relaxed)
    }

    /// 尚未被销毁的缓冲字节总量。
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    fn within_budget(&self, size: usize) -> bool {
        match self.max_total_bytes {
            Some(limit) => self
                .live_bytes
                .load(Ordering::Relaxed)
                .checked_add(size)
                .is_some_and(|total| total <= limit),
            None => true,
        }
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate_buffers(&self, size: usize) -> Result<Vec<BytesMut>, AllocationError> {
        // 零字节缓冲没有独立的存储地址，无法区分归属。
        if size == 0 {
            return Err(AllocationError::new("zero-sized heap buffers are not supported"));
        }
        let mut buffers = Vec::with_capacity(self.buffer_count);
        for index in 0..self.buffer_count {
            if !self.within_budget(size) {
                return Err(AllocationError::new(format!(
                    "heap budget exhausted after {index} of {} buffers",
                    self.buffer_count
                ))
                .with_partial(buffers));
            }
            let buffer = BytesMut::zeroed(size);
            self.owned.lock().insert(buffer.as_ptr() as usize);
            buffers.push(buffer);
            self.live_buffers.fetch_add(1, Ordering::Relaxed);
            self.live_bytes.fetch_add(size, Ordering::Relaxed);
        }
        Ok(buffers)
    }

    fn destroy_buffer(&self, buffer: BytesMut) {
        if !self.owned.lock().remove(&(buffer.as_ptr() as usize)) {
            return;
        }
        let _ = self
            .live_buffers
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(prev.saturating_sub(1))
            });
        let len = buffer.len();
        let _ = self
            .live_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                Some(prev.saturating_sub(len))
            });
        drop(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_allocator_produces_zeroed_buffers_of_exact_size() {
        let allocator = HeapAllocator::new(3);
        let buffers = allocator.allocate_buffers(64).expect("堆分配不应失败");
        assert_eq!(buffers.len(), 3);
        assert!(buffers.iter().all(|buf| buf.len() == 64));
        assert!(buffers.iter().all(|buf| buf.iter().all(|b| *b == 0)));
        assert_eq!(allocator.live_buffers(), 3);
        assert_eq!(allocator.live_bytes(), 192);

        for buf in buffers {
            allocator.destroy_buffer(buf);
        }
        assert_eq!(allocator.live_buffers(), 0);
        assert_eq!(allocator.live_bytes(), 0);
    }

    #[test]
    fn budget_overflow_returns_partial_allocation() {
        let allocator = HeapAllocator::new(4).with_max_total_bytes(100);
        let err = allocator
            .allocate_buffers(40)
            .expect_err("预算只够两个缓冲");
        assert_eq!(err.partial().len(), 2);
        assert!(err.reason().contains("2 of 4"));
        let (_, partial) = err.into_parts();
        for buf in partial {
            allocator.destroy_buffer(buf);
        }
        assert_eq!(allocator.live_bytes(), 0);
    }

    #[test]
    fn foreign_buffers_do_not_touch_live_accounting() {
        let allocator = HeapAllocator::new(1).with_max_total_bytes(64);
        let mut buffers = allocator.allocate_buffers(64).expect("预算内分配");
        allocator.destroy_buffer(BytesMut::zeroed(1000));
        assert_eq!(allocator.live_buffers(), 1);
        assert_eq!(allocator.live_bytes(), 64);
        assert!(allocator.allocate_buffers(64).is_err(), "预算已满");

        if let Some(buf) = buffers.pop() {
            allocator.destroy_buffer(buf);
        }
        assert_eq!(allocator.live_bytes(), 0);
    }

    #[test]
    fn zero_sized_requests_are_rejected() {
        let allocator = HeapAllocator::new(2);
        let err = allocator.allocate_buffers(0).expect_err("零字节缓冲不受支持");
        assert!(err.partial().is_empty());
        assert_eq!(allocator.live_buffers(), 0);
    }
}
