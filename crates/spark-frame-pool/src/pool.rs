use core::{
    mem,
    sync::atomic::{AtomicU64, Ordering},
};
use std::{collections::VecDeque, sync::Arc};

use bytes::BytesMut;
use spin::Mutex;

use crate::{
    allocator::{BufferAllocator, HeapAllocator},
    config::PoolConfig,
    error::{PoolError, Result},
    lease::{FrameLease, ReleaseOutcome},
    observer::{PoolEvent, PoolObserver, TracingObserver},
    record::{BufferId, BufferRecord, BufferTag, PoolId},
};

/// `FramePool` 提供定长、可调整尺寸的帧缓冲池。
///
/// # 模块角色（Why）
/// - 以预分配缓冲的“租借 / 归还”替代高频的分配与释放，避免传感器流水线中的分配抖动；
/// - 通过引用计数与延迟销毁，保证调整尺寸或关闭时仍被持有的缓冲不会被提前释放。
///
/// # 核心机制（How）
/// - 内部以 `spin::Mutex<PoolState>` 串行化全部集合变更：`all` 记录池已知的全部缓冲，
///   `free` 为按 FIFO 顺序出租的空闲子集；
/// - 租借从 `free` 头部取出缓冲并将引用计数置为 1，返回 [`FrameLease`]；
/// - 引用计数位于共享记录中的原子整数，复制句柄无需加锁；最后一个句柄释放时回到池锁内结算；
/// - 调整尺寸在**同一临界区**内完成回收与重新分配，并发租借只会看到调整前或调整后的空闲链表。
///
/// # 契约说明（What）
/// - **线程安全**：`FramePool` 为 `Send + Sync + Clone`，副本共享同一池；
/// - 租借从不阻塞：空闲链表为空时立即返回 [`PoolError::Exhausted`]；
/// - 分配与销毁钩子、观测回调在池锁内执行，不得回调同一池。
///
/// # 设计权衡（Trade-offs）
/// - 调整尺寸期间的分配延迟会以锁竞争的形式被其它调用方观察到；
/// - 使用自旋锁与 `spark-buffer` 保持一致，临界区仅包含簿记与钩子调用。
///
/// ```
/// use spark_frame_pool::{FramePool, HeapAllocator};
///
/// let pool = FramePool::initialize(1024, HeapAllocator::new(2)).unwrap();
/// let frame = pool.lease().unwrap();
/// assert_eq!(frame.size(), 1024);
/// drop(frame);
/// assert_eq!(pool.stats().free_buffers, 2);
/// ```
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

/// 池状态快照。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// 当前新分配缓冲使用的字节数。
    pub buffer_size: usize,
    /// 池已知的缓冲数（空闲、租借中与待销毁）。
    pub total_buffers: usize,
    /// 可立即租借的缓冲数。
    pub free_buffers: usize,
    /// 引用计数大于 0 的缓冲数。
    pub leased_buffers: usize,
    /// 已标记待销毁、等待最后一次释放的缓冲数。
    pub pending_destroy: usize,
    /// 下一个将分配的缓冲编号。
    pub next_id: u64,
    /// 累计成功租借次数。
    pub leases_granted: u64,
    /// 累计因空闲链表为空而失败的租借次数。
    pub exhaustions: u64,
    /// 累计交给销毁钩子的缓冲数。
    pub buffers_destroyed: u64,
    /// 池是否已关闭。
    pub shut_down: bool,
}

/// 关闭池的结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 本次交给销毁钩子的缓冲数。
    pub destroyed: usize,
    /// 其中仍被持有、被强制销毁的缓冲数。
    pub forced: usize,
}

impl FramePool {
    /// 以给定尺寸与分配策略初始化池，并执行首轮分配。
    ///
    /// 分配钩子失败时返回 [`PoolError::AllocationFailed`]，已部分分配的缓冲随池一起销毁。
    pub fn initialize(buffer_size: usize, allocator: impl BufferAllocator) -> Result<Self> {
        Self::builder()
            .buffer_size(buffer_size)
            .allocator(allocator)
            .build()
    }

    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    pub fn id(&self) -> PoolId {
        self.inner.id
    }

    /// 配置中的可读名称。
    pub fn label(&self) -> Option<&str> {
        self.inner.label.as_deref()
    }

    /// 当前新分配缓冲的字节数。
    pub fn buffer_size(&self) -> usize {
        self.inner.state.lock().buffer_size
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.state.lock().shut_down
    }

    /// 调整缓冲尺寸：回收空闲缓冲、将仍被持有的缓冲标记为待销毁，再按新尺寸分配。
    ///
    /// # 契约说明（What）
    /// - 整个过程位于同一临界区，并发租借不会观察到新旧缓冲混合的空闲链表；
    /// - 分配钩子失败时，池保留失败前已登记的新缓冲并返回 [`PoolError::AllocationFailed`]，
    ///   待销毁缓冲不受影响，仍在最后一次释放时销毁；
    /// - 返回本次新登记的缓冲数。
    pub fn change_buffer_size(&self, buffer_size: usize) -> Result<usize> {
        if buffer_size == 0 {
            return Err(PoolError::invalid_config(
                "buffer_size",
                "buffer size must be greater than zero",
            ));
        }
        let inner = &self.inner;
        let mut state = inner.state.lock();
        inner.ensure_open(&state)?;

        inner.emit(&PoolEvent::Resizing {
            from: state.buffer_size,
            to: buffer_size,
        });
        state.buffer_size = buffer_size;
        inner.reclaim_locked(&mut state, false);
        let allocated = inner.allocate_locked(&mut state, buffer_size)?;
        inner.emit(&PoolEvent::Resized {
            buffer_size,
            buffers: allocated,
        });
        Ok(allocated)
    }

    /// 登记一个外部提供的缓冲，立即可供租借。
    ///
    /// 缓冲字节数取自 `buffer.len()`，可与当前 [`FramePool::buffer_size`] 不同。
    pub fn add_new_buffer(&self, buffer: BytesMut) -> Result<BufferId> {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        inner.ensure_open(&state)?;
        Ok(inner.register_locked(&mut state, buffer))
    }

    /// 租借空闲链表头部（最早归还）的缓冲。
    ///
    /// 空闲链表为空时返回 [`PoolError::Exhausted`] 且不修改池状态；调用方应视其为背压，
    /// 例如丢弃当前帧或稍后重试。
    pub fn lease(&self) -> Result<FrameLease> {
        let inner = &self.inner;
        let record = {
            let mut state = inner.state.lock();
            inner.ensure_open(&state)?;
            let Some(record) = state.free.pop_front() else {
                inner.counters.exhaustions.fetch_add(1, Ordering::Relaxed);
                inner.emit(&PoolEvent::Exhausted);
                return Err(PoolError::Exhausted { pool: inner.id });
            };
            record.mark_leased();
            inner.counters.leases_granted.fetch_add(1, Ordering::Relaxed);
            inner.emit(&PoolEvent::Leased {
                buffer: record.id(),
            });
            record
        };
        Ok(FrameLease::new(Arc::clone(inner), record))
    }

    /// 为已租借缓冲增加一个引用单位，返回对应的新句柄。
    ///
    /// 句柄属于其它池时返回 [`PoolError::ForeignBuffer`]；缓冲已被强制回收时返回
    /// [`PoolError::BufferReclaimed`]。
    pub fn add_ref(&self, lease: &FrameLease) -> Result<FrameLease> {
        self.check_owned(lease)?;
        if lease.is_reclaimed() {
            return Err(PoolError::BufferReclaimed { tag: lease.tag() });
        }
        Ok(lease.retained())
    }

    /// 复制引用：第二个独立持有者获得自己的释放生命周期，而不必重新租借。
    ///
    /// 引用计数语义与 [`FramePool::add_ref`] 相同。
    pub fn duplicate_reference(&self, source: &FrameLease) -> Result<FrameLease> {
        self.add_ref(source)
    }

    /// 释放一个引用单位。
    ///
    /// 句柄属于其它池时返回 [`PoolError::ForeignBuffer`]，句柄仍按其所属池正常释放。
    pub fn release(&self, lease: FrameLease) -> Result<ReleaseOutcome> {
        self.check_owned(&lease)?;
        lease.release()
    }

    /// 关闭池：无论引用计数如何，销毁全部缓冲。
    ///
    /// 仍被持有的句柄此后访问数据将得到 [`PoolError::BufferReclaimed`]，释放它们是安全的空操作。
    /// 重复关闭返回空报告。
    pub fn shutdown(&self) -> ShutdownReport {
        let inner = &self.inner;
        let mut state = inner.state.lock();
        if state.shut_down {
            return ShutdownReport::default();
        }
        let report = inner.reclaim_locked(&mut state, true);
        state.shut_down = true;
        inner.emit(&PoolEvent::ShutDown {
            destroyed: report.destroyed,
            forced: report.forced,
        });
        report
    }

    /// 读取池状态快照。
    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = inner.state.lock();
        PoolStats {
            buffer_size: state.buffer_size,
            total_buffers: state.all.len(),
            free_buffers: state.free.len(),
            leased_buffers: state.all.iter().filter(|r| r.refs() > 0).count(),
            pending_destroy: state
                .all
                .iter()
                .filter(|r| r.is_pending_destroy())
                .count(),
            next_id: state.next_id,
            leases_granted: inner.counters.leases_granted.load(Ordering::Relaxed),
            exhaustions: inner.counters.exhaustions.load(Ordering::Relaxed),
            buffers_destroyed: inner.counters.buffers_destroyed.load(Ordering::Relaxed),
            shut_down: state.shut_down,
        }
    }

    /// 按出租顺序列出空闲缓冲编号。
    pub fn free_buffer_ids(&self) -> Vec<BufferId> {
        self.inner.state.lock().free.iter().map(|r| r.id()).collect()
    }

    /// 按登记顺序列出池已知的全部缓冲编号。
    pub fn buffer_ids(&self) -> Vec<BufferId> {
        self.inner.state.lock().all.iter().map(|r| r.id()).collect()
    }

    fn check_owned(&self, lease: &FrameLease) -> Result<()> {
        if lease.pool_id() == self.inner.id {
            Ok(())
        } else {
            Err(PoolError::ForeignBuffer {
                expected: self.inner.id,
                found: lease.pool_id(),
            })
        }
    }
}

impl core::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FramePool")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("stats", &self.stats())
            .finish()
    }
}

/// `FramePool` 构建器。
///
/// 未指定分配器时使用 [`HeapAllocator`]，每次分配 `buffer_count` 个缓冲（此时个数必须大于 0）；
/// 未指定观测者时使用 [`TracingObserver`]。
pub struct PoolBuilder {
    config: PoolConfig,
    allocator: Option<Arc<dyn BufferAllocator>>,
    observer: Arc<dyn PoolObserver>,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolBuilder {
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            allocator: None,
            observer: Arc::new(TracingObserver),
        }
    }

    /// 以现有配置为基础构建。
    pub fn from_config(config: PoolConfig) -> Self {
        Self {
            config,
            ..Self::new()
        }
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.config.buffer_size = buffer_size;
        self
    }

    pub fn buffer_count(mut self, buffer_count: usize) -> Self {
        self.config.buffer_count = buffer_count;
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.config.label = Some(label.into());
        self
    }

    pub fn allocator(mut self, allocator: impl BufferAllocator) -> Self {
        self.allocator = Some(Arc::new(allocator));
        self
    }

    /// 注入共享的分配器，便于调用方保留句柄观察分配统计。
    pub fn shared_allocator(mut self, allocator: Arc<dyn BufferAllocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn observer(mut self, observer: impl PoolObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn shared_observer(mut self, observer: Arc<dyn PoolObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// 校验配置并执行首轮分配。
    pub fn build(self) -> Result<FramePool> {
        self.config.validate_buffer_size()?;
        let PoolBuilder {
            config,
            allocator,
            observer,
        } = self;
        let allocator: Arc<dyn BufferAllocator> = match allocator {
            Some(allocator) => allocator,
            None => {
                config.validate_buffer_count()?;
                Arc::new(HeapAllocator::new(config.buffer_count))
            }
        };
        let inner = Arc::new(PoolInner {
            id: PoolId::next(),
            label: config.label,
            allocator,
            observer,
            counters: PoolCounters::default(),
            state: Mutex::new(PoolState::new(config.buffer_size)),
        });

        {
            let mut state = inner.state.lock();
            let allocated = inner.allocate_locked(&mut state, config.buffer_size)?;
            inner.emit(&PoolEvent::Initialized {
                buffer_size: config.buffer_size,
                buffers: allocated,
            });
        }
        Ok(FramePool { inner })
    }
}

struct PoolState {
    buffer_size: usize,
    next_id: u64,
    all: Vec<Arc<BufferRecord>>,
    free: VecDeque<Arc<BufferRecord>>,
    shut_down: bool,
}

impl PoolState {
    fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            next_id: 0,
            all: Vec::new(),
            free: VecDeque::new(),
            shut_down: false,
        }
    }

    fn position(&self, record: &Arc<BufferRecord>) -> Option<usize> {
        self.all.iter().position(|r| Arc::ptr_eq(r, record))
    }
}

#[derive(Default)]
struct PoolCounters {
    leases_granted: AtomicU64,
    exhaustions: AtomicU64,
    buffers_destroyed: AtomicU64,
}

pub(crate) struct PoolInner {
    id: PoolId,
    label: Option<String>,
    allocator: Arc<dyn BufferAllocator>,
    observer: Arc<dyn PoolObserver>,
    counters: PoolCounters,
    state: Mutex<PoolState>,
}

impl PoolInner {
    pub(crate) fn emit(&self, event: &PoolEvent) {
        self.observer.on_event(self.id, event);
    }

    fn ensure_open(&self, state: &PoolState) -> Result<()> {
        if state.shut_down {
            Err(PoolError::ShutDown { pool: self.id })
        } else {
            Ok(())
        }
    }

    /// 以新编号登记缓冲，同时加入全集与空闲链表尾部。
    fn register_locked(&self, state: &mut PoolState, storage: BytesMut) -> BufferId {
        let id = BufferId::from_raw(state.next_id);
        state.next_id += 1;
        let record = Arc::new(BufferRecord::new(BufferTag::new(self.id, id), storage));
        self.emit(&PoolEvent::Created {
            buffer: id,
            size: record.size(),
        });
        state.all.push(Arc::clone(&record));
        state.free.push_back(record);
        id
    }

    /// 调用分配钩子并登记产出的缓冲，返回登记数量。
    ///
    /// 部分失败时先登记已产出的缓冲，再返回 [`PoolError::AllocationFailed`]。
    fn allocate_locked(&self, state: &mut PoolState, size: usize) -> Result<usize> {
        match self.allocator.allocate_buffers(size) {
            Ok(buffers) => {
                let count = buffers.len();
                for buffer in buffers {
                    self.register_locked(state, buffer);
                }
                Ok(count)
            }
            Err(err) => {
                let (reason, partial) = err.into_parts();
                let registered = partial.len();
                for buffer in partial {
                    self.register_locked(state, buffer);
                }
                self.emit(&PoolEvent::AllocationFailed {
                    size,
                    registered,
                    reason: reason.clone(),
                });
                Err(PoolError::AllocationFailed {
                    pool: self.id,
                    requested_size: size,
                    reason,
                })
            }
        }
    }

    /// 回收缓冲。
    ///
    /// 单次遍历把全集划分为“立即销毁”与“保留”两组：`force` 为真或引用计数为 0 的缓冲立即销毁，
    /// 其余标记为待销毁并保留在全集中。最后清空空闲链表。
    fn reclaim_locked(&self, state: &mut PoolState, force: bool) -> ShutdownReport {
        let (doomed, retained): (Vec<_>, Vec<_>) = mem::take(&mut state.all)
            .into_iter()
            .partition(|record| force || record.refs() == 0);

        for record in &retained {
            record.mark_pending_destroy();
            self.emit(&PoolEvent::MarkedForDestruction {
                buffer: record.id(),
                refs: record.refs(),
            });
        }
        state.all = retained;

        let mut report = ShutdownReport::default();
        for record in &doomed {
            if record.refs() > 0 {
                record.mark_pending_destroy();
                report.forced += 1;
            }
            if self.destroy(record) {
                report.destroyed += 1;
            }
        }
        state.free.clear();
        report
    }

    /// 将缓冲存储交给销毁钩子；存储已被取走时返回 `false`。
    fn destroy(&self, record: &BufferRecord) -> bool {
        match record.take_storage() {
            Some(storage) => {
                self.emit(&PoolEvent::Destroyed {
                    buffer: record.id(),
                });
                self.allocator.destroy_buffer(storage);
                self.counters.buffers_destroyed.fetch_add(1, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    /// 最后一个引用释放后的结算：待销毁则销毁，否则回到空闲链表尾部。
    pub(crate) fn settle(&self, record: &Arc<BufferRecord>) -> ReleaseOutcome {
        let mut state = self.state.lock();
        let Some(position) = state.position(record) else {
            // 已被调整尺寸或关闭流程回收。只有回收时仍被持有（带待销毁标记）的缓冲才算越过池生命周期；
            // 计数已归零、尚未进入结算的缓冲被回收属于正常竞争。
            if state.shut_down && record.is_pending_destroy() {
                self.emit(&PoolEvent::ReleasedAfterReclaim {
                    buffer: record.id(),
                });
            }
            return ReleaseOutcome::Destroyed;
        };

        if record.is_pending_destroy() {
            state.all.remove(position);
            self.destroy(record);
            ReleaseOutcome::Destroyed
        } else {
            state.free.push_back(Arc::clone(record));
            self.emit(&PoolEvent::Returned {
                buffer: record.id(),
            });
            ReleaseOutcome::Returned
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if !state.shut_down {
            self.reclaim_locked(&mut state, true);
            state.shut_down = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{allocator::AllocationError, observer::NoopObserver};

    fn pool(count: usize, size: usize) -> FramePool {
        FramePool::builder()
            .buffer_size(size)
            .allocator(HeapAllocator::new(count))
            .observer(NoopObserver)
            .build()
            .expect("初始化不应失败")
    }

    #[test]
    fn free_list_is_fifo() {
        let pool = pool(3, 8);
        let a = pool.lease().expect("租借 0");
        let b = pool.lease().expect("租借 1");
        drop(b);
        drop(a);
        assert_eq!(
            pool.free_buffer_ids(),
            vec![
                BufferId::from_raw(2),
                BufferId::from_raw(1),
                BufferId::from_raw(0)
            ]
        );
        assert_eq!(pool.lease().expect("租借").id(), BufferId::from_raw(2));
    }

    #[test]
    fn reclaim_partitions_free_and_leased_buffers() {
        let pool = pool(3, 8);
        let held = pool.lease().expect("租借");
        {
            let mut state = pool.inner.state.lock();
            let report = pool.inner.reclaim_locked(&mut state, false);
            assert_eq!(report.destroyed, 2);
            assert_eq!(report.forced, 0);
            assert_eq!(state.all.len(), 1);
            assert!(state.free.is_empty());
        }
        assert!(held.is_pending_destroy());
        assert_eq!(held.release(), Ok(ReleaseOutcome::Destroyed));
        assert_eq!(pool.stats().total_buffers, 0);
    }

    #[test]
    fn zero_resize_is_rejected_without_side_effects() {
        let pool = pool(2, 8);
        let err = pool.change_buffer_size(0).expect_err("零尺寸非法");
        assert_eq!(err.code(), crate::error::codes::POOL_INVALID_CONFIG);
        assert_eq!(pool.stats().free_buffers, 2);
        assert_eq!(pool.buffer_size(), 8);
    }

    #[derive(Default)]
    struct EventLog(Mutex<Vec<PoolEvent>>);

    impl PoolObserver for EventLog {
        fn on_event(&self, _pool: PoolId, event: &PoolEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[test]
    fn in_flight_release_racing_shutdown_is_not_reported() {
        let log = Arc::new(EventLog::default());
        let pool = FramePool::builder()
            .buffer_size(8)
            .allocator(HeapAllocator::new(1))
            .shared_observer(log.clone())
            .build()
            .expect("初始化");
        let lease = pool.lease().expect("租借");
        let record = Arc::clone(&pool.inner.state.lock().all[0]);

        // 最后一次释放已将计数归零，但尚未进入池锁结算时，关闭流程抢先回收。
        assert_eq!(record.release(), 0);
        let report = pool.shutdown();
        assert_eq!(report.forced, 0);
        assert_eq!(pool.inner.settle(&record), ReleaseOutcome::Destroyed);

        // 恢复句柄持有的引用单位，使其丢弃路径保持配对。
        record.mark_leased();
        drop(lease);
        assert!(
            !log.0
                .lock()
                .iter()
                .any(|event| matches!(event, PoolEvent::ReleasedAfterReclaim { .. }))
        );
    }

    struct FailingAllocator;

    impl BufferAllocator for FailingAllocator {
        fn allocate_buffers(
            &self,
            _size: usize,
        ) -> core::result::Result<Vec<BytesMut>, AllocationError> {
            Err(AllocationError::new("device memory unavailable"))
        }

        fn destroy_buffer(&self, _buffer: BytesMut) {}
    }

    #[test]
    fn initialization_failure_surfaces_allocation_error() {
        let err = FramePool::builder()
            .buffer_size(16)
            .allocator(FailingAllocator)
            .observer(NoopObserver)
            .build()
            .expect_err("分配钩子失败");
        assert!(err.is_allocation_failure());
        assert!(matches!(err, PoolError::AllocationFailed { requested_size: 16, .. }));
    }
}
