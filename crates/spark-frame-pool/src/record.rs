//! 缓冲身份与单个缓冲的生命周期状态。
//!
//! # 结构说明（How）
//! - [`PoolId`]：进程内唯一的池标识，由全局原子计数器分配；
//! - [`BufferId`]：池内单调递增、永不复用的缓冲编号；
//! - [`BufferTag`]：`(池, 缓冲)` 二元组，句柄以此校验归属，替代裸指针强转；
//! - [`BufferRecord`]：池与持有者共享的跟踪记录，承载引用计数、待销毁标记与底层存储。

use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

use bytes::BytesMut;
use spin::Mutex;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// 池实例标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PoolId(u64);

impl PoolId {
    /// 分配一个新的进程内唯一标识。
    pub(crate) fn next() -> Self {
        Self(NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// 由原始数值构造，主要用于测试与日志回放。
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 池内缓冲编号，严格递增且不复用（即便对应缓冲已被销毁）。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(u64);

impl BufferId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 带池归属的缓冲标签。
///
/// # 契约说明（What）
/// - 池在 `add_ref`/`release` 时比对 `pool` 字段，跨池句柄得到
///   [`PoolError::ForeignBuffer`](crate::PoolError::ForeignBuffer)；
/// - 同一池内 `buffer` 字段唯一，因此标签在进程范围内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferTag {
    pub pool: PoolId,
    pub buffer: BufferId,
}

impl BufferTag {
    pub fn new(pool: PoolId, buffer: BufferId) -> Self {
        Self { pool, buffer }
    }
}

impl fmt::Display for BufferTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pool#{}/buffer#{}", self.pool.0, self.buffer.0)
    }
}

/// `BufferRecord` 是池与全部持有者共享的跟踪记录。
///
/// # 教案式说明
/// - **结构 (How)**：
///   - `refs`：原子引用计数，`0` 表示空闲（或正等待池结算），`>0` 表示被租借；
///   - `pending_destroy`：仅在池锁内写入，标记“最后一次释放时销毁，不再回到空闲链表”；
///   - `storage`：底层字节存储，销毁时被取走，之后句柄访问得到 `BufferReclaimed`。
/// - **契约 (What)**：
///   - `0 -> 1` 的转换只发生在池锁内的租借路径上，且对象必须位于空闲链表；
///   - `n -> n+1` 只能由已持有引用的句柄触发，因此不会与租借竞争；
///   - `1 -> 0` 的转换由最后一个句柄完成，随后在池锁内结算归还或销毁。
pub(crate) struct BufferRecord {
    tag: BufferTag,
    size: usize,
    refs: AtomicUsize,
    pending_destroy: AtomicBool,
    storage: Mutex<Option<BytesMut>>,
}

impl BufferRecord {
    pub(crate) fn new(tag: BufferTag, storage: BytesMut) -> Self {
        Self {
            tag,
            size: storage.len(),
            refs: AtomicUsize::new(0),
            pending_destroy: AtomicBool::new(false),
            storage: Mutex::new(Some(storage)),
        }
    }

    pub(crate) fn tag(&self) -> BufferTag {
        self.tag
    }

    pub(crate) fn id(&self) -> BufferId {
        self.tag.buffer
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn refs(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    /// 租借：空闲 -> 单一持有者。调用方必须持有池锁。
    pub(crate) fn mark_leased(&self) {
        let previous = self.refs.swap(1, Ordering::AcqRel);
        debug_assert_eq!(previous, 0, "只有空闲缓冲可以被租借");
    }

    /// 新增一个引用单位，返回新的计数。
    pub(crate) fn retain(&self) -> usize {
        let previous = self.refs.fetch_add(1, Ordering::AcqRel);
        assert!(previous > 0, "缓冲 {} 未被持有，无法增加引用", self.tag);
        previous + 1
    }

    /// 释放一个引用单位，返回剩余计数。
    pub(crate) fn release(&self) -> usize {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "缓冲 {} 引用计数下溢", self.tag);
        previous - 1
    }

    pub(crate) fn is_pending_destroy(&self) -> bool {
        self.pending_destroy.load(Ordering::Acquire)
    }

    /// 标记为待销毁。调用方必须持有池锁。
    pub(crate) fn mark_pending_destroy(&self) {
        self.pending_destroy.store(true, Ordering::Release);
    }

    /// 取走底层存储，交给销毁钩子；重复调用返回 `None`。
    pub(crate) fn take_storage(&self) -> Option<BytesMut> {
        self.storage.lock().take()
    }

    pub(crate) fn is_reclaimed(&self) -> bool {
        self.storage.lock().is_none()
    }

    /// 在存储锁内访问字节，存储已被取走时返回 `None`。
    pub(crate) fn with_storage<R>(&self, f: impl FnOnce(&mut BytesMut) -> R) -> Option<R> {
        let mut slot = self.storage.lock();
        slot.as_mut().map(f)
    }
}

impl fmt::Debug for BufferRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRecord")
            .field("tag", &self.tag)
            .field("size", &self.size)
            .field("refs", &self.refs())
            .field("pending_destroy", &self.is_pending_destroy())
            .finish()
    }
}
