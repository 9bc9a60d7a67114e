use core::fmt;
use std::sync::Arc;

use crate::{
    error::{PoolError, Result},
    observer::PoolEvent,
    pool::PoolInner,
    record::{BufferId, BufferRecord, BufferTag, PoolId},
};

/// 释放一个引用单位后的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// 仍有其它持有者，`refs` 为剩余引用数。
    StillLeased { refs: usize },
    /// 最后一个引用释放，缓冲回到空闲链表尾部。
    Returned,
    /// 最后一个引用释放，缓冲已被销毁（待销毁标记或已被强制回收）。
    Destroyed,
}

/// `FrameLease` 是对池中一个缓冲的**一个引用单位**。
///
/// # 设计动机（Why）
/// - 以所有权表达引用计数：每个句柄恰好对应一个引用单位，`Clone` 增加一个单位，
///   `Drop` 释放一个单位，调用方不可能“忘记释放”或“重复释放”；
/// - 句柄携带 [`BufferTag`]，池据此拒绝其它池的句柄。
///
/// # 架构关系（How）
/// - `record` 与池共享，引用计数是其中的原子整数，增加引用不需要池锁；
/// - 最后一个句柄释放时进入池锁结算：带待销毁标记则销毁，否则追加到空闲链表尾部；
/// - 句柄持有池内部状态的 `Arc`，因此即使所有 [`FramePool`](crate::FramePool) 副本都已释放，
///   结算路径依然有效。
///
/// # 契约说明（What）
/// - **前置条件**：无；句柄只能由池的租借或既有句柄复制得到；
/// - **后置条件**：`Drop` 或 [`FrameLease::release`] 之后该引用单位不再存在；
/// - 池关闭会强制销毁仍被持有的缓冲，此后数据访问返回 [`PoolError::BufferReclaimed`]，
///   释放依然安全。
pub struct FrameLease {
    pool: Arc<PoolInner>,
    record: Arc<BufferRecord>,
    armed: bool,
}

impl FrameLease {
    pub(crate) fn new(pool: Arc<PoolInner>, record: Arc<BufferRecord>) -> Self {
        Self {
            pool,
            record,
            armed: true,
        }
    }

    pub fn tag(&self) -> BufferTag {
        self.record.tag()
    }

    pub fn id(&self) -> BufferId {
        self.record.id()
    }

    pub fn pool_id(&self) -> PoolId {
        self.record.tag().pool
    }

    /// 缓冲字节数。
    pub fn size(&self) -> usize {
        self.record.size()
    }

    /// 当前引用计数（所有持有者合计）。
    pub fn ref_count(&self) -> usize {
        self.record.refs()
    }

    /// 是否已因调整尺寸或关闭被标记为待销毁。
    pub fn is_pending_destroy(&self) -> bool {
        self.record.is_pending_destroy()
    }

    /// 底层存储是否已被强制回收。
    pub fn is_reclaimed(&self) -> bool {
        self.record.is_reclaimed()
    }

    /// 以可变切片访问缓冲内容。
    ///
    /// 多个持有者共享同一存储，访问在缓冲级锁内串行；切片长度固定为 [`FrameLease::size`]。
    /// 闭包内不得调用同一池的方法，也不得释放（包括隐式丢弃）同一池的**任何**句柄：
    /// 调整尺寸与关闭流程先持有池锁再等待缓冲级锁，闭包内的结算会反向等待池锁而死锁。
    pub fn with_data<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        self.record
            .with_storage(|buf| f(&mut buf[..]))
            .ok_or(PoolError::BufferReclaimed { tag: self.tag() })
    }

    /// 以只读切片访问缓冲内容。
    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        self.record
            .with_storage(|buf| f(&buf[..]))
            .ok_or(PoolError::BufferReclaimed { tag: self.tag() })
    }

    /// 复制一个新的引用单位，等价于 `clone`。
    pub fn duplicate(&self) -> FrameLease {
        self.clone()
    }

    /// 显式释放本引用单位并返回结算结果。
    ///
    /// 若缓冲在释放前已被关闭流程强制销毁，引用依然被释放，但返回
    /// [`PoolError::BufferReclaimed`] 提示调用方存在越过池生命周期的持有。
    pub fn release(mut self) -> Result<ReleaseOutcome> {
        self.armed = false;
        let reclaimed = self.record.is_reclaimed();
        let outcome = self.release_unit();
        if reclaimed {
            Err(PoolError::BufferReclaimed { tag: self.tag() })
        } else {
            Ok(outcome)
        }
    }

    pub(crate) fn retained(&self) -> FrameLease {
        let refs = self.record.retain();
        self.pool.emit(&PoolEvent::RefAdded {
            buffer: self.id(),
            refs,
        });
        FrameLease::new(Arc::clone(&self.pool), Arc::clone(&self.record))
    }

    fn release_unit(&self) -> ReleaseOutcome {
        let refs = self.record.release();
        if refs > 0 {
            self.pool.emit(&PoolEvent::Released {
                buffer: self.id(),
                refs,
            });
            ReleaseOutcome::StillLeased { refs }
        } else {
            self.pool.settle(&self.record)
        }
    }
}

/// 复制句柄即增加一个引用单位。
///
/// 与 [`FramePool::add_ref`](crate::FramePool::add_ref) 不同，`clone` 无法返回错误：
/// 缓冲已被关闭流程回收时依然增加引用单位，使每个句柄的释放保持配对，
/// 新句柄的数据访问同样返回 [`PoolError::BufferReclaimed`]。需要显式错误信号的调用方应使用
/// `add_ref`。
impl Clone for FrameLease {
    fn clone(&self) -> Self {
        self.retained()
    }
}

impl Drop for FrameLease {
    fn drop(&mut self) {
        if self.armed {
            self.release_unit();
        }
    }
}

impl fmt::Debug for FrameLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameLease")
            .field("tag", &self.tag())
            .field("size", &self.size())
            .field("refs", &self.ref_count())
            .field("pending_destroy", &self.is_pending_destroy())
            .finish()
    }
}
