//! 缓冲池诊断事件与观测钩子。
//!
//! # 模块定位（Why）
//! - 池在生命周期关键点（创建、租借、归还、标记待销毁、销毁、调整尺寸）输出结构化事件，
//!   便于排查帧丢失与内存占用问题；
//! - 观测结果只用于诊断，池的控制流从不读取观测者状态。
//!
//! # 使用方式（How）
//! - 默认注入 [`TracingObserver`]，事件经 `tracing` 以结构化字段输出；
//! - 测试或回放场景可实现 [`PoolObserver`] 记录事件序列，或使用 [`NoopObserver`] 关闭输出。

use core::fmt;

use crate::record::{BufferId, PoolId};

/// 池生命周期事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolEvent {
    /// 初始化完成。
    Initialized { buffer_size: usize, buffers: usize },
    /// 开始调整缓冲尺寸。
    Resizing { from: usize, to: usize },
    /// 调整尺寸完成。
    Resized { buffer_size: usize, buffers: usize },
    /// 新缓冲登记入池。
    Created { buffer: BufferId, size: usize },
    /// 缓冲被租出。
    Leased { buffer: BufferId },
    /// 引用计数增加。
    RefAdded { buffer: BufferId, refs: usize },
    /// 引用计数减少但仍被持有。
    Released { buffer: BufferId, refs: usize },
    /// 缓冲回到空闲链表尾部。
    Returned { buffer: BufferId },
    /// 缓冲仍被持有，推迟到最后一次释放时销毁。
    MarkedForDestruction { buffer: BufferId, refs: usize },
    /// 缓冲已交给销毁钩子。
    Destroyed { buffer: BufferId },
    /// 租借时空闲链表为空。
    Exhausted,
    /// 分配钩子失败；`registered` 为失败前已登记的缓冲数。
    AllocationFailed {
        size: usize,
        registered: usize,
        reason: String,
    },
    /// 缓冲已被强制回收后，持有者才释放其引用。
    ReleasedAfterReclaim { buffer: BufferId },
    /// 池被关闭；`forced` 为仍被持有但依然销毁的缓冲数。
    ShutDown { destroyed: usize, forced: usize },
}

impl fmt::Display for PoolEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolEvent::Initialized {
                buffer_size,
                buffers,
            } => write!(f, "initialized with size {buffer_size} ({buffers} buffers)"),
            PoolEvent::Resizing { from, to } => {
                write!(f, "changing buffer size from {from} to {to}")
            }
            PoolEvent::Resized {
                buffer_size,
                buffers,
            } => write!(f, "buffers were allocated: {buffers} x {buffer_size} bytes"),
            PoolEvent::Created { buffer, size } => {
                write!(f, "added new buffer {buffer} with size {size}")
            }
            PoolEvent::Leased { buffer } => write!(f, "{buffer} taken from pool"),
            PoolEvent::RefAdded { buffer, refs } => write!(f, "{buffer} add ref ({refs})"),
            PoolEvent::Released { buffer, refs } => write!(f, "{buffer} dec ref ({refs})"),
            PoolEvent::Returned { buffer } => write!(f, "{buffer} returned to pool"),
            PoolEvent::MarkedForDestruction { buffer, refs } => write!(
                f,
                "buffer {buffer} is still referenced ({refs}), marked for destruction"
            ),
            PoolEvent::Destroyed { buffer } => write!(f, "destroying buffer {buffer}"),
            PoolEvent::Exhausted => f.write_str("no free buffer available"),
            PoolEvent::AllocationFailed {
                size,
                registered,
                reason,
            } => write!(
                f,
                "allocation of {size}-byte buffers failed after {registered} buffers: {reason}"
            ),
            PoolEvent::ReleasedAfterReclaim { buffer } => {
                write!(f, "{buffer} released after it was reclaimed")
            }
            PoolEvent::ShutDown { destroyed, forced } => write!(
                f,
                "shut down: {destroyed} buffers destroyed ({forced} still referenced)"
            ),
        }
    }
}

/// 池事件的接收端。
///
/// # 契约定义（What）
/// - 回调同步执行，可能位于池锁内（租借、归还、调整尺寸），也可能在锁外（增加引用）；
///   实现必须轻量、不得阻塞、不得回调同一池；
/// - 实现需线程安全，且不得 panic。
pub trait PoolObserver: Send + Sync + 'static {
    fn on_event(&self, pool: PoolId, event: &PoolEvent);
}

/// 丢弃全部事件。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopObserver;

impl PoolObserver for NoopObserver {
    fn on_event(&self, _pool: PoolId, _event: &PoolEvent) {}
}

/// 将事件输出到 `tracing`。
///
/// 租借与引用计数类高频事件使用 `trace` 级别，生命周期事件与池耗尽使用 `debug`，
/// 分配失败与回收后释放使用 `warn`。
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingObserver;

impl PoolObserver for TracingObserver {
    fn on_event(&self, pool: PoolId, event: &PoolEvent) {
        let pool = pool.as_u64();
        match event {
            PoolEvent::Leased { buffer } | PoolEvent::Returned { buffer } => {
                tracing::trace!(target: "spark_frame_pool", pool, buffer = buffer.as_u64(), "{event}");
            }
            PoolEvent::RefAdded { buffer, refs } | PoolEvent::Released { buffer, refs } => {
                tracing::trace!(
                    target: "spark_frame_pool",
                    pool,
                    buffer = buffer.as_u64(),
                    refs,
                    "{event}"
                );
            }
            PoolEvent::Created { buffer, size } => {
                tracing::debug!(
                    target: "spark_frame_pool",
                    pool,
                    buffer = buffer.as_u64(),
                    size,
                    "{event}"
                );
            }
            PoolEvent::MarkedForDestruction { buffer, refs } => {
                tracing::debug!(
                    target: "spark_frame_pool",
                    pool,
                    buffer = buffer.as_u64(),
                    refs,
                    "{event}"
                );
            }
            PoolEvent::Destroyed { buffer } => {
                tracing::debug!(target: "spark_frame_pool", pool, buffer = buffer.as_u64(), "{event}");
            }
            PoolEvent::Initialized { .. }
            | PoolEvent::Resizing { .. }
            | PoolEvent::Resized { .. }
            | PoolEvent::ShutDown { .. } => {
                tracing::debug!(target: "spark_frame_pool", pool, "{event}");
            }
            PoolEvent::Exhausted => {
                tracing::debug!(target: "spark_frame_pool", pool, "{event}");
            }
            PoolEvent::AllocationFailed { .. } => {
                tracing::warn!(target: "spark_frame_pool", pool, "{event}");
            }
            PoolEvent::ReleasedAfterReclaim { buffer } => {
                tracing::warn!(target: "spark_frame_pool", pool, buffer = buffer.as_u64(), "{event}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn display_is_human_readable() {
        let event = PoolEvent::MarkedForDestruction {
            buffer: BufferId::from_raw(3),
            refs: 2,
        };
        assert_eq!(
            event.to_string(),
            "buffer 3 is still referenced (2), marked for destruction"
        );
        assert_eq!(
            PoolEvent::Leased {
                buffer: BufferId::from_raw(5)
            }
            .to_string(),
            "5 taken from pool"
        );
    }

    #[traced_test]
    #[test]
    fn tracing_observer_reports_exhaustion() {
        TracingObserver.on_event(PoolId::from_raw(11), &PoolEvent::Exhausted);
        assert!(logs_contain("no free buffer available"));
    }
}
