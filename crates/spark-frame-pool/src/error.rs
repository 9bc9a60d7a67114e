//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 集中定义帧缓冲池对外暴露的错误语义，区分“例行背压”（池耗尽）与真正的分配失败；
//! - 将句柄误用（跨池句柄、关闭后访问）建模为带类型的前置条件违例，而非未定义行为。
//!
//! ## 设计要求（What）
//! - 所有变体派生 `thiserror::Error`，满足 `Send + Sync + 'static`，可跨线程传播；
//! - [`PoolError::code`] 返回稳定的点分错误码，供日志与告警聚合；
//! - [`PoolError::is_allocation_failure`] 对应“分配失败”大类：池耗尽与分配钩子失败都属于此类。

use std::borrow::Cow;

use thiserror::Error;

use crate::record::{BufferTag, PoolId};

/// 稳定错误码常量，命名沿用 `<域>.<原因>` 的点分格式。
pub mod codes {
    /// 空闲链表为空，租借立即失败。
    pub const POOL_EXHAUSTED: &str = "pool.exhausted";
    /// 分配钩子或跟踪记录注册失败。
    pub const POOL_ALLOCATION_FAILED: &str = "pool.allocation_failed";
    /// 池已关闭。
    pub const POOL_SHUT_DOWN: &str = "pool.shut_down";
    /// 句柄归属其它池实例。
    pub const POOL_FOREIGN_BUFFER: &str = "pool.foreign_buffer";
    /// 句柄指向的缓冲已被强制销毁。
    pub const POOL_BUFFER_RECLAIMED: &str = "pool.buffer_reclaimed";
    /// 配置非法。
    pub const POOL_INVALID_CONFIG: &str = "pool.invalid_config";
}

/// 帧缓冲池错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：池耗尽是调用方必须处理的常规背压信号（例如丢帧或稍后重试），
///   与钩子分配失败同属“分配失败”大类，但保留独立变体便于观测区分。
/// - **契约 (What)**：所有变体携带池标识，便于多池部署下定位来源；
///   跨池句柄与关闭后访问均返回错误，不触发 panic。
/// - **风险 (Trade-offs)**：`reason` 以 `String` 保存钩子给出的描述，失败路径上多一次堆分配。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum PoolError {
    /// 空闲链表为空。
    #[error("buffer pool {pool} is exhausted: no free buffer available")]
    Exhausted { pool: PoolId },

    /// 分配钩子未能产出（全部或部分）缓冲。
    #[error("buffer pool {pool} failed to allocate buffers of {requested_size} bytes: {reason}")]
    AllocationFailed {
        pool: PoolId,
        requested_size: usize,
        reason: String,
    },

    /// 池已关闭，拒绝后续操作。
    #[error("buffer pool {pool} has been shut down")]
    ShutDown { pool: PoolId },

    /// 句柄属于其它池实例。
    #[error("buffer handle belongs to pool {found}, not to pool {expected}")]
    ForeignBuffer { expected: PoolId, found: PoolId },

    /// 句柄指向的缓冲已被关闭流程强制销毁。
    #[error("buffer {tag} was reclaimed while still referenced")]
    BufferReclaimed { tag: BufferTag },

    /// 配置校验失败。
    #[error("invalid pool configuration `{field}`: {detail}")]
    InvalidConfig {
        field: Cow<'static, str>,
        detail: String,
    },
}

impl PoolError {
    /// 返回稳定错误码，见 [`codes`]。
    pub fn code(&self) -> &'static str {
        match self {
            PoolError::Exhausted { .. } => codes::POOL_EXHAUSTED,
            PoolError::AllocationFailed { .. } => codes::POOL_ALLOCATION_FAILED,
            PoolError::ShutDown { .. } => codes::POOL_SHUT_DOWN,
            PoolError::ForeignBuffer { .. } => codes::POOL_FOREIGN_BUFFER,
            PoolError::BufferReclaimed { .. } => codes::POOL_BUFFER_RECLAIMED,
            PoolError::InvalidConfig { .. } => codes::POOL_INVALID_CONFIG,
        }
    }

    /// 是否属于“分配失败”大类（池耗尽或钩子失败）。
    ///
    /// 调用方通常以此判断是否应当降级处理（丢帧、延迟重试），而不是终止流水线。
    pub fn is_allocation_failure(&self) -> bool {
        matches!(
            self,
            PoolError::Exhausted { .. } | PoolError::AllocationFailed { .. }
        )
    }

    pub(crate) fn invalid_config(field: &'static str, detail: impl Into<String>) -> Self {
        PoolError::InvalidConfig {
            field: Cow::Borrowed(field),
            detail: detail.into(),
        }
    }
}

/// 本 crate 统一的结果别名。
pub type Result<T, E = PoolError> = core::result::Result<T, E>;
