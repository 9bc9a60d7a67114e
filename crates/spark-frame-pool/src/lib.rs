//! `spark-frame-pool` 提供面向传感器流水线的定长帧缓冲池。
//!
//! # 模块定位（Why）
//! - 将高频的帧缓冲分配 / 释放替换为对预分配池的租借 / 归还，避免分配器抖动；
//! - 以引用计数与延迟销毁防止悬挂引用：调整尺寸或关闭时仍被持有的缓冲，
//!   直到最后一次释放才会被销毁。
//!
//! # 设计概要（How）
//! - `pool` 模块实现 [`FramePool`]：持有全部缓冲与空闲子集，串行化租借、结算与调整尺寸；
//! - `lease` 模块实现 [`FrameLease`]：一个句柄即一个引用单位，`Clone` 增加引用，`Drop` 释放引用；
//! - `allocator` 模块定义 [`BufferAllocator`] 钩子，内存来源由策略实现决定；
//! - `observer` 模块输出 [`PoolEvent`] 诊断事件，默认经 `tracing` 记录；
//! - `config` 模块提供可从 TOML 加载的 [`PoolConfig`]。
//!
//! ```
//! use spark_frame_pool::{FramePool, HeapAllocator, ReleaseOutcome};
//!
//! let pool = FramePool::initialize(1024, HeapAllocator::new(4)).unwrap();
//! let frame = pool.lease().unwrap();
//! frame.with_data(|bytes| bytes[0] = 0xAB).unwrap();
//!
//! let shared = frame.clone();
//! assert_eq!(frame.ref_count(), 2);
//! assert_eq!(
//!     frame.release().unwrap(),
//!     ReleaseOutcome::StillLeased { refs: 1 }
//! );
//! assert_eq!(shared.release().unwrap(), ReleaseOutcome::Returned);
//! ```

mod allocator;
mod config;
mod error;
mod lease;
mod observer;
mod pool;
mod record;

pub use allocator::{AllocationError, BufferAllocator, HeapAllocator};
pub use config::{DEFAULT_BUFFER_COUNT, DEFAULT_BUFFER_SIZE, PoolConfig};
pub use error::{PoolError, Result, codes};
pub use lease::{FrameLease, ReleaseOutcome};
pub use observer::{NoopObserver, PoolEvent, PoolObserver, TracingObserver};
pub use pool::{FramePool, PoolBuilder, PoolStats, ShutdownReport};
pub use record::{BufferId, BufferTag, PoolId};
