//! `lease_contract` 集成测试：聚焦 `FrameLease` 句柄的引用语义与数据访问。

use bytes::BytesMut;
use spark_frame_pool::{
    AllocationError, BufferAllocator, FramePool, HeapAllocator, NoopObserver, PoolConfig, PoolError,
    ReleaseOutcome,
};

fn pool(buffer_size: usize, buffer_count: usize) -> FramePool {
    FramePool::builder()
        .buffer_size(buffer_size)
        .allocator(HeapAllocator::new(buffer_count))
        .observer(NoopObserver)
        .build()
        .expect("初始化不应失败")
}

/// 所有别名共享同一存储，写入对其它持有者可见。
#[test]
fn aliases_share_the_same_storage() {
    let pool = pool(16, 1);
    let writer = pool.lease().expect("租借");
    let reader = writer.duplicate();

    writer
        .with_data(|bytes| bytes.copy_from_slice(&[5u8; 16]))
        .expect("写入");
    let sum: u32 = reader
        .read(|bytes| bytes.iter().map(|b| u32::from(*b)).sum())
        .expect("读取");
    assert_eq!(sum, 5 * 16);
    assert_eq!(reader.tag(), writer.tag());
}

/// 数据切片长度固定为缓冲尺寸，持有者无法改变缓冲大小。
#[test]
fn data_slice_length_matches_buffer_size() {
    let pool = pool(100, 1);
    let lease = pool.lease().expect("租借");
    assert_eq!(lease.with_data(|bytes| bytes.len()), Ok(100));
    assert_eq!(lease.size(), 100);
}

/// 显式释放报告剩余引用数，最后一次释放报告归还。
#[test]
fn release_reports_outcome_per_unit() {
    let pool = pool(8, 2);
    let first = pool.lease().expect("租借");
    let second = first.clone();
    let third = second.clone();
    assert_eq!(first.ref_count(), 3);

    assert_eq!(first.release(), Ok(ReleaseOutcome::StillLeased { refs: 2 }));
    assert_eq!(third.release(), Ok(ReleaseOutcome::StillLeased { refs: 1 }));
    assert_eq!(second.ref_count(), 1);
    assert_eq!(second.release(), Ok(ReleaseOutcome::Returned));
    assert_eq!(pool.stats().free_buffers, 2);
}

/// 释放后的缓冲保留内容，池不清零也不改写字节。
#[test]
fn pool_never_touches_buffer_contents() {
    let pool = pool(4, 1);
    let lease = pool.lease().expect("租借");
    let id = lease.id();
    lease
        .with_data(|bytes| bytes.copy_from_slice(b"abcd"))
        .expect("写入");
    drop(lease);

    let again = pool.lease().expect("再次租借");
    assert_eq!(again.id(), id);
    assert_eq!(again.read(|bytes| bytes.to_vec()), Ok(b"abcd".to_vec()));
}

/// 句柄的调试输出携带标签与引用计数。
#[test]
fn debug_output_includes_tag_and_refs() {
    let pool = pool(8, 1);
    let lease = pool.lease().expect("租借");
    let rendered = format!("{lease:?}");
    assert!(rendered.contains("FrameLease"));
    assert!(rendered.contains("refs: 1"));
}

/// 从配置构建的池使用配置中的尺寸、个数与名称。
#[test]
fn builder_from_config_applies_every_field() {
    let config = PoolConfig::from_toml_str(
        r#"
        buffer_size = 320
        buffer_count = 3
        label = "depth-stream"
        "#,
    )
    .expect("合法配置");
    let pool = spark_frame_pool::PoolBuilder::from_config(config)
        .observer(NoopObserver)
        .build()
        .expect("构建");
    assert_eq!(pool.label(), Some("depth-stream"));
    assert_eq!(pool.buffer_size(), 320);
    assert_eq!(pool.stats().free_buffers, 3);
}

/// 关闭后复制句柄依然保持引用配对，但新句柄同样无法访问数据；`add_ref` 则直接报错。
#[test]
fn clone_after_shutdown_keeps_release_pairing() {
    let pool = pool(8, 1);
    let held = pool.lease().expect("租借");
    let tag = held.tag();
    pool.shutdown();

    let alias = held.clone();
    assert_eq!(held.ref_count(), 2);
    assert_eq!(
        alias.read(|bytes| bytes.len()),
        Err(PoolError::BufferReclaimed { tag })
    );
    assert!(matches!(
        pool.add_ref(&held),
        Err(PoolError::BufferReclaimed { .. })
    ));

    drop(alias);
    assert_eq!(held.ref_count(), 1);
    assert_eq!(held.release(), Err(PoolError::BufferReclaimed { tag }));
}

/// 固定返回两个缓冲的自定义分配器，不读取配置中的缓冲个数。
struct PairAllocator;

impl BufferAllocator for PairAllocator {
    fn allocate_buffers(&self, size: usize) -> Result<Vec<BytesMut>, AllocationError> {
        Ok(vec![BytesMut::zeroed(size), BytesMut::zeroed(size)])
    }

    fn destroy_buffer(&self, _buffer: BytesMut) {}
}

/// 缓冲个数只约束默认堆分配器；自定义分配器下零个数不影响构建。
#[test]
fn buffer_count_only_constrains_the_default_allocator() {
    let pool = FramePool::builder()
        .buffer_size(16)
        .buffer_count(0)
        .allocator(PairAllocator)
        .observer(NoopObserver)
        .build()
        .expect("自定义分配器不使用缓冲个数");
    assert_eq!(pool.stats().free_buffers, 2);

    let err = FramePool::builder()
        .buffer_size(16)
        .buffer_count(0)
        .observer(NoopObserver)
        .build()
        .expect_err("默认分配器需要正的缓冲个数");
    assert!(matches!(&err, PoolError::InvalidConfig { field, .. } if field == "buffer_count"));

    let err = FramePool::builder()
        .buffer_size(0)
        .allocator(PairAllocator)
        .observer(NoopObserver)
        .build()
        .expect_err("零尺寸始终非法");
    assert!(matches!(&err, PoolError::InvalidConfig { field, .. } if field == "buffer_size"));
}
