//! 池配置：可从 TOML 片段加载，并在构建池前校验。

use serde::Deserialize;

use crate::error::{PoolError, Result};

/// 默认单缓冲字节数。
pub const DEFAULT_BUFFER_SIZE: usize = 4096;
/// 默认每次分配的缓冲个数。
pub const DEFAULT_BUFFER_COUNT: usize = 4;

/// `PoolConfig` 描述一个帧缓冲池的静态参数。
///
/// # 契约说明（What）
/// - `buffer_size`：新分配缓冲的固定字节数，必须大于 0；
/// - `buffer_count`：默认 [`HeapAllocator`](crate::HeapAllocator) 每次分配的缓冲个数，使用默认分配器时必须大于 0；
/// - `label`：可选的人类可读名称，仅用于日志。
///
/// 未出现的字段取默认值；未知字段直接拒绝，避免拼写错误被静默忽略。
///
/// ```
/// use spark_frame_pool::PoolConfig;
///
/// let config = PoolConfig::from_toml_str("buffer_size = 1024\nbuffer_count = 8").unwrap();
/// assert_eq!(config.buffer_size, 1024);
/// assert_eq!(config.buffer_count, 8);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PoolConfig {
    pub buffer_size: usize,
    pub buffer_count: usize,
    pub label: Option<String>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            buffer_count: DEFAULT_BUFFER_COUNT,
            label: None,
        }
    }
}

impl PoolConfig {
    /// 解析 TOML 文本并校验。
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: PoolConfig = toml::from_str(source)
            .map_err(|err| PoolError::invalid_config("<toml>", err.message().to_owned()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_buffer_count(mut self, buffer_count: usize) -> Self {
        self.buffer_count = buffer_count;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// 校验全部字段取值（按默认堆分配器的要求）。
    pub fn validate(&self) -> Result<()> {
        self.validate_buffer_size()?;
        self.validate_buffer_count()
    }

    pub(crate) fn validate_buffer_size(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(PoolError::invalid_config(
                "buffer_size",
                "buffer size must be greater than zero",
            ));
        }
        Ok(())
    }

    /// `buffer_count` 只被默认 [`HeapAllocator`](crate::HeapAllocator) 使用。
    pub(crate) fn validate_buffer_count(&self) -> Result<()> {
        if self.buffer_count == 0 {
            return Err(PoolError::invalid_config(
                "buffer_count",
                "buffer count must be greater than zero",
            ));
        }
        Ok(())
    }
}
