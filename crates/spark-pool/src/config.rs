//! # config：连接池配置与运行期热更新
//!
//! ## 意图（Why）
//! - 汇总连接层全部可调参数：标识空间大小、按距离划分的核心/最大连接数、扩缩容水位、
//!   心跳间隔、借出超时与排空宽限期；
//! - 所有参数都可以在运行期替换，而读路径不需要加锁。
//!
//! ## 契约（What）
//! - [`PoolConfig`] 可从 TOML 解析，缺省字段回落到 [`Default`]；时长字段以毫秒表示（`*_ms`）；
//! - [`PoolConfig::validate`] 拒绝 `core > max`、`max == 0`、`low_water > high_water` 等组合；
//! - [`RuntimeConfig::update`] 先校验再原子替换，并递增纪元；
//! - 核心/最大连接数的变化在下一次扩缩容评估时生效；心跳间隔只影响之后新建的连接。
//!
//! ## 实现（How）
//! - `RuntimeConfig` 以 `ArcSwap<PoolConfig>` 保存当前快照，读者通过 `snapshot()` 拿到 `Arc`
//!   后可长时间持有，不会阻塞写者。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::stream_id::MAX_STREAM_CAPACITY;

/// 原生协议版本，决定单连接的流标识容量。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolVersion {
    V1,
    V2,
    V3,
    #[default]
    V4,
    V5,
}

impl ProtocolVersion {
    /// 协议允许的流标识数量。
    pub const fn stream_capacity(self) -> usize {
        match self {
            ProtocolVersion::V1 | ProtocolVersion::V2 => 128,
            ProtocolVersion::V3 | ProtocolVersion::V4 | ProtocolVersion::V5 => MAX_STREAM_CAPACITY,
        }
    }

    /// 帧头中的版本字节。
    pub const fn as_byte(self) -> u8 {
        match self {
            ProtocolVersion::V1 => 1,
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
            ProtocolVersion::V4 => 4,
            ProtocolVersion::V5 => 5,
        }
    }
}

/// 节点相对本客户端的距离分类。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Distance {
    Local,
    Remote,
    /// 不为该节点建立连接池。
    Ignored,
}

/// 某一距离类别下的连接池规模与水位。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistanceSettings {
    pub core_connections: usize,
    pub max_connections: usize,
    /// 单连接负载超过该值时异步新建一条连接（高水位）。
    pub new_connection_threshold: usize,
    /// 单连接平均负载低于该值并持续 `shrink_delay` 时回收一条多余连接（低水位）。
    pub low_water_threshold: usize,
}

impl DistanceSettings {
    pub const fn new(
        core_connections: usize,
        max_connections: usize,
        new_connection_threshold: usize,
        low_water_threshold: usize,
    ) -> Self {
        Self {
            core_connections,
            max_connections,
            new_connection_threshold,
            low_water_threshold,
        }
    }

    const fn local_default() -> Self {
        Self::new(2, 8, 800, 200)
    }

    const fn remote_default() -> Self {
        Self::new(1, 2, 200, 50)
    }

    fn validate(&self, field: &'static str) -> Result<(), ConfigError> {
        if self.max_connections == 0 {
            return Err(invalid(field, "max_connections must be at least 1"));
        }
        if self.core_connections > self.max_connections {
            return Err(invalid(
                field,
                format!(
                    "core_connections ({}) exceeds max_connections ({})",
                    self.core_connections, self.max_connections
                ),
            ));
        }
        if self.low_water_threshold > self.new_connection_threshold {
            return Err(invalid(
                field,
                format!(
                    "low_water_threshold ({}) exceeds new_connection_threshold ({})",
                    self.low_water_threshold, self.new_connection_threshold
                ),
            ));
        }
        Ok(())
    }
}

impl Default for DistanceSettings {
    fn default() -> Self {
        Self::local_default()
    }
}

/// 连接层完整配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub protocol_version: ProtocolVersion,
    /// 覆盖协议给出的单连接标识容量，不得超过协议上限。
    pub max_requests_per_connection: Option<usize>,
    pub local: DistanceSettings,
    pub remote: DistanceSettings,
    /// 连接空闲超过该时长即发送心跳；为零时关闭心跳。
    #[serde(rename = "heartbeat_interval_ms", with = "millis")]
    pub heartbeat_interval: Duration,
    /// 心跳调度器的扫描周期。
    #[serde(rename = "heartbeat_tick_ms", with = "millis")]
    pub heartbeat_tick: Duration,
    #[serde(rename = "heartbeat_timeout_ms", with = "millis")]
    pub heartbeat_timeout: Duration,
    #[serde(rename = "acquire_timeout_ms", with = "millis")]
    pub acquire_timeout: Duration,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    /// 排空连接等待在途请求完成的最长时间。
    #[serde(rename = "drain_grace_period_ms", with = "millis")]
    pub drain_grace_period: Duration,
    /// 低负载需要持续多久才回收一条连接。
    #[serde(rename = "shrink_delay_ms", with = "millis")]
    pub shrink_delay: Duration,
    #[serde(rename = "maintenance_interval_ms", with = "millis")]
    pub maintenance_interval: Duration,
    /// 单个连接池上同时等待借出的调用方上限。
    pub max_waiters: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::default(),
            max_requests_per_connection: None,
            local: DistanceSettings::local_default(),
            remote: DistanceSettings::remote_default(),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_tick: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(12),
            acquire_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            drain_grace_period: Duration::from_secs(10),
            shrink_delay: Duration::from_secs(60),
            maintenance_interval: Duration::from_secs(5),
            max_waiters: 256,
        }
    }
}

impl PoolConfig {
    /// 从 TOML 文本解析并校验配置。
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: PoolConfig =
            toml::from_str(input).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// 单连接的流标识容量。
    pub fn stream_capacity(&self) -> usize {
        self.max_requests_per_connection
            .unwrap_or_else(|| self.protocol_version.stream_capacity())
    }

    /// 距离对应的规模设置；`Ignored` 没有连接池。
    pub fn distance(&self, distance: Distance) -> Option<&DistanceSettings> {
        match distance {
            Distance::Local => Some(&self.local),
            Distance::Remote => Some(&self.remote),
            Distance::Ignored => None,
        }
    }

    /// 校验跨字段约束；非法配置不会被 [`RuntimeConfig`] 接受。
    pub fn validate(&self) -> Result<(), ConfigError> {
        let protocol_limit = self.protocol_version.stream_capacity();
        if let Some(limit) = self.max_requests_per_connection
            && (limit == 0 || limit > protocol_limit)
        {
            return Err(invalid(
                "max_requests_per_connection",
                format!("must be within 1..={protocol_limit}, got {limit}"),
            ));
        }
        self.local.validate("local")?;
        self.remote.validate("remote")?;
        if self.heartbeat_tick.is_zero() {
            return Err(invalid("heartbeat_tick_ms", "must be greater than zero"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(invalid("maintenance_interval_ms", "must be greater than zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(invalid("connect_timeout_ms", "must be greater than zero"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// 可热更新的配置容器。
#[derive(Debug)]
pub struct RuntimeConfig {
    current: ArcSwap<PoolConfig>,
    epoch: AtomicU64,
}

impl RuntimeConfig {
    /// 以校验通过的初始配置创建容器，纪元从 0 开始。
    pub fn new(initial: PoolConfig) -> Result<Self, ConfigError> {
        initial.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(initial),
            epoch: AtomicU64::new(0),
        })
    }

    /// 当前生效的配置快照。
    pub fn snapshot(&self) -> Arc<PoolConfig> {
        self.current.load_full()
    }

    /// 校验并替换配置，返回新的纪元。
    pub fn update(&self, next: PoolConfig) -> Result<u64, ConfigError> {
        next.validate()?;
        self.current.store(Arc::new(next));
        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(epoch, "pool configuration updated");
        Ok(epoch)
    }

    /// 基于当前快照修改部分字段后提交。
    pub fn modify(&self, edit: impl FnOnce(&mut PoolConfig)) -> Result<u64, ConfigError> {
        let mut next = PoolConfig::clone(&self.snapshot());
        edit(&mut next);
        self.update(next)
    }

    /// 已成功提交的更新次数。
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
