//! 原子类型的统一入口：常规构建使用标准库，`cfg(loom)`/`cfg(spark_loom)` 下切换为 loom 模型。

#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[cfg(not(any(loom, spark_loom)))]
pub(crate) use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
