//! # stream_id：单连接的流标识分配器
//!
//! ## 意图（Why）
//! - 一条多路复用连接上的每个在途请求都由一个小整数标识区分，响应按标识回送；
//! - 标识空间容量由协议版本决定（V1/V2 为 128，V3 起为 32768），耗尽即意味着连接已满。
//!
//! ## 契约（What）
//! - [`StreamIdAllocator::acquire`] 返回任一空闲标识，或在无空闲时返回 [`Exhausted`]；
//! - [`StreamIdAllocator::release`] 归还标识；归还未被持有或越界的标识返回 [`AllocatorFault`]，
//!   调用方必须据此关闭所在连接，不得忽略；
//! - 分配顺序不作保证，只保证同一标识不会被同时发放两次。
//!
//! ## 实现（How）
//! - 位图以 `AtomicU64` 字为单位存放，置位表示“已占用”；分配时对首个非满字做 CAS 置位，
//!   释放时 `fetch_and` 清位并通过旧值检测重复释放；
//! - 容量不是 64 的整数倍时，最后一个字的越界位在构造时预先置位，永远不会被发放；
//! - `cursor` 记录最近一次成功分配的字下标，下次从该处开始扫描，减少高并发下的 CAS 冲突。

use std::fmt;

use crate::error::{AllocatorFault, AllocatorFaultKind, Exhausted};
use crate::sync::{AtomicU64, AtomicUsize, Ordering};

/// 标识空间的上限：协议中的流标识为 16 位。
pub const MAX_STREAM_CAPACITY: usize = 1 << 15;

const WORD_BITS: usize = 64;

/// 多路复用请求的流标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(u16);

impl StreamId {
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 固定容量的无锁流标识分配器。
#[derive(Debug)]
pub struct StreamIdAllocator {
    words: Box<[AtomicU64]>,
    capacity: usize,
    in_use: AtomicUsize,
    cursor: AtomicUsize,
}

impl StreamIdAllocator {
    /// 创建容量为 `capacity` 的分配器。
    ///
    /// `capacity` 会被限制在 `1..=MAX_STREAM_CAPACITY`；配置层已对取值做过校验。
    pub fn new(capacity: usize) -> Self {
        debug_assert!((1..=MAX_STREAM_CAPACITY).contains(&capacity));
        let capacity = capacity.clamp(1, MAX_STREAM_CAPACITY);
        let word_count = capacity.div_ceil(WORD_BITS);
        let words: Box<[AtomicU64]> = (0..word_count)
            .map(|index| {
                let first = index * WORD_BITS;
                let valid = (capacity - first).min(WORD_BITS);
                let reserved = if valid == WORD_BITS {
                    0
                } else {
                    !0u64 << valid
                };
                AtomicU64::new(reserved)
            })
            .collect();
        Self {
            words,
            capacity,
            in_use: AtomicUsize::new(0),
            cursor: AtomicUsize::new(0),
        }
    }

    /// 标识空间容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前被持有的标识数量。
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// 剩余可分配的标识数量（近似值，可能被并发分配立即改变）。
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.in_use())
    }

    /// 分配一个空闲标识。
    pub fn acquire(&self) -> Result<StreamId, Exhausted> {
        let word_count = self.words.len();
        let start = self.cursor.load(Ordering::Relaxed) % word_count;
        for step in 0..word_count {
            let index = (start + step) % word_count;
            let word = &self.words[index];
            let mut current = word.load(Ordering::Acquire);
            while current != u64::MAX {
                let bit = current.trailing_ones() as usize;
                let next = current | (1u64 << bit);
                match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire)
                {
                    Ok(_) => {
                        self.in_use.fetch_add(1, Ordering::AcqRel);
                        self.cursor.store(index, Ordering::Relaxed);
                        return Ok(StreamId((index * WORD_BITS + bit) as u16));
                    }
                    Err(actual) => current = actual,
                }
            }
        }
        Err(Exhausted {
            capacity: self.capacity,
        })
    }

    /// 归还标识。
    pub fn release(&self, stream: StreamId) -> Result<(), AllocatorFault> {
        let raw = usize::from(stream.get());
        if raw >= self.capacity {
            return Err(self.fault(stream, AllocatorFaultKind::OutOfRange));
        }
        let mask = 1u64 << (raw % WORD_BITS);
        let previous = self.words[raw / WORD_BITS].fetch_and(!mask, Ordering::AcqRel);
        if previous & mask == 0 {
            return Err(self.fault(stream, AllocatorFaultKind::DoubleRelease));
        }
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        Ok(())
    }

    /// 标识当前是否被持有。
    pub fn is_held(&self, stream: StreamId) -> bool {
        let raw = usize::from(stream.get());
        if raw >= self.capacity {
            return false;
        }
        let mask = 1u64 << (raw % WORD_BITS);
        self.words[raw / WORD_BITS].load(Ordering::Acquire) & mask != 0
    }

    fn fault(&self, stream: StreamId, kind: AllocatorFaultKind) -> AllocatorFault {
        AllocatorFault {
            stream: stream.get(),
            capacity: self.capacity,
            kind,
        }
    }
}
