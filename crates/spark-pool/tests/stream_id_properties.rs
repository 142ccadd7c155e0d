//! 流标识分配器性质验证
//!
//! # 概览
//!
//! - **目标 (Why)**：分配器是整条连接的正确性基石：同一标识被同时发放两次会让两个请求互相收到对方的响应；
//!   漏掉一次归还则连接的容量永久缩水。
//! - **手法 (How)**：
//!   1. Proptest 生成任意的“分配 / 归还第 k 个已持有标识 / 归还任意原始值”操作序列，以 `BTreeSet`
//!      作为影子模型逐步比对；
//!   2. `cfg(loom)`/`cfg(spark_loom)` 下以 Loom 穷举两个线程并发分配与归还的交错。
//! - **断言 (What)**：
//!   - 任意时刻持有数不超过容量，且与影子模型一致；
//!   - 已持有的标识不会被再次发放；
//!   - 仅当持有数达到容量时返回 `Exhausted`；
//!   - 归还未持有或越界的标识返回对应的 `AllocatorFault`，且不改变持有数。

#[cfg(not(any(loom, spark_loom)))]
mod properties {
    use std::collections::BTreeSet;

    use proptest::prelude::*;
    use spark_pool::{AllocatorFaultKind, StreamId, StreamIdAllocator};

    #[derive(Clone, Debug)]
    enum Op {
        Acquire,
        /// 归还影子模型中第 `k % len` 个已持有标识。
        ReleaseHeld(usize),
        /// 归还任意原始值，可能未被持有或越界。
        ReleaseRaw(u16),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => Just(Op::Acquire),
            3 => any::<usize>().prop_map(Op::ReleaseHeld),
            1 => (0u16..400).prop_map(Op::ReleaseRaw),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_allocator_matches_shadow_model(
            capacity in 1usize..=300,
            ops in prop::collection::vec(op(), 1..600),
        ) {
            let allocator = StreamIdAllocator::new(capacity);
            let mut held = BTreeSet::new();

            for op in ops {
                match op {
                    Op::Acquire => match allocator.acquire() {
                        Ok(stream) => {
                            prop_assert!(usize::from(stream.get()) < capacity);
                            prop_assert!(held.insert(stream), "标识 {} 被重复发放", stream);
                        }
                        Err(exhausted) => {
                            prop_assert_eq!(held.len(), capacity);
                            prop_assert_eq!(exhausted.capacity, capacity);
                        }
                    },
                    Op::ReleaseHeld(k) => {
                        if held.is_empty() {
                            continue;
                        }
                        let stream = *held.iter().nth(k % held.len()).expect("下标在范围内");
                        prop_assert_eq!(allocator.release(stream), Ok(()));
                        held.remove(&stream);
                    }
                    Op::ReleaseRaw(raw) => {
                        let stream = StreamId::new(raw);
                        let result = allocator.release(stream);
                        if usize::from(raw) >= capacity {
                            prop_assert_eq!(result.map_err(|fault| fault.kind), Err(AllocatorFaultKind::OutOfRange));
                        } else if held.remove(&stream) {
                            prop_assert_eq!(result, Ok(()));
                        } else {
                            prop_assert_eq!(result.map_err(|fault| fault.kind), Err(AllocatorFaultKind::DoubleRelease));
                        }
                    }
                }
                prop_assert_eq!(allocator.in_use(), held.len());
                prop_assert!(allocator.in_use() <= capacity);
            }

            for stream in &held {
                prop_assert!(allocator.is_held(*stream));
            }
        }

        #[test]
        fn prop_draining_returns_every_identifier(capacity in 1usize..=200) {
            let allocator = StreamIdAllocator::new(capacity);
            let issued: Vec<_> = std::iter::from_fn(|| allocator.acquire().ok()).collect();
            prop_assert_eq!(issued.len(), capacity);
            let distinct: BTreeSet<_> = issued.iter().copied().collect();
            prop_assert_eq!(distinct.len(), capacity);

            for stream in issued {
                prop_assert_eq!(allocator.release(stream), Ok(()));
            }
            prop_assert_eq!(allocator.in_use(), 0);
            prop_assert_eq!(allocator.available(), capacity);
        }
    }
}

#[cfg(any(loom, spark_loom))]
mod loom_scenarios {
    //! 并发分配与归还的 Loom 模型：两个线程竞争同一个位图字，验证 CAS 置位与 `fetch_and` 清位
    //! 在任意交错下都不会重复发放标识，也不会丢失归还。

    use loom::sync::Arc;
    use loom::thread;
    use spark_pool::StreamIdAllocator;

    #[test]
    fn concurrent_acquire_never_issues_the_same_identifier() {
        loom::model(|| {
            let allocator = Arc::new(StreamIdAllocator::new(2));
            let handles: Vec<_> = (0..2)
                .map(|_| {
                    let allocator = Arc::clone(&allocator);
                    thread::spawn(move || allocator.acquire().expect("容量足够两个线程"))
                })
                .collect();
            let issued: Vec<_> = handles
                .into_iter()
                .map(|handle| handle.join().expect("线程不应 panic"))
                .collect();

            assert_ne!(issued[0], issued[1]);
            assert_eq!(allocator.in_use(), 2);
            assert!(allocator.acquire().is_err());
        });
    }

    #[test]
    fn release_racing_acquire_keeps_the_count_exact() {
        loom::model(|| {
            let allocator = Arc::new(StreamIdAllocator::new(1));
            let first = allocator.acquire().expect("空分配器必有标识");

            let releaser = {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || allocator.release(first).expect("归还持有中的标识"))
            };
            let contender = {
                let allocator = Arc::clone(&allocator);
                thread::spawn(move || allocator.acquire().ok())
            };

            releaser.join().expect("线程不应 panic");
            let second = contender.join().expect("线程不应 panic");
            match second {
                Some(stream) => {
                    assert_eq!(stream, first);
                    assert_eq!(allocator.in_use(), 1);
                }
                None => assert_eq!(allocator.in_use(), 0),
            }
        });
    }
}
