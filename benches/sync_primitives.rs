//! Baseline benchmarks for the primary operations:
//!
//! 1. **Uncontended read** — acquire and release a read guard
//! 2. **Uncontended write** — acquire and release a write guard
//! 3. **Upgrade cycle** — upgradable read, upgrade, release both
//! 4. **Queue put/get** — one rendezvous through the buffer
//!
//! All paths resolve on the first poll, so these measure the fixed cost
//! of the census bookkeeping, not parking or waking.

#![allow(missing_docs)]

use criterion::{Criterion, criterion_group, criterion_main};
use std::future::Future;
use std::hint::black_box;
use std::task::{Context, Poll, Waker};

use coopsync::{AsyncQueue, CancelToken, RwLock};

/// Polls a future that is expected to resolve immediately.
fn poll_ready<T>(future: impl Future<Output = T>) -> T {
    let waker = Waker::noop();
    let mut cx = Context::from_waker(waker);
    let mut future = std::pin::pin!(future);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(v) => v,
        Poll::Pending => panic!("benchmark future did not resolve immediately"),
    }
}

fn bench_uncontended_read(c: &mut Criterion) {
    let token = CancelToken::new();
    let lock = RwLock::new(0_u64);
    c.bench_function("rwlock/uncontended_read", |b| {
        b.iter(|| {
            let guard = poll_ready(lock.read(&token)).expect("read failed");
            black_box(*guard);
        });
    });
}

fn bench_uncontended_write(c: &mut Criterion) {
    let token = CancelToken::new();
    let lock = RwLock::new(0_u64);
    c.bench_function("rwlock/uncontended_write", |b| {
        b.iter(|| {
            let mut guard = poll_ready(lock.write(&token)).expect("write failed");
            *guard += 1;
            black_box(*guard);
        });
    });
}

fn bench_upgrade_cycle(c: &mut Criterion) {
    let token = CancelToken::new();
    let lock = RwLock::new(0_u64);
    c.bench_function("rwlock/upgrade_cycle", |b| {
        b.iter(|| {
            let mut ur = poll_ready(lock.upgradable_read(&token)).expect("upgradable failed");
            {
                let mut w = poll_ready(ur.upgrade(&token)).expect("upgrade failed");
                *w += 1;
            }
            black_box(*ur);
        });
    });
}

fn bench_queue_put_get(c: &mut Criterion) {
    let token = CancelToken::new();
    let queue = AsyncQueue::new();
    c.bench_function("queue/put_get", |b| {
        b.iter(|| {
            queue.put(1_u64);
            let value = poll_ready(queue.get(&token)).expect("get failed");
            black_box(value);
        });
    });
}

criterion_group!(
    benches,
    bench_uncontended_read,
    bench_uncontended_write,
    bench_upgrade_cycle,
    bench_queue_put_get
);
criterion_main!(benches);
