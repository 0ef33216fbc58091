//! Benchmarks for the async mutex.

#![allow(
    missing_docs,
    reason = "Benchmarks do not require public documentation"
)]

use criterion::{Criterion, criterion_group, criterion_main};
use tether::{Mutex, run};

criterion_group!(benches, mutex);
criterion_main!(benches);

fn mutex(c: &mut Criterion) {
    let mut group = c.benchmark_group("mutex");

    group.bench_function("try_lock_unlock", |b| {
        let m = Mutex::new();
        b.iter(|| {
            let success = m.try_lock();
            assert!(success);
            m.unlock();
        });
    });

    group.bench_function("async_lock_unlock_uncontended", |b| {
        let m = Mutex::new();
        b.iter(|| {
            run(m.async_lock());
            m.unlock();
        });
    });

    group.finish();
}
