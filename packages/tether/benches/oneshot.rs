//! Benchmarks for the one-shot events.

#![allow(
    missing_docs,
    reason = "Benchmarks do not require public documentation"
)]

use std::hint::black_box;
use std::sync::atomic::{AtomicU32, Ordering};

use criterion::{Criterion, criterion_group, criterion_main};
use tether::{OneshotEvent, OneshotPrimitive, detach, run, transform};

criterion_group!(benches, oneshot);
criterion_main!(benches);

fn oneshot(c: &mut Criterion) {
    let mut group = c.benchmark_group("oneshot");

    group.bench_function("raise_wait_event", |b| {
        b.iter(|| {
            let event = OneshotEvent::new();
            event.raise();
            run(event.wait());
        });
    });

    group.bench_function("raise_wait_primitive", |b| {
        b.iter(|| {
            let event = OneshotPrimitive::new();
            event.raise();
            run(event.wait());
        });
    });

    group.bench_function("wait_twice_raise_primitive", |b| {
        static DONE: AtomicU32 = AtomicU32::new(0);
        b.iter(|| {
            DONE.store(0, Ordering::Relaxed);
            let event = OneshotPrimitive::new();
            detach(transform(event.wait(), |()| {
                DONE.fetch_add(1, Ordering::Relaxed);
            }));
            detach(transform(event.wait(), |()| {
                DONE.fetch_add(1, Ordering::Relaxed);
            }));
            event.raise();
            assert_eq!(black_box(DONE.load(Ordering::Relaxed)), 2);
        });
    });

    group.finish();
}
