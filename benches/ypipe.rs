use std::hint::spin_loop;
use std::thread;
use std::time::{Duration, Instant};

use conduit::{ypipe, YQueue};
use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use criterion::{criterion_group, criterion_main};

const ITEMS_PER_ITER: usize = 10_000;
const THROUGHPUT_BATCH: u64 = 1_000_000;

fn bench_yqueue(c: &mut Criterion) {
    let mut group = c.benchmark_group("yqueue");
    group.throughput(Throughput::Elements(ITEMS_PER_ITER as u64));
    group.bench_function("push_pop", |b| {
        let mut queue: YQueue<u64> = YQueue::new();
        b.iter(|| {
            for i in 0..ITEMS_PER_ITER as u64 {
                queue.push(black_box(i));
            }
            while !queue.is_empty() {
                black_box(queue.pop());
            }
        });
    });
    group.finish();
}

fn bench_single_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ypipe_single_thread");
    for &batch in &[1_usize, 16, 256] {
        group.throughput(Throughput::Elements(ITEMS_PER_ITER as u64));
        group.bench_with_input(BenchmarkId::new("flush_every", batch), &batch, |b, &batch| {
            let (mut writer, mut reader) = ypipe::<u64>();
            b.iter(|| {
                for i in 0..ITEMS_PER_ITER {
                    writer.write(i as u64, false);
                    if i % batch == batch - 1 {
                        writer.flush();
                        while let Some(v) = reader.read() {
                            black_box(v);
                        }
                    }
                }
                writer.flush();
                while let Some(v) = reader.read() {
                    black_box(v);
                }
            });
        });
    }
    group.finish();
}

fn bench_cross_thread(c: &mut Criterion) {
    let mut group = c.benchmark_group("ypipe_cross_thread");
    group.measurement_time(Duration::from_secs(20));
    group.throughput(Throughput::Elements(THROUGHPUT_BATCH));

    group.bench_function("busy_spin", |b| {
        b.iter_custom(|iters| {
            let (mut writer, mut reader) = ypipe::<u64>();
            let total = THROUGHPUT_BATCH * iters;

            let consumer = thread::spawn(move || {
                let mut received = 0;
                while received < total {
                    match reader.read() {
                        Some(v) => {
                            black_box(v);
                            received += 1;
                        }
                        None => spin_loop(),
                    }
                }
            });

            let start = Instant::now();
            for i in 0..total {
                writer.write(i, false);
                if i % 64 == 63 {
                    writer.flush();
                }
            }
            writer.flush();
            consumer.join().expect("consumer join");
            start.elapsed()
        })
    });
    group.finish();
}

criterion_group!(benches, bench_yqueue, bench_single_thread, bench_cross_thread);
criterion_main!(benches);
