use std::hint::spin_loop;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use conduit::{pipepair, CommandSink, Mailbox, Msg, PairConfig, Pipe};
use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use criterion::{criterion_group, criterion_main};

const ROUND_TRIPS_PER_ITER: u64 = 10_000;

struct Side {
    pipe: Pipe,
    mailbox: Arc<Mailbox>,
}

impl Side {
    fn drain(&mut self) {
        while let Some(env) = self.mailbox.try_recv().expect("mailbox") {
            self.pipe
                .process_command(env.command, &mut ())
                .expect("command");
        }
    }

    fn send(&mut self, mut msg: Msg) {
        loop {
            match self.pipe.write(msg) {
                Ok(()) => break,
                Err(refused) => {
                    msg = refused;
                    self.drain();
                    spin_loop();
                }
            }
        }
        self.pipe.flush();
    }

    fn recv(&mut self) -> Msg {
        loop {
            if let Some(msg) = self.pipe.read() {
                return msg;
            }
            self.drain();
            spin_loop();
        }
    }
}

fn pair(hwm: u64) -> (Side, Side) {
    let a = Arc::new(Mailbox::new().expect("mailbox"));
    let b = Arc::new(Mailbox::new().expect("mailbox"));
    let (pa, pb) = pipepair(
        [
            Arc::clone(&a) as Arc<dyn CommandSink>,
            Arc::clone(&b) as Arc<dyn CommandSink>,
        ],
        PairConfig::with_hwm(hwm),
    );
    (
        Side {
            pipe: pa,
            mailbox: a,
        },
        Side {
            pipe: pb,
            mailbox: b,
        },
    )
}

fn bench_pingpong(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipe_pingpong");
    group.measurement_time(Duration::from_secs(20));
    group.throughput(Throughput::Elements(ROUND_TRIPS_PER_ITER));

    for &size in &[8_usize, 256] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_custom(|iters| {
                let (mut ping, mut pong) = pair(1000);
                let total = ROUND_TRIPS_PER_ITER * iters;

                let echo = thread::spawn(move || {
                    for _ in 0..total {
                        let msg = pong.recv();
                        pong.send(msg);
                    }
                });

                let payload = vec![0u8; size];
                let start = Instant::now();
                for _ in 0..total {
                    ping.send(Msg::new(black_box(payload.clone())));
                    black_box(ping.recv());
                }
                let elapsed = start.elapsed();
                echo.join().expect("echo join");
                elapsed
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_pingpong);
criterion_main!(benches);
