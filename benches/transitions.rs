extern crate gcenv;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use gcenv::{
    env::{read_uint_from_env, MapConfig},
    sample::SampleHeap,
    thread::alloc_context::AllocContext,
    AllocFlags, BlockingEvent, GcEnv, SuspendReason,
};

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};

fn bench_env(heap_size: usize) -> Arc<GcEnv> {
    let heap = SampleHeap::new(heap_size, 64 * 1024).unwrap();
    GcEnv::new(Box::new(heap), Box::new(MapConfig::new())).unwrap()
}

fn criterion_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("transitions");
    {
        let env = bench_env(1024 * 1024);
        let thread = env.attach_current_thread().unwrap();
        group.bench_function("enable/disable preemptive", |b| {
            b.iter(|| {
                thread.enable_preemptive();
                thread.disable_preemptive();
            });
        });
        group.bench_function("safepoint poll", |b| {
            b.iter(|| thread.safepoint());
        });
        env.detach_current_thread().unwrap();
    }
    group.bench_function("event set/wait", |b| {
        let event = BlockingEvent::new();
        event.create_auto(false);
        b.iter(|| {
            event.set();
            event.wait(0, false)
        });
    });
    group.bench_function("alloc context bump", |b| {
        let mut ctx = AllocContext::new();
        b.iter(|| {
            if ctx.allocate(32).is_none() {
                ctx.retire();
                ctx.refill(0x10_0000, 64 * 1024);
            }
        });
    });
    group.bench_function("alloc 1024 x 32 bytes", |b| {
        b.iter_batched(
            || bench_env(1024 * 1024),
            |env| {
                env.attach_current_thread().unwrap();
                for _ in 0..1024 {
                    env.alloc(32, AllocFlags::NONE).unwrap();
                }
                env.detach_current_thread().unwrap();
            },
            BatchSize::PerIteration,
        );
    });
    group.finish();

    let mut group = c.benchmark_group("suspension");
    let max_threads = read_uint_from_env("GCENV_BENCH_THREADS").unwrap_or(8).max(2);
    for threads in [1, max_threads / 2, max_threads] {
        let env = bench_env(1024 * 1024);
        let stop = Arc::new(AtomicBool::new(false));
        let workers = (0..threads)
            .map(|_| {
                let stop = stop.clone();
                gcenv::spawn(&env, move |thread| {
                    while !stop.load(Ordering::Relaxed) {
                        thread.safepoint();
                        std::hint::spin_loop();
                    }
                })
            })
            .collect::<Vec<_>>();

        group.bench_with_input(BenchmarkId::new("suspend/resume", threads), &threads, |b, _| {
            b.iter(|| {
                env.suspend_ee(SuspendReason::ForGc);
                env.restart_ee(true);
            });
        });

        stop.store(true, Ordering::Relaxed);
        for worker in workers {
            worker.join().unwrap().unwrap();
        }
    }
    group.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
