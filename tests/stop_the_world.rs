use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    mpsc, Arc, Barrier,
};

use gcenv::{
    collector::{PromoteFlags, ScanContext},
    env::MapConfig,
    sample::SampleHeap,
    spawn, GcEnv, GcMode, SuspendReason,
};

fn env() -> Arc<GcEnv> {
    let _ = env_logger::builder().is_test(true).try_init();
    let heap = SampleHeap::new(1024 * 1024, 8 * 1024).unwrap();
    GcEnv::new(Box::new(heap), Box::new(MapConfig::new())).unwrap()
}

#[test]
fn four_threads_are_stopped_before_root_scan() {
    let env = env();
    let attached = Arc::new(Barrier::new(5));
    let stop = Arc::new(AtomicBool::new(false));
    let (seen_tx, seen_rx) = mpsc::channel();

    let workers = (0..4usize)
        .map(|i| {
            let env2 = env.clone();
            let attached = attached.clone();
            let stop = stop.clone();
            let seen_tx = seen_tx.clone();
            spawn(&env, move |thread| {
                let _root = thread.add_root(0x1000 + i * 0x10, PromoteFlags::NONE);
                attached.wait();
                // Half the threads run "managed code" and poll, half sit in native code.
                if i % 2 == 0 {
                    while !stop.load(Ordering::SeqCst) {
                        thread.safepoint();
                        std::hint::spin_loop();
                    }
                } else {
                    thread.enable_preemptive();
                    while !stop.load(Ordering::SeqCst) {
                        std::thread::yield_now();
                    }
                    thread.disable_preemptive();
                }
                seen_tx.send(env2.gc_in_progress()).unwrap();
            })
        })
        .collect::<Vec<_>>();
    drop(seen_tx);

    attached.wait();
    assert_eq!(env.registry().len(), 4);

    env.suspend_ee(SuspendReason::ForGc);
    for thread in env.registry().iter() {
        assert!(
            thread.gc_mode() == GcMode::Preemptive || thread.at_safe_point(),
            "{:?} still running managed code",
            thread
        );
    }

    let reported = AtomicUsize::new(0);
    let mut sc = ScanContext::new(true);
    env.gc_scan_roots(
        &mut |_slot: &AtomicUsize, sc: &ScanContext, _flags: PromoteFlags| {
            let thread = sc.thread_under_crawl.as_ref().unwrap();
            assert!(thread.gc_mode() == GcMode::Preemptive || thread.at_safe_point());
            reported.fetch_add(1, Ordering::Relaxed);
        },
        0,
        2,
        &mut sc,
    );
    assert_eq!(reported.load(Ordering::Relaxed), 4);

    stop.store(true, Ordering::SeqCst);
    env.restart_ee(true);

    for worker in workers {
        worker.join().unwrap().unwrap();
    }
    let observed = seen_rx.iter().collect::<Vec<_>>();
    assert_eq!(observed, vec![false; 4]);
    assert!(env.registry().is_empty());
    env.shutdown().unwrap();
}

#[test]
fn preemptive_thread_returns_immediately_after_completed_pause() {
    let env = env();
    let (ready_tx, ready_rx) = mpsc::channel();
    let (go_tx, go_rx) = mpsc::channel::<()>();

    let worker = spawn(&env, move |thread| {
        thread.enable_preemptive();
        ready_tx.send(()).unwrap();
        go_rx.recv().unwrap();
        let start = std::time::Instant::now();
        thread.disable_preemptive();
        start.elapsed()
    });

    ready_rx.recv().unwrap();
    env.suspend_ee(SuspendReason::ForGc);
    env.restart_ee(true);
    go_tx.send(()).unwrap();

    let elapsed = worker.join().unwrap().unwrap();
    assert!(elapsed < std::time::Duration::from_millis(100));
}

#[test]
fn collection_from_mutator_stops_other_mutators() {
    let env = env();
    let stop = Arc::new(AtomicBool::new(false));
    let pollers = (0..3)
        .map(|_| {
            let stop = stop.clone();
            spawn(&env, move |thread| {
                let mut polls = 0usize;
                while !stop.load(Ordering::SeqCst) {
                    thread.safepoint();
                    polls += 1;
                }
                polls
            })
        })
        .collect::<Vec<_>>();

    let collector = spawn(&env, {
        let env = env.clone();
        move |_| {
            for _ in 0..20 {
                assert!(env.collect(None, gcenv::CollectionMode::Default));
            }
        }
    });
    collector.join().unwrap().unwrap();

    stop.store(true, Ordering::SeqCst);
    for poller in pollers {
        poller.join().unwrap().unwrap();
    }
    assert_eq!(env.stats().collections(), 20);
    assert_eq!(env.coordinator().pauses(), 20);
}
