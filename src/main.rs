use std::{sync::Arc, time::Duration};

use gcenv::{
    env::{EnvConfig, GcConfig},
    sample::SampleHeap,
    spawn, AllocFlags, BlockingEvent, CollectionMode, EnvError, GcEnv, PromoteFlags, INFINITE,
};

fn main() -> Result<(), EnvError> {
    env_logger::init();

    let source = EnvConfig::new();
    let config = GcConfig::resolve(&source);
    let heap = SampleHeap::from_config(&config)?;
    let env = GcEnv::new(Box::new(heap), Box::new(source))?;

    let done = Arc::new(BlockingEvent::new());
    if !done.create_manual(false) {
        return Err(EnvError::EventCreation("completion"));
    }

    let workers = (0..4)
        .map(|_| {
            let env2 = env.clone();
            let done = done.clone();
            spawn(&env, move |thread| -> Result<usize, EnvError> {
                let root = thread.add_root(0, PromoteFlags::NONE);
                let mut allocated = 0;
                for i in 0..10_000 {
                    let obj = env2.alloc(16 + (i % 8) * 16, AllocFlags::NONE)?;
                    root.set(obj.as_ptr() as usize);
                    allocated += 1;
                    thread.safepoint();
                }
                // Parked preemptively: does not hold up collections.
                done.wait(INFINITE, false);
                Ok(allocated)
            })
        })
        .collect::<Vec<_>>();

    for _ in 0..5 {
        std::thread::sleep(Duration::from_millis(5));
        env.collect(Some(0), CollectionMode::Default);
    }
    done.set();

    let mut total = 0;
    for worker in workers {
        match worker.join() {
            Ok(allocated) => total += allocated??,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    println!(
        "allocated {} objects, {} collection(s)",
        total,
        env.stats().collections()
    );
    env.shutdown()
}
