//! Runs four reactors on four threads, posts some work to each and shuts them all down.
//!
//! Set `RUST_LOG=chain_reactor=trace` to watch the loops dispatch.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use chain_reactor::{AsyncExecutor, Coroutine, Event, Scheduler, ShutdownLatch, Suspend};
use tracing_subscriber::EnvFilter;

const REACTOR_COUNT: u32 = 4;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    let latch = Arc::new(ShutdownLatch::new(REACTOR_COUNT));
    let schedulers = (0..REACTOR_COUNT)
        .map(|_| Arc::new(Scheduler::new()))
        .collect::<Vec<_>>();

    for (index, scheduler) in schedulers.iter().enumerate() {
        let scheduler = Arc::clone(scheduler);
        let latch = Arc::clone(&latch);

        // Detached, like any worker pool that is coordinated through the latch alone.
        thread::Builder::new()
            .name(format!("reactor-{index}"))
            .spawn(move || {
                if !scheduler.run_loop(None) {
                    println!("reactor {index} failed: {}", scheduler.last_error());
                }

                println!("reactor {index} exited");
                latch.decrease();
            })
            .expect("failed to spawn reactor thread");
    }

    thread::sleep(Duration::from_millis(5));

    let handled = Arc::new(AtomicUsize::new(0));

    for (index, scheduler) in schedulers.iter().enumerate() {
        let handled_by_event = Arc::clone(&handled);

        if let Err(error) = scheduler.post(Event::net_recv(move |wake_fd| {
            println!("reactor {index} handling posted event (wake descriptor {wake_fd})");
            handled_by_event.fetch_add(1, Ordering::Relaxed);
        })) {
            println!("reactor {index} is not accepting events yet: {error}");
        }

        let executor: Arc<dyn AsyncExecutor> = Arc::<Scheduler>::clone(scheduler);
        let handled_by_coroutine = Arc::clone(&handled);

        let _coroutine = Coroutine::spawn(async move {
            // Continues on the reactor thread once the scheduler resumes it.
            Suspend::<()>::new(executor, true).await;
            println!(
                "coroutine for reactor {index} resumed on {:?}",
                thread::current().name()
            );
            handled_by_coroutine.fetch_add(1, Ordering::Relaxed);
        });
    }

    for (index, scheduler) in schedulers.iter().enumerate() {
        while !scheduler.stop() {
            println!("retrying stop of reactor {index}");
            thread::yield_now();
        }
    }

    if latch.wait(Some(Duration::from_millis(1000))) {
        println!(
            "all reactors exited after handling {} work items",
            handled.load(Ordering::Relaxed)
        );
    } else {
        println!("timed out waiting for reactors to exit");
    }
}
