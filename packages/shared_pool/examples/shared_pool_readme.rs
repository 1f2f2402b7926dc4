//! Demonstrates the shared pool: result handles, delayed and periodic schedules, cancellation
//! and coalesced repeating tasks.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use shared_pool::{RepeatingTask, SharedPool, is_interrupt_requested, label_current_task};

fn main() {
    let pool = SharedPool::builder()
        .idle_timeout(Duration::from_secs(5))
        .thread_name_prefix("readme")
        .build();

    // A task with a result.
    let answer = pool.submit(|| {
        label_current_task("compute answer");
        6 * 7
    });
    println!("Answer: {:?}", answer.get());

    // A delayed task.
    let delayed = pool.schedule_once(|| "later", Duration::from_millis(100));
    println!("Delayed task fires in {:?}", delayed.delay());
    println!("Delayed task result: {:?}", delayed.get());

    // A periodic task, cancelled after a few ticks.
    let ticks = Arc::new(AtomicUsize::new(0));
    let periodic = pool.schedule_at_fixed_rate(
        {
            let ticks = Arc::clone(&ticks);
            move || {
                ticks.fetch_add(1, Ordering::Relaxed);
            }
        },
        Duration::ZERO,
        Duration::from_millis(50),
    );

    thread::sleep(Duration::from_millis(220));
    periodic.cancel(false);
    println!("Periodic task ticked {} times", ticks.load(Ordering::Relaxed));

    // A long task that cooperates with interruption.
    let long = pool.submit(|| {
        while !is_interrupt_requested() {
            thread::sleep(Duration::from_millis(10));
        }

        println!("Long task noticed the interrupt request");
    });

    thread::sleep(Duration::from_millis(50));
    long.cancel(true);
    println!("Long task outcome: {:?}", long.get());

    // A storm of run requests causes at most one extra run.
    let runs = Arc::new(AtomicUsize::new(0));
    let refresh = RepeatingTask::new(pool.clone(), {
        let runs = Arc::clone(&runs);
        move || {
            runs.fetch_add(1, Ordering::Relaxed);
            thread::sleep(Duration::from_millis(20));
        }
    });

    for _ in 0..100 {
        refresh.request_run().unwrap();
    }

    while !refresh.is_idle() {
        thread::sleep(Duration::from_millis(5));
    }

    println!("100 requests caused {} runs", runs.load(Ordering::Relaxed));
}
