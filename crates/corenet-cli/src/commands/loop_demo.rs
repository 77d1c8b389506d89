use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use corenet_core::EventLoop;

pub fn run(tasks: usize) {
    println!("loop-demo: submitting {tasks} immediate task(s) and one scheduled task");

    let event_loop = EventLoop::new();
    let completed = Arc::new(AtomicUsize::new(0));

    for i in 0..tasks {
        let completed = Arc::clone(&completed);
        event_loop
            .execute(move || {
                completed.fetch_add(1, Ordering::SeqCst);
                println!("  ran immediate task {i}");
            })
            .expect("event loop rejected submission");
    }

    event_loop
        .schedule(|| println!("  ran scheduled task after 20ms"), Duration::from_millis(20))
        .expect("event loop rejected scheduled submission");

    std::thread::sleep(Duration::from_millis(50));
    println!("completed {} of {tasks} immediate tasks", completed.load(Ordering::SeqCst));

    let termination = event_loop.shutdown_gracefully(Duration::from_millis(50), Duration::from_secs(2));
    termination.wait();
    println!("event loop terminated (panicked = {})", termination.panicked());
}
