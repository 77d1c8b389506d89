use std::sync::Arc;
use std::thread;
use std::time::Instant;

use corenet_core::MpscQueue;

pub fn run(producers: usize, per_producer: usize) {
    println!("queue-bench: {producers} producer(s) x {per_producer} values");

    let queue = Arc::new(MpscQueue::new());
    let start = Instant::now();

    let handles: Vec<_> = (0..producers)
        .map(|p| {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                for i in 0..per_producer {
                    queue.enqueue((p, i));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("producer thread panicked");
    }

    let depth = queue.depth();
    println!(
        "depth before drain: {}",
        serde_json::to_string(&depth).expect("depth serializes")
    );

    let mut total = 0usize;
    while queue.dequeue().is_some() {
        total += 1;
    }
    let elapsed = start.elapsed();

    println!("drained {total} values in {elapsed:?}");
    if elapsed.as_secs_f64() > 0.0 {
        println!(
            "throughput: {:.0} values/sec",
            total as f64 / elapsed.as_secs_f64()
        );
    }
}
