use std::sync::mpsc;
use std::time::{Duration, Instant};

use corenet_core::config::TimerConfig;
use corenet_core::HashedWheelTimer;

pub fn run(tick_millis: u64, count: usize) {
    println!("timer-demo: tick_duration={tick_millis}ms, {count} timeout(s)");

    let timer = HashedWheelTimer::with_config(TimerConfig {
        tick_duration: Duration::from_millis(tick_millis),
        ticks_per_wheel: 512,
        max_pending_timeouts: 0,
        max_instances: 0,
    });

    let (tx, rx) = mpsc::channel();
    let start = Instant::now();
    for i in 0..count {
        let tx = tx.clone();
        let delay = Duration::from_millis(tick_millis * (count - i) as u64);
        timer
            .new_timeout(move || tx.send(i).unwrap(), delay)
            .expect("timer rejected submission");
        println!("  submitted timeout {i} at +{delay:?}");
    }
    drop(tx);

    let snapshot = timer.diagnostics();
    println!(
        "  diagnostics: {}",
        serde_json::to_string(&snapshot).expect("snapshot serializes")
    );

    for fired in rx.iter().take(count) {
        println!("  fired timeout {fired} at {:?}", start.elapsed());
    }

    let unprocessed = timer.stop().expect("timer stop failed");
    println!("stopped: {} timeout(s) left unprocessed", unprocessed.len());
}
