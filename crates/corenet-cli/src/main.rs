//! CLI for corenet — a demonstration harness over corenet-core's primitives.
//!
//! This binary is not part of the library contract; it exists to exercise
//! the queue, timer, attribute map, and event loop from the command line.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "corenet")]
#[command(about = "corenet — demonstration CLI for corenet-core's transport primitives")]
#[command(version = corenet_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Hammer the MPSC queue with several producer threads and report throughput.
    QueueBench {
        /// Number of concurrent producer threads.
        #[arg(long, default_value_t = 4)]
        producers: usize,

        /// Values enqueued per producer.
        #[arg(long, default_value_t = 100_000)]
        per_producer: usize,
    },

    /// Submit a handful of timeouts to a hashed-wheel timer and show firing order.
    TimerDemo {
        /// Tick duration in milliseconds.
        #[arg(long, default_value_t = 10)]
        tick_millis: u64,

        /// Number of timeouts to submit, with staggered delays.
        #[arg(long, default_value_t = 5)]
        count: usize,
    },

    /// Exercise an AttributeMap: set/get/remove across a few keys.
    AttrDemo,

    /// Submit immediate and scheduled tasks to an EventLoop, then shut it down.
    LoopDemo {
        /// Number of immediate tasks to submit.
        #[arg(long, default_value_t = 10)]
        tasks: usize,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match cli.command {
        Commands::QueueBench {
            producers,
            per_producer,
        } => commands::queue_bench::run(producers, per_producer),
        Commands::TimerDemo { tick_millis, count } => commands::timer_demo::run(tick_millis, count),
        Commands::AttrDemo => commands::attr_demo::run(),
        Commands::LoopDemo { tasks } => commands::loop_demo::run(tasks),
    }
}
