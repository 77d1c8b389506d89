//! Environment-variable tunables.
//!
//! Every reader follows the same `name -> string -> typed default`
//! convention: read the variable, try to parse it, fall back to the typed
//! default on anything else (missing, empty, unparsable) and log the
//! fallback at `debug!` rather than failing the caller.

use std::time::Duration;

const TIMER_TICK_MILLIS: &str = "CORENET_TIMER_TICK_MILLIS";
const TIMER_TICKS_PER_WHEEL: &str = "CORENET_TIMER_TICKS_PER_WHEEL";
const TIMER_MAX_PENDING_TIMEOUTS: &str = "CORENET_TIMER_MAX_PENDING_TIMEOUTS";
const TIMER_MAX_INSTANCES: &str = "CORENET_TIMER_MAX_INSTANCES";
const LOOP_BREAKOUT_MILLIS: &str = "CORENET_LOOP_BREAKOUT_MILLIS";
const LOOP_TASKS_PER_TIME_CHECK: &str = "CORENET_LOOP_TASKS_PER_TIME_CHECK";

/// Resolved timer tunables, snapshotted once at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerConfig {
    pub tick_duration: Duration,
    pub ticks_per_wheel: usize,
    pub max_pending_timeouts: i64,
    pub max_instances: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(read_u64(TIMER_TICK_MILLIS, 100)),
            ticks_per_wheel: read_u64(TIMER_TICKS_PER_WHEEL, 512) as usize,
            max_pending_timeouts: read_i64(TIMER_MAX_PENDING_TIMEOUTS, 0),
            max_instances: read_u64(TIMER_MAX_INSTANCES, 64),
        }
    }
}

/// Resolved event-loop tunables, snapshotted once at construction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopConfig {
    pub breakout_interval: Duration,
    pub tasks_per_time_check: u32,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            breakout_interval: Duration::from_millis(read_u64(LOOP_BREAKOUT_MILLIS, 100)),
            tasks_per_time_check: read_u64(LOOP_TASKS_PER_TIME_CHECK, 64) as u32,
        }
    }
}

fn read_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                log::debug!("{name}={raw:?} is not a valid u64, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}

fn read_i64(name: &str, default: i64) -> i64 {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<i64>() {
            Ok(v) => v,
            Err(_) => {
                log::debug!("{name}={raw:?} is not a valid i64, using default {default}");
                default
            }
        },
        Err(_) => default,
    }
}
