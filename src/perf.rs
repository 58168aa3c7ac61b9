//! Advisory runtime counters.
//!
//! Everything here is telemetry for the dashboard's performance panel.
//! Counters never gate correctness and are safe to reset at any time.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use serde::Serialize;

#[derive(Debug)]
pub struct PerfMonitor {
    started: Instant,

    commands_processed: AtomicU64,
    commands_rejected: AtomicU64,

    delta_events: AtomicU64,
    full_events: AtomicU64,
    queue_drops: AtomicU64,

    max_serialize_micros: AtomicU64,
    max_broadcast_tick_micros: AtomicU64,
    max_command_micros: AtomicU64,

    subscriber_count: AtomicUsize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfSnapshot {
    pub uptime_secs: u64,
    pub commands_processed: u64,
    pub commands_rejected: u64,
    pub delta_events: u64,
    pub full_events: u64,
    pub queue_drops: u64,
    pub max_serialize_micros: u64,
    pub max_broadcast_tick_micros: u64,
    pub max_command_micros: u64,
    pub subscriber_count: usize,
}

fn record_max(slot: &AtomicU64, value: u64) {
    slot.fetch_max(value, Ordering::Relaxed);
}

impl PerfMonitor {
    pub fn new() -> Self {
        PerfMonitor {
            started: Instant::now(),
            commands_processed: AtomicU64::new(0),
            commands_rejected: AtomicU64::new(0),
            delta_events: AtomicU64::new(0),
            full_events: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            max_serialize_micros: AtomicU64::new(0),
            max_broadcast_tick_micros: AtomicU64::new(0),
            max_command_micros: AtomicU64::new(0),
            subscriber_count: AtomicUsize::new(0),
        }
    }

    pub fn command_processed(&self, elapsed_micros: u64, rejected: bool) {
        self.commands_processed.fetch_add(1, Ordering::Relaxed);
        if rejected {
            self.commands_rejected.fetch_add(1, Ordering::Relaxed);
        }
        record_max(&self.max_command_micros, elapsed_micros);
    }

    pub fn delta_event(&self) {
        self.delta_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn full_event(&self) {
        self.full_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn queue_drop(&self) {
        self.queue_drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_serialize_micros(&self, micros: u64) {
        record_max(&self.max_serialize_micros, micros);
    }

    pub fn record_broadcast_tick_micros(&self, micros: u64) {
        record_max(&self.max_broadcast_tick_micros, micros);
    }

    pub fn set_subscriber_count(&self, count: usize) {
        self.subscriber_count.store(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            uptime_secs: self.started.elapsed().as_secs(),
            commands_processed: self.commands_processed.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            delta_events: self.delta_events.load(Ordering::Relaxed),
            full_events: self.full_events.load(Ordering::Relaxed),
            queue_drops: self.queue_drops.load(Ordering::Relaxed),
            max_serialize_micros: self.max_serialize_micros.load(Ordering::Relaxed),
            max_broadcast_tick_micros: self.max_broadcast_tick_micros.load(Ordering::Relaxed),
            max_command_micros: self.max_command_micros.load(Ordering::Relaxed),
            subscriber_count: self.subscriber_count.load(Ordering::Relaxed),
        }
    }

    /// Zeroes the counters. MachineState is untouched.
    pub fn reset(&self) {
        self.commands_processed.store(0, Ordering::Relaxed);
        self.commands_rejected.store(0, Ordering::Relaxed);
        self.delta_events.store(0, Ordering::Relaxed);
        self.full_events.store(0, Ordering::Relaxed);
        self.queue_drops.store(0, Ordering::Relaxed);
        self.max_serialize_micros.store(0, Ordering::Relaxed);
        self.max_broadcast_tick_micros.store(0, Ordering::Relaxed);
        self.max_command_micros.store(0, Ordering::Relaxed);
    }
}

impl Default for PerfMonitor {
    fn default() -> Self {
        Self::new()
    }
}
