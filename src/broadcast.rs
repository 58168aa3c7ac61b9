//! Machine-status broadcast over SSE.
//!
//! The broadcaster keeps the last-emitted snapshot as a shared baseline,
//! diffs the live MachineState against it every tick and fans the result
//! out to all subscribers. A subscriber always receives one full
//! `machine-status` event before any `machine-status-delta`; deltas are
//! suppressed entirely when nothing changed.
//!
//! Per-subscriber queues are bounded. A full queue never blocks the
//! producer: the event is dropped, the drop is counted, and the subscriber
//! is flagged for a full-snapshot resync on the next tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::models::{CncState, MachineState};
use crate::perf::PerfMonitor;

pub const BROADCAST_TICK: Duration = Duration::from_millis(200);
/// Every Nth tick all subscribers get a full snapshot, bounding how long a
/// missed delta can go unnoticed.
const RESYNC_TICKS: u32 = 25;
/// Cadence of the advisory `performance-metrics` event.
const PERF_TICKS: u32 = 10;
const SUBSCRIBER_QUEUE: usize = 16;
/// With this many changed groups a full snapshot is cheaper than a delta.
const FULL_SNAPSHOT_GROUP_THRESHOLD: usize = 4;

/// One outgoing SSE frame, already serialized.
#[derive(Debug, Clone)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: String,
}

/// One changed field group. Position is relative to the baseline the delta
/// was computed against; the other groups carry absolute values.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaGroup {
    Position {
        dx: f32,
        dy: f32,
    },
    Run {
        state: CncState,
        is_paused: bool,
        is_homed: bool,
    },
    Io {
        estop_on: bool,
        limit_x_on: bool,
        limit_y_on: bool,
        hot_wire_on: bool,
        fan_on: bool,
        hot_wire_power: f32,
        fan_power: f32,
    },
    Progress {
        current_project: String,
        current_line: u32,
        total_lines: u32,
        job_progress: f32,
        job_run_time: u64,
    },
    Fault {
        error_id: u16,
    },
}

/// A non-empty set of changed groups between two snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaEvent {
    groups: Vec<DeltaGroup>,
}

impl DeltaEvent {
    /// Computes the delta from `base` to `cur`. Returns `None` when the
    /// snapshots are identical, so an empty delta can never be emitted.
    pub fn between(base: &MachineState, cur: &MachineState) -> Option<DeltaEvent> {
        let mut groups = Vec::new();

        if cur.current_x != base.current_x || cur.current_y != base.current_y {
            groups.push(DeltaGroup::Position {
                dx: cur.current_x - base.current_x,
                dy: cur.current_y - base.current_y,
            });
        }

        if cur.state != base.state
            || cur.is_paused != base.is_paused
            || cur.is_homed != base.is_homed
        {
            groups.push(DeltaGroup::Run {
                state: cur.state,
                is_paused: cur.is_paused,
                is_homed: cur.is_homed,
            });
        }

        if cur.estop_on != base.estop_on
            || cur.limit_x_on != base.limit_x_on
            || cur.limit_y_on != base.limit_y_on
            || cur.hot_wire_on != base.hot_wire_on
            || cur.fan_on != base.fan_on
            || cur.hot_wire_power != base.hot_wire_power
            || cur.fan_power != base.fan_power
        {
            groups.push(DeltaGroup::Io {
                estop_on: cur.estop_on,
                limit_x_on: cur.limit_x_on,
                limit_y_on: cur.limit_y_on,
                hot_wire_on: cur.hot_wire_on,
                fan_on: cur.fan_on,
                hot_wire_power: cur.hot_wire_power,
                fan_power: cur.fan_power,
            });
        }

        if cur.current_project != base.current_project
            || cur.current_line != base.current_line
            || cur.total_lines != base.total_lines
            || cur.job_progress != base.job_progress
            || cur.job_run_time != base.job_run_time
        {
            groups.push(DeltaGroup::Progress {
                current_project: cur.current_project.clone(),
                current_line: cur.current_line,
                total_lines: cur.total_lines,
                job_progress: cur.job_progress,
                job_run_time: cur.job_run_time,
            });
        }

        if cur.error_id != base.error_id {
            groups.push(DeltaGroup::Fault {
                error_id: cur.error_id,
            });
        }

        if groups.is_empty() {
            None
        } else {
            Some(DeltaEvent { groups })
        }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Applies the delta to a snapshot. `between(base, cur)` applied to
    /// `base` reproduces `cur`.
    pub fn apply_to(&self, state: &mut MachineState) {
        for group in &self.groups {
            match group {
                DeltaGroup::Position { dx, dy } => {
                    state.current_x += dx;
                    state.current_y += dy;
                }
                DeltaGroup::Run {
                    state: run_state,
                    is_paused,
                    is_homed,
                } => {
                    state.state = *run_state;
                    state.is_paused = *is_paused;
                    state.is_homed = *is_homed;
                }
                DeltaGroup::Io {
                    estop_on,
                    limit_x_on,
                    limit_y_on,
                    hot_wire_on,
                    fan_on,
                    hot_wire_power,
                    fan_power,
                } => {
                    state.estop_on = *estop_on;
                    state.limit_x_on = *limit_x_on;
                    state.limit_y_on = *limit_y_on;
                    state.hot_wire_on = *hot_wire_on;
                    state.fan_on = *fan_on;
                    state.hot_wire_power = *hot_wire_power;
                    state.fan_power = *fan_power;
                }
                DeltaGroup::Progress {
                    current_project,
                    current_line,
                    total_lines,
                    job_progress,
                    job_run_time,
                } => {
                    state.current_project = current_project.clone();
                    state.current_line = *current_line;
                    state.total_lines = *total_lines;
                    state.job_progress = *job_progress;
                    state.job_run_time = *job_run_time;
                }
                DeltaGroup::Fault { error_id } => {
                    state.error_id = *error_id;
                }
            }
        }
    }

    /// Wire encoding: one flag per group plus only that group's fields.
    pub fn to_wire(&self) -> serde_json::Value {
        let mut wire = serde_json::Map::new();
        for group in &self.groups {
            match group {
                DeltaGroup::Position { dx, dy } => {
                    wire.insert("hasPositionUpdate".into(), json!(true));
                    wire.insert("deltaX".into(), json!(dx));
                    wire.insert("deltaY".into(), json!(dy));
                }
                DeltaGroup::Run {
                    state,
                    is_paused,
                    is_homed,
                } => {
                    wire.insert("hasStateUpdate".into(), json!(true));
                    wire.insert("state".into(), json!(state));
                    wire.insert("isPaused".into(), json!(is_paused));
                    wire.insert("isHomed".into(), json!(is_homed));
                }
                DeltaGroup::Io {
                    estop_on,
                    limit_x_on,
                    limit_y_on,
                    hot_wire_on,
                    fan_on,
                    hot_wire_power,
                    fan_power,
                } => {
                    wire.insert("hasIOUpdate".into(), json!(true));
                    wire.insert("estopOn".into(), json!(estop_on));
                    wire.insert("limitXOn".into(), json!(limit_x_on));
                    wire.insert("limitYOn".into(), json!(limit_y_on));
                    wire.insert("hotWireOn".into(), json!(hot_wire_on));
                    wire.insert("fanOn".into(), json!(fan_on));
                    wire.insert("hotWirePower".into(), json!(hot_wire_power));
                    wire.insert("fanPower".into(), json!(fan_power));
                }
                DeltaGroup::Progress {
                    current_project,
                    current_line,
                    total_lines,
                    job_progress,
                    job_run_time,
                } => {
                    wire.insert("hasProgressUpdate".into(), json!(true));
                    wire.insert("currentProject".into(), json!(current_project));
                    wire.insert("currentLine".into(), json!(current_line));
                    wire.insert("totalLines".into(), json!(total_lines));
                    wire.insert("jobProgress".into(), json!(job_progress));
                    wire.insert("jobRunTime".into(), json!(job_run_time));
                }
                DeltaGroup::Fault { error_id } => {
                    wire.insert("hasErrorUpdate".into(), json!(true));
                    wire.insert("errorID".into(), json!(error_id));
                }
            }
        }
        serde_json::Value::Object(wire)
    }
}

struct Subscriber {
    tx: mpsc::Sender<SseFrame>,
    needs_full: bool,
}

struct Inner {
    subscribers: Vec<Subscriber>,
    baseline: Option<MachineState>,
    tick: u32,
}

pub struct EventBroadcaster {
    machine: Arc<Mutex<MachineState>>,
    perf: Arc<PerfMonitor>,
    inner: Mutex<Inner>,
}

impl EventBroadcaster {
    pub fn new(machine: Arc<Mutex<MachineState>>, perf: Arc<PerfMonitor>) -> Arc<Self> {
        Arc::new(EventBroadcaster {
            machine,
            perf,
            inner: Mutex::new(Inner {
                subscribers: Vec::new(),
                baseline: None,
                tick: 0,
            }),
        })
    }

    /// Registers a new subscriber. The first frame it receives is always a
    /// full `machine-status` snapshot.
    pub async fn subscribe(&self) -> mpsc::Receiver<SseFrame> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        let mut inner = self.inner.lock().await;
        inner.subscribers.push(Subscriber {
            tx,
            needs_full: true,
        });
        self.perf.set_subscriber_count(inner.subscribers.len());
        debug!("Subscriber added ({} total)", inner.subscribers.len());
        rx
    }

    /// One broadcast pass. Called by [`run`] on a fixed cadence; exposed
    /// for tests.
    pub async fn tick(&self) {
        let tick_started = Instant::now();
        let snapshot = self.machine.lock().await.clone();

        let mut inner = self.inner.lock().await;
        inner.tick = inner.tick.wrapping_add(1);
        let resync_due = inner.tick % RESYNC_TICKS == 0;
        let perf_due = inner.tick % PERF_TICKS == 0;

        let delta = inner
            .baseline
            .as_ref()
            .and_then(|base| DeltaEvent::between(base, &snapshot));
        let baseline_missing = inner.baseline.is_none();

        let serialize_started = Instant::now();
        let full_frame = SseFrame {
            event: "machine-status",
            data: serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string()),
        };
        let delta_frame = delta.as_ref().map(|d| SseFrame {
            event: "machine-status-delta",
            data: d.to_wire().to_string(),
        });
        self.perf
            .record_serialize_micros(serialize_started.elapsed().as_micros() as u64);

        let delta_too_broad = delta
            .as_ref()
            .map(|d| d.group_count() >= FULL_SNAPSHOT_GROUP_THRESHOLD)
            .unwrap_or(false);
        let changed = delta.is_some() || baseline_missing;

        let perf_frame = if perf_due {
            serde_json::to_string(&self.perf.snapshot())
                .ok()
                .map(|data| SseFrame {
                    event: "performance-metrics",
                    data,
                })
        } else {
            None
        };

        let perf = self.perf.clone();
        inner.subscribers.retain_mut(|sub| {
            let send_full = sub.needs_full || baseline_missing || resync_due || delta_too_broad;

            let frame = if send_full && changed || sub.needs_full || resync_due {
                Some(&full_frame)
            } else {
                delta_frame.as_ref()
            };

            if let Some(frame) = frame {
                let is_full = frame.event == "machine-status";
                match sub.tx.try_send(frame.clone()) {
                    Ok(()) => {
                        sub.needs_full = false;
                        if is_full {
                            perf.full_event();
                        } else {
                            perf.delta_event();
                        }
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        perf.queue_drop();
                        sub.needs_full = true;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }

            // Telemetry only goes to subscribers that already hold a
            // consistent snapshot.
            if let Some(perf_frame) = &perf_frame {
                if !sub.needs_full && sub.tx.try_send(perf_frame.clone()).is_err() {
                    perf.queue_drop();
                }
            }

            true
        });

        if changed {
            inner.baseline = Some(snapshot);
        }
        self.perf.set_subscriber_count(inner.subscribers.len());
        self.perf
            .record_broadcast_tick_micros(tick_started.elapsed().as_micros() as u64);
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut interval = tokio::time::interval(BROADCAST_TICK);
        loop {
            interval.tick().await;
            self.tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_state() -> MachineState {
        MachineState {
            current_x: 10.0,
            current_y: 20.0,
            ..MachineState::default()
        }
    }

    #[test]
    fn identical_snapshots_yield_no_delta() {
        let state = base_state();
        assert_eq!(DeltaEvent::between(&state, &state.clone()), None);
    }

    #[test]
    fn position_delta_is_relative_and_applies() {
        let base = base_state();
        let mut cur = base.clone();
        cur.current_x += 5.0;
        cur.current_y -= 3.0;

        let delta = DeltaEvent::between(&base, &cur).unwrap();
        assert_eq!(delta.group_count(), 1);

        let wire = delta.to_wire();
        assert_eq!(wire["hasPositionUpdate"], true);
        assert_eq!(wire["deltaX"], 5.0);
        assert_eq!(wire["deltaY"], -3.0);
        assert!(wire.get("hasStateUpdate").is_none());

        let mut rebuilt = base.clone();
        delta.apply_to(&mut rebuilt);
        assert!((rebuilt.current_x - 15.0).abs() < 1e-4);
        assert!((rebuilt.current_y - 17.0).abs() < 1e-4);
    }

    #[test]
    fn delta_accumulation_matches_full_snapshot() {
        let base = base_state();
        let mut cur = base.clone();
        cur.state = CncState::Running;
        cur.current_x = 42.5;
        cur.current_line = 17;
        cur.total_lines = 80;
        cur.job_progress = 21.25;
        cur.job_run_time = 9001;
        cur.hot_wire_on = true;
        cur.current_project = "wing.gcode".to_string();

        let delta = DeltaEvent::between(&base, &cur).unwrap();
        let mut rebuilt = base.clone();
        delta.apply_to(&mut rebuilt);

        assert!((rebuilt.current_x - cur.current_x).abs() < 1e-4);
        rebuilt.current_x = cur.current_x;
        rebuilt.current_y = cur.current_y;
        assert_eq!(rebuilt, cur);
    }

    #[test]
    fn run_group_encodes_state_as_its_code() {
        let base = base_state();
        let mut cur = base.clone();
        cur.state = CncState::Running;

        let wire = DeltaEvent::between(&base, &cur).unwrap().to_wire();
        assert_eq!(wire["hasStateUpdate"], true);
        assert_eq!(wire["state"], 1);
    }

    #[test]
    fn error_group_round_trips() {
        let base = base_state();
        let mut cur = base.clone();
        cur.error_id = 3;
        cur.state = CncState::Error;

        let delta = DeltaEvent::between(&base, &cur).unwrap();
        let wire = delta.to_wire();
        assert_eq!(wire["hasErrorUpdate"], true);
        assert_eq!(wire["errorID"], 3);

        let mut rebuilt = base.clone();
        delta.apply_to(&mut rebuilt);
        assert_eq!(rebuilt, cur);
    }

    #[tokio::test]
    async fn first_frame_is_always_a_full_snapshot() {
        let machine = Arc::new(Mutex::new(base_state()));
        let perf = Arc::new(PerfMonitor::new());
        let broadcaster = EventBroadcaster::new(machine.clone(), perf);

        let mut rx = broadcaster.subscribe().await;
        broadcaster.tick().await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "machine-status");
        let decoded: MachineState = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(decoded.current_x, 10.0);
    }

    #[tokio::test]
    async fn quiet_machine_emits_nothing_after_bootstrap() {
        let machine = Arc::new(Mutex::new(base_state()));
        let perf = Arc::new(PerfMonitor::new());
        let broadcaster = EventBroadcaster::new(machine.clone(), perf);

        let mut rx = broadcaster.subscribe().await;
        broadcaster.tick().await;
        assert_eq!(rx.recv().await.unwrap().event, "machine-status");

        broadcaster.tick().await;
        broadcaster.tick().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn small_change_arrives_as_delta() {
        let machine = Arc::new(Mutex::new(base_state()));
        let perf = Arc::new(PerfMonitor::new());
        let broadcaster = EventBroadcaster::new(machine.clone(), perf);

        let mut rx = broadcaster.subscribe().await;
        broadcaster.tick().await;
        let _ = rx.recv().await.unwrap();

        machine.lock().await.current_x = 11.0;
        broadcaster.tick().await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "machine-status-delta");
        let wire: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
        assert_eq!(wire["hasPositionUpdate"], true);
        assert!((wire["deltaX"].as_f64().unwrap() - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn broad_change_falls_back_to_full_snapshot() {
        let machine = Arc::new(Mutex::new(base_state()));
        let perf = Arc::new(PerfMonitor::new());
        let broadcaster = EventBroadcaster::new(machine.clone(), perf);

        let mut rx = broadcaster.subscribe().await;
        broadcaster.tick().await;
        let _ = rx.recv().await.unwrap();

        {
            let mut m = machine.lock().await;
            m.current_x = 1.0;
            m.state = CncState::Running;
            m.hot_wire_on = true;
            m.current_line = 5;
            m.job_progress = 2.0;
        }
        broadcaster.tick().await;

        let frame = rx.recv().await.unwrap();
        assert_eq!(frame.event, "machine-status");
    }
}
