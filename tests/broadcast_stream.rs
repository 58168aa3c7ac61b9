//! Stress and recovery tests for the SSE broadcaster.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use hotwire_controller::broadcast::{EventBroadcaster, SseFrame};
use hotwire_controller::models::MachineState;
use hotwire_controller::perf::PerfMonitor;

fn fixture() -> (Arc<Mutex<MachineState>>, Arc<PerfMonitor>, Arc<EventBroadcaster>) {
    let machine = Arc::new(Mutex::new(MachineState::default()));
    let perf = Arc::new(PerfMonitor::new());
    let broadcaster = EventBroadcaster::new(machine.clone(), perf.clone());
    (machine, perf, broadcaster)
}

fn drain(rx: &mut mpsc::Receiver<SseFrame>) -> Vec<SseFrame> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    frames
}

#[tokio::test]
async fn every_late_subscriber_gets_a_full_snapshot_first() {
    let (machine, _perf, broadcaster) = fixture();

    // Subscribers join one per tick while the machine keeps changing, so
    // deltas are flowing the whole time.
    let mut receivers = Vec::new();
    for i in 0..100u32 {
        receivers.push(broadcaster.subscribe().await);
        machine.lock().await.current_x = i as f32;
        machine.lock().await.current_line = i;
        broadcaster.tick().await;
    }

    for rx in &mut receivers {
        let frames = drain(rx);
        let first = frames.first().expect("subscriber received no frames");
        assert_eq!(first.event, "machine-status");

        // Status frames after the first full one are only deltas or
        // resync/recovery fulls, never a delta before any full.
        for frame in &frames {
            assert!(
                frame.event == "machine-status"
                    || frame.event == "machine-status-delta"
                    || frame.event == "performance-metrics"
            );
        }
    }
}

#[tokio::test]
async fn accumulated_deltas_reproduce_the_live_state() {
    let (machine, _perf, broadcaster) = fixture();

    let mut rx = broadcaster.subscribe().await;
    broadcaster.tick().await;
    let bootstrap = drain(&mut rx);
    assert_eq!(bootstrap[0].event, "machine-status");
    let mut tracked: MachineState = serde_json::from_str(&bootstrap[0].data).unwrap();

    // A handful of small, drained-between-ticks updates.
    for step in 1..=5u32 {
        {
            let mut m = machine.lock().await;
            m.current_x += 2.5;
            m.current_y += 1.0;
            m.job_run_time = u64::from(step) * 100;
        }
        broadcaster.tick().await;

        for frame in drain(&mut rx) {
            match frame.event {
                "machine-status" => {
                    tracked = serde_json::from_str(&frame.data).unwrap();
                }
                "machine-status-delta" => {
                    let wire: serde_json::Value = serde_json::from_str(&frame.data).unwrap();
                    if wire["hasPositionUpdate"] == true {
                        tracked.current_x += wire["deltaX"].as_f64().unwrap() as f32;
                        tracked.current_y += wire["deltaY"].as_f64().unwrap() as f32;
                    }
                    if wire["hasProgressUpdate"] == true {
                        tracked.job_run_time = wire["jobRunTime"].as_u64().unwrap();
                    }
                }
                _ => {}
            }
        }
    }

    let live = machine.lock().await;
    assert!((tracked.current_x - live.current_x).abs() < 1e-3);
    assert!((tracked.current_y - live.current_y).abs() < 1e-3);
    assert_eq!(tracked.job_run_time, live.job_run_time);
}

#[tokio::test]
async fn slow_subscriber_overflow_counts_drops_and_forces_resync() {
    let (machine, perf, broadcaster) = fixture();

    let mut rx = broadcaster.subscribe().await;

    // Never drain: every tick changes the state, so the bounded queue
    // eventually rejects a frame.
    for i in 0..40u32 {
        machine.lock().await.current_x = i as f32;
        broadcaster.tick().await;
    }
    assert!(perf.snapshot().queue_drops > 0);

    // After the consumer catches up, the next changed tick must deliver a
    // full snapshot so the missed deltas cannot corrupt the client's view.
    drain(&mut rx);
    machine.lock().await.current_x = 999.0;
    broadcaster.tick().await;

    let frame = rx.recv().await.unwrap();
    assert_eq!(frame.event, "machine-status");
    let decoded: MachineState = serde_json::from_str(&frame.data).unwrap();
    assert_eq!(decoded.current_x, 999.0);
}

#[tokio::test]
async fn dropped_receiver_is_pruned_from_the_subscriber_list() {
    let (machine, perf, broadcaster) = fixture();

    let rx_kept = broadcaster.subscribe().await;
    let rx_dropped = broadcaster.subscribe().await;
    assert_eq!(perf.snapshot().subscriber_count, 2);

    drop(rx_dropped);
    machine.lock().await.current_x = 1.0;
    broadcaster.tick().await;

    assert_eq!(perf.snapshot().subscriber_count, 1);
    drop(rx_kept);
}
