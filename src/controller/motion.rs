//! Simulated motion backend for jog and homing moves.
//!
//! A move runs as a spawned task that advances the machine position a
//! little every control tick, honoring the shared stop flag and a watchdog
//! deadline. The command executor transitions the machine into JOG/HOMING
//! before spawning; the task publishes the terminal transition when the
//! move finishes.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::ControllerContext;
use crate::models::{error_id, CncState};

/// Control tick for simulated motion.
pub const MOTION_TICK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MotionOutcome {
    Completed,
    Stopped,
    TimedOut,
}

/// Advances the position toward `(target_x, target_y)` at `feed_rate`
/// mm/min, one tick at a time. Returns how the move ended.
async fn drive_to(
    ctx: &ControllerContext,
    target_x: f32,
    target_y: f32,
    feed_rate: f32,
    watchdog: Duration,
) -> MotionOutcome {
    let (start_x, start_y) = {
        let machine = ctx.machine.lock().await;
        (machine.current_x, machine.current_y)
    };

    let dx = target_x - start_x;
    let dy = target_y - start_y;
    let total = (dx * dx + dy * dy).sqrt();
    if total <= f32::EPSILON {
        return MotionOutcome::Completed;
    }

    let (ux, uy) = (dx / total, dy / total);
    let step = (feed_rate / 60.0) * MOTION_TICK.as_secs_f32();
    let mut traveled = 0.0f32;
    let started = Instant::now();

    loop {
        if ctx.flags.stop.load(Ordering::SeqCst) {
            return MotionOutcome::Stopped;
        }
        if started.elapsed() >= watchdog {
            return MotionOutcome::TimedOut;
        }

        tokio::time::sleep(MOTION_TICK).await;

        let advance = step.min(total - traveled);
        traveled += advance;

        let mut machine = ctx.machine.lock().await;
        machine.current_x = start_x + ux * traveled;
        machine.current_y = start_y + uy * traveled;

        if traveled >= total {
            return MotionOutcome::Completed;
        }
    }
}

/// Runs one jog displacement. Spawned with the machine already in JOG.
pub fn spawn_jog(ctx: Arc<ControllerContext>, dx: f32, dy: f32, feed_rate: f32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let watchdog = watchdog_interval(&ctx).await;
        let (target_x, target_y) = {
            let machine = ctx.machine.lock().await;
            (machine.current_x + dx, machine.current_y + dy)
        };

        debug!(
            "Jog to X={:.3} Y={:.3} at {:.0} mm/min",
            target_x, target_y, feed_rate
        );
        let outcome = drive_to(&ctx, target_x, target_y, feed_rate, watchdog).await;
        finish_motion(&ctx, CncState::Jog, outcome, error_id::MOTION_TIMEOUT).await;
    })
}

/// Runs the homing sequence: rapid move back to the reference position,
/// then latches `is_homed` and redefines the origin.
pub fn spawn_homing(ctx: Arc<ControllerContext>, rapid_feed: f32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let watchdog = watchdog_interval(&ctx).await;

        info!("Homing sequence started");
        let outcome = drive_to(&ctx, 0.0, 0.0, rapid_feed, watchdog).await;

        if outcome == MotionOutcome::Completed {
            let mut machine = ctx.machine.lock().await;
            machine.current_x = 0.0;
            machine.current_y = 0.0;
            machine.is_homed = true;
        }
        finish_motion(&ctx, CncState::Homing, outcome, error_id::HOMING_FAILED).await;
    })
}

async fn watchdog_interval(ctx: &ControllerContext) -> Duration {
    Duration::from_secs(ctx.config.lock().await.motion_watchdog_secs)
}

/// Publishes the terminal transition for a finished move.
///
/// A stopped move publishes nothing: whoever raised the stop flag (stop
/// command, E-STOP, safety monitor) already owns the state.
async fn finish_motion(
    ctx: &ControllerContext,
    from: CncState,
    outcome: MotionOutcome,
    timeout_error: u16,
) {
    let mut machine = ctx.machine.lock().await;
    match outcome {
        MotionOutcome::Completed => {
            if machine.state == from {
                machine.state = CncState::Idle;
                info!(
                    "{} finished at X={:.3} Y={:.3}",
                    from, machine.current_x, machine.current_y
                );
            }
        }
        MotionOutcome::Stopped => {
            debug!("{} interrupted by stop request", from);
        }
        MotionOutcome::TimedOut => {
            warn!("{} watchdog expired, faulting machine", from);
            machine.state = CncState::Error;
            machine.error_id = timeout_error;
            machine.hot_wire_on = false;
        }
    }
    drop(machine);
    ctx.flags.moving.store(false, Ordering::SeqCst);
}
