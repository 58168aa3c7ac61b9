//! Non-blocking G-code job runner.
//!
//! The runner is a spawned task that walks the selected project file line
//! by line, extracts motion commands (G0/G1 with X/Y/F) and simulates the
//! cut one control tick at a time. Stop and pause flags are sampled every
//! tick, so both take effect within [`MOTION_TICK`] of being raised.
//!
//! Progress is derived from consumed bytes over file size, and the line
//! total is estimated from the file size (about 20 bytes per line), so
//! `currentLine <= totalLines` holds for the whole run.

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::controller::motion::MOTION_TICK;
use crate::controller::ControllerContext;
use crate::models::{error_id, CncState};

/// Bytes-per-line estimate used for the line total before the file has
/// been fully read.
const ESTIMATED_BYTES_PER_LINE: u64 = 20;

/// Motion extracted from one G-code line. Coordinates are absolute
/// machine-space targets; a missing axis keeps its current value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MoveTarget {
    pub x: Option<f32>,
    pub y: Option<f32>,
    pub feed: Option<f32>,
    pub rapid: bool,
}

/// Extracts the move from a G-code line, if it carries one.
///
/// Everything that is not a G0/G1 move (comments, M-codes, blank lines)
/// yields `None` and is skipped by the runner.
pub fn parse_move(line: &str) -> Option<MoveTarget> {
    let line = match line.split(';').next() {
        Some(code) => code.trim(),
        None => return None,
    };
    if line.is_empty() {
        return None;
    }

    let mut words = line.split_whitespace();
    let rapid = match words.next()?.to_ascii_uppercase().as_str() {
        "G0" | "G00" => true,
        "G1" | "G01" => false,
        _ => return None,
    };

    let mut target = MoveTarget {
        x: None,
        y: None,
        feed: None,
        rapid,
    };

    for word in words {
        let mut chars = word.chars();
        let letter = chars.next()?.to_ascii_uppercase();
        let value: f32 = chars.as_str().parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        match letter {
            'X' => target.x = Some(value),
            'Y' => target.y = Some(value),
            'F' => target.feed = Some(value),
            _ => {} // Z, E and friends have no meaning on a two-axis cutter
        }
    }

    if target.x.is_none() && target.y.is_none() {
        return None;
    }
    Some(target)
}

/// Wall-clock accumulator that freezes while the job is paused.
#[derive(Debug)]
pub struct RunTimer {
    accumulated: Duration,
    segment_start: Option<Instant>,
}

impl RunTimer {
    pub fn started() -> Self {
        RunTimer {
            accumulated: Duration::ZERO,
            segment_start: Some(Instant::now()),
        }
    }

    pub fn pause(&mut self) {
        if let Some(start) = self.segment_start.take() {
            self.accumulated += start.elapsed();
        }
    }

    pub fn resume(&mut self) {
        if self.segment_start.is_none() {
            self.segment_start = Some(Instant::now());
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        let running = self
            .segment_start
            .map(|start| start.elapsed())
            .unwrap_or(Duration::ZERO);
        (self.accumulated + running).as_millis() as u64
    }
}

enum JobOutcome {
    Finished,
    Stopped,
    Faulted(String),
}

/// Spawns the runner for the already-opened project. The executor has put
/// the machine into RUNNING before calling this.
pub fn spawn_job(ctx: Arc<ControllerContext>, path: PathBuf) -> JoinHandle<()> {
    tokio::spawn(async move {
        let outcome = run_job(&ctx, path).await;

        let mut machine = ctx.machine.lock().await;
        match outcome {
            JobOutcome::Finished => {
                if machine.state == CncState::Running {
                    machine.state = CncState::Idle;
                }
                machine.job_progress = 100.0;
                machine.current_line = machine.total_lines;
                machine.is_paused = false;
                machine.hot_wire_on = false;
                info!(
                    "Job '{}' finished in {} ms",
                    machine.current_project, machine.job_run_time
                );
            }
            JobOutcome::Stopped => {
                machine.is_paused = false;
                machine.hot_wire_on = false;
                info!("Job '{}' stopped by operator", machine.current_project);
            }
            JobOutcome::Faulted(message) => {
                warn!("Job '{}' faulted: {}", machine.current_project, message);
                machine.state = CncState::Error;
                machine.error_id = error_id::JOB_FILE_FAULT;
                machine.is_paused = false;
                machine.hot_wire_on = false;
            }
        }
        drop(machine);
        ctx.flags.moving.store(false, Ordering::SeqCst);
    })
}

async fn run_job(ctx: &ControllerContext, path: PathBuf) -> JobOutcome {
    let content = match tokio::fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) => return JobOutcome::Faulted(format!("cannot read {:?}: {}", path, e)),
    };

    let file_size = content.len() as u64;
    let total_lines = (file_size / ESTIMATED_BYTES_PER_LINE).max(1) as u32;
    let (work_feed, rapid_feed, use_gcode_feed) = {
        let config = ctx.config.lock().await;
        (
            config.jog_feed_rate(false),
            config.jog_feed_rate(true),
            config.use_gcode_feed_rate,
        )
    };

    let mut timer = RunTimer::started();
    {
        let mut machine = ctx.machine.lock().await;
        machine.total_lines = total_lines;
        machine.hot_wire_on = true;
    }

    let mut consumed: u64 = 0;
    let mut line_number: u32 = 0;

    for line in content.lines() {
        consumed += line.len() as u64 + 1;
        line_number += 1;

        if ctx.flags.stop.load(Ordering::SeqCst) {
            return JobOutcome::Stopped;
        }
        if let JobOutcome::Stopped = wait_while_paused(ctx, &mut timer).await {
            return JobOutcome::Stopped;
        }

        {
            let mut machine = ctx.machine.lock().await;
            machine.current_line = line_number.min(total_lines);
            machine.job_progress =
                ((consumed.min(file_size) as f32 / file_size.max(1) as f32) * 100.0).min(100.0);
            machine.job_run_time = timer.elapsed_ms();
        }

        let Some(target) = parse_move(line) else {
            continue;
        };

        let feed = if target.rapid {
            rapid_feed
        } else if use_gcode_feed_rate_applies(use_gcode_feed, target.feed) {
            target.feed.unwrap_or(work_feed)
        } else {
            work_feed
        };

        debug!(
            "Line {}: move to X={:?} Y={:?} at {:.0} mm/min",
            line_number, target.x, target.y, feed
        );

        if let JobOutcome::Stopped = cut_to(ctx, target, feed, &mut timer).await {
            return JobOutcome::Stopped;
        }
    }

    JobOutcome::Finished
}

fn use_gcode_feed_rate_applies(enabled: bool, feed: Option<f32>) -> bool {
    enabled && feed.map(|f| f.is_finite() && f > 0.0).unwrap_or(false)
}

/// Blocks (cooperatively) while the pause flag is raised. Run time does
/// not advance during the pause.
async fn wait_while_paused(ctx: &ControllerContext, timer: &mut RunTimer) -> JobOutcome {
    if !ctx.flags.pause.load(Ordering::SeqCst) {
        return JobOutcome::Finished;
    }

    timer.pause();
    while ctx.flags.pause.load(Ordering::SeqCst) {
        if ctx.flags.stop.load(Ordering::SeqCst) {
            return JobOutcome::Stopped;
        }
        tokio::time::sleep(MOTION_TICK).await;
    }
    timer.resume();
    JobOutcome::Finished
}

/// Simulates one cutting move, tick by tick.
async fn cut_to(
    ctx: &ControllerContext,
    target: MoveTarget,
    feed_rate: f32,
    timer: &mut RunTimer,
) -> JobOutcome {
    let (start_x, start_y) = {
        let machine = ctx.machine.lock().await;
        (machine.current_x, machine.current_y)
    };

    let target_x = target.x.unwrap_or(start_x);
    let target_y = target.y.unwrap_or(start_y);
    let dx = target_x - start_x;
    let dy = target_y - start_y;
    let total = (dx * dx + dy * dy).sqrt();
    if total <= f32::EPSILON {
        return JobOutcome::Finished;
    }

    let (ux, uy) = (dx / total, dy / total);
    let step = (feed_rate.max(1.0) / 60.0) * MOTION_TICK.as_secs_f32();
    let mut traveled = 0.0f32;

    loop {
        if ctx.flags.stop.load(Ordering::SeqCst) {
            return JobOutcome::Stopped;
        }
        if let JobOutcome::Stopped = wait_while_paused(ctx, timer).await {
            return JobOutcome::Stopped;
        }

        tokio::time::sleep(MOTION_TICK).await;

        let advance = step.min(total - traveled);
        traveled += advance;

        let mut machine = ctx.machine.lock().await;
        machine.current_x = start_x + ux * traveled;
        machine.current_y = start_y + uy * traveled;
        machine.job_run_time = timer.elapsed_ms();

        if traveled >= total {
            return JobOutcome::Finished;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_linear_move_with_feed() {
        let mv = parse_move("G1 X10.5 Y-3.25 F600").unwrap();
        assert_eq!(mv.x, Some(10.5));
        assert_eq!(mv.y, Some(-3.25));
        assert_eq!(mv.feed, Some(600.0));
        assert!(!mv.rapid);
    }

    #[test]
    fn parses_rapid_and_zero_padded_codes() {
        assert!(parse_move("G0 X5").unwrap().rapid);
        assert!(parse_move("g00 y2").unwrap().rapid);
        assert!(!parse_move("G01 X1 Y1").unwrap().rapid);
    }

    #[test]
    fn single_axis_move_leaves_other_axis_unset() {
        let mv = parse_move("G1 Y42").unwrap();
        assert_eq!(mv.x, None);
        assert_eq!(mv.y, Some(42.0));
    }

    #[test]
    fn comments_and_non_motion_lines_are_skipped() {
        assert_eq!(parse_move("; preamble"), None);
        assert_eq!(parse_move(""), None);
        assert_eq!(parse_move("M3 S255"), None);
        assert_eq!(parse_move("G1 F600"), None); // feed only, no axis word
        let mv = parse_move("G1 X2 Y3 ; cut corner").unwrap();
        assert_eq!(mv.x, Some(2.0));
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert_eq!(parse_move("G1 Xabc"), None);
        assert_eq!(parse_move("G1 Xinf Y2"), None);
    }

    #[test]
    fn run_timer_freezes_while_paused() {
        let mut timer = RunTimer::started();
        std::thread::sleep(Duration::from_millis(30));
        timer.pause();
        let at_pause = timer.elapsed_ms();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(timer.elapsed_ms(), at_pause);

        timer.resume();
        std::thread::sleep(Duration::from_millis(20));
        assert!(timer.elapsed_ms() >= at_pause + 15);
        assert!(timer.elapsed_ms() < at_pause + 50);
    }
}
