//! Command executor task.
//!
//! Consumes [`CommandEnvelope`]s from the queue, validates each command
//! against the current state via the transition table, mutates the machine
//! and answers over the envelope's oneshot channel. A rejected command
//! leaves MachineState untouched: every branch validates fully before the
//! first mutation.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::controller::{job, motion, safety, ControllerContext};
use crate::models::{
    CncState, Command, CommandEnvelope, CommandError, CommandResponse, CommandResult, SpeedMode,
};
use crate::state_machine::check_transition;

pub async fn run_controller(
    mut command_rx: mpsc::Receiver<CommandEnvelope>,
    ctx: Arc<ControllerContext>,
) -> Result<()> {
    while let Some(envelope) = command_rx.recv().await {
        let CommandEnvelope { command, response } = envelope;
        debug!("Executing command: {:?}", command);

        let started = Instant::now();
        let result = execute(&ctx, command).await;
        ctx.perf
            .command_processed(started.elapsed().as_micros() as u64, result.is_err());

        if let Err(e) = &result {
            warn!("Command rejected: {}", e);
        }
        if response.send(result).is_err() {
            debug!("Command response receiver dropped");
        }
    }

    Ok(())
}

async fn execute(ctx: &Arc<ControllerContext>, command: Command) -> CommandResult {
    match command {
        Command::Jog { dx, dy, speed_mode } => jog(ctx, dx, dy, speed_mode).await,
        Command::Home => home(ctx).await,
        Command::Zero => zero(ctx).await,
        Command::Start => start(ctx).await,
        Command::Pause => pause(ctx).await,
        Command::Stop => stop(ctx).await,
        Command::Reset => reset(ctx).await,
        Command::SetWire { on } => set_output(ctx, Output::Wire, on).await,
        Command::SetFan { on } => set_output(ctx, Output::Fan, on).await,
        Command::EmergencyStop => emergency_stop(ctx).await,
        Command::SelectProject { file } => select_project(ctx, file).await,
    }
}

async fn jog(ctx: &Arc<ControllerContext>, dx: f32, dy: f32, speed_mode: SpeedMode) -> CommandResult {
    if !dx.is_finite() || !dy.is_finite() {
        return Err(CommandError::InvalidParameter(
            "jog displacement must be finite".to_string(),
        ));
    }
    let distance = (dx * dx + dy * dy).sqrt();
    if distance <= 0.0 {
        return Err(CommandError::InvalidParameter(
            "jog distance must be positive".to_string(),
        ));
    }

    let (feed, max_x, max_y) = {
        let config = ctx.config.lock().await;
        (
            config.jog_feed_rate(speed_mode == SpeedMode::Rapid),
            config.x_axis.max_travel,
            config.y_axis.max_travel,
        )
    };

    let mut machine = ctx.machine.lock().await;
    if !matches!(machine.state, CncState::Idle | CncState::Jog) {
        return Err(CommandError::invalid_state(
            machine.state,
            "jog is only available while idle",
        ));
    }
    if ctx.flags.moving.load(Ordering::SeqCst) {
        return Err(CommandError::invalid_state(
            machine.state,
            "motion already in progress",
        ));
    }

    let target_x = machine.current_x + dx;
    let target_y = machine.current_y + dy;
    if target_x < 0.0 || target_x > max_x || target_y < 0.0 || target_y > max_y {
        return Err(CommandError::InvalidParameter(format!(
            "jog target X={:.3} Y={:.3} is outside axis travel",
            target_x, target_y
        )));
    }

    check_transition(machine.state, CncState::Jog)?;
    machine.state = CncState::Jog;
    drop(machine);

    ctx.flags.stop.store(false, Ordering::SeqCst);
    ctx.flags.pause.store(false, Ordering::SeqCst);
    ctx.flags.moving.store(true, Ordering::SeqCst);
    motion::spawn_jog(ctx.clone(), dx, dy, feed);

    info!("Jog accepted: dX={:.3} dY={:.3} at {:.0} mm/min", dx, dy, feed);
    Ok(CommandResponse::Success)
}

async fn home(ctx: &Arc<ControllerContext>) -> CommandResult {
    let rapid_feed = ctx.config.lock().await.jog_feed_rate(true);

    let mut machine = ctx.machine.lock().await;
    if machine.state != CncState::Idle {
        return Err(CommandError::invalid_state(
            machine.state,
            "homing is only available while idle",
        ));
    }
    if ctx.flags.moving.load(Ordering::SeqCst) {
        return Err(CommandError::invalid_state(
            machine.state,
            "motion already in progress",
        ));
    }

    check_transition(machine.state, CncState::Homing)?;
    machine.state = CncState::Homing;
    drop(machine);

    ctx.flags.stop.store(false, Ordering::SeqCst);
    ctx.flags.pause.store(false, Ordering::SeqCst);
    ctx.flags.moving.store(true, Ordering::SeqCst);
    motion::spawn_homing(ctx.clone(), rapid_feed);

    Ok(CommandResponse::Success)
}

async fn zero(ctx: &Arc<ControllerContext>) -> CommandResult {
    let mut machine = ctx.machine.lock().await;
    if machine.state != CncState::Idle {
        return Err(CommandError::invalid_state(
            machine.state,
            "zeroing is only available while idle",
        ));
    }

    machine.current_x = 0.0;
    machine.current_y = 0.0;
    info!("Axes zeroed, origin redefined");
    Ok(CommandResponse::Success)
}

async fn start(ctx: &Arc<ControllerContext>) -> CommandResult {
    let (project, path) = {
        let projects = ctx.projects.lock().await;
        match (projects.selected(), projects.selected_path()) {
            (Some(name), Some(path)) => (name.to_string(), path),
            _ => return Err(CommandError::NoProjectSelected),
        }
    };

    let mut machine = ctx.machine.lock().await;
    if machine.state != CncState::Idle {
        return Err(CommandError::invalid_state(
            machine.state,
            "a job can only start while idle",
        ));
    }
    if ctx.flags.moving.load(Ordering::SeqCst) {
        return Err(CommandError::invalid_state(
            machine.state,
            "motion already in progress",
        ));
    }
    if !machine.is_homed {
        warn!("Starting job '{}' on an unhomed machine", project);
    }

    check_transition(machine.state, CncState::Running)?;
    machine.state = CncState::Running;
    machine.is_paused = false;
    machine.current_project = project.clone();
    machine.current_line = 0;
    machine.total_lines = 0;
    machine.job_progress = 0.0;
    machine.job_run_time = 0;
    drop(machine);

    ctx.flags.stop.store(false, Ordering::SeqCst);
    ctx.flags.pause.store(false, Ordering::SeqCst);
    ctx.flags.moving.store(true, Ordering::SeqCst);
    job::spawn_job(ctx.clone(), path);

    info!("Job '{}' started", project);
    Ok(CommandResponse::Success)
}

async fn pause(ctx: &Arc<ControllerContext>) -> CommandResult {
    let mut machine = ctx.machine.lock().await;
    if machine.state != CncState::Running {
        return Err(CommandError::invalid_state(
            machine.state,
            "pause only applies to a running job",
        ));
    }

    let paused = !machine.is_paused;
    machine.is_paused = paused;
    ctx.flags.pause.store(paused, Ordering::SeqCst);

    info!("Job {}", if paused { "paused" } else { "resumed" });
    Ok(CommandResponse::Message(
        if paused { "paused" } else { "resumed" }.to_string(),
    ))
}

async fn stop(ctx: &Arc<ControllerContext>) -> CommandResult {
    let mut machine = ctx.machine.lock().await;
    match machine.state {
        CncState::Running | CncState::Jog | CncState::Homing => {
            ctx.flags.stop.store(true, Ordering::SeqCst);
            check_transition(machine.state, CncState::Stopped)?;
            machine.state = CncState::Stopped;
            machine.is_paused = false;
            machine.hot_wire_on = false;
            info!("Motion stopped by operator");
        }
        // Nothing in flight; stop is an acknowledged no-op.
        CncState::Idle | CncState::Stopped | CncState::Error => {
            debug!("Stop requested with no motion in progress");
        }
    }
    Ok(CommandResponse::Success)
}

async fn reset(ctx: &Arc<ControllerContext>) -> CommandResult {
    let estop_enabled = !ctx.config.lock().await.deactivate_estop;
    if estop_enabled && ctx.safety.estop.load(Ordering::SeqCst) {
        let state = ctx.machine.lock().await.state;
        return Err(CommandError::invalid_state(
            state,
            "E-STOP is still asserted",
        ));
    }

    let mut machine = ctx.machine.lock().await;
    match machine.state {
        CncState::Stopped | CncState::Error | CncState::Idle => {
            check_transition(machine.state, CncState::Idle)?;
            machine.clear_for_reset();
            machine.estop_on = false;
            info!("Machine reset to IDLE");
            Ok(CommandResponse::Success)
        }
        other => Err(CommandError::invalid_state(
            other,
            "stop the machine before resetting",
        )),
    }
}

enum Output {
    Wire,
    Fan,
}

async fn set_output(ctx: &Arc<ControllerContext>, output: Output, on: bool) -> CommandResult {
    let mut machine = ctx.machine.lock().await;
    if machine.state == CncState::Error {
        return Err(CommandError::invalid_state(
            machine.state,
            "outputs are locked out while faulted",
        ));
    }

    match output {
        Output::Wire => {
            machine.hot_wire_on = on;
            info!("Hot wire {}", if on { "on" } else { "off" });
        }
        Output::Fan => {
            machine.fan_on = on;
            info!("Fan {}", if on { "on" } else { "off" });
        }
    }
    Ok(CommandResponse::Success)
}

async fn emergency_stop(ctx: &Arc<ControllerContext>) -> CommandResult {
    ctx.flags.stop.store(true, Ordering::SeqCst);
    ctx.flags.pause.store(false, Ordering::SeqCst);

    let mut machine = ctx.machine.lock().await;
    safety::apply_estop(&mut machine);
    tracing::error!("Emergency stop executed");
    Ok(CommandResponse::Success)
}

async fn select_project(ctx: &Arc<ControllerContext>, file: String) -> CommandResult {
    {
        let machine = ctx.machine.lock().await;
        if machine.state == CncState::Running {
            return Err(CommandError::invalid_state(
                machine.state,
                "cannot change project while a job is running",
            ));
        }
    }

    let mut projects = ctx.projects.lock().await;
    projects.select(&file).map_err(|e| match e {
        crate::projects::ProjectStoreError::NotFound(name) => {
            CommandError::InvalidParameter(format!("project '{}' not found", name))
        }
        crate::projects::ProjectStoreError::InvalidName(name) => {
            CommandError::InvalidParameter(format!("invalid project name '{}'", name))
        }
        other => CommandError::ResourceUnavailable(other.to_string()),
    })?;
    drop(projects);

    let mut machine = ctx.machine.lock().await;
    machine.current_project = file;
    machine.current_line = 0;
    machine.total_lines = 0;
    machine.job_progress = 0.0;
    machine.job_run_time = 0;
    Ok(CommandResponse::Success)
}
