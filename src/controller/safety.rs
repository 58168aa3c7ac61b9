//! Safety monitor task.
//!
//! Polls the raw E-STOP and limit-switch inputs and forces the machine
//! into ERROR (E-STOP) or STOPPED (limit trip), overriding any in-flight
//! command. Motion halts through the shared stop flag, which every motion
//! loop samples each tick.
//!
//! E-STOP recovery needs both the physical input released and an explicit
//! reset command; the executor rejects reset while the input is asserted.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::controller::ControllerContext;
use crate::models::{error_id, CncState, MachineState};

const SAFETY_POLL: Duration = Duration::from_millis(10);

/// Forces the E-STOP fault path. Shared by the monitor and the
/// emergency-stop command.
pub fn apply_estop(machine: &mut MachineState) {
    machine.state = CncState::Error;
    machine.error_id = error_id::ESTOP;
    machine.estop_on = true;
    machine.is_paused = false;
    machine.is_homed = false;
    machine.hot_wire_on = false;
    machine.fan_on = false;
}

pub async fn run_safety_monitor(ctx: Arc<ControllerContext>) -> Result<()> {
    let mut interval = tokio::time::interval(SAFETY_POLL);

    loop {
        interval.tick().await;

        let (estop_enabled, limits_enabled) = {
            let config = ctx.config.lock().await;
            (!config.deactivate_estop, !config.deactivate_limit_switches)
        };

        let estop = estop_enabled && ctx.safety.estop.load(Ordering::SeqCst);
        let limit_x = limits_enabled && ctx.safety.limit_x.load(Ordering::SeqCst);
        let limit_y = limits_enabled && ctx.safety.limit_y.load(Ordering::SeqCst);

        let mut machine = ctx.machine.lock().await;

        machine.limit_x_on = limit_x;
        machine.limit_y_on = limit_y;

        if estop {
            if machine.error_id != error_id::ESTOP {
                error!("E-STOP asserted, halting all motion");
                ctx.flags.stop.store(true, Ordering::SeqCst);
                apply_estop(&mut machine);
            }
            continue;
        }

        // Input released; the latched ERROR state stays until reset.
        if machine.estop_on && machine.error_id == error_id::ESTOP {
            machine.estop_on = false;
            info!("E-STOP input released, awaiting reset");
        }

        // A tripped limit forces STOPPED from any state, so motion cannot
        // be commanded toward the switch. A latched fault keeps precedence.
        if (limit_x || limit_y)
            && !matches!(machine.state, CncState::Stopped | CncState::Error)
        {
            warn!(
                "Limit switch tripped (X={}, Y={}), stopping motion",
                limit_x, limit_y
            );
            ctx.flags.stop.store(true, Ordering::SeqCst);
            machine.state = CncState::Stopped;
            machine.is_paused = false;
            machine.hot_wire_on = false;
        }
    }
}
