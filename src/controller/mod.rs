pub mod controller_service;
pub mod job;
pub mod motion;
pub mod safety;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::MachineConfig;
use crate::models::MachineState;
use crate::perf::PerfMonitor;
use crate::projects::ProjectStore;

/// Cross-task motion flags.
///
/// `stop` is the priority path: the HTTP layer raises it before the stop or
/// emergency-stop command even reaches the queue, so in-flight motion reacts
/// within one control tick no matter what else is queued.
#[derive(Debug, Default)]
pub struct MotionFlags {
    pub stop: AtomicBool,
    pub pause: AtomicBool,
    pub moving: AtomicBool,
}

/// Raw physical safety inputs as last sampled. The safety monitor polls
/// these; tests and the input driver toggle them.
#[derive(Debug, Default)]
pub struct SafetyInputs {
    pub estop: AtomicBool,
    pub limit_x: AtomicBool,
    pub limit_y: AtomicBool,
}

/// Everything the controller tasks share. Cloned by reference into the
/// command executor, the motion tasks, the safety monitor and the HTTP layer.
pub struct ControllerContext {
    pub machine: Arc<Mutex<MachineState>>,
    pub flags: Arc<MotionFlags>,
    pub safety: Arc<SafetyInputs>,
    pub config: Arc<Mutex<MachineConfig>>,
    pub projects: Arc<Mutex<ProjectStore>>,
    pub perf: Arc<PerfMonitor>,
}

impl ControllerContext {
    pub fn new(config: MachineConfig, projects: ProjectStore) -> Arc<Self> {
        let mut machine = MachineState::default();
        machine.hot_wire_power = config.hot_wire_power;
        machine.fan_power = config.fan_power;

        Arc::new(ControllerContext {
            machine: Arc::new(Mutex::new(machine)),
            flags: Arc::new(MotionFlags::default()),
            safety: Arc::new(SafetyInputs::default()),
            config: Arc::new(Mutex::new(config)),
            projects: Arc::new(Mutex::new(projects)),
            perf: Arc::new(PerfMonitor::new()),
        })
    }
}
