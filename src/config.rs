use std::io;

use serde::{Deserialize, Serialize};

/// Per-axis motion parameters. Feed rates are mm/min, accelerations mm/s^2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AxisConfig {
    #[serde(rename = "stepsPerMM")]
    pub steps_per_mm: f32,
    pub rapid_feed_rate: f32,
    pub rapid_acceleration: f32,
    pub work_feed_rate: f32,
    pub work_acceleration: f32,
    /// Travel applied after the wire is heated, before cutting starts.
    pub offset: f32,
    pub max_travel: f32,
}

impl Default for AxisConfig {
    fn default() -> Self {
        AxisConfig {
            steps_per_mm: 80.0,
            rapid_feed_rate: 1000.0,
            rapid_acceleration: 100.0,
            work_feed_rate: 300.0,
            work_acceleration: 50.0,
            offset: 0.0,
            max_travel: 500.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MachineConfig {
    pub x_axis: AxisConfig,
    pub y_axis: AxisConfig,

    /// Hot wire PWM power, 0-100%.
    pub hot_wire_power: f32,
    /// Fan PWM power, 0-100%.
    pub fan_power: f32,

    #[serde(rename = "useGCodeFeedRate")]
    pub use_gcode_feed_rate: bool,
    /// Milliseconds to wait before the controller comes up.
    #[serde(rename = "delayAfterStartup")]
    pub delay_after_startup_ms: u64,
    #[serde(rename = "deactivateESTOP")]
    pub deactivate_estop: bool,
    pub deactivate_limit_switches: bool,
    /// 0 = normally open, 1 = normally closed.
    pub limit_switch_type: u8,

    /// A jog or homing move that runs longer than this is faulted.
    pub motion_watchdog_secs: u64,

    pub listen_addr: String,
    pub projects_dir: String,
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            x_axis: AxisConfig::default(),
            y_axis: AxisConfig::default(),
            hot_wire_power: 80.0,
            fan_power: 100.0,
            use_gcode_feed_rate: true,
            delay_after_startup_ms: 1000,
            deactivate_estop: false,
            deactivate_limit_switches: false,
            limit_switch_type: 0,
            motion_watchdog_secs: 60,
            listen_addr: "0.0.0.0:8080".to_string(),
            projects_dir: "projects".to_string(),
        }
    }
}

fn config_path() -> String {
    std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string())
}

pub fn load_config() -> io::Result<MachineConfig> {
    let config_path = config_path();

    let config_content = match std::fs::read_to_string(&config_path) {
        Ok(content) => content,
        Err(e) => {
            tracing::warn!(
                "Failed to read config file '{}': {}. Using defaults",
                config_path,
                e
            );
            return Ok(MachineConfig::default());
        }
    };

    toml::from_str(&config_content).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to parse config file '{}': {}", config_path, e),
        )
    })
}

pub fn save_config(config: &MachineConfig) -> io::Result<()> {
    let toml_content = toml::to_string_pretty(config).map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Failed to serialize config: {}", e),
        )
    })?;

    std::fs::write(config_path(), toml_content)
}

pub fn save_default_config() -> io::Result<()> {
    save_config(&MachineConfig::default())
}

impl MachineConfig {
    /// Feed rate for the given jog speed mode, taken as the slower of the
    /// two axes so a combined move never outruns either motor.
    pub fn jog_feed_rate(&self, rapid: bool) -> f32 {
        if rapid {
            self.x_axis.rapid_feed_rate.min(self.y_axis.rapid_feed_rate)
        } else {
            self.x_axis.work_feed_rate.min(self.y_axis.work_feed_rate)
        }
    }
}
