use std::time::Duration;

use tokio::sync::mpsc;
use tracing::error;

use hotwire_controller::broadcast::EventBroadcaster;
use hotwire_controller::config::{load_config, save_default_config};
use hotwire_controller::controller::{controller_service, safety, ControllerContext};
use hotwire_controller::projects::ProjectStore;
use hotwire_controller::server::{self, AppState};
use hotwire_controller::logging;

fn should_create_config() -> bool {
    std::env::var("CREATE_CONFIG")
        .map(|val| val == "1" || val.to_lowercase() == "true")
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    if should_create_config() {
        save_default_config()?;
    }

    let config = load_config().map_err(|e| {
        eprintln!("Failed to load configuration: {}", e);
        eprintln!("Run with CREATE_CONFIG=1 to create a default configuration file.");
        e
    })?;

    let mut projects = ProjectStore::new(&config.projects_dir);
    if let Err(e) = projects.init().await {
        // The dashboard can reinitialize storage later; start degraded.
        error!("Project storage unavailable: {}", e);
    }

    let startup_delay = Duration::from_millis(config.delay_after_startup_ms);
    let listen_addr = config.listen_addr.clone();
    let ctx = ControllerContext::new(config, projects);

    tokio::time::sleep(startup_delay).await;

    let (command_tx, command_rx) = mpsc::channel(32);
    let broadcaster = EventBroadcaster::new(ctx.machine.clone(), ctx.perf.clone());

    tokio::spawn(controller_service::run_controller(command_rx, ctx.clone()));
    tokio::spawn(safety::run_safety_monitor(ctx.clone()));
    tokio::spawn(broadcaster.clone().run());

    let state = AppState {
        ctx,
        command_tx,
        broadcaster,
    };
    server::serve(state, &listen_addr).await
}
