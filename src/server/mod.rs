//! HTTP and SSE front end for the web dashboard.
//!
//! Command endpoints translate the wire request into a [`Command`], push
//! it onto the executor queue and wait for the structured result; every
//! outcome, accepted or rejected, is answered with HTTP 200 and a
//! `{success, message}` body the dashboard renders directly.

use std::convert::Infallible;
use std::str::FromStr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::broadcast::EventBroadcaster;
use crate::config::{save_config, MachineConfig};
use crate::controller::ControllerContext;
use crate::models::{Command, CommandEnvelope, CommandResponse, SpeedMode};

#[derive(Clone)]
pub struct AppState {
    pub ctx: Arc<ControllerContext>,
    pub command_tx: mpsc::Sender<CommandEnvelope>,
    pub broadcaster: Arc<EventBroadcaster>,
}

#[derive(Debug, Serialize)]
struct ApiResponse {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ApiResponse {
    fn ok() -> Json<ApiResponse> {
        Json(ApiResponse {
            success: true,
            message: None,
        })
    }

    fn ok_with(message: impl Into<String>) -> Json<ApiResponse> {
        Json(ApiResponse {
            success: true,
            message: Some(message.into()),
        })
    }

    fn error(message: impl Into<String>) -> Json<ApiResponse> {
        Json(ApiResponse {
            success: false,
            message: Some(message.into()),
        })
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/jog", post(jog))
        .route("/api/home", post(home))
        .route("/api/zero", post(zero))
        .route("/api/start", post(start))
        .route("/api/pause", post(pause))
        .route("/api/stop", post(stop))
        .route("/api/reset", post(reset))
        .route("/api/wire", post(wire))
        .route("/api/fan", post(fan))
        .route("/api/emergency-stop", post(emergency_stop))
        .route("/api/position", get(position))
        .route("/api/config", get(get_config).post(update_config))
        .route("/api/performance", get(performance))
        .route("/api/performance/reset", post(performance_reset))
        .route("/api/list-files", get(list_files))
        .route("/api/select-file", post(select_file))
        .route("/api/delete-file", post(delete_file))
        .route("/api/upload-file", post(upload_file))
        .route("/api/refresh-files", post(refresh_files))
        .route("/api/sd_content", get(sd_content))
        .route("/api/sd-status", get(sd_status))
        .route("/api/reinitialize-sd", post(reinitialize_sd))
        .route("/events", get(events))
        .with_state(state)
}

pub async fn serve(state: AppState, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Web interface listening on {}", addr);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Sends one command through the executor queue and maps the result onto
/// the wire response.
async fn dispatch(state: &AppState, command: Command) -> Json<ApiResponse> {
    let (envelope, rx) = CommandEnvelope::new(command);
    if state.command_tx.send(envelope).await.is_err() {
        return ApiResponse::error("controller is not running");
    }

    match rx.await {
        Ok(Ok(CommandResponse::Success)) => ApiResponse::ok(),
        Ok(Ok(CommandResponse::Message(message))) => ApiResponse::ok_with(message),
        Ok(Err(e)) => ApiResponse::error(e.to_string()),
        Err(_) => ApiResponse::error("controller dropped the command"),
    }
}

// ---- motion and run control ----------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JogRequest {
    x: f32,
    y: f32,
    speed_mode: String,
}

async fn jog(State(state): State<AppState>, Json(req): Json<JogRequest>) -> Json<ApiResponse> {
    let speed_mode = match SpeedMode::from_str(&req.speed_mode) {
        Ok(mode) => mode,
        Err(e) => return ApiResponse::error(e.to_string()),
    };
    dispatch(
        &state,
        Command::Jog {
            dx: req.x,
            dy: req.y,
            speed_mode,
        },
    )
    .await
}

async fn home(State(state): State<AppState>) -> Json<ApiResponse> {
    dispatch(&state, Command::Home).await
}

async fn zero(State(state): State<AppState>) -> Json<ApiResponse> {
    dispatch(&state, Command::Zero).await
}

async fn start(State(state): State<AppState>) -> Json<ApiResponse> {
    dispatch(&state, Command::Start).await
}

async fn pause(State(state): State<AppState>) -> Json<ApiResponse> {
    dispatch(&state, Command::Pause).await
}

async fn stop(State(state): State<AppState>) -> Json<ApiResponse> {
    // Priority path: raise the stop flag before the command is queued so
    // in-flight motion halts within one control tick.
    state.ctx.flags.stop.store(true, Ordering::SeqCst);
    dispatch(&state, Command::Stop).await
}

async fn reset(State(state): State<AppState>) -> Json<ApiResponse> {
    dispatch(&state, Command::Reset).await
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    state: bool,
}

async fn wire(State(state): State<AppState>, Json(req): Json<ToggleRequest>) -> Json<ApiResponse> {
    dispatch(&state, Command::SetWire { on: req.state }).await
}

async fn fan(State(state): State<AppState>, Json(req): Json<ToggleRequest>) -> Json<ApiResponse> {
    dispatch(&state, Command::SetFan { on: req.state }).await
}

async fn emergency_stop(State(state): State<AppState>) -> Json<ApiResponse> {
    state.ctx.flags.stop.store(true, Ordering::SeqCst);
    dispatch(&state, Command::EmergencyStop).await
}

// ---- queries -------------------------------------------------------------

async fn position(State(state): State<AppState>) -> Json<serde_json::Value> {
    let machine = state.ctx.machine.lock().await;
    Json(json!({ "x": machine.current_x, "y": machine.current_y }))
}

async fn performance(State(state): State<AppState>) -> Json<crate::perf::PerfSnapshot> {
    Json(state.ctx.perf.snapshot())
}

async fn performance_reset(State(state): State<AppState>) -> Json<ApiResponse> {
    state.ctx.perf.reset();
    ApiResponse::ok()
}

// ---- configuration -------------------------------------------------------

async fn get_config(State(state): State<AppState>) -> Json<MachineConfig> {
    Json(state.ctx.config.lock().await.clone())
}

async fn update_config(
    State(state): State<AppState>,
    Json(new_config): Json<MachineConfig>,
) -> Json<ApiResponse> {
    {
        let machine = state.ctx.machine.lock().await;
        if machine.is_busy() {
            return ApiResponse::error("configuration is locked while the machine is busy");
        }
    }

    if let Err(e) = save_config(&new_config) {
        warn!("Failed to persist configuration: {}", e);
        return ApiResponse::error(format!("failed to save configuration: {}", e));
    }

    {
        let mut machine = state.ctx.machine.lock().await;
        machine.hot_wire_power = new_config.hot_wire_power;
        machine.fan_power = new_config.fan_power;
    }
    *state.ctx.config.lock().await = new_config;

    info!("Configuration updated");
    ApiResponse::ok()
}

// ---- project files -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct FileQuery {
    file: String,
}

async fn list_files(State(state): State<AppState>) -> Json<serde_json::Value> {
    let projects = state.ctx.projects.lock().await;
    Json(json!({ "success": true, "files": projects.list() }))
}

async fn select_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Json<ApiResponse> {
    dispatch(&state, Command::SelectProject { file: query.file }).await
}

async fn delete_file(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Json<ApiResponse> {
    {
        let machine = state.ctx.machine.lock().await;
        if machine.state == crate::models::CncState::Running {
            return ApiResponse::error("cannot delete files while a job is running");
        }
    }

    let mut projects = state.ctx.projects.lock().await;
    match projects.delete(&query.file).await {
        Ok(()) => ApiResponse::ok(),
        Err(e) => ApiResponse::error(e.to_string()),
    }
}

async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Json<ApiResponse> {
    let mut uploaded = 0usize;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return ApiResponse::error(format!("malformed upload: {}", e)),
        };

        let Some(name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let data = match field.bytes().await {
            Ok(data) => data,
            Err(e) => return ApiResponse::error(format!("upload of '{}' failed: {}", name, e)),
        };

        let mut projects = state.ctx.projects.lock().await;
        if let Err(e) = projects.write_chunk(&name, &data, true).await {
            return ApiResponse::error(e.to_string());
        }
        info!("Uploaded project '{}' ({} bytes)", name, data.len());
        uploaded += 1;
    }

    if uploaded == 0 {
        ApiResponse::error("no file in upload")
    } else {
        ApiResponse::ok_with(format!("{} file(s) uploaded", uploaded))
    }
}

async fn refresh_files(State(state): State<AppState>) -> Json<ApiResponse> {
    let mut projects = state.ctx.projects.lock().await;
    match projects.refresh().await {
        Ok(()) => ApiResponse::ok(),
        Err(e) => ApiResponse::error(e.to_string()),
    }
}

async fn sd_content(
    State(state): State<AppState>,
    Query(query): Query<FileQuery>,
) -> Result<String, (StatusCode, String)> {
    let projects = state.ctx.projects.lock().await;
    projects
        .read(&query.file)
        .await
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))
}

async fn sd_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let projects = state.ctx.projects.lock().await;
    Json(json!({ "initialized": projects.is_initialized() }))
}

async fn reinitialize_sd(State(state): State<AppState>) -> Json<ApiResponse> {
    let mut projects = state.ctx.projects.lock().await;
    match projects.reinitialize().await {
        Ok(()) => ApiResponse::ok(),
        Err(e) => ApiResponse::error(e.to_string()),
    }
}

// ---- event stream --------------------------------------------------------

async fn events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcaster.subscribe().await;
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| {
            (
                Ok(Event::default().event(frame.event).data(frame.data)),
                rx,
            )
        })
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::ControllerContext;
    use crate::projects::ProjectStore;

    async fn test_state(tag: &str) -> AppState {
        let dir = std::env::temp_dir().join(format!(
            "hotwire-server-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let mut projects = ProjectStore::new(dir);
        projects.init().await.unwrap();

        let ctx = ControllerContext::new(MachineConfig::default(), projects);
        let (command_tx, _command_rx) = mpsc::channel(8);
        let broadcaster = EventBroadcaster::new(ctx.machine.clone(), ctx.perf.clone());
        AppState {
            ctx,
            command_tx,
            broadcaster,
        }
    }

    #[tokio::test]
    async fn file_listing_uses_the_success_envelope() {
        let state = test_state("list").await;
        state
            .ctx
            .projects
            .lock()
            .await
            .write_chunk("wing.gcode", b"G1 X1\n", true)
            .await
            .unwrap();

        let Json(value) = list_files(State(state)).await;
        assert_eq!(value["success"], true);
        assert_eq!(value["files"], json!(["wing.gcode"]));
    }

    #[tokio::test]
    async fn empty_listing_still_carries_the_envelope() {
        let state = test_state("list-empty").await;
        let Json(value) = list_files(State(state)).await;
        assert_eq!(value["success"], true);
        assert_eq!(value["files"], json!([]));
    }
}
