use crate::capture_loop::LoopState;
use crate::config::RuntimeConfigDelta;
use crate::streaming::prep::{encode_placeholder, prepare_frame_for_streaming};
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{Html, IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::server::ServerState;

const BOUNDARY: &str = "frame";
const PLACEHOLDER_WIDTH: u32 = 640;
const PLACEHOLDER_HEIGHT: u32 = 480;

/// Raw camera frames as MJPEG
pub async fn mjpeg_stream_handler(State(state): State<ServerState>) -> Response {
    info!("New MJPEG stream client connected");
    mjpeg_response(state, false)
}

/// Frames with motion and face boxes drawn, as MJPEG
pub async fn mjpeg_overlay_handler(State(state): State<ServerState>) -> Response {
    info!("New MJPEG overlay client connected");
    mjpeg_response(state, true)
}

fn mjpeg_response(state: ServerState, overlay: bool) -> Response {
    let mut frames = if overlay {
        state.controller.subscribe_overlay_frames()
    } else {
        state.controller.subscribe_frames()
    };

    let stream = async_stream::stream! {
        let mut last_sequence: Option<u64> = None;
        let mut placeholder_sent = false;
        let mut frame_interval = interval(state.frame_interval);
        frame_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut frames_streamed = 0u64;
        let mut bytes_streamed = 0u64;
        let stream_start = std::time::Instant::now();

        loop {
            tokio::select! {
                _ = state.shutdown.cancelled() => break,
                _ = frame_interval.tick() => {}
            }

            let latest = frames.borrow_and_update().clone();
            let (sequence, jpeg) = match latest {
                Some(frame) if last_sequence.map_or(true, |last| frame.sequence > last) => {
                    let sequence = frame.sequence;
                    last_sequence = Some(sequence);
                    match prepare_frame_for_streaming(frame, state.jpeg_quality).await {
                        Ok(jpeg) => (sequence, jpeg),
                        Err(e) => {
                            warn!("Skipping frame: {}", e);
                            continue;
                        }
                    }
                }
                Some(_) => continue,
                None if placeholder_sent => continue,
                None => {
                    placeholder_sent = true;
                    match encode_placeholder(
                        PLACEHOLDER_WIDTH,
                        PLACEHOLDER_HEIGHT,
                        state.jpeg_quality,
                    ) {
                        Ok(jpeg) => (0, Bytes::from(jpeg)),
                        Err(e) => {
                            warn!("Placeholder unavailable: {}", e);
                            continue;
                        }
                    }
                }
            };

            frames_streamed += 1;
            bytes_streamed += jpeg.len() as u64;

            let part_header = format!(
                "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\nX-Frame-Sequence: {}\r\n\r\n",
                BOUNDARY,
                jpeg.len(),
                sequence,
            );

            yield Ok::<_, axum::Error>(Bytes::from(part_header));
            yield Ok(jpeg);
            yield Ok(Bytes::from_static(b"\r\n"));

            if frames_streamed % 100 == 0 {
                let elapsed = stream_start.elapsed().as_secs_f64();
                debug!(
                    "Streaming stats: {} frames, {:.1} FPS, {:.1} MB total",
                    frames_streamed,
                    frames_streamed as f64 / elapsed.max(f64::EPSILON),
                    bytes_streamed as f64 / 1_048_576.0
                );
            }
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("multipart/x-mixed-replace; boundary=frame"),
    );
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(header::EXPIRES, HeaderValue::from_static("0"));

    (headers, Body::from_stream(stream)).into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct SnapshotQuery {
    #[serde(default)]
    overlay: bool,
}

/// Latest frame as a single JPEG
pub async fn snapshot_handler(
    State(state): State<ServerState>,
    Query(query): Query<SnapshotQuery>,
) -> Response {
    let frame = if query.overlay {
        state.controller.current_overlay_frame()
    } else {
        state.controller.request_snapshot()
    };

    let Some(frame) = frame else {
        return (StatusCode::SERVICE_UNAVAILABLE, "no frame available yet").into_response();
    };

    match prepare_frame_for_streaming(frame, state.jpeg_quality).await {
        Ok(jpeg) => (
            [
                (header::CONTENT_TYPE, "image/jpeg"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            jpeg,
        )
            .into_response(),
        Err(e) => {
            warn!("Snapshot failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

pub async fn stats_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.controller.stats_snapshot())
}

/// Camera and stream status as the viewer page polls it
pub async fn status_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let stats = state.controller.stats_snapshot();
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();

    Json(serde_json::json!({
        "streaming": state.controller.state() == LoopState::Running,
        "camera": stats.camera_open,
        "timestamp": timestamp,
        "camera_active": stats.is_running,
    }))
}

pub async fn config_get_handler(State(state): State<ServerState>) -> impl IntoResponse {
    Json(state.controller.runtime_config())
}

/// Apply a partial runtime config; rejected changes leave the old config in place
pub async fn config_update_handler(
    State(state): State<ServerState>,
    Json(delta): Json<RuntimeConfigDelta>,
) -> Response {
    match state.controller.apply_config(&delta) {
        Ok(()) => Json(state.controller.runtime_config()).into_response(),
        Err(e) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// Start capture, including after the loop gave up on the camera
pub async fn capture_start_handler(State(state): State<ServerState>) -> Response {
    match state.controller.start().await {
        Ok(()) => Json(serde_json::json!({ "state": state.controller.state() })).into_response(),
        Err(e) => {
            warn!("Capture start requested over HTTP failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "error": e.to_string(),
                    "state": state.controller.state(),
                })),
            )
                .into_response()
        }
    }
}

/// Stop capture; the HTTP surface stays up and reports `is_running: false`
pub async fn capture_stop_handler(State(state): State<ServerState>) -> Response {
    match state.controller.stop().await {
        Ok(()) => Json(serde_json::json!({ "state": state.controller.state() })).into_response(),
        Err(e) => {
            warn!("Capture stop requested over HTTP failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({
                    "error": e.to_string(),
                    "state": state.controller.state(),
                })),
            )
                .into_response()
        }
    }
}

pub async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let latest_frame = state.controller.current_frame();
    let stats = state.controller.stats_snapshot();

    Json(serde_json::json!({
        "status": "healthy",
        "state": state.controller.state(),
        "frames_available": latest_frame.is_some(),
        "latest_frame_sequence": latest_frame.map(|f| f.sequence),
        "frame_count": stats.frame_count,
        "error_count": stats.error_count,
    }))
}

/// Viewer page with a toggle between the raw and annotated streams
pub async fn stream_page_handler() -> impl IntoResponse {
    Html(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="utf-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <title>Visage Live Stream</title>
    <style>
        :root { color-scheme: dark; }
        body {
            margin: 0;
            background: #000;
            color: #ccc;
            font-family: sans-serif;
            display: flex;
            flex-direction: column;
            align-items: center;
            justify-content: center;
            min-height: 100vh;
        }
        img.stream {
            display: block;
            max-width: 100vw;
            max-height: 90vh;
            object-fit: contain;
            background: #000;
        }
        .bar { padding: 8px; font-size: 14px; }
        button { margin-right: 8px; }
    </style>
</head>
<body>
    <img id="stream" class="stream" src="/stream" alt="Visage stream">
    <div class="bar">
        <button onclick="show('/stream')">Raw</button>
        <button onclick="show('/stream/overlay')">Detections</button>
        <span id="status">Checking status...</span>
    </div>
    <script>
        const img = document.getElementById('stream');
        const statusText = document.getElementById('status');

        function show(path) {
            img.src = path + '?t=' + Date.now();
        }

        function checkStatus() {
            fetch('/api/status')
                .then(r => r.json())
                .then(s => {
                    statusText.textContent =
                        'stream: ' + (s.streaming ? 'active' : 'inactive') +
                        ', camera: ' + (s.camera ? 'connected' : 'disconnected') +
                        ', updated ' + new Date(s.timestamp * 1000).toLocaleTimeString();
                })
                .catch(() => { statusText.textContent = 'status unavailable'; });
        }

        img.onerror = () => setTimeout(() => show('/stream'), 2000);
        checkStatus();
        setInterval(checkStatus, 5000);
    </script>
</body>
</html>
"#,
    )
}
