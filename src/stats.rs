use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Read-only copy of the capture statistics.
///
/// The field set is the externally documented stats contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub frame_count: u64,
    pub error_count: u64,
    pub actual_fps: f64,
    pub target_fps: u32,
    pub is_running: bool,
    pub camera_open: bool,
    pub motion_detection_enabled: bool,
    pub motion_detected: bool,
    pub motion_areas_count: usize,
    pub last_motion_time: Option<DateTime<Utc>>,
    /// Seconds since the loop was started
    pub uptime: f64,
    pub width: u32,
    pub height: u32,
}

/// Per-cycle observations recorded after a frame is fully processed
#[derive(Debug, Clone, Copy)]
pub struct CycleStats {
    pub motion_detected: bool,
    pub motion_areas_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct StatsInner {
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
    frame_count: u64,
    error_count: u64,
    target_fps: u32,
    is_running: bool,
    camera_open: bool,
    motion_detection_enabled: bool,
    motion_detected: bool,
    motion_areas_count: usize,
    last_motion_time: Option<DateTime<Utc>>,
    width: u32,
    height: u32,
}

impl StatsInner {
    fn uptime(&self) -> Duration {
        match (self.started_at, self.stopped_at) {
            (Some(start), Some(stop)) => stop.saturating_duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }
}

/// Counters and gauges owned by the capture loop.
///
/// The loop is the only writer; everyone else reads through [`StatsRegistry::snapshot`].
#[derive(Debug, Default)]
pub struct StatsRegistry {
    inner: RwLock<StatsInner>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset counters for a fresh run
    pub fn mark_started(&self, target_fps: u32, width: u32, height: u32, motion_enabled: bool) {
        let mut inner = self.inner.write();
        *inner = StatsInner {
            started_at: Some(Instant::now()),
            target_fps,
            width,
            height,
            motion_detection_enabled: motion_enabled,
            is_running: true,
            ..StatsInner::default()
        };
    }

    /// Freeze uptime and clear the live gauges
    pub fn mark_stopped(&self) {
        let mut inner = self.inner.write();
        inner.is_running = false;
        inner.camera_open = false;
        inner.motion_detected = false;
        inner.motion_areas_count = 0;
        if inner.started_at.is_some() && inner.stopped_at.is_none() {
            inner.stopped_at = Some(Instant::now());
        }
    }

    pub fn set_camera_open(&self, open: bool) {
        self.inner.write().camera_open = open;
    }

    pub fn record_error(&self) {
        self.inner.write().error_count += 1;
    }

    /// Mirror the active runtime configuration
    pub fn update_settings(&self, target_fps: u32, width: u32, height: u32, motion_enabled: bool) {
        let mut inner = self.inner.write();
        inner.target_fps = target_fps;
        inner.width = width;
        inner.height = height;
        inner.motion_detection_enabled = motion_enabled;
        if !motion_enabled {
            inner.motion_detected = false;
            inner.motion_areas_count = 0;
        }
    }

    /// Count one processed frame and update the motion gauges in a single write
    pub fn record_frame(&self, cycle: CycleStats) {
        let mut inner = self.inner.write();
        inner.frame_count += 1;
        inner.motion_detected = cycle.motion_detected;
        inner.motion_areas_count = cycle.motion_areas_count;
        if cycle.motion_detected {
            inner.last_motion_time = Some(cycle.timestamp);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.read();
        let uptime = inner.uptime().as_secs_f64();
        let actual_fps = if uptime > 0.0 {
            inner.frame_count as f64 / uptime
        } else {
            0.0
        };

        StatsSnapshot {
            frame_count: inner.frame_count,
            error_count: inner.error_count,
            actual_fps,
            target_fps: inner.target_fps,
            is_running: inner.is_running,
            camera_open: inner.camera_open,
            motion_detection_enabled: inner.motion_detection_enabled,
            motion_detected: inner.motion_detected,
            motion_areas_count: inner.motion_areas_count,
            last_motion_time: inner.last_motion_time,
            uptime,
            width: inner.width,
            height: inner.height,
        }
    }
}
