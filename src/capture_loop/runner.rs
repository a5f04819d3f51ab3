use super::recovery::RecoveryPolicy;
use super::state::LoopState;
use crate::analyzer::{FaceDetection, FaceDetector, MotionDetector, MotionResult, MotionSettings};
use crate::camera::{FrameSource, SourceSettings};
use crate::config::{MotionConfig, RuntimeConfig};
use crate::error::CaptureError;
use crate::events::{AggregatorSettings, EventAggregator};
use crate::frame::Frame;
use crate::frame_buffer::FrameBuffer;
use crate::overlay::render_overlay;
use crate::stats::{CycleStats, StatsRegistry};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Outcome of one [`CaptureLoop::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Run the next step after this delay
    Continue(Duration),
    /// The loop has reached `Stopped`
    Finished,
}

/// Per-cycle analysis output
#[derive(Default)]
struct Analysis {
    motion: MotionResult,
    faces: Vec<FaceDetection>,
    overlay: Option<Arc<Frame>>,
}

/// The capture pipeline: read, analyze, aggregate, publish.
///
/// Sole writer of the frame buffer, detector state and stats. Each cycle is
/// one [`step`](Self::step); [`run`](Self::run) adds pacing and cancellation.
pub struct CaptureLoop {
    source: Box<dyn FrameSource>,
    detector: Option<MotionDetector>,
    motion_config: MotionConfig,
    face_detector: Option<Arc<dyn FaceDetector>>,
    aggregator: EventAggregator,
    frame_buffer: Arc<FrameBuffer>,
    stats: Arc<StatsRegistry>,
    config_rx: watch::Receiver<RuntimeConfig>,
    runtime: RuntimeConfig,
    state_tx: watch::Sender<LoopState>,
    policy: RecoveryPolicy,
    read_timeout: Duration,
    sequence: u64,
    consecutive_failures: u32,
    recovery_attempts: u32,
}

impl CaptureLoop {
    pub fn new(
        source: Box<dyn FrameSource>,
        mut config_rx: watch::Receiver<RuntimeConfig>,
        frame_buffer: Arc<FrameBuffer>,
        stats: Arc<StatsRegistry>,
        aggregator: EventAggregator,
    ) -> Self {
        let runtime = config_rx.borrow_and_update().clone();
        let motion_config = MotionConfig::default();
        let (state_tx, _) = watch::channel(LoopState::Stopped);

        let mut capture_loop = Self {
            source,
            detector: Some(MotionDetector::new(MotionSettings::new(&motion_config, &runtime))),
            motion_config,
            face_detector: None,
            aggregator,
            frame_buffer,
            stats,
            config_rx,
            runtime,
            state_tx,
            policy: RecoveryPolicy::default(),
            read_timeout: Duration::from_secs(1),
            sequence: 0,
            consecutive_failures: 0,
            recovery_attempts: 0,
        };
        capture_loop
            .aggregator
            .apply_settings(AggregatorSettings::from(&capture_loop.runtime));
        capture_loop
    }

    /// Detector tunables that are not part of the runtime config
    pub fn with_motion_config(mut self, motion_config: MotionConfig) -> Self {
        self.detector = Some(MotionDetector::new(MotionSettings::new(
            &motion_config,
            &self.runtime,
        )));
        self.motion_config = motion_config;
        self
    }

    pub fn with_face_detector(mut self, detector: Arc<dyn FaceDetector>) -> Self {
        self.face_detector = Some(detector);
        self
    }

    pub fn with_recovery(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn state(&self) -> LoopState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state_tx.subscribe()
    }

    pub fn runtime(&self) -> &RuntimeConfig {
        &self.runtime
    }

    fn set_state(&self, state: LoopState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            info!("Capture loop {} -> {}", previous, state);
        }
    }

    fn source_settings(&self) -> SourceSettings {
        SourceSettings {
            width: self.runtime.width,
            height: self.runtime.height,
            fps: self.runtime.target_fps,
        }
    }

    fn motion_settings(&self) -> MotionSettings {
        MotionSettings::new(&self.motion_config, &self.runtime)
    }

    /// Open the source and enter `Running`. On failure the loop stays `Stopped`.
    pub async fn open(&mut self) -> Result<(), CaptureError> {
        self.adopt_config();
        self.set_state(LoopState::Starting);

        let settings = self.source_settings();
        if let Err(e) = self.source.open(settings).await {
            error!("Failed to open {} source: {}", self.source.name(), e);
            self.source.close().await;
            self.set_state(LoopState::Stopped);
            return Err(e);
        }

        self.stats.mark_started(
            self.runtime.target_fps,
            self.runtime.width,
            self.runtime.height,
            self.runtime.motion_enabled,
        );
        self.stats.set_camera_open(true);
        self.consecutive_failures = 0;
        self.recovery_attempts = 0;
        self.reset_analysis();
        self.set_state(LoopState::Running);

        info!(
            "Capturing from {} source at {}x{} @ {}fps",
            self.source.name(),
            settings.width,
            settings.height,
            settings.fps
        );
        Ok(())
    }

    /// Advance the state machine by one cycle
    pub async fn step(&mut self) -> Step {
        match self.state() {
            LoopState::Running => self.run_cycle().await,
            LoopState::Error => self.attempt_recovery().await,
            LoopState::Stopped | LoopState::Starting | LoopState::Stopping => Step::Finished,
        }
    }

    /// Drive the loop until cancelled or recovery is exhausted.
    ///
    /// Cancellation is observed between cycles and while pacing, so a cycle
    /// that has started always completes. The source is closed on every exit.
    pub async fn run(&mut self, cancel: CancellationToken) {
        debug!("Capture loop task started");

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.step().await {
                Step::Finished => break,
                Step::Continue(delay) if delay.is_zero() => tokio::task::yield_now().await,
                Step::Continue(delay) => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.shutdown().await;
        debug!("Capture loop task finished");
    }

    /// Close the source and settle in `Stopped`
    pub async fn shutdown(&mut self) {
        if self.state() == LoopState::Stopped && !self.source.is_open() {
            return;
        }

        self.set_state(LoopState::Stopping);
        self.source.close().await;
        self.stats.set_camera_open(false);
        self.stats.mark_stopped();
        self.set_state(LoopState::Stopped);
    }

    /// Pick up a pending config change. Returns true when the source must be
    /// reopened for it.
    fn adopt_config(&mut self) -> bool {
        if !self.config_rx.has_changed().unwrap_or(false) {
            return false;
        }

        let next = self.config_rx.borrow_and_update().clone();
        if next == self.runtime {
            return false;
        }

        let reopen = (next.width, next.height, next.target_fps)
            != (self.runtime.width, self.runtime.height, self.runtime.target_fps);

        info!("Adopting runtime configuration: {:?}", next);
        self.runtime = next;
        let settings = self.motion_settings();
        if let Some(detector) = self.detector.as_mut() {
            detector.apply_settings(settings);
        }
        self.aggregator
            .apply_settings(AggregatorSettings::from(&self.runtime));
        self.stats.update_settings(
            self.runtime.target_fps,
            self.runtime.width,
            self.runtime.height,
            self.runtime.motion_enabled,
        );
        reopen
    }

    /// Fresh background and warm-up, after the source was (re)opened
    fn reset_analysis(&mut self) {
        match self.detector.as_mut() {
            Some(detector) => detector.reset(),
            None => self.detector = Some(MotionDetector::new(self.motion_settings())),
        }
        self.aggregator.restart_warmup();
    }

    async fn run_cycle(&mut self) -> Step {
        let started = Instant::now();

        if self.adopt_config() {
            let settings = self.source_settings();
            info!(
                "Reopening {} source at {}x{} @ {}fps",
                self.source.name(),
                settings.width,
                settings.height,
                settings.fps
            );
            self.source.close().await;
            if let Err(e) = self.source.open(settings).await {
                error!("Failed to reopen source with new settings: {}", e);
                self.stats.record_error();
                return self.enter_error().await;
            }
            self.reset_analysis();
        }

        let budget = self.runtime.frame_budget();
        let read = tokio::time::timeout(
            self.read_timeout + budget,
            self.source.read(self.read_timeout),
        )
        .await
        .unwrap_or(Err(CaptureError::Timeout {
            timeout: self.read_timeout,
        }));

        let frame = match read {
            Ok(frame) => frame,
            Err(e) => return self.handle_read_failure(e).await,
        };
        self.consecutive_failures = 0;

        self.sequence += 1;
        let frame = Arc::new(frame.with_sequence(self.sequence));
        trace!("Captured frame {} ({} bytes)", frame.sequence, frame.data.len());

        let analysis = self.analyze(frame.clone()).await;
        self.aggregator
            .process(&frame, &analysis.motion, &analysis.faces)
            .await;
        self.frame_buffer.publish(frame.clone(), analysis.overlay);

        self.stats.record_frame(CycleStats {
            motion_detected: analysis.motion.active,
            motion_areas_count: analysis.motion.regions.len(),
            timestamp: frame.timestamp.into(),
        });

        Step::Continue(budget.saturating_sub(started.elapsed()))
    }

    /// Motion, faces and overlay on a blocking thread. The detector moves in
    /// and back out; a panicked task costs the background model only.
    async fn analyze(&mut self, frame: Arc<Frame>) -> Analysis {
        let mut detector = self
            .detector
            .take()
            .unwrap_or_else(|| MotionDetector::new(self.motion_settings()));
        let face_detector = if self.runtime.motion_enabled && !self.aggregator.in_warmup() {
            self.face_detector.clone()
        } else {
            None
        };

        let task = tokio::task::spawn_blocking(move || {
            let motion = detector.detect(&frame).unwrap_or_else(|e| {
                warn!("Motion detection failed on frame {}: {}", frame.sequence, e);
                MotionResult::default()
            });

            let faces = match &face_detector {
                Some(faces) if motion.active => faces
                    .detect(&frame, Some(&motion.regions))
                    .unwrap_or_else(|e| {
                        warn!("Face detection failed on frame {}: {}", frame.sequence, e);
                        Vec::new()
                    }),
                _ => Vec::new(),
            };

            let overlay = if motion.regions.is_empty() && faces.is_empty() {
                None
            } else {
                let face_boxes: Vec<_> = faces.iter().map(|f| f.bbox).collect();
                match render_overlay(&frame, &motion.regions, &face_boxes) {
                    Ok(overlay) => Some(Arc::new(overlay)),
                    Err(e) => {
                        warn!("Failed to render overlay for frame {}: {}", frame.sequence, e);
                        None
                    }
                }
            };

            (detector, motion, faces, overlay)
        });

        match task.await {
            Ok((detector, motion, faces, overlay)) => {
                self.detector = Some(detector);
                Analysis {
                    motion,
                    faces,
                    overlay,
                }
            }
            Err(e) => {
                error!("Analysis task failed, rebuilding motion detector: {}", e);
                self.detector = Some(MotionDetector::new(self.motion_settings()));
                Analysis::default()
            }
        }
    }

    async fn handle_read_failure(&mut self, error: CaptureError) -> Step {
        self.stats.record_error();
        self.consecutive_failures += 1;

        if self.consecutive_failures > self.policy.max_consecutive_failures {
            error!(
                "{} consecutive read failures from {} source, last: {}",
                self.consecutive_failures,
                self.source.name(),
                error
            );
            return self.enter_error().await;
        }

        let delay = self
            .policy
            .read_retry(self.runtime.frame_budget())
            .delay(self.consecutive_failures - 1);
        warn!(
            "Frame read failed ({}/{}), retrying in {:?}: {}",
            self.consecutive_failures, self.policy.max_consecutive_failures, delay, error
        );
        Step::Continue(delay)
    }

    async fn enter_error(&mut self) -> Step {
        self.source.close().await;
        self.stats.set_camera_open(false);
        self.recovery_attempts = 0;
        self.set_state(LoopState::Error);
        Step::Continue(self.policy.reopen.delay(0))
    }

    async fn attempt_recovery(&mut self) -> Step {
        if self.policy.attempts_exhausted(self.recovery_attempts) {
            error!(
                "Giving up on {} source after {} recovery attempts",
                self.source.name(),
                self.recovery_attempts
            );
            self.source.close().await;
            self.stats.mark_stopped();
            self.set_state(LoopState::Stopped);
            return Step::Finished;
        }

        self.recovery_attempts += 1;
        self.adopt_config();

        let settings = self.source_settings();
        match self.source.open(settings).await {
            Ok(()) => {
                info!(
                    "Recovered {} source after {} attempt(s)",
                    self.source.name(),
                    self.recovery_attempts
                );
                self.consecutive_failures = 0;
                self.recovery_attempts = 0;
                self.stats.set_camera_open(true);
                self.reset_analysis();
                self.set_state(LoopState::Running);
                Step::Continue(Duration::ZERO)
            }
            Err(e) => {
                self.stats.record_error();
                self.source.close().await;
                let delay = self.policy.reopen.delay(self.recovery_attempts);
                warn!(
                    "Recovery attempt {} failed, next in {:?}: {}",
                    self.recovery_attempts, delay, e
                );
                Step::Continue(delay)
            }
        }
    }
}
