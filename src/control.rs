use crate::analyzer::{FaceDetection, FaceDetector};
use crate::capture_loop::{CaptureLoop, LoopState};
use crate::config::{RuntimeConfig, RuntimeConfigDelta};
use crate::error::{CaptureError, ConfigError, DetectionError, VisageError};
use crate::frame::Frame;
use crate::frame_buffer::FrameBuffer;
use crate::recording::RecordingSession;
use crate::stats::{StatsRegistry, StatsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Where the capture loop lives between `start` and `stop`
enum LoopSlot {
    Idle(Box<CaptureLoop>),
    Running {
        handle: JoinHandle<Box<CaptureLoop>>,
        cancel: CancellationToken,
    },
    /// Cancelled but still finishing its cycle after `stop` gave up waiting
    Draining(JoinHandle<Box<CaptureLoop>>),
    /// The loop task panicked
    Lost,
}

/// A frame and the faces found in it on request
#[derive(Debug, Clone)]
pub struct FaceSnapshot {
    pub frame: Arc<Frame>,
    pub faces: Vec<FaceDetection>,
}

/// Control surface of the pipeline: lifecycle, runtime config, frame access
/// and on-demand requests. Cheap to share behind an `Arc`.
pub struct Controller {
    config_tx: watch::Sender<RuntimeConfig>,
    frame_buffer: Arc<FrameBuffer>,
    stats: Arc<StatsRegistry>,
    face_detector: Option<Arc<dyn FaceDetector>>,
    state_rx: watch::Receiver<LoopState>,
    slot: Mutex<LoopSlot>,
    root: CancellationToken,
    max_recording: Duration,
    stop_timeout: Duration,
}

impl Controller {
    /// `config_tx` must be the sender whose receiver `capture_loop` was built with
    pub fn new(
        capture_loop: CaptureLoop,
        config_tx: watch::Sender<RuntimeConfig>,
        frame_buffer: Arc<FrameBuffer>,
        stats: Arc<StatsRegistry>,
    ) -> Self {
        Self {
            config_tx,
            frame_buffer,
            stats,
            face_detector: None,
            state_rx: capture_loop.subscribe_state(),
            slot: Mutex::new(LoopSlot::Idle(Box::new(capture_loop))),
            root: CancellationToken::new(),
            max_recording: Duration::from_secs(120),
            stop_timeout: Duration::from_secs(10),
        }
    }

    /// Detector used for on-demand face snapshots
    pub fn with_face_detector(mut self, detector: Arc<dyn FaceDetector>) -> Self {
        self.face_detector = Some(detector);
        self
    }

    pub fn with_max_recording(mut self, max: Duration) -> Self {
        self.max_recording = max;
        self
    }

    pub fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout = timeout;
        self
    }

    /// Open the camera and spawn the capture loop.
    ///
    /// Starting a running loop is a no-op. A loop that stopped on its own
    /// (recovery exhausted) or is still draining after a timed-out `stop`
    /// is reclaimed and started again.
    pub async fn start(&self) -> Result<(), VisageError> {
        let mut slot = self.slot.lock().await;

        let mut capture_loop = match std::mem::replace(&mut *slot, LoopSlot::Lost) {
            LoopSlot::Idle(capture_loop) => capture_loop,
            LoopSlot::Running { handle, cancel } if !handle.is_finished() => {
                debug!("Capture loop already running");
                *slot = LoopSlot::Running { handle, cancel };
                return Ok(());
            }
            LoopSlot::Running { handle, .. } | LoopSlot::Draining(handle) => {
                self.reclaim(handle, &mut *slot).await?
            }
            LoopSlot::Lost => {
                return Err(VisageError::component(
                    "capture_loop",
                    "capture loop was lost and cannot be restarted",
                ))
            }
        };

        if let Err(e) = capture_loop.open().await {
            *slot = LoopSlot::Idle(capture_loop);
            return Err(e.into());
        }

        let cancel = self.root.child_token();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            capture_loop.run(token).await;
            capture_loop
        });

        *slot = LoopSlot::Running { handle, cancel };
        info!("Capture started");
        Ok(())
    }

    /// Cancel the loop and wait for it to close the camera
    pub async fn stop(&self) -> Result<(), VisageError> {
        let mut slot = self.slot.lock().await;

        let handle = match std::mem::replace(&mut *slot, LoopSlot::Lost) {
            LoopSlot::Running { handle, cancel } => {
                cancel.cancel();
                handle
            }
            LoopSlot::Draining(handle) => handle,
            other => {
                *slot = other;
                return Ok(());
            }
        };

        let capture_loop = self.reclaim(handle, &mut *slot).await?;
        *slot = LoopSlot::Idle(capture_loop);
        info!("Capture stopped");
        Ok(())
    }

    /// Wait up to the stop timeout for a cancelled or finished loop task to
    /// hand the loop back. On timeout the task keeps draining in the slot and
    /// a later `start` or `stop` picks it up.
    async fn reclaim(
        &self,
        mut handle: JoinHandle<Box<CaptureLoop>>,
        slot: &mut LoopSlot,
    ) -> Result<Box<CaptureLoop>, VisageError> {
        match tokio::time::timeout(self.stop_timeout, &mut handle).await {
            Ok(Ok(capture_loop)) => Ok(capture_loop),
            Ok(Err(e)) => {
                error!("Capture loop task failed: {}", e);
                self.stats.mark_stopped();
                *slot = LoopSlot::Lost;
                Err(VisageError::component("capture_loop", e.to_string()))
            }
            Err(_) => {
                warn!(
                    "Capture loop did not stop within {:?}, still draining",
                    self.stop_timeout
                );
                *slot = LoopSlot::Draining(handle);
                Err(VisageError::component(
                    "capture_loop",
                    "timed out waiting for the capture loop to stop",
                ))
            }
        }
    }

    /// Stop capture and end every outstanding recording
    pub async fn shutdown(&self) -> Result<(), VisageError> {
        let result = self.stop().await;
        self.root.cancel();
        result
    }

    pub fn state(&self) -> LoopState {
        *self.state_rx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LoopState> {
        self.state_rx.clone()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn runtime_config(&self) -> RuntimeConfig {
        self.config_tx.borrow().clone()
    }

    /// Validate the merged config and publish it; the loop adopts it at its
    /// next cycle. On error the current config stays in effect.
    pub fn apply_config(&self, delta: &RuntimeConfigDelta) -> Result<(), ConfigError> {
        let mut outcome = Ok(());
        let changed = self.config_tx.send_if_modified(|current| match current.apply(delta) {
            Ok(next) => {
                let changed = next != *current;
                *current = next;
                changed
            }
            Err(e) => {
                outcome = Err(e);
                false
            }
        });

        match &outcome {
            Ok(()) if changed => info!("Runtime configuration updated: {:?}", delta),
            Ok(()) => debug!("Runtime configuration unchanged"),
            Err(e) => warn!("Rejected configuration change: {}", e),
        }
        outcome
    }

    pub fn current_frame(&self) -> Option<Arc<Frame>> {
        self.frame_buffer.current_frame()
    }

    pub fn current_overlay_frame(&self) -> Option<Arc<Frame>> {
        self.frame_buffer.current_overlay_frame()
    }

    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frame_buffer.subscribe()
    }

    pub fn subscribe_overlay_frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.frame_buffer.subscribe_overlay()
    }

    /// Latest published frame, if any
    pub fn request_snapshot(&self) -> Option<Arc<Frame>> {
        self.frame_buffer.current_frame()
    }

    /// Latest frame with a full-frame face scan, off the async runtime
    pub async fn request_snapshot_with_faces(
        &self,
    ) -> Result<Option<FaceSnapshot>, DetectionError> {
        let Some(frame) = self.frame_buffer.current_frame() else {
            return Ok(None);
        };
        let Some(detector) = self.face_detector.clone() else {
            return Ok(Some(FaceSnapshot {
                frame,
                faces: Vec::new(),
            }));
        };

        let scan_frame = frame.clone();
        let faces = tokio::task::spawn_blocking(move || detector.detect(&scan_frame, None))
            .await
            .map_err(|e| DetectionError::Aborted {
                details: e.to_string(),
            })??;

        Ok(Some(FaceSnapshot { frame, faces }))
    }

    /// Stream frames for `duration`, which must be positive and within the
    /// configured maximum
    pub fn request_recording(&self, duration: Duration) -> Result<RecordingSession, ConfigError> {
        if duration.is_zero() || duration > self.max_recording {
            return Err(ConfigError::invalid(
                "recording.duration",
                format!(
                    "{:?} is outside (0, {:?}]",
                    duration, self.max_recording
                ),
            ));
        }

        info!("Recording requested for {:?}", duration);
        Ok(RecordingSession::new(
            self.frame_buffer.subscribe(),
            duration,
            self.root.child_token(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{AggregatorSettings, EventAggregator, EventKind};
    use crate::test_support::{
        big_block, test_motion_config, test_runtime, FixedFaceDetector, Read, RecordingSink,
        ScriptedSource, SourceControl,
    };
    use futures::StreamExt;

    fn controller() -> (Controller, SourceControl, Arc<RecordingSink>) {
        let runtime = test_runtime();
        let (source, control) = ScriptedSource::new();
        let (config_tx, config_rx) = watch::channel(runtime.clone());
        let frame_buffer = Arc::new(FrameBuffer::new());
        let stats = Arc::new(StatsRegistry::new());
        let sink = Arc::new(RecordingSink::default());

        let capture_loop = CaptureLoop::new(
            Box::new(source),
            config_rx,
            frame_buffer.clone(),
            stats.clone(),
            EventAggregator::new(AggregatorSettings::from(&runtime), sink.clone()),
        )
        .with_motion_config(test_motion_config())
        .with_read_timeout(Duration::from_millis(50));

        let controller = Controller::new(capture_loop, config_tx, frame_buffer, stats)
            .with_face_detector(Arc::new(FixedFaceDetector))
            .with_max_recording(Duration::from_secs(5))
            .with_stop_timeout(Duration::from_secs(5));
        (controller, control, sink)
    }

    async fn wait_for_frames(controller: &Controller, count: u64) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while controller.stats_snapshot().frame_count < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_start_stop_restart() {
        let (controller, control, _) = controller();
        assert_eq!(controller.state(), LoopState::Stopped);

        controller.start().await.unwrap();
        assert_eq!(controller.state(), LoopState::Running);
        // Second start is a no-op
        controller.start().await.unwrap();
        wait_for_frames(&controller, 2).await;

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), LoopState::Stopped);
        assert!(!controller.stats_snapshot().is_running);

        controller.start().await.unwrap();
        assert_eq!(control.opens(), 2);
        controller.shutdown().await.unwrap();
        assert_eq!(controller.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_timed_out_stop_can_be_recovered() {
        let (controller, control, _) = controller();
        let controller = controller.with_stop_timeout(Duration::from_millis(20));
        controller.start().await.unwrap();
        wait_for_frames(&controller, 1).await;

        control.push([Read::Stall(Duration::from_millis(300))]);
        while !control.script.lock().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(controller.stop().await.is_err());

        // The cancelled loop finishes its cycle in the background
        tokio::time::sleep(Duration::from_millis(500)).await;
        controller.start().await.unwrap();
        assert_eq!(controller.state(), LoopState::Running);
        assert_eq!(control.opens(), 2);

        controller.stop().await.unwrap();
        assert_eq!(controller.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_start_reports_capture_error() {
        let (controller, control, _) = controller();
        control.fail_next_opens(1);

        let result = controller.start().await;
        assert!(matches!(
            result,
            Err(VisageError::Capture(CaptureError::DeviceUnavailable { .. }))
        ));
        assert_eq!(controller.state(), LoopState::Stopped);

        controller.start().await.unwrap();
        assert_eq!(controller.state(), LoopState::Running);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_negative_threshold_rejected_and_old_one_kept() {
        let (controller, control, sink) = controller();
        let before = controller.runtime_config();

        let delta = RuntimeConfigDelta {
            motion_threshold: Some(-1),
            ..Default::default()
        };
        assert!(matches!(
            controller.apply_config(&delta),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(controller.runtime_config(), before);

        // The old threshold still gates motion
        control.push([Read::Quiet; 4]);
        control.push([big_block()]);
        controller.start().await.unwrap();
        wait_for_frames(&controller, 6).await;
        controller.stop().await.unwrap();

        assert_eq!(sink.kinds().first(), Some(&EventKind::MotionStarted));
    }

    #[tokio::test]
    async fn test_apply_config_is_all_or_nothing() {
        let (controller, _, _) = controller();

        let delta = RuntimeConfigDelta {
            motion_sensitivity: Some(80),
            target_fps: Some(0),
            ..Default::default()
        };
        assert!(controller.apply_config(&delta).is_err());
        assert_eq!(controller.runtime_config().motion_sensitivity, 50);

        let delta = RuntimeConfigDelta {
            motion_sensitivity: Some(80),
            ..Default::default()
        };
        controller.apply_config(&delta).unwrap();
        assert_eq!(controller.runtime_config().motion_sensitivity, 80);
    }

    #[tokio::test]
    async fn test_snapshots() {
        let (controller, _, _) = controller();
        assert!(controller.request_snapshot().is_none());
        assert!(controller.request_snapshot_with_faces().await.unwrap().is_none());

        controller.start().await.unwrap();
        wait_for_frames(&controller, 1).await;

        let frame = controller.request_snapshot().unwrap();
        assert_eq!((frame.width, frame.height), (160, 120));

        let snapshot = controller.request_snapshot_with_faces().await.unwrap().unwrap();
        assert_eq!(snapshot.faces.len(), 1);
        controller.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_recording_limits_and_stream() {
        let (controller, _, _) = controller();
        assert!(controller.request_recording(Duration::ZERO).is_err());
        assert!(controller.request_recording(Duration::from_secs(6)).is_err());

        controller.start().await.unwrap();
        let session = controller
            .request_recording(Duration::from_millis(400))
            .unwrap();
        let frames: Vec<_> = session.collect().await;
        controller.stop().await.unwrap();

        assert!(!frames.is_empty());
        assert!(frames.windows(2).all(|w| w[1].sequence > w[0].sequence));
    }

    #[tokio::test]
    async fn test_shutdown_ends_recordings() {
        let (controller, _, _) = controller();
        controller.start().await.unwrap();
        let mut session = controller
            .request_recording(Duration::from_secs(5))
            .unwrap();

        controller.shutdown().await.unwrap();
        let drained = tokio::time::timeout(Duration::from_secs(1), async {
            while session.next().await.is_some() {}
        })
        .await;
        assert!(drained.is_ok());
    }
}
