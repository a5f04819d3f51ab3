use super::*;
use crate::config::RuntimeConfig;
use crate::events::{AggregatorSettings, EventAggregator, EventKind};
use crate::frame_buffer::FrameBuffer;
use crate::stats::StatsRegistry;
use crate::test_support::{
    big_block, test_motion_config, test_runtime, FixedFaceDetector, Read, RecordingSink,
    ScriptedSource, SourceControl,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

struct Harness {
    capture_loop: CaptureLoop,
    control: SourceControl,
    config_tx: watch::Sender<RuntimeConfig>,
    frame_buffer: Arc<FrameBuffer>,
    stats: Arc<StatsRegistry>,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(runtime: RuntimeConfig) -> Self {
        let (source, control) = ScriptedSource::new();
        let (config_tx, config_rx) = watch::channel(runtime.clone());
        let frame_buffer = Arc::new(FrameBuffer::new());
        let stats = Arc::new(StatsRegistry::new());
        let sink = Arc::new(RecordingSink::default());
        let aggregator = EventAggregator::new(AggregatorSettings::from(&runtime), sink.clone());

        let capture_loop = CaptureLoop::new(
            Box::new(source),
            config_rx,
            frame_buffer.clone(),
            stats.clone(),
            aggregator,
        )
        .with_motion_config(test_motion_config())
        .with_recovery(RecoveryPolicy {
            max_consecutive_failures: 5,
            max_recovery_attempts: 3,
            reopen: Backoff {
                base: Duration::from_millis(1),
                max: Duration::from_millis(10),
                exponential: true,
            },
        })
        .with_read_timeout(Duration::from_millis(50));

        Self {
            capture_loop,
            control,
            config_tx,
            frame_buffer,
            stats,
            sink,
        }
    }

    async fn steps(&mut self, count: usize) {
        for _ in 0..count {
            self.capture_loop.step().await;
        }
    }

    /// Seed the background with a few quiet frames
    async fn settle(&mut self) {
        self.control.push([Read::Quiet; 4]);
        self.steps(4).await;
    }
}

#[tokio::test]
async fn test_open_enters_running() {
    let mut h = Harness::new(test_runtime());
    assert_eq!(h.capture_loop.state(), LoopState::Stopped);

    h.capture_loop.open().await.unwrap();
    assert_eq!(h.capture_loop.state(), LoopState::Running);

    let stats = h.stats.snapshot();
    assert!(stats.is_running);
    assert!(stats.camera_open);
    assert_eq!((stats.width, stats.height), (160, 120));
}

#[tokio::test]
async fn test_open_failure_stays_stopped() {
    let mut h = Harness::new(test_runtime());
    h.control.fail_next_opens(1);

    assert!(h.capture_loop.open().await.is_err());
    assert_eq!(h.capture_loop.state(), LoopState::Stopped);
    assert!(!h.stats.snapshot().is_running);
    assert_eq!(h.capture_loop.step().await, Step::Finished);
}

#[tokio::test]
async fn test_published_frames_are_restamped_and_monotonic() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();
    let mut rx = h.frame_buffer.subscribe();

    let mut last = 0;
    for _ in 0..10 {
        h.capture_loop.step().await;
        let frame = rx.borrow_and_update().clone().unwrap();
        assert!(frame.sequence > last);
        last = frame.sequence;
    }
    assert_eq!(last, 10);
}

#[tokio::test]
async fn test_counts_frames_and_errors() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();

    let mut script = vec![Read::Quiet; 50];
    script.insert(10, Read::Fail);
    script.insert(30, Read::Fail);
    h.control.push(script);
    h.steps(52).await;

    let stats = h.stats.snapshot();
    assert_eq!(stats.frame_count, 50);
    assert_eq!(stats.error_count, 2);
    assert_eq!(h.capture_loop.state(), LoopState::Running);
}

#[tokio::test]
async fn test_persistent_failures_enter_error_then_recover() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();

    h.control.push([Read::Fail; 100]);
    let mut steps = 0;
    while h.capture_loop.state() == LoopState::Running {
        h.capture_loop.step().await;
        steps += 1;
        assert!(steps <= 100);
    }

    // More than max_consecutive_failures reads failed in a row
    assert_eq!(steps, 6);
    assert_eq!(h.capture_loop.state(), LoopState::Error);
    let stats = h.stats.snapshot();
    assert!(!stats.camera_open);
    assert!(stats.is_running);
    assert_eq!(stats.error_count, 6);

    // Camera comes back after two failed reopen attempts
    h.control.script.lock().clear();
    h.control.fail_next_opens(2);
    h.steps(2).await;
    assert_eq!(h.capture_loop.state(), LoopState::Error);
    h.capture_loop.step().await;
    assert_eq!(h.capture_loop.state(), LoopState::Running);

    let stats = h.stats.snapshot();
    assert!(stats.camera_open);
    assert_eq!(stats.error_count, 8);

    h.capture_loop.step().await;
    assert_eq!(h.stats.snapshot().frame_count, 1);
}

#[tokio::test]
async fn test_exhausted_recovery_stops_the_loop() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();

    h.control.push([Read::Fail; 6]);
    h.steps(6).await;
    assert_eq!(h.capture_loop.state(), LoopState::Error);

    h.control.fail_next_opens(100);
    h.steps(3).await;
    assert_eq!(h.capture_loop.step().await, Step::Finished);
    assert_eq!(h.capture_loop.state(), LoopState::Stopped);

    let stats = h.stats.snapshot();
    assert!(!stats.is_running);
    assert!(!stats.camera_open);
}

#[tokio::test]
async fn test_single_cycle_spike_emits_start_and_stop() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();
    h.settle().await;

    h.control.push([big_block(), Read::Quiet, Read::Quiet, Read::Quiet]);
    h.steps(4).await;

    assert_eq!(
        h.sink.kinds(),
        vec![EventKind::MotionStarted, EventKind::MotionStopped]
    );
    assert!(h.stats.snapshot().last_motion_time.is_some());
}

#[tokio::test]
async fn test_motion_below_threshold_never_starts() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();
    h.settle().await;

    // 20x20 px is well under the 1000 px threshold
    h.control.push([Read::Block { x: 50, y: 50, size: 20 }; 5]);
    h.steps(5).await;
    assert!(h.sink.kinds().is_empty());

    // Same change is reported once the threshold allows it
    h.config_tx.send_modify(|c| c.motion_threshold = 200);
    h.control.push([Read::Quiet; 10]);
    h.steps(10).await;
    h.control.push([Read::Block { x: 50, y: 50, size: 20 }]);
    h.capture_loop.step().await;
    assert_eq!(h.sink.kinds(), vec![EventKind::MotionStarted]);
}

#[tokio::test]
async fn test_disabling_motion_stops_emissions() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();
    h.settle().await;

    h.control.push([big_block()]);
    h.capture_loop.step().await;
    assert_eq!(h.sink.kinds(), vec![EventKind::MotionStarted]);

    h.config_tx.send_modify(|c| c.motion_enabled = false);
    h.control.push([Read::Quiet, big_block(), Read::Quiet, big_block()]);
    h.steps(4).await;

    assert_eq!(h.sink.kinds(), vec![EventKind::MotionStarted]);
    let stats = h.stats.snapshot();
    assert!(!stats.motion_detection_enabled);
    assert!(!stats.motion_detected);
}

#[tokio::test]
async fn test_faces_run_only_during_motion() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop = h
        .capture_loop
        .with_face_detector(Arc::new(FixedFaceDetector));
    h.capture_loop.open().await.unwrap();
    h.settle().await;
    assert!(h.sink.kinds().is_empty());

    h.control.push([big_block()]);
    h.capture_loop.step().await;

    assert_eq!(h.sink.kinds(), vec![EventKind::MotionStarted, EventKind::Face]);
    let overlay = h.frame_buffer.current_overlay_frame().unwrap();
    let current = h.frame_buffer.current_frame().unwrap();
    assert_eq!(overlay.sequence, current.sequence);
    assert!(!Arc::ptr_eq(&overlay, &current));
}

#[tokio::test]
async fn test_resolution_change_reopens_source() {
    let mut h = Harness::new(test_runtime());
    h.capture_loop.open().await.unwrap();
    h.capture_loop.step().await;
    assert_eq!(h.control.opens(), 1);

    h.config_tx.send_modify(|c| {
        c.width = 80;
        c.height = 60;
    });
    h.capture_loop.step().await;

    assert_eq!(h.control.opens(), 2);
    let frame = h.frame_buffer.current_frame().unwrap();
    assert_eq!((frame.width, frame.height), (80, 60));
    let stats = h.stats.snapshot();
    assert_eq!((stats.width, stats.height), (80, 60));
}

#[tokio::test]
async fn test_run_closes_source_on_cancel() {
    let h = Harness::new(test_runtime());
    let mut capture_loop = h.capture_loop;
    capture_loop.open().await.unwrap();
    let mut state_rx = capture_loop.subscribe_state();

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            capture_loop.run(cancel).await;
            capture_loop
        }
    });

    tokio::time::timeout(Duration::from_secs(5), async {
        while h.stats.snapshot().frame_count < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    cancel.cancel();
    let capture_loop = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(capture_loop.state(), LoopState::Stopped);
    assert_eq!(*state_rx.borrow_and_update(), LoopState::Stopped);
    let stats = h.stats.snapshot();
    assert!(!stats.is_running);
    assert!(!stats.camera_open);
}
