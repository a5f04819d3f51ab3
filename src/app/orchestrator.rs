use super::types::{ComponentState, ShutdownReason};
use crate::analyzer::{create_face_detector, FaceDetector};
use crate::camera::{create_source, FrameSource, SyntheticSource};
use crate::capture_loop::{CaptureLoop, RecoveryPolicy};
use crate::config::VisageConfig;
use crate::control::Controller;
use crate::error::Result;
use crate::events::{AggregatorSettings, EventAggregator, EventBus};
use crate::frame_buffer::FrameBuffer;
use crate::overlay::TimestampStamp;
use crate::stats::StatsRegistry;
use crate::storage::{JsonlEventStore, SnapshotWriter};
#[cfg(feature = "streaming")]
use crate::streaming::StreamServer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Builds the pipeline from configuration and owns it for the process lifetime
pub struct VisageOrchestrator {
    pub(super) config: VisageConfig,
    pub(super) event_bus: EventBus,
    pub(super) controller: Arc<Controller>,

    #[cfg(feature = "streaming")]
    pub(super) stream_server: Option<Arc<StreamServer>>,
    pub(super) background_tasks: Mutex<HashMap<String, JoinHandle<()>>>,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) shutdown_sender: Option<oneshot::Sender<ShutdownReason>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
}

impl VisageOrchestrator {
    /// Create an orchestrator reading from the source selected in `config.camera`
    pub async fn new(config: VisageConfig) -> Result<Self> {
        let source = create_source(&config.camera)?;
        Self::with_source(config, source).await
    }

    /// Create an orchestrator fed by the moving-block generator
    pub async fn synthetic(config: VisageConfig) -> Result<Self> {
        Self::with_source(config, Box::new(SyntheticSource::new())).await
    }

    pub async fn with_source(config: VisageConfig, source: Box<dyn FrameSource>) -> Result<Self> {
        let runtime = config.runtime();
        let event_bus = EventBus::new(config.events.bus_capacity);
        let frame_buffer = Arc::new(FrameBuffer::new());
        let stats = Arc::new(StatsRegistry::new());
        let (config_tx, config_rx) = watch::channel(runtime.clone());
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        let face_detector = build_face_detector(&config);

        let mut aggregator =
            EventAggregator::new(AggregatorSettings::from(&runtime), Arc::new(event_bus.clone()));
        if config.capture.persist_events {
            let store = JsonlEventStore::new(&config.capture.path);
            aggregator = aggregator.with_store(Arc::new(store));
        }
        if config.capture.save_snapshots {
            aggregator = aggregator.with_snapshots(Arc::new(build_snapshot_writer(&config)));
        }

        let mut capture_loop = CaptureLoop::new(
            source,
            config_rx,
            Arc::clone(&frame_buffer),
            Arc::clone(&stats),
            aggregator,
        )
        .with_motion_config(config.motion.clone())
        .with_recovery(RecoveryPolicy::from(&config.recovery))
        .with_read_timeout(Duration::from_millis(config.camera.read_timeout_ms));
        if let Some(detector) = &face_detector {
            capture_loop = capture_loop.with_face_detector(Arc::clone(detector));
        }

        let mut controller = Controller::new(capture_loop, config_tx, frame_buffer, stats)
            .with_max_recording(Duration::from_secs(config.system.max_recording_secs))
            .with_stop_timeout(Duration::from_secs(config.system.shutdown_timeout_secs));
        if let Some(detector) = face_detector {
            controller = controller.with_face_detector(detector);
        }
        let controller = Arc::new(controller);

        #[cfg(feature = "streaming")]
        let stream_server = config
            .stream
            .enabled
            .then(|| Arc::new(StreamServer::new(config.stream.clone(), Arc::clone(&controller))));

        Ok(Self {
            config,
            event_bus,
            controller,
            #[cfg(feature = "streaming")]
            stream_server,
            background_tasks: Mutex::new(HashMap::new()),
            component_states: Arc::new(Mutex::new(HashMap::new())),
            shutdown_sender: Some(shutdown_sender),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
        })
    }

    pub fn controller(&self) -> Arc<Controller> {
        Arc::clone(&self.controller)
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn config(&self) -> &VisageConfig {
        &self.config
    }
}

/// A face detector that fails to load disables face detection instead of the
/// whole system
fn build_face_detector(config: &VisageConfig) -> Option<Arc<dyn FaceDetector>> {
    if !config.face.enabled {
        info!("Face detection disabled");
        return None;
    }

    match create_face_detector(&config.face) {
        Ok(detector) => {
            info!("Face detection enabled ({})", detector.name());
            Some(detector)
        }
        Err(e) => {
            warn!("Face detection unavailable: {}", e);
            None
        }
    }
}

fn build_snapshot_writer(config: &VisageConfig) -> SnapshotWriter {
    let capture = &config.capture;
    let writer = SnapshotWriter::new(&capture.path, capture.jpeg_quality);
    if !capture.timestamp_overlay {
        return writer;
    }

    match TimestampStamp::load(
        &capture.timestamp_font_path,
        capture.timestamp_font_size,
        &capture.timestamp_timezone,
    ) {
        Ok(stamp) => writer.with_timestamp(stamp),
        Err(e) => {
            warn!("Snapshots will not be timestamped: {}", e);
            writer
        }
    }
}
