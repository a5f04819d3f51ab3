use super::bus::EventSink;
use super::types::{DetectionEvent, EventKind};
use crate::analyzer::{FaceDetection, MotionResult};
use crate::config::RuntimeConfig;
use crate::frame::{BoundingBox, Frame};
use crate::storage::{EventStore, SnapshotWriter};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const MIN_SIDE_EFFECT_TIMEOUT: Duration = Duration::from_millis(250);

/// Event policy knobs, adopted from the runtime config at cycle boundaries
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregatorSettings {
    pub motion_enabled: bool,
    pub cooldown: Duration,
    pub face_window: Duration,
    pub face_distance: f32,
    pub warmup_frames: u32,
    /// Upper bound on each snapshot write and store append
    pub side_effect_timeout: Duration,
}

impl From<&RuntimeConfig> for AggregatorSettings {
    fn from(runtime: &RuntimeConfig) -> Self {
        Self {
            motion_enabled: runtime.motion_enabled,
            cooldown: runtime.motion_cooldown(),
            face_window: runtime.face_coalesce_window(),
            face_distance: runtime.face_coalesce_distance,
            warmup_frames: runtime.warmup_frames,
            side_effect_timeout: (runtime.frame_budget() * 4).max(MIN_SIDE_EFFECT_TIMEOUT),
        }
    }
}

/// Turns per-cycle detector output into debounced, coalesced events.
///
/// Time is measured on frame timestamps, so replayed or scripted frames
/// behave exactly like live ones.
pub struct EventAggregator {
    settings: AggregatorSettings,
    sink: Arc<dyn EventSink>,
    store: Option<Arc<dyn EventStore>>,
    snapshots: Option<Arc<SnapshotWriter>>,
    cycles_since_open: u64,
    active: bool,
    start_reported: bool,
    /// `None` until motion has been seen for the first time
    inactive_since: Option<DateTime<Utc>>,
    recent_faces: Vec<(BoundingBox, DateTime<Utc>)>,
    last_emitted: HashMap<EventKind, DateTime<Utc>>,
}

impl EventAggregator {
    pub fn new(settings: AggregatorSettings, sink: Arc<dyn EventSink>) -> Self {
        Self {
            settings,
            sink,
            store: None,
            snapshots: None,
            cycles_since_open: 0,
            active: false,
            start_reported: false,
            inactive_since: None,
            recent_faces: Vec::new(),
            last_emitted: HashMap::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_snapshots(mut self, writer: Arc<SnapshotWriter>) -> Self {
        self.snapshots = Some(writer);
        self
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub fn apply_settings(&mut self, settings: AggregatorSettings) {
        if settings != self.settings {
            debug!("Aggregator settings updated: {:?}", settings);
            self.settings = settings;
        }
    }

    /// Start counting warm-up cycles again, after the source was (re)opened
    pub fn restart_warmup(&mut self) {
        self.cycles_since_open = 0;
    }

    pub fn in_warmup(&self) -> bool {
        self.cycles_since_open < self.settings.warmup_frames as u64
    }

    /// Motion state as seen by the debouncer
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Feed one cycle's results and emit whatever events they produce
    pub async fn process(
        &mut self,
        frame: &Arc<Frame>,
        motion: &MotionResult,
        faces: &[FaceDetection],
    ) -> Vec<DetectionEvent> {
        let warming_up = self.in_warmup();
        self.cycles_since_open = self.cycles_since_open.saturating_add(1);

        if !self.settings.motion_enabled {
            if self.active {
                debug!("Motion detection disabled, dropping to inactive");
                self.active = false;
                self.start_reported = false;
            }
            self.recent_faces.clear();
            return Vec::new();
        }

        if warming_up {
            return Vec::new();
        }

        let now: DateTime<Utc> = frame.timestamp.into();
        let mut events = Vec::new();

        match (self.active, motion.active) {
            (false, true) => {
                self.active = true;
                let quiet_long_enough = match self.inactive_since {
                    Some(since) => elapsed(since, now) >= self.settings.cooldown,
                    None => true,
                };

                if quiet_long_enough {
                    self.start_reported = true;
                    self.recent_faces.clear();
                    let event = DetectionEvent::new(
                        EventKind::MotionStarted,
                        now,
                        frame.sequence,
                        motion.regions.clone(),
                        motion.total_area,
                    );
                    events.push(self.emit(event, frame, &motion.regions, &[]).await);
                } else {
                    debug!(
                        "Suppressed motion start on frame {} inside cooldown",
                        frame.sequence
                    );
                    self.start_reported = false;
                }
            }
            (true, false) => {
                self.active = false;
                self.inactive_since = Some(now);
                if self.start_reported {
                    let event = DetectionEvent::new(
                        EventKind::MotionStopped,
                        now,
                        frame.sequence,
                        Vec::new(),
                        0,
                    );
                    events.push(self.emit(event, frame, &[], &[]).await);
                }
                self.start_reported = false;
            }
            _ => {}
        }

        // Faces belong to a reported episode; a start swallowed by the
        // cooldown swallows its faces too.
        if self.active && self.start_reported && !faces.is_empty() {
            let new_faces = self.coalesce_faces(faces, now);
            if !new_faces.is_empty() {
                let boxes: Vec<BoundingBox> = new_faces.iter().map(|f| f.bbox).collect();
                let mut event = DetectionEvent::new(
                    EventKind::Face,
                    now,
                    frame.sequence,
                    boxes.clone(),
                    boxes.iter().map(|b| b.area()).sum(),
                );
                event.confidence = new_faces
                    .iter()
                    .map(|f| f.confidence)
                    .fold(None, |best, c| Some(best.map_or(c, |b: f32| b.max(c))));
                events.push(self.emit(event, frame, &motion.regions, &boxes).await);
            }
        }

        events
    }

    /// Faces not already reported near the same spot within the window
    fn coalesce_faces<'a>(
        &mut self,
        faces: &'a [FaceDetection],
        now: DateTime<Utc>,
    ) -> Vec<&'a FaceDetection> {
        let window = self.settings.face_window;
        self.recent_faces.retain(|(_, seen)| elapsed(*seen, now) < window);

        let mut fresh = Vec::new();
        for face in faces {
            let seen = self
                .recent_faces
                .iter()
                .any(|(bbox, _)| bbox.distance_to(&face.bbox) <= self.settings.face_distance);
            if !seen {
                self.recent_faces.push((face.bbox, now));
                fresh.push(face);
            }
        }
        fresh
    }

    /// Snapshot, persist and deliver one event. Side effects are bounded by
    /// the side-effect timeout; failures and overruns are logged and the
    /// event goes out regardless.
    async fn emit(
        &mut self,
        mut event: DetectionEvent,
        frame: &Arc<Frame>,
        motion_boxes: &[BoundingBox],
        face_boxes: &[BoundingBox],
    ) -> DetectionEvent {
        if let Some(last) = self.last_emitted.get(&event.kind) {
            if event.timestamp < *last {
                event.timestamp = *last;
            }
        }
        self.last_emitted.insert(event.kind, event.timestamp);

        let limit = self.settings.side_effect_timeout;
        if event.kind != EventKind::MotionStopped {
            if let Some(writer) = &self.snapshots {
                let write = writer.write(
                    frame.clone(),
                    motion_boxes.to_vec(),
                    face_boxes.to_vec(),
                    event.kind.as_str(),
                    event.timestamp,
                );
                match tokio::time::timeout(limit, write).await {
                    Ok(Ok(path)) => event.image_path = Some(path),
                    Ok(Err(e)) => warn!("Failed to write snapshot for {} event: {}", event.kind, e),
                    Err(_) => warn!(
                        "Snapshot for {} event took longer than {:?}, skipped",
                        event.kind, limit
                    ),
                }
            }
        }

        if let Some(store) = &self.store {
            match tokio::time::timeout(limit, store.persist(&event)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Failed to persist {} event {}: {}", event.kind, event.id, e),
                Err(_) => warn!(
                    "Persisting {} event {} took longer than {:?}, skipped",
                    event.kind, event.id, limit
                ),
            }
        }

        debug!("Event: {}", event.description());
        if let Err(e) = self.sink.on_event(&event) {
            warn!("Event sink rejected {} event: {}", event.kind, e);
        }

        event
    }
}

fn elapsed(since: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NotifyError, StorageError};
    use crate::frame::PixelFormat;
    use crate::storage::{MemoryEventStore, StoredPath};
    use crate::test_support::RecordingSink;
    use async_trait::async_trait;
    use std::time::UNIX_EPOCH;

    struct FailingSink;

    impl EventSink for FailingSink {
        fn on_event(&self, _event: &DetectionEvent) -> Result<(), NotifyError> {
            Err(NotifyError::Delivery {
                details: "offline".to_string(),
            })
        }
    }

    fn settings() -> AggregatorSettings {
        AggregatorSettings {
            motion_enabled: true,
            cooldown: Duration::from_millis(3000),
            face_window: Duration::from_millis(10_000),
            face_distance: 80.0,
            warmup_frames: 0,
            side_effect_timeout: Duration::from_secs(5),
        }
    }

    /// Frame captured `ms` milliseconds after an arbitrary epoch
    fn frame_at(sequence: u64, ms: u64) -> Arc<Frame> {
        Arc::new(Frame::new(
            sequence,
            UNIX_EPOCH + Duration::from_secs(1_700_000_000) + Duration::from_millis(ms),
            vec![0; 16 * 16],
            16,
            16,
            PixelFormat::Gray8,
        ))
    }

    fn motion(active: bool) -> MotionResult {
        if active {
            MotionResult {
                active: true,
                regions: vec![BoundingBox::new(0, 0, 8, 8)],
                total_area: 64,
            }
        } else {
            MotionResult::default()
        }
    }

    fn face(x: u32, y: u32) -> FaceDetection {
        FaceDetection {
            bbox: BoundingBox::new(x, y, 48, 48),
            confidence: 0.6,
            timestamp: Utc::now(),
        }
    }

    /// Drive one cycle per `(ms, motion_active)` pair
    async fn drive(aggregator: &mut EventAggregator, script: &[(u64, bool)]) {
        for (i, (ms, active)) in script.iter().enumerate() {
            aggregator
                .process(&frame_at(i as u64, *ms), &motion(*active), &[])
                .await;
        }
    }

    #[tokio::test]
    async fn test_spike_yields_one_start_and_one_stop() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(settings(), sink.clone());

        drive(&mut aggregator, &[(0, false), (66, true), (133, false), (200, false)]).await;

        assert_eq!(
            sink.kinds(),
            vec![EventKind::MotionStarted, EventKind::MotionStopped]
        );
    }

    #[tokio::test]
    async fn test_restart_inside_cooldown_is_suppressed() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(settings(), sink.clone());

        drive(
            &mut aggregator,
            &[
                (0, true),
                (100, false),
                // 1s after going quiet: suppressed, and so is its stop
                (1100, true),
                (1200, false),
                // 3.5s after the last quiet transition: reported
                (4700, true),
            ],
        )
        .await;

        assert_eq!(
            sink.kinds(),
            vec![
                EventKind::MotionStarted,
                EventKind::MotionStopped,
                EventKind::MotionStarted
            ]
        );
    }

    #[tokio::test]
    async fn test_warmup_ignores_motion() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(
            AggregatorSettings {
                warmup_frames: 3,
                ..settings()
            },
            sink.clone(),
        );

        drive(&mut aggregator, &[(0, true), (10, true), (20, true)]).await;
        assert!(sink.kinds().is_empty());
        assert!(!aggregator.in_warmup());

        drive(&mut aggregator, &[(30, true)]).await;
        assert_eq!(sink.kinds(), vec![EventKind::MotionStarted]);

        aggregator.restart_warmup();
        assert!(aggregator.in_warmup());
    }

    #[tokio::test]
    async fn test_disable_drops_silently() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(settings(), sink.clone());

        drive(&mut aggregator, &[(0, true)]).await;
        aggregator.apply_settings(AggregatorSettings {
            motion_enabled: false,
            ..settings()
        });
        drive(&mut aggregator, &[(100, true), (200, false), (300, true)]).await;

        assert_eq!(sink.kinds(), vec![EventKind::MotionStarted]);
        assert!(!aggregator.is_active());
    }

    #[tokio::test]
    async fn test_faces_are_coalesced() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(settings(), sink.clone());
        let active = motion(true);

        aggregator
            .process(&frame_at(1, 0), &active, &[face(100, 100)])
            .await;
        // Same face a little later and a few pixels over
        aggregator
            .process(&frame_at(2, 500), &active, &[face(110, 104)])
            .await;
        // A second person far away
        aggregator
            .process(&frame_at(3, 600), &active, &[face(110, 104), face(400, 100)])
            .await;
        // The first face again once the window has passed
        aggregator
            .process(&frame_at(4, 11_000), &active, &[face(100, 100)])
            .await;

        let events = sink.events();
        let faces: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::Face)
            .collect();
        assert_eq!(faces.len(), 3);
        assert_eq!(faces[1].regions, vec![BoundingBox::new(400, 100, 48, 48)]);
        assert_eq!(faces[0].confidence, Some(0.6));
    }

    #[tokio::test]
    async fn test_faces_in_suppressed_episode_are_dropped() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(settings(), sink.clone());
        let seen = [face(100, 100)];

        aggregator.process(&frame_at(1, 0), &motion(true), &seen).await;
        aggregator.process(&frame_at(2, 100), &motion(false), &[]).await;
        // Back inside the cooldown: no start, so no face either
        aggregator.process(&frame_at(3, 1000), &motion(true), &seen).await;
        aggregator.process(&frame_at(4, 1100), &motion(false), &[]).await;
        // A reported episode within the face window starts coalescing afresh
        aggregator.process(&frame_at(5, 5000), &motion(true), &seen).await;

        assert_eq!(
            sink.kinds(),
            vec![
                EventKind::MotionStarted,
                EventKind::Face,
                EventKind::MotionStopped,
                EventKind::MotionStarted,
                EventKind::Face
            ]
        );
    }

    #[tokio::test]
    async fn test_faces_without_motion_are_ignored() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(settings(), sink.clone());

        aggregator
            .process(&frame_at(1, 0), &motion(false), &[face(0, 0)])
            .await;
        assert!(sink.kinds().is_empty());
    }

    #[tokio::test]
    async fn test_timestamps_never_go_backwards() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(
            AggregatorSettings {
                cooldown: Duration::ZERO,
                ..settings()
            },
            sink.clone(),
        );

        // Clock steps back between the two episodes
        drive(&mut aggregator, &[(5000, true), (5100, false), (1000, true)]).await;

        let events = sink.events();
        let starts: Vec<_> = events
            .iter()
            .filter(|e| e.kind == EventKind::MotionStarted)
            .collect();
        assert_eq!(starts.len(), 2);
        assert!(starts[1].timestamp >= starts[0].timestamp);
    }

    #[tokio::test]
    async fn test_side_effect_failures_do_not_block_events() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"file").unwrap();

        let store = Arc::new(MemoryEventStore::new());
        let mut aggregator = EventAggregator::new(settings(), Arc::new(FailingSink))
            .with_store(store.clone())
            .with_snapshots(Arc::new(SnapshotWriter::new(&blocker, 80)));

        let events = aggregator
            .process(&frame_at(1, 0), &motion(true), &[])
            .await;

        assert_eq!(events.len(), 1);
        assert!(events[0].image_path.is_none());
        assert_eq!(store.len(), 1);
    }

    struct StalledStore;

    #[async_trait]
    impl EventStore for StalledStore {
        async fn persist(&self, _event: &DetectionEvent) -> Result<StoredPath, StorageError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(StoredPath("stalled".into()))
        }
    }

    #[tokio::test]
    async fn test_stalled_store_does_not_hold_the_event() {
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(
            AggregatorSettings {
                side_effect_timeout: Duration::from_millis(50),
                ..settings()
            },
            sink.clone(),
        )
        .with_store(Arc::new(StalledStore));

        let started = std::time::Instant::now();
        let events = aggregator
            .process(&frame_at(1, 0), &motion(true), &[])
            .await;

        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(events.len(), 1);
        assert_eq!(sink.kinds(), vec![EventKind::MotionStarted]);
    }

    #[test]
    fn test_side_effect_timeout_follows_frame_budget() {
        let mut runtime = crate::test_support::test_runtime();
        runtime.target_fps = 1;
        let slow = AggregatorSettings::from(&runtime);
        assert_eq!(slow.side_effect_timeout, Duration::from_secs(4));

        runtime.target_fps = 30;
        let fast = AggregatorSettings::from(&runtime);
        assert_eq!(fast.side_effect_timeout, MIN_SIDE_EFFECT_TIMEOUT);
    }

    #[tokio::test]
    async fn test_start_event_carries_snapshot() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let mut aggregator = EventAggregator::new(settings(), sink.clone())
            .with_snapshots(Arc::new(SnapshotWriter::new(temp_dir.path(), 80)));

        let events = aggregator
            .process(&frame_at(1, 0), &motion(true), &[])
            .await;
        let stops = aggregator
            .process(&frame_at(2, 100), &motion(false), &[])
            .await;

        let path = events[0].image_path.clone().unwrap();
        assert!(path.exists());
        assert!(stops[0].image_path.is_none());
    }
}
