//! Fakes shared by the capture loop, controller and HTTP tests

use crate::analyzer::{FaceDetection, FaceDetector};
use crate::camera::{FrameSource, SourceSettings};
use crate::config::{MotionConfig, RuntimeConfig, VisageConfig};
use crate::error::{CaptureError, DetectionError, NotifyError};
use crate::events::{DetectionEvent, EventKind, EventSink};
use crate::frame::{BoundingBox, Frame, PixelFormat};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

pub const WIDTH: u32 = 160;
pub const HEIGHT: u32 = 120;
const BACKGROUND: u8 = 100;
const FOREGROUND: u8 = 250;

/// What the next `read` returns
#[derive(Debug, Clone, Copy)]
pub enum Read {
    Quiet,
    Block { x: u32, y: u32, size: u32 },
    Fail,
    /// Hold the read for this long, then return a quiet frame
    Stall(Duration),
}

/// Handles to a [`ScriptedSource`] that stay with the test
#[derive(Clone, Default)]
pub struct SourceControl {
    pub script: Arc<Mutex<VecDeque<Read>>>,
    pub failing_opens: Arc<AtomicU32>,
    pub opens: Arc<AtomicU32>,
}

impl SourceControl {
    pub fn push(&self, reads: impl IntoIterator<Item = Read>) {
        self.script.lock().extend(reads);
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

/// Frame source replaying a script; reads `Quiet` once the script runs out.
///
/// Frames are stamped 100ms apart on a fixed clock and carry their own
/// sequence numbers, which the loop is expected to replace.
pub struct ScriptedSource {
    control: SourceControl,
    settings: Option<SourceSettings>,
    reads: u64,
}

impl ScriptedSource {
    pub fn new() -> (Self, SourceControl) {
        let control = SourceControl::default();
        (
            Self {
                control: control.clone(),
                settings: None,
                reads: 0,
            },
            control,
        )
    }
}

#[async_trait]
impl FrameSource for ScriptedSource {
    async fn open(&mut self, settings: SourceSettings) -> Result<(), CaptureError> {
        let failing = self.control.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.control.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(CaptureError::DeviceUnavailable {
                details: "scripted open failure".to_string(),
            });
        }
        self.control.opens.fetch_add(1, Ordering::SeqCst);
        self.settings = Some(settings);
        Ok(())
    }

    async fn read(&mut self, timeout: Duration) -> Result<Frame, CaptureError> {
        let settings = self.settings.ok_or(CaptureError::NotOpen)?;
        let next = self.control.script.lock().pop_front().unwrap_or(Read::Quiet);

        self.reads += 1;
        let timestamp = UNIX_EPOCH
            + Duration::from_secs(1_700_000_000)
            + Duration::from_millis(self.reads * 100);

        match next {
            Read::Fail => Err(CaptureError::Timeout { timeout }),
            Read::Quiet => Ok(scene(9000 + self.reads, timestamp, &settings, None)),
            Read::Stall(hold) => {
                tokio::time::sleep(hold).await;
                Ok(scene(9000 + self.reads, timestamp, &settings, None))
            }
            Read::Block { x, y, size } => Ok(scene(
                9000 + self.reads,
                timestamp,
                &settings,
                Some((x, y, size)),
            )),
        }
    }

    async fn close(&mut self) {
        self.settings = None;
    }

    fn is_open(&self) -> bool {
        self.settings.is_some()
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

fn scene(
    sequence: u64,
    timestamp: std::time::SystemTime,
    settings: &SourceSettings,
    block: Option<(u32, u32, u32)>,
) -> Frame {
    let (w, h) = (settings.width, settings.height);
    let mut data = vec![BACKGROUND; (w * h) as usize];
    if let Some((bx, by, size)) = block {
        for y in by..(by + size).min(h) {
            for x in bx..(bx + size).min(w) {
                data[(y * w + x) as usize] = FOREGROUND;
            }
        }
    }
    Frame::new(sequence, timestamp, data, w, h, PixelFormat::Gray8)
}

/// Big enough to clear a 1000 px threshold comfortably
pub fn big_block() -> Read {
    Read::Block {
        x: 40,
        y: 30,
        size: 40,
    }
}

/// Runtime config sized for the scripted source with no warm-up or cooldown
pub fn test_runtime() -> RuntimeConfig {
    RuntimeConfig {
        width: WIDTH,
        height: HEIGHT,
        target_fps: 15,
        motion_threshold: 1000,
        motion_check_interval: 1,
        motion_cooldown_ms: 0,
        warmup_frames: 0,
        ..VisageConfig::default().runtime()
    }
}

pub fn test_motion_config() -> MotionConfig {
    MotionConfig {
        min_region_area: 100,
        ..MotionConfig::default()
    }
}

/// Sink that remembers every event it is handed
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<DetectionEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<DetectionEvent> {
        self.events.lock().clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }
}

impl EventSink for RecordingSink {
    fn on_event(&self, event: &DetectionEvent) -> Result<(), NotifyError> {
        self.events.lock().push(event.clone());
        Ok(())
    }
}

/// Reports one face at the centre of the first region it is asked about
pub struct FixedFaceDetector;

impl FaceDetector for FixedFaceDetector {
    fn detect(
        &self,
        frame: &Frame,
        regions: Option<&[BoundingBox]>,
    ) -> Result<Vec<FaceDetection>, DetectionError> {
        let area = match regions {
            Some([first, ..]) => *first,
            Some([]) => return Ok(Vec::new()),
            None => BoundingBox::new(0, 0, frame.width, frame.height),
        };
        let (cx, cy) = area.center();
        Ok(vec![FaceDetection {
            bbox: BoundingBox::new(
                (cx as u32).saturating_sub(10),
                (cy as u32).saturating_sub(10),
                20,
                20,
            ),
            confidence: 0.75,
            timestamp: Utc::now(),
        }])
    }

    fn name(&self) -> &str {
        "fixed"
    }
}
