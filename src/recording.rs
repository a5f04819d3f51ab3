use crate::frame::Frame;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Time-boxed stream of published frames.
///
/// Reads the frame buffer only, so a recording never slows the capture loop.
/// Ends at its deadline, on [`cancel`](Self::cancel), when the controller
/// shuts down, or when the frame buffer goes away. Frames the consumer was
/// too slow to take are skipped rather than queued.
pub struct RecordingSession {
    id: Uuid,
    cancel: CancellationToken,
    deadline: Instant,
    frames: Pin<Box<dyn Stream<Item = Arc<Frame>> + Send>>,
}

impl RecordingSession {
    pub(crate) fn new(
        mut frames: watch::Receiver<Option<Arc<Frame>>>,
        duration: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let id = Uuid::new_v4();
        let deadline = Instant::now() + duration;
        let token = cancel.clone();

        let stream = async_stream::stream! {
            let mut last_sequence: Option<u64> = None;
            loop {
                let frame = frames.borrow_and_update().clone();
                if let Some(frame) = frame {
                    if last_sequence.map_or(true, |last| frame.sequence > last) {
                        last_sequence = Some(frame.sequence);
                        yield frame;
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = frames.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Recording {} finished after frame {:?}", id, last_sequence);
        };

        debug!("Recording {} started for {:?}", id, duration);
        Self {
            id,
            cancel,
            deadline,
            frames: Box::pin(stream),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// End the recording early; the stream finishes at its next poll
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for RecordingSession {
    type Item = Arc<Frame>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.frames.as_mut().poll_next(cx)
    }
}
