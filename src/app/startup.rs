use super::{ComponentState, VisageOrchestrator};
use crate::capture_loop::LoopState;
use crate::error::{NotifyError, Result};
use crate::events::EventReceiver;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

impl VisageOrchestrator {
    /// Register all components as stopped
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing Visage components");

        let mut states = self.component_states.lock().await;
        states.insert("capture".to_string(), ComponentState::Stopped);
        states.insert("events".to_string(), ComponentState::Stopped);
        #[cfg(feature = "streaming")]
        if self.stream_server.is_some() {
            states.insert("streaming".to_string(), ComponentState::Stopped);
        }
        drop(states);

        info!("All components initialized successfully");
        Ok(())
    }

    /// Start the event log, the capture loop and the HTTP server, in that order
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting Visage system");

        self.set_component_state("events", ComponentState::Starting)
            .await;
        let receiver = self.event_bus.subscribe_filtered("event_log", Vec::new());
        let handle = tokio::spawn(run_event_log(
            receiver,
            self.cancellation_token.child_token(),
        ));
        self.background_tasks
            .lock()
            .await
            .insert("events".to_string(), handle);
        self.set_component_state("events", ComponentState::Running)
            .await;

        self.set_component_state("capture", ComponentState::Starting)
            .await;
        if let Err(e) = self.controller.start().await {
            self.set_component_state("capture", ComponentState::Failed)
                .await;
            error!("Failed to start capture loop: {}", e);
            return Err(e);
        }
        self.set_component_state("capture", ComponentState::Running)
            .await;
        info!("Capture loop started");
        tokio::spawn(watch_capture(
            self.controller.subscribe_state(),
            Arc::clone(&self.component_states),
            self.cancellation_token.child_token(),
        ));

        #[cfg(feature = "streaming")]
        if let Some(server) = self.stream_server.clone() {
            self.set_component_state("streaming", ComponentState::Starting)
                .await;

            let token = self.cancellation_token.child_token();
            let handle = tokio::spawn(async move {
                if let Err(e) = server.start(token).await {
                    error!("Stream server error: {}", e);
                }
            });
            self.background_tasks
                .lock()
                .await
                .insert("streaming".to_string(), handle);

            self.set_component_state("streaming", ComponentState::Running)
                .await;
            info!(
                "Streaming server started on {}:{}",
                self.config.stream.ip, self.config.stream.port
            );
        }

        if self.all_running().await {
            info!("Visage system started successfully");
        }
        Ok(())
    }
}

/// Mirror capture loop transitions into the component table. A stopped loop
/// leaves the process and HTTP server up so capture can be restarted.
async fn watch_capture(
    mut state_rx: watch::Receiver<LoopState>,
    states: Arc<Mutex<HashMap<String, ComponentState>>>,
    cancel: CancellationToken,
) {
    let mut previous = *state_rx.borrow_and_update();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let current = *state_rx.borrow_and_update();
        let component = match (previous, current) {
            (LoopState::Error, LoopState::Stopped) => {
                error!(
                    "Capture loop gave up on the camera; restart it with POST /api/capture/start"
                );
                Some(ComponentState::Failed)
            }
            (_, LoopState::Stopped) => {
                info!("Capture loop stopped");
                Some(ComponentState::Stopped)
            }
            (_, LoopState::Starting) => Some(ComponentState::Starting),
            (_, LoopState::Running) => Some(ComponentState::Running),
            (_, LoopState::Stopping) => Some(ComponentState::Stopping),
            (_, LoopState::Error) => {
                warn!("Capture loop is recovering from a camera error");
                None
            }
        };
        if let Some(component) = component {
            states.lock().await.insert("capture".to_string(), component);
        }
        previous = current;
    }
    debug!("Capture watcher stopped");
}

/// Default bus subscriber: a log line per event, with the snapshot path when one was written
async fn run_event_log(mut receiver: EventReceiver, cancel: CancellationToken) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = receiver.recv() => next,
        };

        match next {
            Ok(event) => match &event.image_path {
                Some(path) => info!("{} (snapshot {})", event.description(), path.display()),
                None => info!("{}", event.description()),
            },
            Err(NotifyError::Lagged { skipped }) => {
                warn!("Event log skipped {} events", skipped);
            }
            Err(_) => break,
        }
    }
    debug!("Event log stopped");
}
