use super::{ComponentState, VisageOrchestrator};
use crate::error::{Result, VisageError};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

impl VisageOrchestrator {
    /// Stop components in reverse start order; returns the process exit code
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");

        // Stops the HTTP server, the event log and the state watcher
        self.cancellation_token.cancel();

        let mut exit_code = 0;
        for component in ["streaming", "capture", "events"] {
            if let Err(e) = self.stop_component(component).await {
                error!("Error stopping {}: {}", component, e);
                exit_code = 1;
            }
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    async fn stop_component(&self, component: &str) -> Result<()> {
        if self.get_component_state(component).await.is_none() {
            return Ok(());
        }

        info!("Stopping {} component", component);
        self.set_component_state(component, ComponentState::Stopping)
            .await;

        let limit = Duration::from_secs(self.config.system.shutdown_timeout_secs);
        let result = match component {
            "capture" => {
                // The controller applies its own stop timeout; allow it to elapse first
                match timeout(limit * 2, self.controller.shutdown()).await {
                    Ok(result) => result,
                    Err(_) => {
                        error!("{} component stop timeout", component);
                        Err(VisageError::system(format!(
                            "{} component stop timeout",
                            component
                        )))
                    }
                }
            }
            _ => {
                let handle = self.background_tasks.lock().await.remove(component);
                match handle {
                    Some(mut handle) => match timeout(limit, &mut handle).await {
                        Ok(joined) => {
                            joined.map_err(|e| VisageError::component(component, e.to_string()))
                        }
                        Err(_) => {
                            // Open MJPEG connections keep the server alive
                            warn!("{} did not stop within {:?}, aborting", component, limit);
                            handle.abort();
                            Ok(())
                        }
                    },
                    None => Ok(()),
                }
            }
        };

        let state = match &result {
            Ok(()) => {
                info!("{} component stopped", component);
                ComponentState::Stopped
            }
            Err(_) => ComponentState::Failed,
        };
        self.set_component_state(component, state).await;
        result
    }
}
