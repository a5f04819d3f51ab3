use super::{ComponentState, VisageOrchestrator};
use std::collections::HashMap;
use tracing::debug;

impl VisageOrchestrator {
    pub async fn set_component_state(&self, component: &str, state: ComponentState) {
        let mut states = self.component_states.lock().await;
        debug!(
            "Component '{}' state changed: {:?} -> {:?}",
            component,
            states.get(component),
            state
        );
        states.insert(component.to_string(), state);
    }

    pub async fn get_component_state(&self, component: &str) -> Option<ComponentState> {
        let states = self.component_states.lock().await;
        states.get(component).cloned()
    }

    pub async fn get_all_component_states(&self) -> HashMap<String, ComponentState> {
        let states = self.component_states.lock().await;
        states.clone()
    }

    /// True once every registered component reports `Running`
    pub async fn all_running(&self) -> bool {
        let states = self.component_states.lock().await;
        !states.is_empty() && states.values().all(|s| *s == ComponentState::Running)
    }
}
