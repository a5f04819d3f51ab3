use super::*;
use crate::capture_loop::LoopState;
use crate::config::VisageConfig;
use crate::events::EventKind;
use crate::storage::JsonlEventStore;
use crate::test_support::{big_block, Read, ScriptedSource, SourceControl, HEIGHT, WIDTH};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn create_test_config(dir: &TempDir) -> VisageConfig {
    let mut config = VisageConfig::default();
    config.camera.width = WIDTH;
    config.camera.height = HEIGHT;
    config.camera.read_timeout_ms = 50;
    config.motion.threshold = 1000;
    config.motion.check_interval = 1;
    config.motion.min_region_area = 100;
    config.events.motion_cooldown_ms = 0;
    config.events.warmup_frames = 0;
    config.face.enabled = false;
    config.capture.path = dir.path().to_string_lossy().into_owned();
    config.capture.timestamp_overlay = false;
    config.stream.ip = "127.0.0.1".to_string();
    config.stream.port = 0;
    config.system.shutdown_timeout_secs = 2;
    config
}

async fn orchestrator(config: VisageConfig) -> (VisageOrchestrator, SourceControl) {
    let (source, control) = ScriptedSource::new();
    let orchestrator = VisageOrchestrator::with_source(config, Box::new(source))
        .await
        .unwrap();
    (orchestrator, control)
}

#[tokio::test]
async fn test_initialize_registers_components() {
    let dir = TempDir::new().unwrap();
    let (mut orchestrator, _) = orchestrator(create_test_config(&dir)).await;
    assert!(orchestrator.get_all_component_states().await.is_empty());

    orchestrator.initialize().await.unwrap();
    let states = orchestrator.get_all_component_states().await;
    assert_eq!(states.get("capture"), Some(&ComponentState::Stopped));
    assert_eq!(states.get("events"), Some(&ComponentState::Stopped));
    #[cfg(feature = "streaming")]
    assert_eq!(states.get("streaming"), Some(&ComponentState::Stopped));
    assert!(!orchestrator.all_running().await);
}

#[tokio::test]
async fn test_component_state_management() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _) = orchestrator(create_test_config(&dir)).await;

    orchestrator
        .set_component_state("capture", ComponentState::Starting)
        .await;
    assert_eq!(
        orchestrator.get_component_state("capture").await,
        Some(ComponentState::Starting)
    );

    orchestrator
        .set_component_state("capture", ComponentState::Running)
        .await;
    orchestrator
        .set_component_state("events", ComponentState::Running)
        .await;
    assert!(orchestrator.all_running().await);

    orchestrator
        .set_component_state("streaming", ComponentState::Failed)
        .await;
    assert!(!orchestrator.all_running().await);
    assert_eq!(orchestrator.get_all_component_states().await.len(), 3);
    assert_eq!(orchestrator.get_component_state("unknown").await, None);
}

#[tokio::test]
async fn test_start_and_graceful_shutdown() {
    let dir = TempDir::new().unwrap();
    let (mut orchestrator, _) = orchestrator(create_test_config(&dir)).await;
    orchestrator.initialize().await.unwrap();

    orchestrator.start().await.unwrap();
    assert!(orchestrator.all_running().await);
    assert_eq!(orchestrator.controller().state(), LoopState::Running);

    let exit_code = orchestrator.shutdown().await.unwrap();
    assert_eq!(exit_code, 0);
    assert_eq!(orchestrator.controller().state(), LoopState::Stopped);

    let states = orchestrator.get_all_component_states().await;
    assert!(states.values().all(|s| *s == ComponentState::Stopped));
}

#[tokio::test]
async fn test_failed_camera_open_fails_start() {
    let dir = TempDir::new().unwrap();
    let (mut orchestrator, control) = orchestrator(create_test_config(&dir)).await;
    control.fail_next_opens(1);
    orchestrator.initialize().await.unwrap();

    assert!(orchestrator.start().await.is_err());
    assert_eq!(
        orchestrator.get_component_state("capture").await,
        Some(ComponentState::Failed)
    );

    orchestrator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_motion_events_are_persisted_and_snapshotted() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir);
    config.stream.enabled = false;
    let (mut orchestrator, control) = orchestrator(config).await;
    let mut receiver = orchestrator
        .event_bus()
        .subscribe_filtered("test", vec![EventKind::MotionStarted]);

    control.push([Read::Quiet; 4]);
    control.push([big_block()]);

    orchestrator.initialize().await.unwrap();
    orchestrator.start().await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.kind, EventKind::MotionStarted);

    let image_path = event.image_path.clone().unwrap();
    assert!(image_path.starts_with(dir.path()));
    assert!(image_path.exists());

    let store = JsonlEventStore::new(dir.path());
    let stored = store.load_day(event.timestamp.date_naive()).await.unwrap();
    assert!(stored.iter().any(|e| e.id == event.id));

    assert_eq!(orchestrator.shutdown().await.unwrap(), 0);
}

async fn wait_for_component(
    states: &Arc<tokio::sync::Mutex<std::collections::HashMap<String, ComponentState>>>,
    expected: ComponentState,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while states.lock().await.get("capture") != Some(&expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_capture_restarts_under_running_orchestrator() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir);
    config.stream.enabled = false;
    let (mut orchestrator, _) = orchestrator(config).await;
    orchestrator.initialize().await.unwrap();
    orchestrator.start().await.unwrap();

    let controller = orchestrator.controller();
    let states = orchestrator.component_states.clone();
    let run_task = tokio::spawn(async move { orchestrator.run().await });

    controller.stop().await.unwrap();
    assert_eq!(controller.state(), LoopState::Stopped);
    assert!(!controller.stats_snapshot().is_running);
    wait_for_component(&states, ComponentState::Stopped).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!run_task.is_finished());

    controller.start().await.unwrap();
    assert_eq!(controller.state(), LoopState::Running);
    wait_for_component(&states, ComponentState::Running).await;
    let frames = controller.stats_snapshot().frame_count;
    tokio::time::timeout(Duration::from_secs(5), async {
        while controller.stats_snapshot().frame_count <= frames {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    run_task.abort();
    controller.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_exhausted_recovery_keeps_process_up() {
    let dir = TempDir::new().unwrap();
    let mut config = create_test_config(&dir);
    config.stream.enabled = false;
    config.recovery.max_consecutive_failures = 1;
    config.recovery.max_recovery_attempts = 1;
    config.recovery.base_delay_ms = 10;
    config.recovery.max_delay_ms = 20;
    let (mut orchestrator, control) = orchestrator(config).await;
    orchestrator.initialize().await.unwrap();
    orchestrator.start().await.unwrap();

    let controller = orchestrator.controller();
    let states = orchestrator.component_states.clone();
    let run_task = tokio::spawn(async move { orchestrator.run().await });

    control.fail_next_opens(1);
    control.push([Read::Fail; 3]);

    wait_for_component(&states, ComponentState::Failed).await;
    assert_eq!(controller.state(), LoopState::Stopped);
    assert!(!controller.stats_snapshot().is_running);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!run_task.is_finished());

    control.script.lock().clear();
    controller.start().await.unwrap();
    assert_eq!(controller.state(), LoopState::Running);
    wait_for_component(&states, ComponentState::Running).await;

    run_task.abort();
    controller.shutdown().await.unwrap();
}
