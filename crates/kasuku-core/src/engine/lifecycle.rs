//! Model lifecycle management
//!
//! Owns zero-or-one engine instance and transitions it safely between
//! models. Teardown always completes before a new engine is constructed so
//! two model instances never coexist.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, MutexGuard, RwLock};
use tracing::{error, info, warn};

use crate::catalog::ModelDescriptor;
use crate::classify::{ClassifiedError, MemoryHints};
use crate::config::EngineConfig;
use crate::device;
use crate::engine::backend::{
    Acceleration, BackendConfig, BackendFactory, EngineBackend,
};
use crate::error::Error;

/// Lifecycle of the single engine instance. `Ready` holds exactly when one
/// engine is allocated and bound to the model id.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum LifecycleState {
    Idle,
    Loading {
        model_id: String,
        percent: u8,
        status: String,
    },
    Ready {
        model_id: String,
    },
    Failed {
        model_id: String,
        error: ClassifiedError,
    },
}

/// The owned engine slot. The generation pipeline borrows it briefly to
/// start a stream; the stop flag of an in-flight generation lives here so
/// teardown can cancel it without waiting for the stream to drain.
pub(crate) struct EngineSlot {
    pub engine: Option<Box<dyn EngineBackend>>,
    pub model_id: Option<String>,
    pub generation: Option<Arc<AtomicBool>>,
}

pub struct LifecycleManager {
    config: EngineConfig,
    factory: Arc<dyn BackendFactory>,
    state: RwLock<LifecycleState>,
    slot: Mutex<EngineSlot>,
}

impl LifecycleManager {
    pub fn new(config: EngineConfig, factory: Arc<dyn BackendFactory>) -> Self {
        Self {
            config,
            factory,
            state: RwLock::new(LifecycleState::Idle),
            slot: Mutex::new(EngineSlot {
                engine: None,
                model_id: None,
                generation: None,
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Snapshot of the current state.
    pub async fn state(&self) -> LifecycleState {
        self.state.read().await.clone()
    }

    pub async fn is_ready(&self) -> bool {
        matches!(*self.state.read().await, LifecycleState::Ready { .. })
    }

    pub async fn current_model_id(&self) -> Option<String> {
        match &*self.state.read().await {
            LifecycleState::Ready { model_id } => Some(model_id.clone()),
            _ => None,
        }
    }

    /// Percent and status of an in-flight load, if any.
    pub async fn loading_progress(&self) -> Option<(u8, String)> {
        match &*self.state.read().await {
            LifecycleState::Loading {
                percent, status, ..
            } => Some((*percent, status.clone())),
            _ => None,
        }
    }

    /// Load a model, tearing down any previous engine first.
    ///
    /// Progress percentages are monotonically non-decreasing in `[0, 100]`.
    /// Engine-supplied status text is preferred; otherwise text is
    /// synthesized from the percentage band.
    pub async fn load_model<F>(
        &self,
        descriptor: &ModelDescriptor,
        mut on_progress: F,
    ) -> std::result::Result<(), ClassifiedError>
    where
        F: FnMut(u8, &str) + Send,
    {
        if matches!(*self.state.read().await, LifecycleState::Loading { .. }) {
            return Err(ClassifiedError::from_engine_error(
                &Error::LoadInProgress,
                &self.memory_hints(descriptor),
            ));
        }

        let mut slot = self.slot.lock().await;

        // Loading the already-ready model is a no-op success.
        if slot.model_id.as_deref() == Some(descriptor.id)
            && matches!(*self.state.read().await, LifecycleState::Ready { .. })
        {
            return Ok(());
        }

        // Teardown before construction bounds peak memory: two model
        // instances must never coexist.
        self.teardown_locked(&mut slot).await;

        let accel = self.select_acceleration();
        let initial = status_for(0, accel);
        self.set_loading(descriptor.id, 0, initial).await;
        on_progress(0, initial);

        let backend_config = BackendConfig {
            acceleration: accel,
            num_threads: self.config.num_threads,
        };
        let mut engine = match self.factory.construct(&backend_config) {
            Ok(engine) => engine,
            Err(err) => {
                let classified =
                    ClassifiedError::from_engine_error(&err, &self.memory_hints(descriptor));
                error!(
                    model = descriptor.id,
                    "Engine construction failed: {}", classified.raw_message
                );
                self.set_failed(descriptor.id, classified.clone()).await;
                return Err(classified);
            }
        };

        info!(model = descriptor.id, backend = ?accel, "Loading model");

        let (progress_tx, mut progress_rx) = mpsc::channel(16);
        let load_result = {
            let load = engine.load_weights(descriptor.id, progress_tx);
            let drain = async {
                let mut last_pct = 0u8;
                while let Some(report) = progress_rx.recv().await {
                    last_pct = last_pct.max(report.percent.min(100));
                    let status = match report.text.as_deref().filter(|t| !t.is_empty()) {
                        Some(text) => text.to_string(),
                        None => status_for(last_pct, accel).to_string(),
                    };
                    self.set_loading(descriptor.id, last_pct, &status).await;
                    on_progress(last_pct, &status);
                }
            };
            let (result, ()) = tokio::join!(load, drain);
            result
        };

        match load_result {
            Ok(()) => {
                slot.engine = Some(engine);
                slot.model_id = Some(descriptor.id.to_string());
                self.set_state(LifecycleState::Ready {
                    model_id: descriptor.id.to_string(),
                })
                .await;
                on_progress(100, "Model loaded successfully");
                info!(model = descriptor.id, "Model ready");
                Ok(())
            }
            Err(err) => {
                // A failed load must not leave a half-initialized engine
                // referenced anywhere.
                engine.release().await;
                let classified =
                    ClassifiedError::from_engine_error(&err, &self.memory_hints(descriptor));
                warn!(
                    model = descriptor.id,
                    "Model load failed: {}", classified.raw_message
                );
                self.set_failed(descriptor.id, classified.clone()).await;
                Err(classified)
            }
        }
    }

    /// Release the engine and return to `Idle`. Idempotent; safe to call
    /// from a shutdown path even if no model was ever loaded.
    pub async fn unload(&self) {
        let mut slot = self.slot.lock().await;
        self.teardown_locked(&mut slot).await;
    }

    pub(crate) async fn slot(&self) -> MutexGuard<'_, EngineSlot> {
        self.slot.lock().await
    }

    pub(crate) fn generation_hints(&self) -> MemoryHints {
        MemoryHints {
            detected_gb: self.config.detected_memory_gb,
            required_gb: None,
        }
    }

    async fn teardown_locked(&self, slot: &mut EngineSlot) {
        if let Some(stop) = slot.generation.take() {
            stop.store(true, Ordering::SeqCst);
            info!("Cancelled in-flight generation for teardown");
        }
        if let Some(mut engine) = slot.engine.take() {
            engine.release().await;
            info!("Engine instance released");
        }
        slot.model_id = None;
        self.set_state(LifecycleState::Idle).await;
    }

    fn select_acceleration(&self) -> Acceleration {
        let caps = self.factory.capabilities();
        if self.config.prefer_gpu && caps.gpu_available {
            Acceleration::Gpu
        } else {
            if self.config.prefer_gpu {
                info!("GPU backend unavailable, falling back to CPU");
            }
            Acceleration::Cpu
        }
    }

    fn memory_hints(&self, descriptor: &ModelDescriptor) -> MemoryHints {
        MemoryHints {
            detected_gb: self
                .config
                .detected_memory_gb
                .or_else(device::detect_memory_gb),
            required_gb: Some(f64::from(descriptor.min_ram_gb)),
        }
    }

    async fn set_state(&self, state: LifecycleState) {
        *self.state.write().await = state;
    }

    async fn set_loading(&self, model_id: &str, percent: u8, status: &str) {
        self.set_state(LifecycleState::Loading {
            model_id: model_id.to_string(),
            percent,
            status: status.to_string(),
        })
        .await;
    }

    async fn set_failed(&self, model_id: &str, error: ClassifiedError) {
        self.set_state(LifecycleState::Failed {
            model_id: model_id.to_string(),
            error,
        })
        .await;
    }
}

/// Synthesized status text for a percentage band.
fn status_for(percent: u8, accel: Acceleration) -> &'static str {
    match percent {
        0..=4 => match accel {
            Acceleration::Gpu => "Initializing GPU backend...",
            Acceleration::Cpu => "Initializing CPU backend...",
        },
        5..=14 => "Checking model cache...",
        15..=24 => "Downloading model metadata...",
        25..=39 => "Downloading model weights...",
        40..=54 => "Loading model into memory...",
        55..=69 => match accel {
            Acceleration::Gpu => "Compiling GPU kernels...",
            Acceleration::Cpu => "Compiling for CPU execution...",
        },
        70..=84 => "Optimizing for your device...",
        85..=94 => "Finalizing model initialization...",
        _ => "Almost ready...",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::classify::ErrorCode;
    use crate::engine::backend::testing::{MockEvent, MockFactory, MockScript};
    use crate::engine::backend::LoadReport;
    use std::sync::Mutex as StdMutex;

    fn tiny() -> &'static ModelDescriptor {
        catalog::by_id("Qwen2-0.5B-Instruct-q4f16_1").unwrap()
    }

    fn large() -> &'static ModelDescriptor {
        catalog::by_id("Mistral-7B-Instruct-v0.2-q4f16_1").unwrap()
    }

    fn manager_with(factory: MockFactory, config: EngineConfig) -> LifecycleManager {
        LifecycleManager::new(config, Arc::new(factory))
    }

    fn progress_recorder() -> (
        Arc<StdMutex<Vec<(u8, String)>>>,
        impl FnMut(u8, &str) + Send,
    ) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        let callback = move |pct: u8, status: &str| {
            sink.lock().unwrap().push((pct, status.to_string()));
        };
        (log, callback)
    }

    #[tokio::test]
    async fn successful_load_reaches_ready_with_forced_100() {
        let factory = MockFactory {
            script: MockScript {
                load_reports: vec![
                    LoadReport { percent: 10, text: None },
                    LoadReport {
                        percent: 50,
                        text: Some("Fetching shards".to_string()),
                    },
                    LoadReport { percent: 90, text: None },
                ],
                ..MockScript::default()
            },
            gpu_available: true,
            ..MockFactory::default()
        };
        let manager = manager_with(factory, EngineConfig::default());
        let (log, callback) = progress_recorder();

        manager.load_model(tiny(), callback).await.unwrap();

        assert!(manager.is_ready().await);
        assert_eq!(manager.current_model_id().await.as_deref(), Some(tiny().id));

        let reports = log.lock().unwrap().clone();
        assert_eq!(reports.first().unwrap().0, 0);
        assert_eq!(reports.last().unwrap().0, 100);
        // Engine-supplied text wins over the synthesized band text.
        assert!(reports.iter().any(|(p, s)| *p == 50 && s == "Fetching shards"));
        // Band text fills the gaps.
        assert!(reports.iter().any(|(p, s)| *p == 10 && s == "Checking model cache..."));
    }

    #[tokio::test]
    async fn progress_is_monotonically_non_decreasing() {
        let factory = MockFactory {
            script: MockScript {
                load_reports: vec![
                    LoadReport { percent: 30, text: None },
                    LoadReport { percent: 20, text: None },
                    LoadReport { percent: 60, text: None },
                    LoadReport { percent: 250, text: None },
                ],
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let manager = manager_with(factory, EngineConfig::default());
        let (log, callback) = progress_recorder();

        manager.load_model(tiny(), callback).await.unwrap();

        let reports = log.lock().unwrap().clone();
        let mut last = 0;
        for (pct, _) in &reports {
            assert!(*pct >= last, "progress went backwards: {reports:?}");
            assert!(*pct <= 100);
            last = *pct;
        }
    }

    #[tokio::test]
    async fn loading_ready_model_again_is_a_noop() {
        let factory = MockFactory::default();
        let manager = manager_with(factory.clone(), EngineConfig::default());

        manager.load_model(tiny(), |_, _| {}).await.unwrap();
        let events_after_first = factory.events().len();

        manager.load_model(tiny(), |_, _| {}).await.unwrap();
        assert_eq!(factory.events().len(), events_after_first);
        assert!(manager.is_ready().await);
    }

    #[tokio::test]
    async fn switching_models_tears_down_before_constructing() {
        let factory = MockFactory::default();
        let manager = manager_with(factory.clone(), EngineConfig::default());

        manager.load_model(tiny(), |_, _| {}).await.unwrap();
        manager.load_model(large(), |_, _| {}).await.unwrap();

        assert_eq!(
            factory.events(),
            vec![
                MockEvent::Constructed(Acceleration::Cpu),
                MockEvent::LoadStarted(tiny().id.to_string()),
                MockEvent::Released,
                MockEvent::Constructed(Acceleration::Cpu),
                MockEvent::LoadStarted(large().id.to_string()),
            ]
        );
        assert_eq!(manager.current_model_id().await.as_deref(), Some(large().id));
    }

    #[tokio::test]
    async fn failed_load_releases_engine_and_classifies() {
        let factory = MockFactory {
            script: MockScript {
                load_error: Some("buffer allocation failed: out of memory".to_string()),
                ..MockScript::default()
            },
            ..MockFactory::default()
        };
        let config = EngineConfig {
            detected_memory_gb: Some(8.0),
            ..EngineConfig::default()
        };
        let manager = manager_with(factory.clone(), config);

        let err = manager.load_model(large(), |_, _| {}).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::OutOfMemory);
        // Hint carries the concrete numbers: 8GB detected, 12GB required.
        let hint = err.suggestions.last().unwrap();
        assert!(hint.contains("8GB") && hint.contains("12GB"));

        assert!(matches!(
            manager.state().await,
            LifecycleState::Failed { .. }
        ));
        assert_eq!(factory.events().last(), Some(&MockEvent::Released));
        assert!(!manager.is_ready().await);
    }

    #[tokio::test]
    async fn unload_is_idempotent_and_safe_before_first_load() {
        let factory = MockFactory::default();
        let manager = manager_with(factory.clone(), EngineConfig::default());

        manager.unload().await;
        assert!(matches!(manager.state().await, LifecycleState::Idle));

        manager.load_model(tiny(), |_, _| {}).await.unwrap();
        manager.unload().await;
        manager.unload().await;

        let releases = factory
            .events()
            .iter()
            .filter(|e| **e == MockEvent::Released)
            .count();
        assert_eq!(releases, 1);
        assert!(matches!(manager.state().await, LifecycleState::Idle));
    }

    #[tokio::test]
    async fn gpu_preference_falls_back_to_cpu_when_unavailable() {
        let factory = MockFactory {
            gpu_available: false,
            ..MockFactory::default()
        };
        let manager = manager_with(factory.clone(), EngineConfig::default());
        let (log, callback) = progress_recorder();

        manager.load_model(tiny(), callback).await.unwrap();

        assert!(factory
            .events()
            .contains(&MockEvent::Constructed(Acceleration::Cpu)));
        let reports = log.lock().unwrap().clone();
        assert!(reports[0].1.contains("CPU"));
    }

    #[tokio::test]
    async fn gpu_is_selected_when_available_and_preferred() {
        let factory = MockFactory {
            gpu_available: true,
            ..MockFactory::default()
        };
        let manager = manager_with(factory.clone(), EngineConfig::default());
        manager.load_model(tiny(), |_, _| {}).await.unwrap();
        assert!(factory
            .events()
            .contains(&MockEvent::Constructed(Acceleration::Gpu)));
    }

    #[tokio::test]
    async fn teardown_cancels_in_flight_generation() {
        let factory = MockFactory::default();
        let manager = manager_with(factory, EngineConfig::default());
        manager.load_model(tiny(), |_, _| {}).await.unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        manager.slot().await.generation = Some(stop.clone());

        manager.unload().await;
        assert!(stop.load(Ordering::SeqCst));
        assert!(manager.slot().await.generation.is_none());
    }

    #[test]
    fn status_bands_cover_the_full_range() {
        assert_eq!(
            status_for(0, Acceleration::Gpu),
            "Initializing GPU backend..."
        );
        assert_eq!(status_for(10, Acceleration::Cpu), "Checking model cache...");
        assert_eq!(
            status_for(45, Acceleration::Gpu),
            "Loading model into memory..."
        );
        assert_eq!(
            status_for(60, Acceleration::Cpu),
            "Compiling for CPU execution..."
        );
        assert_eq!(status_for(99, Acceleration::Gpu), "Almost ready...");
    }
}
