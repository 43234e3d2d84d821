//! Application state management

use kasuku_core::engine::{GenerationPipeline, LifecycleManager};
use kasuku_core::Transcript;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub lifecycle: Arc<LifecycleManager>,
    pub pipeline: Arc<GenerationPipeline>,
    /// The single server-side conversation. Append-only except for
    /// explicit clears.
    pub transcript: Arc<Mutex<Transcript>>,
}

impl AppState {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        let pipeline = Arc::new(GenerationPipeline::new(lifecycle.clone()));
        Self {
            lifecycle,
            pipeline,
            transcript: Arc::new(Mutex::new(Transcript::new())),
        }
    }
}
