//! Inference-engine boundary
//!
//! The core depends only on this shape, not on a specific engine. An engine
//! instance is the opaque runtime object bound to one loaded model; the
//! lifecycle manager is the only component that constructs or releases one.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chat::Message;
use crate::config::SamplingParams;
use crate::error::Result;

/// Acceleration backend selected before engine construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Acceleration {
    Gpu,
    Cpu,
}

/// Configuration handed to [`BackendFactory::construct`]
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub acceleration: Acceleration,
    pub num_threads: usize,
}

/// Progress report emitted by the engine while loading weights.
/// `text` is optional; the lifecycle manager synthesizes status text from
/// percentage bands when the engine does not supply one.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub percent: u8,
    pub text: Option<String>,
}

/// One event on a streaming completion channel
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Fragment(String),
    Done,
    Error(String),
}

/// What the host platform can accelerate, probed once per load
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendCapabilities {
    pub gpu_available: bool,
}

/// An allocated engine instance bound to one model.
#[async_trait]
pub trait EngineBackend: Send + Sync {
    /// Load model weights, reporting progress through `progress`.
    async fn load_weights(
        &mut self,
        model_id: &str,
        progress: mpsc::Sender<LoadReport>,
    ) -> Result<()>;

    /// Start a streaming completion. Fragments arrive on the returned
    /// channel in generation order; the channel is bounded so a slow
    /// consumer backpressures the engine rather than buffering.
    async fn stream_completion(
        &mut self,
        messages: &[Message],
        sampling: &SamplingParams,
    ) -> Result<mpsc::Receiver<StreamEvent>>;

    /// Release all engine resources. Must be safe to call more than once.
    async fn release(&mut self);
}

/// Constructs engine instances and reports platform capabilities.
pub trait BackendFactory: Send + Sync {
    fn capabilities(&self) -> BackendCapabilities;
    fn construct(&self, config: &BackendConfig) -> Result<Box<dyn EngineBackend>>;
}
