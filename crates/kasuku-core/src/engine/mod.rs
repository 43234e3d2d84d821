//! Engine lifecycle and streaming generation

pub mod backend;
mod daemon;
mod generation;
mod lifecycle;

pub use backend::{
    Acceleration, BackendCapabilities, BackendConfig, BackendFactory, EngineBackend, LoadReport,
    StreamEvent,
};
pub use daemon::{DaemonBackend, DaemonFactory};
pub use generation::{
    GenerationHandle, GenerationOutcome, GenerationPipeline, DEFAULT_MAX_FRAGMENTS,
};
pub use lifecycle::{LifecycleManager, LifecycleState};
