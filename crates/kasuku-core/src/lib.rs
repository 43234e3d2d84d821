//! Kasuku Core - In-Process Chat Inference Engine
//!
//! This crate manages the lifecycle of a local chat model and drives
//! streaming generation against it: one engine instance at a time, loaded
//! with progress reporting, generating one response at a time with
//! cooperative cancellation.
//!
//! # Architecture
//!
//! - A model catalog describing known models and their device requirements
//! - A lifecycle manager owning zero-or-one engine instance
//! - A generation pipeline streaming fragments with context-window policy
//! - An error classifier mapping raw engine errors to user-facing advice
//!
//! # Example
//!
//! ```ignore
//! use kasuku_core::engine::{DaemonFactory, GenerationPipeline, LifecycleManager};
//! use kasuku_core::{catalog, EngineConfig};
//!
//! let config = EngineConfig::default();
//! let factory = Arc::new(DaemonFactory::new(&config.socket_path));
//! let lifecycle = Arc::new(LifecycleManager::new(config, factory));
//!
//! let model = catalog::by_id("Llama-3.2-1B-Instruct-q4f16_1").unwrap();
//! lifecycle.load_model(model, |pct, status| println!("{pct}% {status}")).await?;
//!
//! let pipeline = GenerationPipeline::new(lifecycle);
//! pipeline.generate(&transcript, None, |f| print!("{f}"), 2048).await?;
//! ```

pub mod catalog;
pub mod chat;
pub mod classify;
pub mod config;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod sanitize;

pub use catalog::{GpuRequirement, ModelDescriptor, SizeTier};
pub use chat::{Message, Role, Transcript};
pub use classify::{classify, ClassifiedError, ErrorCode, MemoryHints};
pub use config::{ContextPolicy, EngineConfig, SamplingParams};
pub use context::{ContextEstimate, ContextTracker, WarningLevel};
pub use engine::{
    DaemonFactory, GenerationOutcome, GenerationPipeline, LifecycleManager, LifecycleState,
};
pub use error::{Error, Result};
