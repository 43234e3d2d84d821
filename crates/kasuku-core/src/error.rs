//! Error types for the Kasuku chat engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("no model is loaded")]
    NotReady,

    #[error("a generation is already in progress")]
    AlreadyGenerating,

    #[error("model load already in progress")]
    LoadInProgress,

    #[error("model not found: {0}")]
    ModelNotFound(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
