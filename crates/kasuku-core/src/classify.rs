//! Maps raw engine and transport failures into actionable categories.
//!
//! Classification is a case-insensitive keyword match against the raw
//! message, checked in a fixed priority order: the first rule that matches
//! wins. Both the keyword tables and the remediation suggestions are data,
//! kept together in [`RULES`] so the whole mapping can be reviewed (or
//! re-ordered) in one place.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// User-facing error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    GpuUnsupported,
    OutOfMemory,
    NetworkError,
    RuntimeUnsupported,
    ModelLoadError,
    TimeoutError,
    PermissionError,
    UnknownError,
    NotReady,
    AlreadyGenerating,
    Cancelled,
}

/// Optional device-memory context attached to a classification.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MemoryHints {
    /// Total device memory in GB, when known.
    pub detected_gb: Option<f64>,
    /// Memory the model needs in GB, when known.
    pub required_gb: Option<f64>,
}

/// A raw failure resolved into a category, a user-facing message and an
/// ordered list of remediation suggestions. Never mutated after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub raw_message: String,
    pub code: ErrorCode,
    pub user_message: String,
    pub suggestions: Vec<String>,
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.user_message)
    }
}

impl std::error::Error for ClassifiedError {}

struct Rule {
    code: ErrorCode,
    keywords: &'static [&'static str],
    user_message: &'static str,
    suggestions: &'static [&'static str],
}

/// Ordered rule list. A message containing keywords from several rules
/// classifies as the first match (e.g. "memory" beats "network").
const RULES: &[Rule] = &[
    Rule {
        code: ErrorCode::GpuUnsupported,
        keywords: &["gpu", "cuda", "metal", "vulkan", "adapter", "accelerat"],
        user_message: "GPU acceleration is not available on this device.",
        suggestions: &[
            "Try a smaller model from the tiny or small tier",
            "Update your GPU drivers to the latest version",
            "Retry with the CPU backend enabled",
            "Check that the acceleration runtime is installed correctly",
        ],
    },
    Rule {
        code: ErrorCode::OutOfMemory,
        keywords: &["memory", "oom", "alloc"],
        user_message: "Not enough memory to load this model.",
        suggestions: &[
            "Close other applications to free memory",
            "Select a smaller model from the catalog",
            "Restart the application and try again",
        ],
    },
    Rule {
        code: ErrorCode::NetworkError,
        keywords: &["fetch", "network", "download", "connection", "dns"],
        user_message: "Failed to download model files.",
        suggestions: &[
            "Check your internet connection",
            "Try again in a few moments",
            "The model host might be experiencing issues",
            "Check if your firewall is blocking the connection",
        ],
    },
    Rule {
        code: ErrorCode::RuntimeUnsupported,
        keywords: &["wasm", "webassembly", "bytecode", "jit"],
        user_message: "The runtime required by this model is not supported here.",
        suggestions: &[
            "Update to the latest release",
            "Select a model that does not require this runtime",
            "Check the engine runtime installation",
        ],
    },
    Rule {
        code: ErrorCode::ModelLoadError,
        keywords: &["model", "load", "initialize"],
        user_message: "Failed to load the model.",
        suggestions: &[
            "Try selecting a different model",
            "Check that the model artifact is not corrupted",
            "Check available disk space",
            "Re-download the model and try again",
        ],
    },
    Rule {
        code: ErrorCode::TimeoutError,
        keywords: &["timeout", "timed out", "deadline"],
        user_message: "Model loading timed out.",
        suggestions: &[
            "Your connection might be too slow",
            "Try a smaller model",
            "Try again with a better connection",
        ],
    },
    Rule {
        code: ErrorCode::PermissionError,
        keywords: &["permission", "denied", "security", "blocked"],
        user_message: "A security policy is blocking model loading.",
        suggestions: &[
            "Check file permissions on the model directory",
            "Review sandbox or security policy settings",
            "Run with sufficient privileges",
        ],
    },
];

const UNKNOWN_MESSAGE: &str = "An unexpected error occurred.";
const UNKNOWN_SUGGESTIONS: &[&str] = &[
    "Try again",
    "Try a different model",
    "Check the logs for details",
    "Report this issue if it persists",
];

/// Classify a raw failure message. Always returns a value, even for empty
/// or garbled input (which falls into [`ErrorCode::UnknownError`]).
pub fn classify(raw: &str, hints: &MemoryHints) -> ClassifiedError {
    let lowered = raw.to_lowercase();

    for rule in RULES {
        if rule.keywords.iter().any(|kw| lowered.contains(kw)) {
            let mut suggestions: Vec<String> =
                rule.suggestions.iter().map(|s| (*s).to_string()).collect();

            if rule.code == ErrorCode::OutOfMemory {
                if let (Some(detected), Some(required)) = (hints.detected_gb, hints.required_gb) {
                    suggestions.push(format!(
                        "Your device has {detected:.0}GB RAM, but this model needs at least {required:.0}GB"
                    ));
                }
            }

            return ClassifiedError {
                raw_message: raw.to_string(),
                code: rule.code,
                user_message: rule.user_message.to_string(),
                suggestions,
            };
        }
    }

    ClassifiedError {
        raw_message: raw.to_string(),
        code: ErrorCode::UnknownError,
        user_message: UNKNOWN_MESSAGE.to_string(),
        suggestions: UNKNOWN_SUGGESTIONS.iter().map(|s| (*s).to_string()).collect(),
    }
}

impl ClassifiedError {
    fn fixed(code: ErrorCode, raw: &str, user_message: &str, suggestions: &[&str]) -> Self {
        Self {
            raw_message: raw.to_string(),
            code,
            user_message: user_message.to_string(),
            suggestions: suggestions.iter().map(|s| (*s).to_string()).collect(),
        }
    }

    /// A generation or load was attempted with no model ready.
    pub fn not_ready() -> Self {
        Self::fixed(
            ErrorCode::NotReady,
            "no model is loaded",
            "No model is loaded yet.",
            &["Load a model before sending a message"],
        )
    }

    /// A second generation was requested while one is still active.
    pub fn already_generating() -> Self {
        Self::fixed(
            ErrorCode::AlreadyGenerating,
            "a generation is already in progress",
            "A response is already being generated.",
            &["Cancel the current response before sending another message"],
        )
    }

    /// Intentional stop. Never shown to the user as an error.
    pub fn cancelled() -> Self {
        Self::fixed(ErrorCode::Cancelled, "generation cancelled", "Cancelled.", &[])
    }

    /// Resolve an internal [`Error`] into a classified value. Structural
    /// failures map straight to their code; everything else goes through
    /// the keyword rules.
    pub fn from_engine_error(err: &Error, hints: &MemoryHints) -> Self {
        match err {
            Error::NotReady => Self::not_ready(),
            Error::AlreadyGenerating => Self::already_generating(),
            other => classify(&other.to_string(), hints),
        }
    }
}
