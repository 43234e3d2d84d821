//! Configuration types for the Kasuku chat engine

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Unix socket of the engine runner daemon
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,

    /// Prefer the GPU backend when the platform supports it
    #[serde(default = "default_prefer_gpu")]
    pub prefer_gpu: bool,

    /// Number of threads for CPU inference
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,

    /// Total device memory in GB; probed at load time when unset
    #[serde(default)]
    pub detected_memory_gb: Option<f64>,

    /// Sampling defaults for generation
    #[serde(default)]
    pub sampling: SamplingParams,

    /// Context estimation and windowing policy
    #[serde(default)]
    pub context: ContextPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            prefer_gpu: default_prefer_gpu(),
            num_threads: default_num_threads(),
            detected_memory_gb: None,
            sampling: SamplingParams::default(),
            context: ContextPolicy::default(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("kasuku-engine.sock")
}

fn default_prefer_gpu() -> bool {
    true
}

fn default_num_threads() -> usize {
    get_num_cpus().min(8)
}

/// Sampling parameters passed to the engine for each generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingParams {
    /// Maximum tokens to generate per response
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    0.95
}

/// Context estimation and adaptive windowing policy.
///
/// The characters-per-token ratio is an approximation tuned for English
/// text, not hard physics; deployments with different tokenizers should
/// adjust it here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextPolicy {
    /// Characters per estimated token
    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,

    /// Estimates above this raise a caution warning
    #[serde(default = "default_caution_tokens")]
    pub caution_tokens: usize,

    /// Estimates above this raise a critical warning
    #[serde(default = "default_critical_tokens")]
    pub critical_tokens: usize,

    /// Estimates above this shrink the generation window
    #[serde(default = "default_shrink_threshold_tokens")]
    pub shrink_threshold_tokens: usize,

    /// Messages sent as context under normal pressure
    #[serde(default = "default_full_window")]
    pub full_window: usize,

    /// Messages sent as context once the shrink threshold is crossed
    #[serde(default = "default_reduced_window")]
    pub reduced_window: usize,
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self {
            chars_per_token: default_chars_per_token(),
            caution_tokens: default_caution_tokens(),
            critical_tokens: default_critical_tokens(),
            shrink_threshold_tokens: default_shrink_threshold_tokens(),
            full_window: default_full_window(),
            reduced_window: default_reduced_window(),
        }
    }
}

fn default_chars_per_token() -> usize {
    4
}

fn default_caution_tokens() -> usize {
    2048
}

fn default_critical_tokens() -> usize {
    3072
}

fn default_shrink_threshold_tokens() -> usize {
    2048
}

fn default_full_window() -> usize {
    10
}

fn default_reduced_window() -> usize {
    6
}

fn get_num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}
