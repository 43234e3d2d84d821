//! Static model registry and device-capability filtering

use serde::{Deserialize, Serialize};

/// Size tier of a model artifact, smallest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeTier {
    Tiny,
    Small,
    Medium,
    Large,
    Xl,
    Xxl,
}

/// How much the model depends on GPU acceleration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuRequirement {
    Optional,
    Recommended,
    Required,
}

/// Static metadata for a selectable model. Never mutated; looked up by id.
#[derive(Debug, Clone, Serialize)]
pub struct ModelDescriptor {
    pub id: &'static str,
    pub display_name: &'static str,
    pub approx_size_bytes: u64,
    pub min_ram_gb: u32,
    pub gpu: GpuRequirement,
    pub tier: SizeTier,
    pub description: &'static str,
}

const fn mib(n: u64) -> u64 {
    n * 1024 * 1024
}

/// All selectable models, ordered smallest tier first.
const REGISTRY: &[ModelDescriptor] = &[
    // Tiny tier: ultra-fast, runs everywhere
    ModelDescriptor {
        id: "Qwen2-0.5B-Instruct-q4f16_1",
        display_name: "Qwen2 0.5B",
        approx_size_bytes: mib(945),
        min_ram_gb: 2,
        gpu: GpuRequirement::Optional,
        tier: SizeTier::Tiny,
        description: "Ultra-fast, works on all devices including old phones",
    },
    ModelDescriptor {
        id: "Llama-3.2-1B-Instruct-q4f16_1",
        display_name: "Llama 3.2 1B",
        approx_size_bytes: mib(879),
        min_ram_gb: 4,
        gpu: GpuRequirement::Optional,
        tier: SizeTier::Tiny,
        description: "Flexible and fast, great for mobile devices",
    },
    // Small tier: fast, most devices
    ModelDescriptor {
        id: "Qwen2-1.5B-Instruct-q4f16_1",
        display_name: "Qwen2 1.5B",
        approx_size_bytes: mib(1669),
        min_ram_gb: 4,
        gpu: GpuRequirement::Recommended,
        tier: SizeTier::Small,
        description: "Recommended: best balance of speed and quality",
    },
    ModelDescriptor {
        id: "gemma-2b-it-q4f16_1",
        display_name: "Gemma 2B",
        approx_size_bytes: mib(1772),
        min_ram_gb: 4,
        gpu: GpuRequirement::Recommended,
        tier: SizeTier::Small,
        description: "Efficient model, excellent for general tasks",
    },
    // Medium tier: high quality, capable devices
    ModelDescriptor {
        id: "Llama-3.2-3B-Instruct-q4f16_1",
        display_name: "Llama 3.2 3B",
        approx_size_bytes: mib(2314),
        min_ram_gb: 8,
        gpu: GpuRequirement::Recommended,
        tier: SizeTier::Medium,
        description: "High quality responses, good for complex conversations",
    },
    ModelDescriptor {
        id: "stablelm-2-zephyr-1_6b-q4f16_1",
        display_name: "StableLM 2 Zephyr 1.6B",
        approx_size_bytes: mib(1936),
        min_ram_gb: 6,
        gpu: GpuRequirement::Recommended,
        tier: SizeTier::Medium,
        description: "Efficient model, great for creative tasks",
    },
    ModelDescriptor {
        id: "RedPajama-INCITE-Chat-3B-v1-q4f16_1",
        display_name: "RedPajama 3B",
        approx_size_bytes: mib(2120),
        min_ram_gb: 6,
        gpu: GpuRequirement::Recommended,
        tier: SizeTier::Medium,
        description: "Open-source model trained on diverse data, versatile",
    },
    // Large tier: very capable, powerful devices
    ModelDescriptor {
        id: "Hermes-2-Pro-Mistral-7B-q4f16_1",
        display_name: "Hermes 2 Pro 7B",
        approx_size_bytes: mib(4127),
        min_ram_gb: 12,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Large,
        description: "Advanced model with excellent instruction following",
    },
    ModelDescriptor {
        id: "Mistral-7B-Instruct-v0.2-q4f16_1",
        display_name: "Mistral 7B v0.2",
        approx_size_bytes: mib(4475),
        min_ram_gb: 12,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Large,
        description: "Popular powerful model, excellent for complex reasoning",
    },
    ModelDescriptor {
        id: "WizardLM-2-7B-q4f16_1",
        display_name: "WizardLM 2 7B",
        approx_size_bytes: mib(4762),
        min_ram_gb: 12,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Large,
        description: "Advanced instruction-following with strong reasoning",
    },
    ModelDescriptor {
        id: "DeepSeek-R1-Distill-Qwen-7B-q4f16_1",
        display_name: "DeepSeek-R1 7B",
        approx_size_bytes: mib(5233),
        min_ram_gb: 12,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Large,
        description: "Specialized reasoning model with chain-of-thought output",
    },
    // XL tier: high-end hardware
    ModelDescriptor {
        id: "Llama-3.1-8B-Instruct-q4f16_1",
        display_name: "Llama 3.1 8B",
        approx_size_bytes: mib(4710),
        min_ram_gb: 16,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Xl,
        description: "Flagship model, exceptional at all tasks",
    },
    ModelDescriptor {
        id: "Hermes-2-Pro-Llama-3-8B-q4f16_1",
        display_name: "Hermes 2 Pro Llama 8B",
        approx_size_bytes: mib(5100),
        min_ram_gb: 16,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Xl,
        description: "Most powerful Hermes variant",
    },
    ModelDescriptor {
        id: "DeepSeek-R1-Distill-Llama-8B-q4f16_1",
        display_name: "DeepSeek-R1 8B",
        approx_size_bytes: mib(5120),
        min_ram_gb: 16,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Xl,
        description: "Top-tier reasoning model with exceptional problem-solving",
    },
    // XXL tier: enthusiast hardware only
    ModelDescriptor {
        id: "WizardMath-7B-V1.1-q4f16_1",
        display_name: "WizardMath 7B",
        approx_size_bytes: mib(4680),
        min_ram_gb: 16,
        gpu: GpuRequirement::Required,
        tier: SizeTier::Xxl,
        description: "Specialized in mathematics and complex problem-solving",
    },
];

/// All selectable models.
pub fn registry() -> &'static [ModelDescriptor] {
    REGISTRY
}

/// Look up a descriptor by id.
pub fn by_id(id: &str) -> Option<&'static ModelDescriptor> {
    REGISTRY.iter().find(|m| m.id == id)
}

/// Whether a single model fits the device.
///
/// Mobile filtering is deliberately more conservative than desktop: mobile
/// runtimes impose a much lower practical ceiling than raw device RAM, so
/// tier gates apply instead of a plain RAM threshold.
pub fn compatible(model: &ModelDescriptor, memory_gb: f64, is_mobile: bool) -> bool {
    if is_mobile {
        if memory_gb <= 4.0 {
            model.tier == SizeTier::Tiny
        } else if memory_gb <= 8.0 {
            model.tier == SizeTier::Tiny || model.tier == SizeTier::Small
        } else {
            model.tier == SizeTier::Tiny
                || model.tier == SizeTier::Small
                || (model.tier == SizeTier::Medium && model.min_ram_gb <= 6)
        }
    } else {
        f64::from(model.min_ram_gb) <= memory_gb
    }
}

/// Models admissible on a device with the given memory.
pub fn filter_for_device(memory_gb: f64, is_mobile: bool) -> Vec<&'static ModelDescriptor> {
    REGISTRY
        .iter()
        .filter(|m| compatible(m, memory_gb, is_mobile))
        .collect()
}
