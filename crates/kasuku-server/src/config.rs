//! Server configuration
//!
//! Loaded from an optional `kasuku.toml` in the working directory, then
//! overridden by `KASUKU_*` environment variables (`KASUKU_PORT=9090`,
//! `KASUKU_ENGINE__PREFER_GPU=false`).

use config::{Config, Environment, File};
use kasuku_core::EngineConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            engine: EngineConfig::default(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let settings = Config::builder()
            .add_source(File::with_name("kasuku").required(false))
            .add_source(
                Environment::with_prefix("KASUKU")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
