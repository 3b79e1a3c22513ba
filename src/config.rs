//! Process configuration.
//!
//! Everything has a compiled-in default; a JSON file may override any subset
//! of fields, and the binaries layer a few command-line flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::consumer::ConsumerSettings;
use crate::controller::{ControllerConfig, DEFAULT_RESOLVE_DELAY, DEFAULT_SECONDARY_NAME};
use crate::error::{Error, Result};
use crate::producer::ProducerSettings;
use crate::retry::{millis, RetryPolicy};
use crate::target::TargetRef;

pub const DEFAULT_PRIMARY_ID: &str = "primary-stream";
pub const DEFAULT_PRIMARY_ENDPOINT: &str = "file://./data/primary";
pub const DEFAULT_SECONDARY_ENDPOINT: &str = "file://./data/secondary";
pub const DEFAULT_REGISTRY_PATH: &str = "./data/stream.properties";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HaConfig {
    pub primary: TargetRef,
    /// Properties file shared by producer and consumer processes.
    pub registry_path: PathBuf,
    pub secondary_name: String,
    /// Endpoint the admin capability creates the secondary on.
    pub secondary_endpoint: String,
    pub retry: RetryPolicy,
    #[serde(rename = "resolve_delay_ms", deserialize_with = "millis::deserialize")]
    pub resolve_delay: Duration,
    pub consumer: ConsumerSettings,
    pub producer: ProducerSettings,
}

impl Default for HaConfig {
    fn default() -> Self {
        Self {
            primary: TargetRef::new(DEFAULT_PRIMARY_ID, DEFAULT_PRIMARY_ENDPOINT),
            registry_path: PathBuf::from(DEFAULT_REGISTRY_PATH),
            secondary_name: DEFAULT_SECONDARY_NAME.to_string(),
            secondary_endpoint: DEFAULT_SECONDARY_ENDPOINT.to_string(),
            retry: RetryPolicy::default(),
            resolve_delay: DEFAULT_RESOLVE_DELAY,
            consumer: ConsumerSettings::default(),
            producer: ProducerSettings::default(),
        }
    }
}

impl HaConfig {
    pub fn from_json(text: &str) -> Result<Self> {
        let config: HaConfig =
            serde_json::from_str(text).map_err(|err| Error::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| Error::Config(format!("cannot read {}: {err}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.primary.is_complete() {
            return Err(Error::Config("primary id and endpoint must be set".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".to_string()));
        }
        if self.consumer.batch_limit == 0 {
            return Err(Error::Config("consumer.batch_limit must be at least 1".to_string()));
        }
        if self.secondary_name.trim().is_empty() {
            return Err(Error::Config("secondary_name must be set".to_string()));
        }
        if self.registry_path.as_os_str().is_empty() {
            return Err(Error::Config("registry_path must be set".to_string()));
        }
        Ok(())
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            retry: self.retry,
            secondary_name: self.secondary_name.clone(),
            resolve_delay: self.resolve_delay,
        }
    }
}
