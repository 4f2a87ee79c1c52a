//! Backend selection.
//!
//! The backend is chosen once per run from an [`EngineConfig`]; everything
//! downstream is generic over [`Backend`] and never inspects which one it got.

use std::str::FromStr;

use derive_more::Display;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    error::Error,
    loom::device::{Backend, CpuBuildError, CpuBuilder, GpuBuildError, GpuBuilder},
};

pub const PROCESSOR_VAR: &str = "BRAID_PROCESSOR";
pub const CPU_THREADS_VAR: &str = "BRAID_CPU_THREADS";
pub const POWER_PREFERENCE_VAR: &str = "BRAID_POWER_PREFERENCE";

#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ProcessorType {
    #[default]
    #[display("cpu")]
    Cpu,
    #[display("gpu")]
    Gpu,
}

impl FromStr for ProcessorType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "gpu" => Ok(Self::Gpu),
            _ => Err(ConfigError::Invalid {
                key: PROCESSOR_VAR,
                value: s.into(),
            }),
        }
    }
}

#[derive(Debug, Display, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PowerPreference {
    #[display("none")]
    None,
    #[default]
    #[display("high_performance")]
    HighPerformance,
    #[display("low_power")]
    LowPower,
}

impl FromStr for PowerPreference {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "none" => Ok(Self::None),
            "high_performance" | "high" => Ok(Self::HighPerformance),
            "low_power" | "low" => Ok(Self::LowPower),
            _ => Err(ConfigError::Invalid {
                key: POWER_PREFERENCE_VAR,
                value: s.into(),
            }),
        }
    }
}

impl From<PowerPreference> for wgpu::PowerPreference {
    fn from(value: PowerPreference) -> Self {
        match value {
            PowerPreference::None => wgpu::PowerPreference::None,
            PowerPreference::HighPerformance => wgpu::PowerPreference::HighPerformance,
            PowerPreference::LowPower => wgpu::PowerPreference::LowPower,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value `{value}` for {key}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to create cpu backend")]
    Cpu(#[from] CpuBuildError),
    #[error("failed to create gpu backend")]
    Gpu(#[from] GpuBuildError),
    #[error(transparent)]
    Job(#[from] Error),
}

/// Work that runs on whichever backend the configuration selects.
pub trait Job {
    type Output;

    fn run<B: Backend>(self, backend: B) -> Result<Self::Output, Error>;
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct EngineConfig {
    pub processor: ProcessorType,
    /// Threads of a dedicated CPU kernel pool; the global pool when absent.
    pub cpu_threads: Option<usize>,
    pub power_preference: PowerPreference,
}

impl EngineConfig {
    /// Reads `BRAID_PROCESSOR`, `BRAID_CPU_THREADS` and `BRAID_POWER_PREFERENCE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a configuration from `lookup`, keeping defaults for absent keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(value) = lookup(PROCESSOR_VAR) {
            config.processor = value.parse()?;
        }
        if let Some(value) = lookup(CPU_THREADS_VAR) {
            let threads = value
                .trim()
                .parse()
                .ok()
                .filter(|&threads: &usize| threads > 0)
                .ok_or(ConfigError::Invalid {
                    key: CPU_THREADS_VAR,
                    value,
                })?;
            config.cpu_threads = Some(threads);
        }
        if let Some(value) = lookup(POWER_PREFERENCE_VAR) {
            config.power_preference = value.parse()?;
        }
        Ok(config)
    }

    pub fn processor(mut self, processor: ProcessorType) -> Self {
        self.processor = processor;
        self
    }

    pub fn cpu_threads(mut self, threads: usize) -> Self {
        self.cpu_threads = Some(threads);
        self
    }

    pub fn power_preference(mut self, power_preference: PowerPreference) -> Self {
        self.power_preference = power_preference;
        self
    }

    /// Creates the selected backend and runs `job` on it.
    pub async fn launch<J: Job>(&self, job: J) -> Result<J::Output, LaunchError> {
        log::info!("launching on {}", self.processor);
        match self.processor {
            ProcessorType::Cpu => {
                let builder = match self.cpu_threads {
                    Some(threads) => CpuBuilder::new().threads(threads),
                    None => CpuBuilder::new(),
                };
                let cpu = builder.build()?;
                Ok(job.run(cpu)?)
            }
            ProcessorType::Gpu => {
                let gpu = GpuBuilder::request(self.power_preference.into())
                    .await?
                    .build()
                    .await?;
                Ok(job.run(gpu)?)
            }
        }
    }

    /// Blocking form of [`EngineConfig::launch`].
    pub fn launch_blocking<J: Job>(&self, job: J) -> Result<J::Output, LaunchError> {
        futures::executor::block_on(self.launch(job))
    }
}
