//! Compute device selection.

use candle_core::Device;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{EggError, Result};

/// Which device a sampler instance runs on. Resolved once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSelection {
    /// First CUDA device, then first Metal device, then CPU.
    #[default]
    Auto,
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DeviceSelection {
    /// Parses `auto`, `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim().to_lowercase();
        let (name, ordinal) = match s.split_once(':') {
            Some((name, ordinal)) => (name.to_string(), Some(ordinal.parse::<usize>().ok()?)),
            None => (s, None),
        };
        match (name.as_str(), ordinal) {
            ("auto", None) => Some(DeviceSelection::Auto),
            ("cpu", None) => Some(DeviceSelection::Cpu),
            ("cuda", ordinal) => Some(DeviceSelection::Cuda(ordinal.unwrap_or(0))),
            ("metal", ordinal) => Some(DeviceSelection::Metal(ordinal.unwrap_or(0))),
            _ => None,
        }
    }

    /// Reads `EGG_DEVICE`, falling back to `Auto` when unset or unparseable.
    pub fn from_env() -> Self {
        Self::from_env_value(std::env::var("EGG_DEVICE").ok().as_deref())
    }

    fn from_env_value(value: Option<&str>) -> Self {
        match value {
            Some(value) => Self::parse(value).unwrap_or_else(|| {
                warn!("ignoring unrecognised EGG_DEVICE={}", value);
                DeviceSelection::Auto
            }),
            None => DeviceSelection::Auto,
        }
    }

    /// Creates the device. Explicit accelerator requests fail when the
    /// accelerator is missing; `Auto` falls back to the CPU.
    pub fn resolve(&self) -> Result<Device> {
        let device = match self {
            DeviceSelection::Auto => {
                let device = Device::cuda_if_available(0)?;
                if device.is_cpu() {
                    if candle_core::utils::metal_is_available() {
                        Device::new_metal(0)?
                    } else {
                        device
                    }
                } else {
                    device
                }
            }
            DeviceSelection::Cpu => Device::Cpu,
            DeviceSelection::Cuda(ordinal) => Device::new_cuda(*ordinal)
                .map_err(|e| EggError::DeviceUnavailable(format!("cuda:{}: {}", ordinal, e)))?,
            DeviceSelection::Metal(ordinal) => Device::new_metal(*ordinal)
                .map_err(|e| EggError::DeviceUnavailable(format!("metal:{}: {}", ordinal, e)))?,
        };
        if device.is_cpu() && *self == DeviceSelection::Auto {
            warn!("no accelerator available, falling back to CPU");
        }
        Ok(device)
    }
}

impl std::fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceSelection::Auto => write!(f, "auto"),
            DeviceSelection::Cpu => write!(f, "cpu"),
            DeviceSelection::Cuda(ordinal) => write!(f, "cuda:{}", ordinal),
            DeviceSelection::Metal(ordinal) => write!(f, "metal:{}", ordinal),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_parsing() {
        assert_eq!(DeviceSelection::parse("auto"), Some(DeviceSelection::Auto));
        assert_eq!(DeviceSelection::parse("CPU"), Some(DeviceSelection::Cpu));
        assert_eq!(DeviceSelection::parse("cuda"), Some(DeviceSelection::Cuda(0)));
        assert_eq!(DeviceSelection::parse("cuda:1"), Some(DeviceSelection::Cuda(1)));
        assert_eq!(DeviceSelection::parse("metal"), Some(DeviceSelection::Metal(0)));
        assert_eq!(DeviceSelection::parse("cpu:1"), None);
        assert_eq!(DeviceSelection::parse("cuda:x"), None);
        assert_eq!(DeviceSelection::parse("tpu"), None);
    }

    #[test]
    fn display_round_trips_through_parse() {
        for selection in [
            DeviceSelection::Auto,
            DeviceSelection::Cpu,
            DeviceSelection::Cuda(2),
            DeviceSelection::Metal(0),
        ] {
            assert_eq!(DeviceSelection::parse(&selection.to_string()), Some(selection));
        }
    }

    #[test]
    fn env_value_selects_device() {
        assert_eq!(DeviceSelection::from_env_value(None), DeviceSelection::Auto);
        assert_eq!(DeviceSelection::from_env_value(Some("cpu")), DeviceSelection::Cpu);
        assert_eq!(DeviceSelection::from_env_value(Some("cuda:3")), DeviceSelection::Cuda(3));
        assert_eq!(DeviceSelection::from_env_value(Some("gpu")), DeviceSelection::Auto);
    }

    #[test]
    fn auto_always_resolves() {
        // falls back to the CPU when no accelerator is built in or present
        let device = DeviceSelection::Auto.resolve().unwrap();
        if !candle_core::utils::cuda_is_available() && !candle_core::utils::metal_is_available() {
            assert!(device.is_cpu());
        }
    }

    #[test]
    fn cpu_always_resolves() {
        let device = DeviceSelection::Cpu.resolve().unwrap();
        assert!(device.is_cpu());
    }
}
