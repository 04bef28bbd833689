//! Resource limits and volume mounts for dev containers.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Resource limits applied when a container is created.
///
/// Sizes use docker notation ("512m", "4g"). `cpuset` pins the container to
/// host CPUs ("0-3", "0,2,4") while `cpus` caps total CPU time ("2.5").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maps to --memory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// Maps to --memory-swap. Equal to `memory` disables swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<String>,

    /// Maps to --cpuset-cpus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpuset: Option<String>,

    /// Maps to --cpus
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,

    /// Maps to --shm-size. Notebook data loaders need more than docker's 64m default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<String>,

    /// Run with the nvidia runtime and request GPU devices
    #[serde(default = "default_gpu")]
    pub gpu: bool,

    /// GPU device ids, or ["all"]
    #[serde(default = "default_gpu_devices")]
    pub gpu_devices: Vec<String>,
}

fn default_gpu() -> bool {
    true
}

fn default_gpu_devices() -> Vec<String> {
    vec!["all".to_string()]
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory: Some("4g".to_string()),
            memory_swap: Some("4g".to_string()),
            cpuset: None,
            cpus: None,
            shm_size: Some("1g".to_string()),
            gpu: default_gpu(),
            gpu_devices: default_gpu_devices(),
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("memory", &self.memory),
            ("memory_swap", &self.memory_swap),
            ("shm_size", &self.shm_size),
        ] {
            if let Some(v) = value {
                if parse_size_bytes(v).is_none() {
                    return Err(Error::Validation(format!(
                        "resources.{} '{}' is not a size. Use formats like '512m', '4g'",
                        field, v
                    )));
                }
            }
        }

        if let (Some(mem), Some(swap)) = (&self.memory, &self.memory_swap) {
            // Both parsed above
            let mem = parse_size_bytes(mem).unwrap_or(0);
            let swap = parse_size_bytes(swap).unwrap_or(u64::MAX);
            if swap < mem {
                return Err(Error::Validation(format!(
                    "resources.memory_swap ({}) must be at least resources.memory ({})",
                    swap, mem
                )));
            }
        }

        if let Some(ref cpuset) = self.cpuset {
            if !is_valid_cpuset(cpuset) {
                return Err(Error::Validation(format!(
                    "resources.cpuset '{}' is invalid. Use formats like '0-3' or '0,2,4'",
                    cpuset
                )));
            }
        }

        if let Some(ref cpus) = self.cpus {
            match cpus.parse::<f64>() {
                Ok(n) if n > 0.0 && n.is_finite() => {}
                _ => {
                    return Err(Error::Validation(format!(
                        "resources.cpus '{}' must be a positive number",
                        cpus
                    )))
                }
            }
        }

        if self.gpu && self.gpu_devices.is_empty() {
            return Err(Error::Validation(
                "resources.gpu_devices must not be empty when gpu is enabled".to_string(),
            ));
        }

        Ok(())
    }

    /// Value for `docker create --gpus`.
    pub fn gpus_arg(&self) -> Option<String> {
        if !self.gpu {
            return None;
        }
        if self.gpu_devices.iter().any(|d| d == "all") {
            Some("all".to_string())
        } else {
            Some(format!("\"device={}\"", self.gpu_devices.join(",")))
        }
    }
}

/// Parse a docker-style size ("1024", "512k", "512m", "4g", "4gb") into bytes.
pub fn parse_size_bytes(s: &str) -> Option<u64> {
    let lower = s.trim().to_ascii_lowercase();
    let trimmed = lower.strip_suffix('b').unwrap_or(&lower);
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let (digits, unit) = trimmed.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1024,
        "m" => 1024 * 1024,
        "g" => 1024 * 1024 * 1024,
        _ => return None,
    };
    if value == 0 {
        return None;
    }
    value.checked_mul(multiplier)
}

/// Accepts comma-separated CPU ids and ascending ranges: "0", "0-3", "0,2,4-7".
pub fn is_valid_cpuset(s: &str) -> bool {
    if s.trim().is_empty() {
        return false;
    }
    s.split(',').all(|part| match part.split_once('-') {
        Some((lo, hi)) => match (lo.parse::<u32>(), hi.parse::<u32>()) {
            (Ok(lo), Ok(hi)) => lo <= hi,
            _ => false,
        },
        None => part.parse::<u32>().is_ok(),
    })
}

/// A bind mount or named volume attached to the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Host path or named volume
    pub source: String,

    /// Absolute path inside the container
    pub target: String,

    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    pub fn validate(&self) -> Result<()> {
        if self.source.trim().is_empty() {
            return Err(Error::Validation(format!(
                "volume source for '{}' is empty",
                self.target
            )));
        }
        if !self.target.starts_with('/') {
            return Err(Error::Validation(format!(
                "volume target '{}' must be an absolute path",
                self.target
            )));
        }
        if self.source.contains(':') || self.target.contains(':') {
            return Err(Error::Validation(format!(
                "volume '{}:{}' must not contain ':' in either path",
                self.source, self.target
            )));
        }
        Ok(())
    }

    /// Value for `docker create -v`.
    pub fn to_docker_arg(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}
