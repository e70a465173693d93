//! Device Discovery Module
//!
//! Queries the host's GPU inventory and maps sweep lanes onto GPU indices.
//!
//! When the launcher itself runs under `CUDA_VISIBLE_DEVICES`, that list is
//! the pool children are assigned from, so `2,3` yields jobs on GPUs 2 and 3.

use std::fmt;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::Serialize;

use crate::error::SweepError;
use crate::plan::GPU_ENV_VAR;

/// GPU reported by `nvidia-smi`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: u64,
    pub memory_free_mib: Option<u64>,
}

impl fmt::Display for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GPU {}: {} ({:.2}GB total",
            self.index,
            self.name,
            self.memory_total_mib as f64 / 1024.0
        )?;
        if let Some(free) = self.memory_free_mib {
            write!(f, ", {:.2}GB free", free as f64 / 1024.0)?;
        }
        write!(f, ")")
    }
}

/// Host GPU probing
pub struct DeviceDiscovery;

impl DeviceDiscovery {
    /// Query the GPU inventory
    ///
    /// Returns an empty list when `nvidia-smi` is missing or fails.
    pub fn discover() -> Vec<GpuDevice> {
        match Self::query_nvidia_smi() {
            Ok(devices) => devices,
            Err(e) => {
                tracing::debug!("GPU discovery failed: {:#}", e);
                Vec::new()
            }
        }
    }

    /// Number of GPUs reported by `nvidia-smi`
    pub fn gpu_count() -> usize {
        let devices = Self::discover();
        Self::log_summary(&devices);
        devices.len()
    }

    /// Run `nvidia-smi` and parse its CSV inventory
    pub fn query_nvidia_smi() -> Result<Vec<GpuDevice>> {
        let output = Command::new("nvidia-smi")
            .args([
                "--query-gpu=index,name,memory.total,memory.free",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .context("failed to execute nvidia-smi")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.is_empty() {
                bail!("nvidia-smi returned non-zero exit status ({})", output.status);
            }
            bail!("nvidia-smi query failed: {}", stderr);
        }

        let stdout = String::from_utf8(output.stdout).context("nvidia-smi output was not UTF-8")?;
        Self::parse_nvidia_smi(&stdout)
    }

    /// Parse `index, name, memory.total, memory.free` rows
    ///
    /// GPU names may themselves contain commas, so the memory columns are
    /// taken from the end of the row.
    pub fn parse_nvidia_smi(raw: &str) -> Result<Vec<GpuDevice>> {
        let mut devices = Vec::new();

        for (line_idx, raw_line) in raw.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            let columns: Vec<&str> = line.split(',').map(str::trim).collect();
            if columns.len() < 3 {
                bail!(
                    "unexpected nvidia-smi output at line {}: '{}'",
                    line_idx + 1,
                    line
                );
            }

            let index = columns[0].parse::<u32>().with_context(|| {
                format!("invalid GPU index '{}' at line {}", columns[0], line_idx + 1)
            })?;

            let (name_end, memory_total_mib, memory_free_mib) = if columns.len() >= 4 {
                let total_idx = columns.len() - 2;
                let free_idx = columns.len() - 1;
                let total = parse_mib(columns[total_idx], line_idx)?;
                let free = parse_mib(columns[free_idx], line_idx)?;
                (total_idx, total, Some(free))
            } else {
                let total_idx = columns.len() - 1;
                (total_idx, parse_mib(columns[total_idx], line_idx)?, None)
            };

            devices.push(GpuDevice {
                index,
                name: columns[1..name_end].join(","),
                memory_total_mib,
                memory_free_mib,
            });
        }

        Ok(devices)
    }

    /// Log device summary
    pub fn log_summary(devices: &[GpuDevice]) {
        if devices.is_empty() {
            tracing::warn!("No GPUs found by nvidia-smi");
            return;
        }
        tracing::info!("Found {} GPU(s):", devices.len());
        for device in devices {
            tracing::info!("  {}", device);
        }
    }
}

fn parse_mib(value: &str, line_idx: usize) -> Result<u64> {
    value
        .parse::<u64>()
        .with_context(|| format!("invalid GPU memory value '{}' at line {}", value, line_idx + 1))
}

/// Split a `CUDA_VISIBLE_DEVICES` value into its entries
pub fn parse_visible_devices(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Numeric GPU ids of a `CUDA_VISIBLE_DEVICES` value
///
/// UUID entries (`GPU-...`) cannot be mapped onto indices and are rejected.
pub fn parse_visible_ids(value: &str) -> Result<Vec<u32>> {
    parse_visible_devices(value)
        .iter()
        .map(|entry| {
            entry.parse::<u32>().map_err(|_| {
                anyhow::Error::from(SweepError::InvalidConfig(format!(
                    "{} entry '{}' is not a GPU index, pass --gpu-ids instead",
                    GPU_ENV_VAR, entry
                )))
            })
        })
        .collect()
}

/// Round-robin mapping from lane position to GPU index
///
/// `gpu_for(i) = devices[i % devices.len()]`; with the default device list
/// `0..count` this is `i mod count`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuAssignment {
    devices: Vec<u32>,
}

impl GpuAssignment {
    /// Cycle over GPU indices `0..count`
    pub fn round_robin(count: usize) -> Result<Self> {
        if count == 0 {
            return Err(SweepError::NoGpus.into());
        }
        let count = u32::try_from(count).context("GPU count out of range")?;
        Ok(Self {
            devices: (0..count).collect(),
        })
    }

    /// Cycle over an explicit list of GPU ids
    pub fn from_ids(ids: Vec<u32>) -> Result<Self> {
        if ids.is_empty() {
            return Err(SweepError::NoGpus.into());
        }
        Ok(Self { devices: ids })
    }

    /// Resolve the GPU pool from the CLI and the launcher's environment
    pub fn resolve(gpu_count: Option<usize>, gpu_ids: Option<Vec<u32>>) -> Result<Self> {
        let visible = std::env::var(GPU_ENV_VAR).ok();
        Self::resolve_with(gpu_count, gpu_ids, visible.as_deref(), DeviceDiscovery::gpu_count)
    }

    /// Explicit ids win, then the visible device list (the first `gpu_count`
    /// entries when a count is given), then `0..gpu_count`, then `discover`
    pub fn resolve_with(
        gpu_count: Option<usize>,
        gpu_ids: Option<Vec<u32>>,
        visible: Option<&str>,
        discover: impl FnOnce() -> usize,
    ) -> Result<Self> {
        if let Some(ids) = gpu_ids {
            return Self::from_ids(ids);
        }
        if let Some(value) = visible {
            let mut ids = parse_visible_ids(value)?;
            if let Some(count) = gpu_count {
                if count > ids.len() {
                    tracing::warn!(
                        "{} GPU(s) requested but {}={} exposes only {}",
                        count,
                        GPU_ENV_VAR,
                        value,
                        ids.len()
                    );
                }
                ids.truncate(count);
            }
            return Self::from_ids(ids);
        }
        Self::round_robin(gpu_count.unwrap_or_else(discover))
    }

    pub fn gpu_for(&self, position: usize) -> u32 {
        self.devices[position % self.devices.len()]
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[u32] {
        &self.devices
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_assignment() {
        for count in 1..=5usize {
            let assignment = GpuAssignment::round_robin(count).unwrap();
            for position in 0..20 {
                assert_eq!(assignment.gpu_for(position) as usize, position % count);
            }
        }
    }

    #[test]
    fn test_zero_gpus_is_validation_error() {
        let err = GpuAssignment::round_robin(0).unwrap_err();
        assert!(matches!(err.downcast_ref::<SweepError>(), Some(SweepError::NoGpus)));

        assert!(GpuAssignment::from_ids(vec![]).is_err());
        assert!(GpuAssignment::resolve_with(Some(0), None, None, || 4).is_err());
        assert!(GpuAssignment::resolve_with(Some(0), None, Some("0,1"), || 4).is_err());
        assert!(GpuAssignment::resolve_with(None, None, None, || 0).is_err());

        let err = GpuAssignment::resolve_with(None, None, Some(""), || 4).unwrap_err();
        assert!(matches!(err.downcast_ref::<SweepError>(), Some(SweepError::NoGpus)));
    }

    #[test]
    fn test_explicit_ids_cycle() {
        let assignment =
            GpuAssignment::resolve_with(Some(8), Some(vec![2, 5]), Some("0"), || 1).unwrap();
        assert_eq!(assignment.len(), 2);
        assert_eq!(assignment.gpu_for(0), 2);
        assert_eq!(assignment.gpu_for(1), 5);
        assert_eq!(assignment.gpu_for(2), 2);
    }

    #[test]
    fn test_visible_devices_are_the_pool() {
        let no_query = || -> usize { panic!("devices must not be queried") };
        let assignment = GpuAssignment::resolve_with(None, None, Some("2,3"), no_query).unwrap();
        assert_eq!(assignment.devices(), &[2, 3]);
        assert_eq!(assignment.gpu_for(0), 2);
        assert_eq!(assignment.gpu_for(1), 3);
        assert_eq!(assignment.gpu_for(2), 2);

        let assignment = GpuAssignment::resolve_with(Some(1), None, Some("2,3"), || 8).unwrap();
        assert_eq!(assignment.devices(), &[2]);

        let assignment = GpuAssignment::resolve_with(Some(4), None, Some("5, 7"), || 8).unwrap();
        assert_eq!(assignment.devices(), &[5, 7]);
    }

    #[test]
    fn test_count_and_discovery_without_visible_devices() {
        let assignment = GpuAssignment::resolve_with(Some(3), None, None, || 8).unwrap();
        assert_eq!(assignment.devices(), &[0, 1, 2]);

        let assignment = GpuAssignment::resolve_with(None, None, None, || 2).unwrap();
        assert_eq!(assignment.devices(), &[0, 1]);
    }

    #[test]
    fn test_visible_device_uuids_rejected() {
        let err = GpuAssignment::resolve_with(None, None, Some("GPU-8a1b"), || 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SweepError>(),
            Some(SweepError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let raw = "0, NVIDIA A100-SXM4-40GB, 40960, 40100\n\
                   1, NVIDIA GeForce RTX 4090, 24564, 20000\n\n";
        let devices = DeviceDiscovery::parse_nvidia_smi(raw).unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].index, 0);
        assert_eq!(devices[0].name, "NVIDIA A100-SXM4-40GB");
        assert_eq!(devices[1].memory_total_mib, 24564);
        assert_eq!(devices[1].memory_free_mib, Some(20000));
        assert!(devices[1].to_string().contains("RTX 4090"));
    }

    #[test]
    fn test_parse_nvidia_smi_rejects_garbage() {
        assert!(DeviceDiscovery::parse_nvidia_smi("not a gpu").is_err());
        assert!(DeviceDiscovery::parse_nvidia_smi("x, GPU, 10, 10").is_err());
        assert!(DeviceDiscovery::parse_nvidia_smi("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_visible_devices() {
        assert_eq!(parse_visible_devices("0,1, 3"), vec!["0", "1", "3"]);
        assert!(parse_visible_devices("").is_empty());
    }
}
