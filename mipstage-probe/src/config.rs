//! Optional TOML configuration for the probe.
//!
//! Every key is optional. Command-line flags win over the file, the file
//! wins over the library defaults.
//!
//! ```toml
//! [transfer]
//! offset_alignment = 16
//! zero_fill_threshold = 65536
//! zero_fill_workers = 2
//! extent_policy = "block-rounded"
//!
//! [device]
//! queue_mode = "unified"
//! memory_priority = false
//! ```

use std::path::{Path, PathBuf};

use eyre::WrapErr;
use mipstage_vk::device::{DeviceConfig, QueueMode};
use mipstage_vk::layout::ExtentPolicy;
use mipstage_vk::transfer::TransferConfig;
use serde::Deserialize;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CliQueueMode {
    #[default]
    Auto,
    Unified,
}

impl From<CliQueueMode> for QueueMode {
    fn from(value: CliQueueMode) -> Self {
        match value {
            CliQueueMode::Auto => QueueMode::Auto,
            CliQueueMode::Unified => QueueMode::Unified,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum CliExtentPolicy {
    #[default]
    Logical,
    BlockRounded,
}

impl From<CliExtentPolicy> for ExtentPolicy {
    fn from(value: CliExtentPolicy) -> Self {
        match value {
            CliExtentPolicy::Logical => ExtentPolicy::Logical,
            CliExtentPolicy::BlockRounded => ExtentPolicy::BlockRounded,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferSection {
    pub offset_alignment: Option<u64>,
    pub zero_fill_threshold: Option<usize>,
    pub zero_fill_workers: Option<usize>,
    pub extent_policy: Option<CliExtentPolicy>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceSection {
    pub queue_mode: Option<CliQueueMode>,
    pub memory_priority: Option<bool>,
    pub device_group: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub transfer: TransferSection,
    pub device: DeviceSection,
}

impl FileConfig {
    pub fn parse(text: &str) -> eyre::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Read `path`, or the per-user config file when `path` is `None` and
    /// that file exists. No file at all yields the defaults.
    pub fn load(path: Option<&Path>) -> eyre::Result<Self> {
        let path = match path {
            Some(path) => path.to_owned(),
            None => match default_path() {
                Some(path) if path.is_file() => path,
                _ => return Ok(Self::default()),
            },
        };
        let text = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        Self::parse(&text)
            .wrap_err_with(|| format!("parsing {}", path.display()))
    }

    pub fn transfer_config(
        &self,
        alignment_override: Option<u64>,
        policy_override: Option<CliExtentPolicy>,
    ) -> TransferConfig {
        let defaults = TransferConfig::default();
        let section = &self.transfer;
        TransferConfig {
            offset_alignment: alignment_override
                .or(section.offset_alignment)
                .unwrap_or(defaults.offset_alignment),
            zero_fill_threshold: section
                .zero_fill_threshold
                .unwrap_or(defaults.zero_fill_threshold),
            zero_fill_workers: section
                .zero_fill_workers
                .unwrap_or(defaults.zero_fill_workers),
            extent_policy: policy_override
                .or(section.extent_policy)
                .map_or(defaults.extent_policy, Into::into),
            // Readback runs on the same queue, so ownership stays put.
            consumer_family: None,
        }
    }

    pub fn device_config(
        &self,
        queue_mode_override: Option<CliQueueMode>,
    ) -> DeviceConfig {
        let defaults = DeviceConfig::default();
        let section = &self.device;
        DeviceConfig {
            queue_mode: queue_mode_override
                .or(section.queue_mode)
                .map_or(defaults.queue_mode, Into::into),
            memory_priority: section
                .memory_priority
                .unwrap_or(defaults.memory_priority),
            device_group: section.device_group.unwrap_or(defaults.device_group),
        }
    }
}

fn default_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "mipstage", "mipstage-probe")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}
