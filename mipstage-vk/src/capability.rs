//! Device capabilities resolved at runtime.
//!
//! [`DeviceCapabilities::resolve`] is run once per physical device from its
//! reported API version and extension list. Code paths that depend on an
//! optional feature branch on the resulting table instead of being compiled
//! in or out.

use std::ffi::CStr;

use ash::vk;
use thiserror::Error;

use crate::instance::VkVersion;

/// How a Vulkan feature that was promoted to core is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSource {
    /// Part of the device's core API version.
    Core,
    /// Provided by a device extension that must be enabled.
    Extension,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Synchronization2,
    BindMemory2,
    DeviceGroup,
    MemoryPriority,
    DedicatedAllocation,
    MemoryBudget,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Device does not support {0:?}")]
pub struct MissingCapabilityError(pub Capability);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceCapabilities {
    pub synchronization2: Option<FeatureSource>,
    pub bind_memory2: Option<FeatureSource>,
    pub device_group: Option<FeatureSource>,
    pub dedicated_allocation: Option<FeatureSource>,
    pub memory_priority: bool,
    pub memory_budget: bool,
}

fn promoted(
    is_core: bool,
    has_ext: bool,
) -> Option<FeatureSource> {
    if is_core {
        Some(FeatureSource::Core)
    } else if has_ext {
        Some(FeatureSource::Extension)
    } else {
        None
    }
}

impl DeviceCapabilities {
    /// Build the table for a device reporting `api_version` and
    /// `extensions`.
    pub fn resolve(api_version: VkVersion, extensions: &[&CStr]) -> Self {
        let has = |name: &CStr| extensions.contains(&name);
        let at_least = |minor: u32| {
            api_version.major() > 1
                || (api_version.major() == 1 && api_version.minor() >= minor)
        };

        Self {
            synchronization2: promoted(
                at_least(3),
                has(ash::khr::synchronization2::NAME),
            ),
            bind_memory2: promoted(at_least(1), has(ash::khr::bind_memory2::NAME)),
            device_group: promoted(at_least(1), has(ash::khr::device_group::NAME)),
            dedicated_allocation: promoted(
                at_least(1),
                has(ash::khr::dedicated_allocation::NAME),
            ),
            memory_priority: has(ash::ext::memory_priority::NAME),
            memory_budget: has(ash::ext::memory_budget::NAME),
        }
    }

    /// Resolve from the raw extension properties returned by the driver.
    pub fn from_properties(
        api_version: VkVersion,
        properties: &[vk::ExtensionProperties],
    ) -> Self {
        let names: Vec<&CStr> = properties
            .iter()
            .filter_map(|p| p.extension_name_as_c_str().ok())
            .collect();
        Self::resolve(api_version, &names)
    }

    pub fn supports(&self, capability: Capability) -> bool {
        match capability {
            Capability::Synchronization2 => self.synchronization2.is_some(),
            Capability::BindMemory2 => self.bind_memory2.is_some(),
            Capability::DeviceGroup => {
                // Device-group binds go through vkBind*Memory2.
                self.device_group.is_some() && self.bind_memory2.is_some()
            }
            Capability::MemoryPriority => self.memory_priority,
            Capability::DedicatedAllocation => {
                self.dedicated_allocation.is_some()
            }
            Capability::MemoryBudget => self.memory_budget,
        }
    }

    pub fn require(
        &self,
        capability: Capability,
    ) -> Result<(), MissingCapabilityError> {
        if self.supports(capability) {
            Ok(())
        } else {
            Err(MissingCapabilityError(capability))
        }
    }

    /// Device extensions that have to be enabled to use this table.
    pub fn required_extensions(&self) -> Vec<&'static CStr> {
        let mut exts = Vec::new();
        if self.synchronization2 == Some(FeatureSource::Extension) {
            exts.push(ash::khr::synchronization2::NAME);
        }
        if self.bind_memory2 == Some(FeatureSource::Extension) {
            exts.push(ash::khr::bind_memory2::NAME);
        }
        if self.device_group == Some(FeatureSource::Extension) {
            exts.push(ash::khr::device_group::NAME);
        }
        if self.dedicated_allocation == Some(FeatureSource::Extension) {
            exts.push(ash::khr::get_memory_requirements2::NAME);
            exts.push(ash::khr::dedicated_allocation::NAME);
        }
        if self.memory_priority {
            exts.push(ash::ext::memory_priority::NAME);
        }
        if self.memory_budget {
            exts.push(ash::ext::memory_budget::NAME);
        }
        exts
    }

    /// Every capability, for diagnostics.
    pub fn summary(&self) -> Vec<(Capability, bool)> {
        [
            Capability::Synchronization2,
            Capability::BindMemory2,
            Capability::DeviceGroup,
            Capability::MemoryPriority,
            Capability::DedicatedAllocation,
            Capability::MemoryBudget,
        ]
        .into_iter()
        .map(|c| (c, self.supports(c)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vulkan_1_3_has_everything_core() {
        let caps = DeviceCapabilities::resolve(VkVersion::new(0, 1, 3, 0), &[]);
        assert_eq!(caps.synchronization2, Some(FeatureSource::Core));
        assert_eq!(caps.bind_memory2, Some(FeatureSource::Core));
        assert!(caps.supports(Capability::DeviceGroup));
        assert!(!caps.supports(Capability::MemoryPriority));
        assert!(caps.required_extensions().is_empty());
    }

    #[test]
    fn vulkan_1_0_falls_back_to_extensions() {
        let caps = DeviceCapabilities::resolve(
            VkVersion::new(0, 1, 0, 0),
            &[ash::khr::synchronization2::NAME, ash::ext::memory_priority::NAME],
        );
        assert_eq!(caps.synchronization2, Some(FeatureSource::Extension));
        assert_eq!(caps.bind_memory2, None);
        assert!(!caps.supports(Capability::DeviceGroup));
        assert_eq!(
            caps.require(Capability::BindMemory2),
            Err(MissingCapabilityError(Capability::BindMemory2))
        );
        assert_eq!(
            caps.required_extensions(),
            vec![
                ash::khr::synchronization2::NAME,
                ash::ext::memory_priority::NAME
            ]
        );
    }

    #[test]
    fn device_group_needs_bind_memory2() {
        let caps = DeviceCapabilities::resolve(
            VkVersion::new(0, 1, 0, 0),
            &[ash::khr::device_group::NAME],
        );
        assert_eq!(caps.device_group, Some(FeatureSource::Extension));
        assert!(!caps.supports(Capability::DeviceGroup));
    }
}
