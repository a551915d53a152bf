//! The native entry points the binder consumes.
//!
//! [`Device`] is the production implementation. Tests substitute a counting
//! mock so creation order and fail-fast paths can be asserted without a GPU.

use ash::vk;

use crate::capability::DeviceCapabilities;
use crate::device::Device;
use crate::format::FormatCapabilityQuery;

pub trait ResourceDriver: FormatCapabilityQuery {
    fn capabilities(&self) -> &DeviceCapabilities;

    /// Physical devices behind this logical device.
    fn device_count(&self) -> u32;

    /// # Safety
    /// `create_info` and everything it points at must be valid.
    unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result>;

    /// # Safety
    /// `buffer` came from this driver and no pending work uses it.
    unsafe fn destroy_buffer(&self, buffer: vk::Buffer);

    /// # Safety
    /// `buffer` came from this driver.
    unsafe fn buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements;

    /// # Safety
    /// `buffer` and `memory` came from this driver and `offset` satisfies
    /// the buffer's requirements.
    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// Every bind info and its chain must be valid.
    unsafe fn bind_buffer_memory2(
        &self,
        bind_infos: &[vk::BindBufferMemoryInfo<'_>],
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// `create_info` and everything it points at must be valid.
    unsafe fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result>;

    /// # Safety
    /// `image` came from this driver and no pending work uses it.
    unsafe fn destroy_image(&self, image: vk::Image);

    /// # Safety
    /// `image` came from this driver.
    unsafe fn image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements;

    /// # Safety
    /// `image` and `memory` came from this driver and `offset` satisfies
    /// the image's requirements.
    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// Every bind info and its chain must be valid.
    unsafe fn bind_image_memory2(
        &self,
        bind_infos: &[vk::BindImageMemoryInfo<'_>],
    ) -> Result<(), vk::Result>;

    /// Attach a debug name. Failures are logged, never returned.
    ///
    /// # Safety
    /// `object` came from this driver and is still alive.
    unsafe fn name_object<H: vk::Handle + Copy>(&self, object: H, name: &str);
}

impl ResourceDriver for Device {
    fn capabilities(&self) -> &DeviceCapabilities {
        Device::capabilities(self)
    }

    fn device_count(&self) -> u32 {
        Device::device_count(self)
    }

    unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { self.create_raw_buffer(create_info) }
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.destroy_raw_buffer(buffer) }
    }

    unsafe fn buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Forwarded caller contract.
        unsafe { self.get_raw_buffer_memory_requirements(buffer) }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { self.bind_raw_buffer_memory(buffer, memory, offset) }
    }

    unsafe fn bind_buffer_memory2(
        &self,
        bind_infos: &[vk::BindBufferMemoryInfo<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { self.bind_raw_buffer_memory2(bind_infos) }
    }

    unsafe fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { self.create_raw_image(create_info) }
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        // SAFETY: Forwarded caller contract.
        unsafe { self.destroy_raw_image(image) }
    }

    unsafe fn image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: Forwarded caller contract.
        unsafe { self.get_raw_image_memory_requirements(image) }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { self.bind_raw_image_memory(image, memory, offset) }
    }

    unsafe fn bind_image_memory2(
        &self,
        bind_infos: &[vk::BindImageMemoryInfo<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { self.bind_raw_image_memory2(bind_infos) }
    }

    unsafe fn name_object<H: vk::Handle + Copy>(&self, object: H, name: &str) {
        let raw = object.as_raw();
        // SAFETY: Forwarded caller contract.
        let result = unsafe { self.set_object_name_str(object, Some(name)) };
        if let Err(e) = result {
            tracing::warn!("Failed to name object {raw:#x}: {e}");
        }
    }
}
