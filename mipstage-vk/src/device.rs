//! Logical device wrapper ([`Device`]).
//!
//! `Device` wraps a `VkDevice` and centralises all per-device state: a
//! `gpu-allocator` allocator (behind a `Mutex`), the runtime
//! [`DeviceCapabilities`] table, loaders for synchronization2,
//! bind_memory2 and debug utils, plus the transfer queue and its family
//! index.
//!
//! Devices are created headless through [`Device::create_headless`], which
//! scores every physical device and keeps the best one.
//!
//! All raw Vulkan operations on the device handle are surfaced as
//! `unsafe fn` methods with `raw` in their name (e.g. `create_raw_buffer`).
//! Higher-level code in sibling modules calls these rather than touching
//! `ash::Device` directly.

use std::collections::HashSet;
use std::ffi::{CStr, CString, c_char};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    AllocationError, MemoryLocation,
    vulkan::{
        Allocation, AllocationCreateDesc, AllocationScheme, Allocator,
        AllocatorCreateDesc,
    },
};
use thiserror::Error;

use crate::capability::{Capability, DeviceCapabilities, FeatureSource};
use crate::instance::{FetchPhysicalDeviceError, Instance, VkVersion};

enum Synchronization2Loader {
    /// Vulkan 1.3+: synchronization2 is core; dispatch through `ash::Device`.
    Core,
    /// Vulkan < 1.3: loaded via `VK_KHR_synchronization2`.
    Extension(ash::khr::synchronization2::Device),
}

enum BindMemory2Loader {
    Core,
    Extension(ash::khr::bind_memory2::Device),
}

/// Describes how an allocation will be accessed by CPU and GPU.
///
/// Used to select the best-matching Vulkan memory type and to decide
/// whether atom-size padding is required for non-coherent flushes.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryUsage {
    /// GPU-only storage. Highest bandwidth; not CPU-mappable.
    GpuOnly,
    /// CPU-writable, GPU-readable. For staging buffers and
    /// per-frame uploads.
    CpuToGpu,
    /// GPU-writable, CPU-readable. For readback.
    GpuToCpu,
}

impl From<MemoryUsage> for MemoryLocation {
    fn from(value: MemoryUsage) -> Self {
        match value {
            MemoryUsage::GpuOnly => MemoryLocation::GpuOnly,
            MemoryUsage::CpuToGpu => MemoryLocation::CpuToGpu,
            MemoryUsage::GpuToCpu => MemoryLocation::GpuToCpu,
        }
    }
}

/// Rank memory type `flags` for `usage`. `None` rules the type out, larger
/// ranks win.
///
/// The required bits match the ones gpu-allocator enforces for the
/// corresponding [`MemoryLocation`], so the type picked here is one the
/// pooled allocator will accept once `memory_type_bits` is narrowed to it.
pub(crate) fn score_memory_type(
    flags: vk::MemoryPropertyFlags,
    usage: MemoryUsage,
) -> Option<u32> {
    use vk::MemoryPropertyFlags as F;
    let device_local = flags.contains(F::DEVICE_LOCAL);
    let host_visible = flags.contains(F::HOST_VISIBLE);
    let host_mappable = flags.contains(F::HOST_VISIBLE | F::HOST_COHERENT);
    let host_cached = flags.contains(F::HOST_CACHED);
    match usage {
        MemoryUsage::GpuOnly => {
            // BAR and unified heaps rank below plain device memory.
            device_local.then_some(if host_visible { 1 } else { 2 })
        }
        MemoryUsage::CpuToGpu => {
            // Upload heaps the GPU reads directly come first.
            host_mappable.then_some(if device_local { 2 } else { 1 })
        }
        MemoryUsage::GpuToCpu => {
            // Readback wants cached host memory.
            host_mappable.then_some(if host_cached { 2 } else { 1 })
        }
    }
}

/// Pick the highest ranked index in `types` permitted by `type_bits` whose
/// flags include `required`. Ties go to the lower index.
pub(crate) fn select_memory_type(
    types: &[vk::MemoryType],
    type_bits: u32,
    usage: MemoryUsage,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    types
        .iter()
        .enumerate()
        .filter(|(i, _)| type_bits & (1 << i) != 0)
        .filter(|(_, ty)| ty.property_flags.contains(required))
        .filter_map(|(i, ty)| {
            score_memory_type(ty.property_flags, usage).map(|s| (i as u32, s))
        })
        .max_by(|(i1, s1), (i2, s2)| s1.cmp(s2).then(i2.cmp(i1)))
        .map(|(i, _)| i)
}

/// A logical Vulkan device and its associated per-device state.
pub struct Device {
    parent: Arc<Instance>,
    allocator: Option<Mutex<Allocator>>,
    handle: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    properties: vk::PhysicalDeviceProperties,
    debug_utils_device: Option<ash::ext::debug_utils::Device>,
    synchronization2: Synchronization2Loader,
    bind_memory2: Option<BindMemory2Loader>,
    capabilities: DeviceCapabilities,
    physical_device: vk::PhysicalDevice,
    device_count: u32,
    transfer_queue: (Arc<Mutex<vk::Queue>>, u32),
    transfer_queue_flags: vk::QueueFlags,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle.handle())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        tracing::debug!("Dropping device {:?}", self.handle.handle());
        // gpu-allocator frees its blocks here, so it has to go first.
        self.allocator = None;
        // SAFETY: Buffers, images, pools and fences keep an `Arc<Device>`,
        // so none of them can outlive this call.
        unsafe { self.handle.destroy_device(None) };
    }
}

#[derive(Debug, Error)]
pub enum CreateDeviceError {
    #[error("Host memory exhaustion while creating a device")]
    MemoryExhaustion,

    #[error("Unknown Vulkan error while creating a device: {0}")]
    UnknownVulkan(vk::Result),

    #[error("No suitable physical device found")]
    NoSuitableDevice,

    #[error("Failed to create logical device: {0}")]
    DeviceCreationFailed(vk::Result),

    #[error(
        "Device groups were requested but the selected physical device \
         does not support them"
    )]
    DeviceGroupNotAvailable,

    #[error("Failed to create GPU allocator: {0}")]
    AllocatorCreation(AllocationError),
}

impl From<FetchPhysicalDeviceError> for CreateDeviceError {
    fn from(value: FetchPhysicalDeviceError) -> Self {
        match value {
            FetchPhysicalDeviceError::MemoryExhaustion => {
                Self::MemoryExhaustion
            }
            FetchPhysicalDeviceError::UnknownVulkan(e) => {
                Self::UnknownVulkan(e)
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum NameObjectError {
    #[error("Invalid Vulkan object name (contains interior NUL): {0}")]
    InvalidName(std::ffi::NulError),

    #[error("Vulkan error setting object name: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueMode {
    /// Use a dedicated transfer queue family when one exists.
    #[default]
    Auto,
    /// Record transfers on the general graphics queue family.
    Unified,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    pub queue_mode: QueueMode,
    /// Enable `VK_EXT_memory_priority` when available.
    pub memory_priority: bool,
    /// Create the device across every member of its physical device group.
    pub device_group: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            queue_mode: QueueMode::Auto,
            memory_priority: true,
            device_group: false,
        }
    }
}

fn device_type_priority(dt: vk::PhysicalDeviceType) -> u32 {
    match dt {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

/// Pick the family transfers are recorded on.
///
/// Any graphics or compute family implicitly supports transfer.
fn pick_transfer_family(
    families: &[vk::QueueFamilyProperties],
    mode: QueueMode,
) -> Option<u32> {
    let general = families.iter().position(|qf| {
        qf.queue_count > 0 && qf.queue_flags.contains(vk::QueueFlags::GRAPHICS)
    });
    let dedicated = families.iter().position(|qf| {
        qf.queue_count > 0
            && qf.queue_flags.contains(vk::QueueFlags::TRANSFER)
            && !qf.queue_flags.contains(vk::QueueFlags::GRAPHICS)
            && !qf.queue_flags.contains(vk::QueueFlags::COMPUTE)
    });
    let any = families.iter().position(|qf| {
        qf.queue_count > 0
            && qf.queue_flags.intersects(
                vk::QueueFlags::GRAPHICS
                    | vk::QueueFlags::COMPUTE
                    | vk::QueueFlags::TRANSFER,
            )
    });

    let picked = match mode {
        QueueMode::Auto => dedicated.or(general),
        QueueMode::Unified => general,
    };
    picked.or(any).map(|idx| idx as u32)
}

impl Device {
    /// Create a headless logical device.
    ///
    /// Candidates must support synchronization2 (core or extension) and
    /// expose a queue family able to run transfers. Survivors are scored by
    /// `(has dedicated transfer family, device type priority)`.
    pub fn create_headless(
        instance: &Arc<Instance>,
        config: DeviceConfig,
    ) -> Result<Self, CreateDeviceError> {
        struct DeviceCandidate {
            handle: vk::PhysicalDevice,
            props: vk::PhysicalDeviceProperties,
            transfer_family: u32,
            transfer_flags: vk::QueueFlags,
            capabilities: DeviceCapabilities,
            score: (u32, u32),
        }

        let physical_devices = instance.fetch_raw_physical_devices()?;
        let mut candidates: Vec<DeviceCandidate> = Vec::new();

        'dev: for &dev in &physical_devices {
            // SAFETY: dev was derived from instance.
            let props =
                unsafe { instance.get_raw_physical_device_properties(dev) };
            let name = props.device_name_as_c_str().unwrap_or(c"unknown");
            // SAFETY: dev was derived from instance.
            let families = unsafe {
                instance.get_raw_physical_device_queue_family_properties(dev)
            };

            // SAFETY: dev was derived from instance.
            let exts = match unsafe {
                instance.enumerate_raw_device_extension_properties(dev)
            } {
                Ok(exts) => exts,
                Err(e) => {
                    tracing::debug!(
                        "Skipping {name:?}: failed to enumerate extensions: {e}"
                    );
                    continue 'dev;
                }
            };

            let mut capabilities = DeviceCapabilities::from_properties(
                VkVersion::from_raw(props.api_version),
                &exts,
            );
            capabilities.memory_priority &= config.memory_priority;

            if !capabilities.supports(Capability::Synchronization2) {
                tracing::debug!(
                    "Skipping {name:?}: missing VK_KHR_synchronization2"
                );
                continue 'dev;
            }

            let Some(transfer_family) =
                pick_transfer_family(&families, config.queue_mode)
            else {
                tracing::debug!("Skipping {name:?}: no transfer queue family");
                continue 'dev;
            };

            let transfer_flags = families[transfer_family as usize].queue_flags;
            let dedicated = !transfer_flags.contains(vk::QueueFlags::GRAPHICS);

            candidates.push(DeviceCandidate {
                handle: dev,
                props,
                transfer_family,
                transfer_flags,
                capabilities,
                score: (dedicated as u32, device_type_priority(props.device_type)),
            });
        }

        let best = candidates
            .iter()
            .max_by_key(|c| c.score)
            .ok_or(CreateDeviceError::NoSuitableDevice)?;

        let physical_device = best.handle;
        let transfer_family = best.transfer_family;
        let capabilities = best.capabilities;
        // SAFETY: physical_device was selected from this instance.
        let memory_properties = unsafe {
            instance.get_raw_physical_device_memory_properties(physical_device)
        };
        tracing::info!(
            "Selected physical device: {:?} (type: {:?}, transfer family: {} {:?})",
            best.props.device_name_as_c_str().unwrap_or(c"unknown"),
            best.props.device_type,
            transfer_family,
            best.transfer_flags,
        );
        for (capability, supported) in capabilities.summary() {
            tracing::debug!("Capability {capability:?}: {supported}");
        }

        let group_members: Vec<vk::PhysicalDevice> = if config.device_group {
            if !capabilities.supports(Capability::DeviceGroup) {
                return Err(CreateDeviceError::DeviceGroupNotAvailable);
            }
            instance
                .fetch_raw_physical_device_groups()
                .map_err(CreateDeviceError::UnknownVulkan)?
                .iter()
                .map(|g| {
                    g.physical_devices[..g.physical_device_count as usize]
                        .to_vec()
                })
                .find(|members| members.contains(&physical_device))
                .unwrap_or_else(|| vec![physical_device])
        } else {
            vec![physical_device]
        };
        let device_count = group_members.len() as u32;

        let priorities = [1.0f32];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(transfer_family)
            .queue_priorities(&priorities)];

        let ext_names: Vec<&CStr> = capabilities.required_extensions();
        let ext_ptrs: Vec<*const c_char> =
            ext_names.iter().map(|e| e.as_ptr()).collect();

        let mut sync2_features =
            vk::PhysicalDeviceSynchronization2Features::default()
                .synchronization2(true);
        let mut priority_features =
            vk::PhysicalDeviceMemoryPriorityFeaturesEXT::default()
                .memory_priority(true);
        let mut group_info = vk::DeviceGroupDeviceCreateInfo::default()
            .physical_devices(&group_members);

        let mut device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&ext_ptrs)
            .push_next(&mut sync2_features);
        if capabilities.memory_priority {
            device_create_info =
                device_create_info.push_next(&mut priority_features);
        }
        if device_count > 1 {
            device_create_info = device_create_info.push_next(&mut group_info);
        }

        // SAFETY: physical_device was derived from instance;
        // device_create_info and its chain live until the call returns.
        let device = unsafe {
            instance.create_ash_device(physical_device, &device_create_info)
        }
        .map_err(CreateDeviceError::DeviceCreationFailed)?;

        // SAFETY: device was just created with one queue in this family.
        let queue = unsafe { device.get_device_queue(transfer_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.ash_instance().clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| {
            // SAFETY: Nothing has been created from device yet.
            unsafe { device.destroy_device(None) };
            CreateDeviceError::AllocatorCreation(e)
        })?;

        let synchronization2 = match capabilities.synchronization2 {
            Some(FeatureSource::Extension) => Synchronization2Loader::Extension(
                instance.create_synchronization2_loader(&device),
            ),
            _ => Synchronization2Loader::Core,
        };
        let bind_memory2 = match capabilities.bind_memory2 {
            Some(FeatureSource::Core) => Some(BindMemory2Loader::Core),
            Some(FeatureSource::Extension) => Some(BindMemory2Loader::Extension(
                instance.create_bind_memory2_loader(&device),
            )),
            None => None,
        };

        Ok(Self {
            parent: Arc::clone(instance),
            allocator: Some(Mutex::new(allocator)),
            memory_properties,
            properties: best.props,
            debug_utils_device: instance
                .create_debug_utils_device_loader(&device),
            synchronization2,
            bind_memory2,
            capabilities,
            handle: device,
            physical_device,
            device_count,
            transfer_queue: (Arc::new(Mutex::new(queue)), transfer_family),
            transfer_queue_flags: best.transfer_flags,
        })
    }

    pub fn parent(&self) -> &Arc<Instance> {
        &self.parent
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    /// Number of physical devices this logical device spans.
    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn memory_types(&self) -> &[vk::MemoryType] {
        &self.memory_properties.memory_types
            [..self.memory_properties.memory_type_count as usize]
    }

    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    pub fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.properties.limits.non_coherent_atom_size
    }

    pub fn transfer_queue_family(&self) -> u32 {
        self.transfer_queue.1
    }

    /// Capabilities of the transfer queue family. Barriers recorded on it
    /// may only name stages these flags support.
    pub fn transfer_queue_flags(&self) -> vk::QueueFlags {
        self.transfer_queue_flags
    }

    /// Allocate device memory through the `gpu-allocator` pools.
    ///
    /// Selects the best-matching Vulkan memory type for `usage`, narrows
    /// `requirements.memory_type_bits` to it, then rounds `size` and
    /// `alignment` up to `nonCoherentAtomSize` only when that type is
    /// HOST_VISIBLE but not HOST_COHERENT.
    pub fn allocate_memory(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
        linear: bool,
    ) -> Result<Allocation, AllocationError> {
        let atom = self.non_coherent_atom_size();
        let requirements = if let Some(idx) = select_memory_type(
            self.memory_types(),
            requirements.memory_type_bits,
            usage,
            vk::MemoryPropertyFlags::empty(),
        ) {
            use vk::MemoryPropertyFlags as F;
            let flags =
                self.memory_properties.memory_types[idx as usize].property_flags;
            let non_coherent_visible = flags.contains(F::HOST_VISIBLE)
                && !flags.contains(F::HOST_COHERENT);
            let (size, alignment) = if non_coherent_visible {
                (
                    requirements.size.div_ceil(atom) * atom,
                    requirements.alignment.max(atom),
                )
            } else {
                (requirements.size, requirements.alignment)
            };
            vk::MemoryRequirements {
                size,
                alignment,
                memory_type_bits: 1 << idx,
            }
        } else {
            requirements
        };

        let mut allocator = self.lock_allocator()?;
        allocator.allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: usage.into(),
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })
    }

    pub fn free_memory(
        &self,
        allocation: Allocation,
    ) -> Result<(), AllocationError> {
        self.lock_allocator()?.free(allocation)
    }

    fn lock_allocator(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, Allocator>, AllocationError> {
        self.allocator
            .as_ref()
            .ok_or_else(|| {
                AllocationError::Internal("allocator already dropped".into())
            })?
            .lock()
            .map_err(|_| AllocationError::Internal("allocator lock poisoned".into()))
    }
}

// ---- debug labels ----
impl Device {
    /// Attach a debug-utils label to `object`. Does nothing without
    /// validation or when `name` is `None`.
    ///
    /// # Safety
    /// `object` must be a valid Vulkan handle created from this device and
    /// must remain valid for the duration of the call.
    pub unsafe fn set_object_name<H>(
        &self,
        object: H,
        name: Option<&CStr>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        let Some(debug_utils) = self.debug_utils_device.as_ref() else {
            return Ok(());
        };
        let Some(name) = name else {
            return Ok(());
        };

        let object_name_info = vk::DebugUtilsObjectNameInfoEXT::default()
            .object_handle(object)
            .object_name(name);

        // SAFETY: `object` belongs to this device per the contract above.
        unsafe { debug_utils.set_debug_utils_object_name(&object_name_info) }
            .map_err(NameObjectError::Vulkan)
    }

    /// [`set_object_name`](Self::set_object_name) for `&str` labels.
    ///
    /// # Safety
    /// As for [`set_object_name`](Self::set_object_name).
    pub unsafe fn set_object_name_str<H>(
        &self,
        object: H,
        name: Option<&str>,
    ) -> Result<(), NameObjectError>
    where
        H: vk::Handle,
    {
        if self.debug_utils_device.is_none() {
            return Ok(());
        }
        let name = name
            .map(CString::new)
            .transpose()
            .map_err(NameObjectError::InvalidName)?;
        // SAFETY: forwarded from our own contract.
        unsafe { self.set_object_name(object, name.as_deref()) }
    }
}

// ---- submission ----
impl Device {
    /// `vkQueueSubmit2` on the transfer queue, through core 1.3 or the
    /// KHR extension.
    ///
    /// # Safety
    /// All handles in `submits` must be valid and derived from this device.
    /// Command buffers must be in the executable state. `fence`, when not
    /// null, must be an unsignaled fence created from this device.
    pub unsafe fn transfer_queue_submit2(
        &self,
        submits: &[vk::SubmitInfo2<'_>],
        fence: vk::Fence,
    ) -> Result<(), vk::Result> {
        let queue = self
            .transfer_queue
            .0
            .lock()
            .map_err(|_| vk::Result::ERROR_UNKNOWN)?;
        match &self.synchronization2 {
            // SAFETY: handles and fence state are the caller's obligation.
            Synchronization2Loader::Core => unsafe {
                self.handle.queue_submit2(*queue, submits, fence)
            },
            // SAFETY: handles and fence state are the caller's obligation.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.queue_submit2(*queue, submits, fence)
            },
        }
    }
}

// ---- command recording ----
impl Device {
    /// `vkCmdPipelineBarrier2`, through core 1.3 or the KHR extension.
    ///
    /// # Safety
    /// `command_buffer` must be a valid handle in the recording state, derived
    /// from this device. All handles and image layouts in `dependency_info`
    /// must be valid and consistent with the command buffer's current state.
    pub unsafe fn cmd_pipeline_barrier2(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        match &self.synchronization2 {
            // SAFETY: the command buffer is recording, per the contract.
            Synchronization2Loader::Core => unsafe {
                self.handle
                    .cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
            // SAFETY: the command buffer is recording, per the contract.
            Synchronization2Loader::Extension(loader) => unsafe {
                loader.cmd_pipeline_barrier2(command_buffer, dependency_info)
            },
        }
    }

    /// Record a buffer-to-buffer copy.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. Both buffers must be
    /// valid handles created from this device, and every region in bounds.
    pub unsafe fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        // SAFETY: Caller guarantees recording state and copy validity.
        unsafe {
            self.handle.cmd_copy_buffer(
                command_buffer,
                src_buffer,
                dst_buffer,
                regions,
            )
        }
    }

    /// Record a buffer-to-image copy.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `dst_image` must be
    /// in `dst_layout` for every region's subresource when the copy executes.
    pub unsafe fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: Caller guarantees recording state and copy validity.
        unsafe {
            self.handle.cmd_copy_buffer_to_image(
                command_buffer,
                src_buffer,
                dst_image,
                dst_layout,
                regions,
            )
        }
    }

    /// Record an image-to-buffer copy.
    ///
    /// # Safety
    /// `command_buffer` must be in the recording state. `src_image` must be
    /// in `src_layout` for every region's subresource when the copy executes.
    pub unsafe fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src_image: vk::Image,
        src_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        // SAFETY: Caller guarantees recording state and copy validity.
        unsafe {
            self.handle.cmd_copy_image_to_buffer(
                command_buffer,
                src_image,
                src_layout,
                dst_buffer,
                regions,
            )
        }
    }
}

// ---- buffers and memory ----
impl Device {
    /// # Safety
    /// `create_info` must be valid. All referenced pointers must remain
    /// valid for the duration of the call.
    pub unsafe fn create_raw_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_buffer(create_info, None) }
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `buffer`.
    pub unsafe fn destroy_raw_buffer(&self, buffer: vk::Buffer) {
        // SAFETY: Caller guarantees buffer provenance and drop ordering.
        unsafe { self.handle.destroy_buffer(buffer, None) };
    }

    /// # Safety
    /// `buffer` must be a valid handle created from this device.
    pub unsafe fn get_raw_buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees buffer validity.
        unsafe { self.handle.get_buffer_memory_requirements(buffer) }
    }

    /// # Safety
    /// `allocate_info` and its chain must be valid and describe a memory
    /// type index supported by this device.
    pub unsafe fn allocate_raw_memory(
        &self,
        allocate_info: &vk::MemoryAllocateInfo<'_>,
    ) -> Result<vk::DeviceMemory, vk::Result> {
        // SAFETY: Caller guarantees allocation info validity.
        unsafe { self.handle.allocate_memory(allocate_info, None) }
    }

    /// # Safety
    /// `memory` must be a valid handle created from this device and not yet
    /// freed. No object may still be in use with `memory` at free time.
    pub unsafe fn free_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory provenance and drop ordering.
        unsafe { self.handle.free_memory(memory, None) };
    }

    /// # Safety
    /// `buffer` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy the buffer's memory requirements.
    pub unsafe fn bind_raw_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_buffer_memory(buffer, memory, offset) }
    }

    /// Bind buffers through `vkBindBufferMemory2`, allowing device-group
    /// chains.
    ///
    /// # Safety
    /// Every bind info and its chain must be valid for this device.
    pub unsafe fn bind_raw_buffer_memory2(
        &self,
        bind_infos: &[vk::BindBufferMemoryInfo<'_>],
    ) -> Result<(), vk::Result> {
        match &self.bind_memory2 {
            // SAFETY: Caller guarantees bind info validity.
            Some(BindMemory2Loader::Core) => unsafe {
                self.handle.bind_buffer_memory2(bind_infos)
            },
            // SAFETY: Caller guarantees bind info validity.
            Some(BindMemory2Loader::Extension(loader)) => unsafe {
                (loader.fp().bind_buffer_memory2_khr)(
                    loader.device(),
                    bind_infos.len() as _,
                    bind_infos.as_ptr(),
                )
                .result()
            },
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }

    /// # Safety
    /// `memory` must be a valid allocation from this device and not
    /// currently mapped. The range must lie within the allocation.
    pub unsafe fn map_raw_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<*mut std::ffi::c_void, vk::Result> {
        // SAFETY: Caller guarantees mapping preconditions.
        unsafe {
            self.handle
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())
        }
    }

    /// # Safety
    /// Every range must reference mapped memory from this device and be
    /// aligned to `nonCoherentAtomSize`.
    pub unsafe fn flush_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.flush_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// Every range must reference mapped memory from this device and be
    /// aligned to `nonCoherentAtomSize`.
    pub unsafe fn invalidate_raw_mapped_memory_ranges(
        &self,
        memory_ranges: &[vk::MappedMemoryRange<'_>],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees memory range validity.
        unsafe { self.handle.invalidate_mapped_memory_ranges(memory_ranges) }
    }

    /// # Safety
    /// `memory` must currently be mapped on this device.
    pub unsafe fn unmap_raw_memory(&self, memory: vk::DeviceMemory) {
        // SAFETY: Caller guarantees memory is currently mapped.
        unsafe { self.handle.unmap_memory(memory) };
    }
}

// ---- images ----
impl Device {
    /// # Safety
    /// `create_info` must be valid. All referenced pointers must remain
    /// valid for the duration of the call.
    pub unsafe fn create_raw_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_image(create_info, None) }
    }

    /// # Safety
    /// `image` must be a valid handle created from this device and not yet
    /// destroyed. No in-flight GPU work may still reference `image`.
    pub unsafe fn destroy_raw_image(&self, image: vk::Image) {
        // SAFETY: Caller guarantees image provenance and drop ordering.
        unsafe { self.handle.destroy_image(image, None) };
    }

    /// # Safety
    /// `image` must be a valid handle created from this device.
    pub unsafe fn get_raw_image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        // SAFETY: Caller guarantees image validity.
        unsafe { self.handle.get_image_memory_requirements(image) }
    }

    /// # Safety
    /// `image` and `memory` must both be valid handles created from this
    /// device. `offset` must satisfy the image's memory requirements.
    pub unsafe fn bind_raw_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees handle validity and offset constraints.
        unsafe { self.handle.bind_image_memory(image, memory, offset) }
    }

    /// Bind images through `vkBindImageMemory2`, allowing device-group
    /// chains.
    ///
    /// # Safety
    /// Every bind info and its chain must be valid for this device.
    pub unsafe fn bind_raw_image_memory2(
        &self,
        bind_infos: &[vk::BindImageMemoryInfo<'_>],
    ) -> Result<(), vk::Result> {
        match &self.bind_memory2 {
            // SAFETY: Caller guarantees bind info validity.
            Some(BindMemory2Loader::Core) => unsafe {
                self.handle.bind_image_memory2(bind_infos)
            },
            // SAFETY: Caller guarantees bind info validity.
            Some(BindMemory2Loader::Extension(loader)) => unsafe {
                (loader.fp().bind_image_memory2_khr)(
                    loader.device(),
                    bind_infos.len() as _,
                    bind_infos.as_ptr(),
                )
                .result()
            },
            None => Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT),
        }
    }
}

// ---- command pools ----
impl Device {
    /// # Safety
    /// `create_info` must have a valid `queue_family_index` for this device.
    pub unsafe fn create_raw_command_pool(
        &self,
        create_info: &vk::CommandPoolCreateInfo<'_>,
    ) -> Result<vk::CommandPool, vk::Result> {
        // SAFETY: Caller guarantees create_info validity and queue
        // family provenance.
        unsafe { self.handle.create_command_pool(create_info, None) }
    }

    /// # Safety
    /// `pool` must be a valid handle created from this device and not yet
    /// destroyed. None of its command buffers may be pending execution.
    pub unsafe fn destroy_raw_command_pool(&self, pool: vk::CommandPool) {
        // SAFETY: Caller guarantees pool provenance and drop ordering.
        unsafe { self.handle.destroy_command_pool(pool, None) };
    }

    /// # Safety
    /// `allocate_info` must reference a valid pool created from this device,
    /// with no concurrent access to that pool.
    pub unsafe fn allocate_raw_command_buffers(
        &self,
        allocate_info: &vk::CommandBufferAllocateInfo<'_>,
    ) -> Result<Vec<vk::CommandBuffer>, vk::Result> {
        // SAFETY: Caller guarantees allocate_info validity.
        unsafe { self.handle.allocate_command_buffers(allocate_info) }
    }

    /// # Safety
    /// Every buffer was allocated from `pool`, none is pending execution, and
    /// access to `pool` is externally synchronized.
    pub unsafe fn free_raw_command_buffers(
        &self,
        pool: vk::CommandPool,
        command_buffers: &[vk::CommandBuffer],
    ) {
        // SAFETY: Caller guarantees pool provenance and buffer state.
        unsafe { self.handle.free_command_buffers(pool, command_buffers) };
    }

    /// # Safety
    /// `command_buffer` must be in the initial state.
    pub unsafe fn begin_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::CommandBufferBeginInfo<'_>,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the command buffer state.
        unsafe {
            self.handle
                .begin_command_buffer(command_buffer, begin_info)
        }
    }

    /// # Safety
    /// `command_buffer` must be in the recording state.
    pub unsafe fn end_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the command buffer state.
        unsafe { self.handle.end_command_buffer(command_buffer) }
    }

    /// # Safety
    /// `command_buffer` must not be pending execution, and its pool must have
    /// been created with `RESET_COMMAND_BUFFER`.
    pub unsafe fn reset_raw_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        flags: vk::CommandBufferResetFlags,
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the command buffer state.
        unsafe { self.handle.reset_command_buffer(command_buffer, flags) }
    }
}

// ---- fences ----
impl Device {
    /// # Safety
    /// `create_info` must be valid.
    pub unsafe fn create_raw_fence(
        &self,
        create_info: &vk::FenceCreateInfo<'_>,
    ) -> Result<vk::Fence, vk::Result> {
        // SAFETY: Caller guarantees create_info validity.
        unsafe { self.handle.create_fence(create_info, None) }
    }

    /// # Safety
    /// `fence` must be a valid handle created from this device and must not
    /// be pending on any queue.
    pub unsafe fn destroy_raw_fence(&self, fence: vk::Fence) {
        // SAFETY: Caller guarantees fence provenance and drop ordering.
        unsafe { self.handle.destroy_fence(fence, None) };
    }

    /// # Safety
    /// Every fence must be a valid handle created from this device.
    pub unsafe fn wait_for_raw_fences(
        &self,
        fences: &[vk::Fence],
        wait_all: bool,
        timeout_ns: u64,
    ) -> Result<(), vk::Result> {
        let _span = tracing::debug_span!("wait_for_fences").entered();
        // SAFETY: Caller guarantees fence validity.
        unsafe { self.handle.wait_for_fences(fences, wait_all, timeout_ns) }
    }

    /// # Safety
    /// Every fence must be a valid handle created from this device and not
    /// pending on any queue.
    pub unsafe fn reset_raw_fences(
        &self,
        fences: &[vk::Fence],
    ) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees fence validity and state.
        unsafe { self.handle.reset_fences(fences) }
    }
}

/// Distinct queue family indices for concurrent sharing.
///
/// Vulkan forbids duplicates in `pQueueFamilyIndices`.
pub(crate) fn dedup_queue_families(families: &[u32]) -> Vec<u32> {
    let mut seen = HashSet::new();
    families
        .iter()
        .copied()
        .filter(|f| seen.insert(*f))
        .collect()
}
