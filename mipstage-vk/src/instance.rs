//! Headless Vulkan instance creation and physical device queries.
//!
//! [`Instance`] wraps an `ash::Instance` together with the entry-point
//! loader and an optional validation messenger that forwards into
//! [`tracing`]. No surface extensions are requested; everything this crate
//! does happens off-screen.
//!
//! [`VkVersion`] is a thin newtype over the packed Vulkan version word.

use std::ffi::{CStr, CString, c_char};
use std::fmt::Debug;

use ash::vk;
use thiserror::Error;

/// Minimum severity level for Vulkan validation layer messages.
///
/// Messages at or above the chosen level are forwarded to the [`tracing`]
/// subscriber under the `mipstage-debug-messenger` target.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
pub enum VulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl VulkanLogLevel {
    fn severity_flags(self) -> vk::DebugUtilsMessageSeverityFlagsEXT {
        use vk::DebugUtilsMessageSeverityFlagsEXT as S;
        match self {
            VulkanLogLevel::Verbose => {
                S::VERBOSE | S::INFO | S::WARNING | S::ERROR
            }
            VulkanLogLevel::Info => S::INFO | S::WARNING | S::ERROR,
            VulkanLogLevel::Warning => S::WARNING | S::ERROR,
            VulkanLogLevel::Error => S::ERROR,
        }
    }
}

/// A packed Vulkan API version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VkVersion(u32);

impl VkVersion {
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn new(variant: u32, major: u32, minor: u32, patch: u32) -> Self {
        Self(vk::make_api_version(variant, major, minor, patch))
    }

    pub fn variant(&self) -> u32 {
        vk::api_version_variant(self.0)
    }

    pub fn major(&self) -> u32 {
        vk::api_version_major(self.0)
    }

    pub fn minor(&self) -> u32 {
        vk::api_version_minor(self.0)
    }

    pub fn patch(&self) -> u32 {
        vk::api_version_patch(self.0)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for VkVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.patch())
    }
}

/// The root Vulkan object.
///
/// All objects derived from an instance hold an `Arc<Instance>` to keep it
/// alive. Construct via [`Instance::new`], which is `unsafe` because it
/// loads the Vulkan shared library.
pub struct Instance {
    // Keeps the loader library mapped while `handle` is alive.
    _entry: ash::Entry,
    handle: ash::Instance,
    debug_messenger:
        Option<(vk::DebugUtilsMessengerEXT, ash::ext::debug_utils::Instance)>,
    ver: VkVersion,
}

impl Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instance")
            .field("handle", &self.handle.handle())
            .field("version", &self.ver)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Error)]
pub enum InstanceCreationError {
    #[error("Could not load Vulkan: {0}")]
    Loading(ash::LoadingError),
    #[error("Invalid app name was passed to Instance::new")]
    InvalidAppName,
    #[error("Vulkan error creating instance: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for InstanceCreationError {
    fn from(value: vk::Result) -> Self {
        InstanceCreationError::Vulkan(value)
    }
}

#[derive(Debug, Error)]
pub enum FetchPhysicalDeviceError {
    #[error("Error fetching physical devices, memory exhaustion")]
    MemoryExhaustion,
    #[error("Error fetching physical devices, Unknown vulkan: {0}")]
    UnknownVulkan(vk::Result),
}

impl Drop for Instance {
    fn drop(&mut self) {
        tracing::debug!("Dropping instance {:?}", self.handle.handle());
        if let Some((debug_messenger, debug_utils_instance)) =
            self.debug_messenger.take()
        {
            // SAFETY: last use of this messenger, which was created from this
            // instance through debug_utils_instance.
            unsafe {
                debug_utils_instance
                    .destroy_debug_utils_messenger(debug_messenger, None)
            };
        }
        // SAFETY: We are in drop so this is the last use of the instance.
        // Every derived object holds an Arc to it and is already gone.
        unsafe { self.handle.destroy_instance(None) };
    }
}

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    // SAFETY: Vulkan guarantees p_callback_data is valid for the call.
    let message = unsafe { CStr::from_ptr((*p_callback_data).p_message) }
        .to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "GENERAL",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "VALIDATION",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "PERFORMANCE",
        _ => "UNKNOWN",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "mipstage-debug-messenger", "[{type_str}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::info!(target: "mipstage-debug-messenger", "[{type_str}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "mipstage-debug-messenger", "[{type_str}] {message}");
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!(target: "mipstage-debug-messenger", "[{type_str}] {message}");
        }
        _ => {
            tracing::debug!(target: "mipstage-debug-messenger", "[{type_str}] {message}");
        }
    }

    vk::FALSE
}

impl Instance {
    /// Create a headless instance at the highest API version the loader
    /// reports.
    ///
    /// When `max_log_level` is set and both `VK_EXT_debug_utils` and the
    /// Khronos validation layer are present, validation messages are routed
    /// into `tracing`. Otherwise validation is silently skipped.
    ///
    /// # Safety
    /// This loads Vulkan through libloading, which runs arbitrary library
    /// initialisation code.
    pub unsafe fn new(
        app_name: impl AsRef<str>,
        max_log_level: Option<VulkanLogLevel>,
    ) -> Result<Self, InstanceCreationError> {
        use InstanceCreationError as Error;

        let app_name_cstring = CString::new(app_name.as_ref())
            .map_err(|_| Error::InvalidAppName)?;

        // SAFETY: The caller carries the library loading burden. Entry is
        // dropped after the instance (field order plus the Drop impl).
        let entry = unsafe { ash::Entry::load() }.map_err(Error::Loading)?;

        // SAFETY: entry is a live Vulkan entry; vkEnumerateInstanceVersion
        // has no further preconditions.
        let api_version = unsafe { entry.try_enumerate_instance_version() }
            .unwrap_or(Some(vk::API_VERSION_1_0))
            .unwrap_or(vk::API_VERSION_1_0);

        // SAFETY: entry is live; None queries global extensions.
        let instance_exts_avail =
            unsafe { entry.enumerate_instance_extension_properties(None) }?;
        // SAFETY: entry is live and the call has no other preconditions.
        let instance_layers_avail =
            unsafe { entry.enumerate_instance_layer_properties() };

        let debug_utils_ext_name = ash::ext::debug_utils::NAME;
        let validation_layer_name = c"VK_LAYER_KHRONOS_validation";

        let debug_utils_available = instance_exts_avail.iter().any(|ext| {
            ext.extension_name_as_c_str() == Ok(debug_utils_ext_name)
        });
        let validation_layer_available = instance_layers_avail
            .as_ref()
            .map(|layers| {
                layers.iter().any(|layer| {
                    layer.layer_name_as_c_str() == Ok(validation_layer_name)
                })
            })
            .unwrap_or(false);

        let mut enabled_ext_ptrs: Vec<*const c_char> = Vec::new();
        let mut enabled_layers: Vec<*const c_char> = Vec::new();

        let mut debug_messenger_create_info = if let Some(log_level) =
            max_log_level
            && debug_utils_available
            && validation_layer_available
        {
            enabled_ext_ptrs.push(debug_utils_ext_name.as_ptr());
            enabled_layers.push(validation_layer_name.as_ptr());

            Some(
                vk::DebugUtilsMessengerCreateInfoEXT::default()
                    .message_severity(log_level.severity_flags())
                    .message_type(
                        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                    )
                    .pfn_user_callback(Some(vulkan_debug_callback)),
            )
        } else {
            if max_log_level.is_some() {
                tracing::warn!(
                    "Validation requested but unavailable \
                     (debug_utils: {debug_utils_available}, \
                     layer: {validation_layer_available})"
                );
            }
            None
        };

        let app_info = vk::ApplicationInfo::default()
            .application_name(&app_name_cstring)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"mipstage")
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(api_version);

        let mut instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&enabled_ext_ptrs)
            .enabled_layer_names(&enabled_layers);

        if let Some(ref mut debug_info) = debug_messenger_create_info {
            instance_create_info = instance_create_info.push_next(debug_info);
        }

        // SAFETY: instance_create_info and everything it points at lives
        // until the end of this function.
        let instance =
            unsafe { entry.create_instance(&instance_create_info, None) }?;

        let debug_messenger = if let Some(mut debug_messenger_create_info) =
            debug_messenger_create_info
        {
            // The create info was chained into the instance create info
            // above; detach it before reuse.
            debug_messenger_create_info.p_next = std::ptr::null();
            let debug_utils_instance =
                ash::ext::debug_utils::Instance::new(&entry, &instance);
            // SAFETY: Valid create info; instance was created with the
            // debug utils extension enabled.
            match unsafe {
                debug_utils_instance.create_debug_utils_messenger(
                    &debug_messenger_create_info,
                    None,
                )
            } {
                Ok(messenger) => Some((messenger, debug_utils_instance)),
                Err(e) => {
                    tracing::error!(
                        "Failed to create debug messenger, continuing \
                         without validation output: {e}"
                    );
                    None
                }
            }
        } else {
            None
        };

        let ver = VkVersion::from_raw(api_version);
        tracing::info!("Created headless Vulkan {ver} instance");

        Ok(Instance {
            _entry: entry,
            handle: instance,
            debug_messenger,
            ver,
        })
    }

    /// Get handles to every physical device. These handles are ONLY valid
    /// in the context of this instance.
    pub fn fetch_raw_physical_devices(
        &self,
    ) -> Result<Vec<vk::PhysicalDevice>, FetchPhysicalDeviceError> {
        // SAFETY: The instance is live for the lifetime of self.
        match unsafe { self.handle.enumerate_physical_devices() } {
            Ok(v) => Ok(v),
            Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
            | Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY) => {
                Err(FetchPhysicalDeviceError::MemoryExhaustion)
            }
            Err(e) => Err(FetchPhysicalDeviceError::UnknownVulkan(e)),
        }
    }

    /// Enumerate physical device groups (linked adapters).
    pub fn fetch_raw_physical_device_groups(
        &self,
    ) -> Result<Vec<vk::PhysicalDeviceGroupProperties<'static>>, vk::Result>
    {
        if self.ver.major() == 1 && self.ver.minor() < 1 {
            return Ok(Vec::new());
        }
        // SAFETY: The instance is live and supports Vulkan 1.1.
        let count =
            unsafe { self.handle.enumerate_physical_device_groups_len() }?;
        let mut groups =
            vec![vk::PhysicalDeviceGroupProperties::default(); count];
        // SAFETY: groups has exactly `count` default-initialised entries.
        unsafe { self.handle.enumerate_physical_device_groups(&mut groups) }?;
        Ok(groups)
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceProperties {
        // SAFETY: physical_device was derived from this instance.
        unsafe { self.handle.get_physical_device_properties(physical_device) }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_queue_family_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Vec<vk::QueueFamilyProperties> {
        // SAFETY: physical_device was derived from this instance.
        unsafe {
            self.handle
                .get_physical_device_queue_family_properties(physical_device)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_memory_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> vk::PhysicalDeviceMemoryProperties {
        // SAFETY: physical_device was derived from this instance.
        unsafe {
            self.handle
                .get_physical_device_memory_properties(physical_device)
        }
    }

    /// Query tiling features supported for `format`.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn get_raw_physical_device_format_properties(
        &self,
        physical_device: vk::PhysicalDevice,
        format: vk::Format,
    ) -> vk::FormatProperties {
        // SAFETY: physical_device was derived from this instance.
        unsafe {
            self.handle
                .get_physical_device_format_properties(physical_device, format)
        }
    }

    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    pub unsafe fn enumerate_raw_device_extension_properties(
        &self,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Vec<vk::ExtensionProperties>, vk::Result> {
        // SAFETY: physical_device was derived from this instance.
        unsafe {
            self.handle
                .enumerate_device_extension_properties(physical_device)
        }
    }

    /// Create a logical device from a physical device.
    ///
    /// # Safety
    /// `physical_device` must be a valid handle derived from this instance.
    /// `create_info` and every handle it references must be valid for the
    /// duration of the call.
    pub unsafe fn create_ash_device(
        &self,
        physical_device: vk::PhysicalDevice,
        create_info: &vk::DeviceCreateInfo<'_>,
    ) -> Result<ash::Device, vk::Result> {
        // SAFETY: Caller guarantees physical_device provenance and
        // create_info validity.
        unsafe {
            self.handle
                .create_device(physical_device, create_info, None)
        }
    }

    pub fn ash_instance(&self) -> &ash::Instance {
        &self.handle
    }
}

// Device extension loader creation functionality
impl Instance {
    pub fn create_synchronization2_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::synchronization2::Device {
        ash::khr::synchronization2::Device::new(&self.handle, device)
    }

    pub fn create_bind_memory2_loader(
        &self,
        device: &ash::Device,
    ) -> ash::khr::bind_memory2::Device {
        ash::khr::bind_memory2::Device::new(&self.handle, device)
    }

    pub fn create_debug_utils_device_loader(
        &self,
        device: &ash::Device,
    ) -> Option<ash::ext::debug_utils::Device> {
        self.debug_messenger
            .is_some()
            .then(|| ash::ext::debug_utils::Device::new(&self.handle, device))
    }
}
