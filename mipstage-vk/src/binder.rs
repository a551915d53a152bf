//! Resource memory binding.
//!
//! [`Resources`] owns a [`ResourceDriver`], a [`MemoryAllocator`] and one
//! [`ResourceTable`] per resource type. Every operation that touches a
//! native object or its memory goes through it:
//!
//! - creation allocates and binds memory before returning the handle;
//! - [`bind_memory`](Resources::bind_memory) replaces a binding wholesale,
//!   recreating the native object first when it was already bound, since a
//!   Vulkan buffer or image can only ever be bound once;
//! - [`realloc`](Resources::realloc) and
//!   [`on_defragment`](Resources::on_defragment) recreate the native object
//!   and bind it again.
//!
//! The table handle survives recreation, the raw Vulkan handle does not.
//! Anything recorded or written against the old raw handle must be redone
//! by the caller.
//!
//! Nothing here is internally locked. Mutating calls take `&mut self`, so
//! they cannot race with other use of the same table.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::arena::{Handle, ResourceTable};
use crate::capability::{Capability, MissingCapabilityError};
use crate::driver::ResourceDriver;
use crate::format::{FormatCapabilityError, check_format_support};
use crate::memory::{
    AllocateMemoryError, DeviceMemory, ManagedDeviceMemory, MapMemoryError,
    MemoryAllocator, MemoryRequest,
};
use crate::resource::{
    Buffer, BufferDesc, Image, ImageDesc, InvalidImageDesc, MemoryBinding,
    Resource,
};

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Handle does not refer to a live resource")]
pub struct StaleHandleError;

#[derive(Debug, Error)]
pub enum CreateResourceError {
    #[error("Buffers must have a non-zero size")]
    ZeroSize,

    #[error("Invalid image description: {0}")]
    InvalidDesc(#[from] InvalidImageDesc),

    #[error(transparent)]
    Format(#[from] FormatCapabilityError),

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("Failed to allocate resource memory: {0}")]
    Allocate(#[from] AllocateMemoryError),

    #[error("Failed to bind resource memory: {0}")]
    Bind(#[from] BindMemoryError),
}

#[derive(Debug, Error)]
pub enum BindMemoryError {
    #[error(transparent)]
    StaleHandle(#[from] StaleHandleError),

    #[error(
        "Bind offset {offset} is not a multiple of the required alignment \
         {alignment}"
    )]
    Misaligned {
        offset: vk::DeviceSize,
        alignment: vk::DeviceSize,
    },

    #[error(
        "Resource needs {required} bytes at offset {offset} but the memory \
         holds {available}"
    )]
    TooSmall {
        offset: vk::DeviceSize,
        required: vk::DeviceSize,
        available: vk::DeviceSize,
    },

    #[error(
        "Memory type {type_index} is not allowed by type bits {type_bits:#b}"
    )]
    IncompatibleMemoryType { type_index: u32, type_bits: u32 },

    #[error(transparent)]
    MissingCapability(#[from] MissingCapabilityError),

    #[error("Device group bind needs {expected} device indices, got {got}")]
    DeviceIndexCount { expected: u32, got: usize },

    #[error("Device index {index} is out of range for {count} devices")]
    DeviceIndexOutOfRange { index: u32, count: u32 },

    #[error("Split instance bind regions only apply to images")]
    SplitRegionsOnBuffer,

    #[error("Split instance binds take no device indices")]
    SplitRegionsWithIndices,

    #[error("Split instance bind needs {expected} regions, got {got}")]
    SplitRegionCount { expected: u32, got: usize },

    #[error("Failed to recreate the resource before rebinding: {0}")]
    Recreate(vk::Result),

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

#[derive(Debug, Error)]
pub enum RecreateError {
    #[error(transparent)]
    StaleHandle(#[from] StaleHandleError),

    #[error("Resource has no memory bound")]
    NotBound,

    #[error("Buffers must have a non-zero size")]
    ZeroSize,

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },

    #[error("Failed to allocate resized memory: {0}")]
    Allocate(#[from] AllocateMemoryError),

    #[error("Failed to bind recreated resource: {0}")]
    Bind(#[from] BindMemoryError),
}

#[derive(Debug, Error)]
pub enum AccessMemoryError {
    #[error(transparent)]
    StaleHandle(#[from] StaleHandleError),

    #[error("Resource has no memory bound")]
    NotBound,

    #[error(transparent)]
    Map(#[from] MapMemoryError),
}

// ---------------------------------------------------------------------------
// Bindable
// ---------------------------------------------------------------------------

/// A resource type the binder can create, bind and recreate.
///
/// Implemented for [`Buffer`] and [`Image`].
pub trait Bindable: Resource + Sized {
    type Raw: vk::Handle + Copy + std::fmt::Debug;

    const CREATE_CALL: &'static str;
    const BIND_CALL: &'static str;
    const BIND2_CALL: &'static str;
    const SUPPORTS_SPLIT_REGIONS: bool;

    #[doc(hidden)]
    fn table<D, A>(resources: &Resources<D, A>) -> &ResourceTable<Self>
    where
        D: ResourceDriver,
        A: MemoryAllocator;

    #[doc(hidden)]
    fn table_mut<D, A>(
        resources: &mut Resources<D, A>,
    ) -> &mut ResourceTable<Self>
    where
        D: ResourceDriver,
        A: MemoryAllocator;

    fn raw(&self) -> Self::Raw;

    /// Create a native object matching this resource's description.
    ///
    /// # Safety
    /// The description must be valid for `driver`.
    unsafe fn create_native<D: ResourceDriver>(
        &self,
        driver: &D,
    ) -> Result<(Self::Raw, vk::MemoryRequirements), vk::Result>;

    /// # Safety
    /// `raw` came from `driver` and is not in use.
    unsafe fn destroy_native<D: ResourceDriver>(driver: &D, raw: Self::Raw);

    /// # Safety
    /// `raw` and `memory` came from `driver` and `offset` is valid.
    unsafe fn bind_native<D: ResourceDriver>(
        driver: &D,
        raw: Self::Raw,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// Same as [`bind_native`](Self::bind_native); indices and regions are
    /// already validated.
    unsafe fn bind_native_device_group<D: ResourceDriver>(
        driver: &D,
        raw: Self::Raw,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        device_indices: &[u32],
        split_regions: &[vk::Rect2D],
    ) -> Result<(), vk::Result>;

    fn replace_native(
        &mut self,
        raw: Self::Raw,
        requirements: vk::MemoryRequirements,
    );

    fn binding_mut(&mut self) -> &mut Option<MemoryBinding>;
}

impl Bindable for Buffer {
    type Raw = vk::Buffer;

    const CREATE_CALL: &'static str = "vkCreateBuffer";
    const BIND_CALL: &'static str = "vkBindBufferMemory";
    const BIND2_CALL: &'static str = "vkBindBufferMemory2";
    const SUPPORTS_SPLIT_REGIONS: bool = false;

    fn table<D, A>(resources: &Resources<D, A>) -> &ResourceTable<Self>
    where
        D: ResourceDriver,
        A: MemoryAllocator,
    {
        &resources.buffers
    }

    fn table_mut<D, A>(
        resources: &mut Resources<D, A>,
    ) -> &mut ResourceTable<Self>
    where
        D: ResourceDriver,
        A: MemoryAllocator,
    {
        &mut resources.buffers
    }

    fn raw(&self) -> vk::Buffer {
        self.raw
    }

    unsafe fn create_native<D: ResourceDriver>(
        &self,
        driver: &D,
    ) -> Result<(vk::Buffer, vk::MemoryRequirements), vk::Result> {
        create_raw_buffer(driver, &self.desc)
    }

    unsafe fn destroy_native<D: ResourceDriver>(driver: &D, raw: vk::Buffer) {
        // SAFETY: Forwarded caller contract.
        unsafe { driver.destroy_buffer(raw) }
    }

    unsafe fn bind_native<D: ResourceDriver>(
        driver: &D,
        raw: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { driver.bind_buffer_memory(raw, memory, offset) }
    }

    unsafe fn bind_native_device_group<D: ResourceDriver>(
        driver: &D,
        raw: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        device_indices: &[u32],
        _split_regions: &[vk::Rect2D],
    ) -> Result<(), vk::Result> {
        let mut group = vk::BindBufferMemoryDeviceGroupInfo::default()
            .device_indices(device_indices);
        let info = vk::BindBufferMemoryInfo::default()
            .buffer(raw)
            .memory(memory)
            .memory_offset(offset)
            .push_next(&mut group);
        // SAFETY: info and its chain live for the call; handles follow the
        // caller contract.
        unsafe { driver.bind_buffer_memory2(std::slice::from_ref(&info)) }
    }

    fn replace_native(
        &mut self,
        raw: vk::Buffer,
        requirements: vk::MemoryRequirements,
    ) {
        self.raw = raw;
        self.requirements = requirements;
    }

    fn binding_mut(&mut self) -> &mut Option<MemoryBinding> {
        &mut self.binding
    }
}

impl Bindable for Image {
    type Raw = vk::Image;

    const CREATE_CALL: &'static str = "vkCreateImage";
    const BIND_CALL: &'static str = "vkBindImageMemory";
    const BIND2_CALL: &'static str = "vkBindImageMemory2";
    const SUPPORTS_SPLIT_REGIONS: bool = true;

    fn table<D, A>(resources: &Resources<D, A>) -> &ResourceTable<Self>
    where
        D: ResourceDriver,
        A: MemoryAllocator,
    {
        &resources.images
    }

    fn table_mut<D, A>(
        resources: &mut Resources<D, A>,
    ) -> &mut ResourceTable<Self>
    where
        D: ResourceDriver,
        A: MemoryAllocator,
    {
        &mut resources.images
    }

    fn raw(&self) -> vk::Image {
        self.raw
    }

    unsafe fn create_native<D: ResourceDriver>(
        &self,
        driver: &D,
    ) -> Result<(vk::Image, vk::MemoryRequirements), vk::Result> {
        create_raw_image(driver, &self.desc)
    }

    unsafe fn destroy_native<D: ResourceDriver>(driver: &D, raw: vk::Image) {
        // SAFETY: Forwarded caller contract.
        unsafe { driver.destroy_image(raw) }
    }

    unsafe fn bind_native<D: ResourceDriver>(
        driver: &D,
        raw: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        // SAFETY: Forwarded caller contract.
        unsafe { driver.bind_image_memory(raw, memory, offset) }
    }

    unsafe fn bind_native_device_group<D: ResourceDriver>(
        driver: &D,
        raw: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        device_indices: &[u32],
        split_regions: &[vk::Rect2D],
    ) -> Result<(), vk::Result> {
        let mut group = vk::BindImageMemoryDeviceGroupInfo::default()
            .device_indices(device_indices)
            .split_instance_bind_regions(split_regions);
        let info = vk::BindImageMemoryInfo::default()
            .image(raw)
            .memory(memory)
            .memory_offset(offset)
            .push_next(&mut group);
        // SAFETY: info and its chain live for the call; handles follow the
        // caller contract.
        unsafe { driver.bind_image_memory2(std::slice::from_ref(&info)) }
    }

    fn replace_native(
        &mut self,
        raw: vk::Image,
        requirements: vk::MemoryRequirements,
    ) {
        self.raw = raw;
        self.requirements = requirements;
        // A fresh image starts out UNDEFINED everywhere.
        self.reset_layouts();
    }

    fn binding_mut(&mut self) -> &mut Option<MemoryBinding> {
        &mut self.binding
    }
}

fn create_raw_buffer<D: ResourceDriver>(
    driver: &D,
    desc: &BufferDesc,
) -> Result<(vk::Buffer, vk::MemoryRequirements), vk::Result> {
    let families = desc.sharing.queue_families();
    let create_info = desc.create_info(&families);
    // SAFETY: create_info borrows families, which outlives the call.
    let raw = unsafe { driver.create_buffer(&create_info) }?;
    // SAFETY: raw was just created from driver.
    unsafe { driver.name_object(raw, &desc.name) };
    // SAFETY: raw was just created from driver.
    let requirements = unsafe { driver.buffer_memory_requirements(raw) };
    Ok((raw, requirements))
}

fn create_raw_image<D: ResourceDriver>(
    driver: &D,
    desc: &ImageDesc,
) -> Result<(vk::Image, vk::MemoryRequirements), vk::Result> {
    let families = desc.sharing.queue_families();
    let create_info = desc.create_info(&families);
    // SAFETY: create_info borrows families, which outlives the call.
    let raw = unsafe { driver.create_image(&create_info) }?;
    // SAFETY: raw was just created from driver.
    unsafe { driver.name_object(raw, &desc.name) };
    // SAFETY: raw was just created from driver.
    let requirements = unsafe { driver.image_memory_requirements(raw) };
    Ok((raw, requirements))
}

/// Check that `requirements` can be satisfied by `memory` at `offset`.
pub fn check_binding_fit(
    requirements: &vk::MemoryRequirements,
    memory: &DeviceMemory,
    offset: vk::DeviceSize,
) -> Result<(), BindMemoryError> {
    let type_index = memory.info().memory_type_index;
    let type_bits = requirements.memory_type_bits;
    if type_index >= u32::BITS || type_bits & (1 << type_index) == 0 {
        return Err(BindMemoryError::IncompatibleMemoryType {
            type_index,
            type_bits,
        });
    }
    let alignment = requirements.alignment.max(1);
    let native_offset = memory.offset() + offset;
    if native_offset % alignment != 0 {
        return Err(BindMemoryError::Misaligned {
            offset: native_offset,
            alignment,
        });
    }
    if offset.saturating_add(requirements.size) > memory.size() {
        return Err(BindMemoryError::TooSmall {
            offset,
            required: requirements.size,
            available: memory.size(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// Buffers and images bound to memory from one allocator.
pub struct Resources<D: ResourceDriver, A: MemoryAllocator> {
    driver: Arc<D>,
    allocator: Arc<A>,
    buffers: ResourceTable<Buffer>,
    images: ResourceTable<Image>,
}

impl<D: ResourceDriver, A: MemoryAllocator> std::fmt::Debug
    for Resources<D, A>
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resources")
            .field("buffers", &self.buffers.len())
            .field("images", &self.images.len())
            .finish_non_exhaustive()
    }
}

impl<D: ResourceDriver, A: MemoryAllocator> Resources<D, A> {
    pub fn new(driver: Arc<D>, allocator: Arc<A>) -> Self {
        Self {
            driver,
            allocator,
            buffers: ResourceTable::new(),
            images: ResourceTable::new(),
        }
    }

    pub fn driver(&self) -> &Arc<D> {
        &self.driver
    }

    pub fn allocator(&self) -> &Arc<A> {
        &self.allocator
    }

    pub fn buffer(&self, handle: Handle<Buffer>) -> Option<&Buffer> {
        self.buffers.get(handle)
    }

    pub fn image(&self, handle: Handle<Image>) -> Option<&Image> {
        self.images.get(handle)
    }

    pub(crate) fn image_mut(
        &mut self,
        handle: Handle<Image>,
    ) -> Option<&mut Image> {
        self.images.get_mut(handle)
    }

    pub fn get<R: Bindable>(&self, handle: Handle<R>) -> Option<&R> {
        R::table(self).get(handle)
    }

    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Allocate memory that frees itself if it is never bound.
    pub fn allocate_memory(
        &self,
        request: &MemoryRequest<'_>,
    ) -> Result<ManagedDeviceMemory<A>, AllocateMemoryError> {
        ManagedDeviceMemory::allocate(&self.allocator, request)
    }

    /// Create a buffer and bind it to freshly allocated memory.
    pub fn create_buffer(
        &mut self,
        desc: BufferDesc,
    ) -> Result<Handle<Buffer>, CreateResourceError> {
        if desc.size == 0 {
            return Err(CreateResourceError::ZeroSize);
        }
        let (raw, requirements) = create_raw_buffer(self.driver.as_ref(), &desc)
            .map_err(|result| CreateResourceError::Vulkan {
                call: Buffer::CREATE_CALL,
                result,
            })?;
        tracing::debug!(
            "Created buffer {:?} ({}, {} bytes)",
            raw,
            desc.name,
            desc.size
        );

        let request =
            MemoryRequest::new(&desc.name, requirements, desc.memory_usage());
        let memory = self.allocate_memory(&request);
        let handle = self.buffers.insert(Buffer {
            raw,
            desc: desc.clone(),
            requirements,
            binding: None,
        });
        self.finish_creation(handle, memory)
    }

    /// Create an image and bind it to freshly allocated memory.
    ///
    /// The description and the format's tiling features are checked before
    /// any native object is created.
    pub fn create_image(
        &mut self,
        desc: ImageDesc,
    ) -> Result<Handle<Image>, CreateResourceError> {
        desc.validate()?;
        check_format_support(
            self.driver.as_ref(),
            desc.format,
            desc.tiling,
            desc.required_features(),
        )?;

        let (raw, requirements) = create_raw_image(self.driver.as_ref(), &desc)
            .map_err(|result| CreateResourceError::Vulkan {
                call: Image::CREATE_CALL,
                result,
            })?;
        tracing::debug!(
            "Created image {:?} ({}, {:?} {:?}, {} levels, {} layers)",
            raw,
            desc.name,
            desc.format,
            desc.extent,
            desc.mip_levels,
            desc.array_layers
        );

        let request = MemoryRequest::new(
            &desc.name,
            requirements,
            crate::device::MemoryUsage::GpuOnly,
        )
        .linear(desc.tiling == vk::ImageTiling::LINEAR);
        let memory = self.allocate_memory(&request);
        let handle = self.images.insert(Image::new(raw, desc, requirements));
        self.finish_creation(handle, memory)
    }

    fn finish_creation<R: Bindable>(
        &mut self,
        handle: Handle<R>,
        memory: Result<ManagedDeviceMemory<A>, AllocateMemoryError>,
    ) -> Result<Handle<R>, CreateResourceError> {
        let memory = match memory {
            Ok(memory) => memory,
            Err(e) => {
                self.discard(handle);
                return Err(e.into());
            }
        };
        if let Err(e) = self.bind_memory(handle, memory, 0) {
            self.discard(handle);
            return Err(e.into());
        }
        Ok(handle)
    }

    /// Destroy a resource whose creation failed part way. Returns whether
    /// the slot was still live; a missing slot is logged, since the caller
    /// is already reporting the original failure.
    fn discard<R: Bindable>(&mut self, handle: Handle<R>) -> bool {
        match self.destroy(handle) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(
                    "Failed to clean up partially created {handle:?}: {e}"
                );
                false
            }
        }
    }

    /// Bind `memory` to the resource at `offset`.
    ///
    /// `offset` is relative to the start of `memory`, which may itself sit
    /// at an offset inside a pooled block. On success the binding records
    /// `memory.size()` and `offset`, and any earlier binding is released.
    ///
    /// On failure the resource is left unbound and `memory` is freed.
    pub fn bind_memory<R: Bindable>(
        &mut self,
        handle: Handle<R>,
        memory: ManagedDeviceMemory<A>,
        offset: vk::DeviceSize,
    ) -> Result<(), BindMemoryError> {
        self.bind_with(handle, memory, offset, |driver, raw, mem, off| {
            // SAFETY: raw and mem belong to this table's driver and the
            // offset was validated against the requirements.
            unsafe { R::bind_native(driver, raw, mem, off) }.map_err(|result| {
                BindMemoryError::Vulkan {
                    call: R::BIND_CALL,
                    result,
                }
            })
        })
    }

    /// Device-group variant of [`bind_memory`](Self::bind_memory).
    ///
    /// `device_indices`, when non-empty, holds one memory instance index
    /// per physical device. `split_regions` (images only) gives
    /// `device_count²` rectangles and excludes `device_indices`.
    pub fn bind_memory_device_group<R: Bindable>(
        &mut self,
        handle: Handle<R>,
        memory: ManagedDeviceMemory<A>,
        device_indices: &[u32],
        split_regions: &[vk::Rect2D],
        offset: vk::DeviceSize,
    ) -> Result<(), BindMemoryError> {
        self.driver.capabilities().require(Capability::DeviceGroup)?;
        let count = self.driver.device_count();

        if !device_indices.is_empty() {
            if device_indices.len() != count as usize {
                return Err(BindMemoryError::DeviceIndexCount {
                    expected: count,
                    got: device_indices.len(),
                });
            }
            if let Some(&index) = device_indices.iter().find(|&&i| i >= count)
            {
                return Err(BindMemoryError::DeviceIndexOutOfRange {
                    index,
                    count,
                });
            }
        }
        if !split_regions.is_empty() {
            if !R::SUPPORTS_SPLIT_REGIONS {
                return Err(BindMemoryError::SplitRegionsOnBuffer);
            }
            if !device_indices.is_empty() {
                return Err(BindMemoryError::SplitRegionsWithIndices);
            }
            let expected = count * count;
            if split_regions.len() != expected as usize {
                return Err(BindMemoryError::SplitRegionCount {
                    expected,
                    got: split_regions.len(),
                });
            }
        }

        self.bind_with(handle, memory, offset, |driver, raw, mem, off| {
            // SAFETY: raw and mem belong to this table's driver; indices
            // and regions were validated above.
            unsafe {
                R::bind_native_device_group(
                    driver,
                    raw,
                    mem,
                    off,
                    device_indices,
                    split_regions,
                )
            }
            .map_err(|result| BindMemoryError::Vulkan {
                call: R::BIND2_CALL,
                result,
            })
        })
    }

    fn bind_with<R: Bindable>(
        &mut self,
        handle: Handle<R>,
        memory: ManagedDeviceMemory<A>,
        offset: vk::DeviceSize,
        bind: impl FnOnce(
            &D,
            R::Raw,
            vk::DeviceMemory,
            vk::DeviceSize,
        ) -> Result<(), BindMemoryError>,
    ) -> Result<(), BindMemoryError> {
        let driver = Arc::clone(&self.driver);
        let allocator = Arc::clone(&self.allocator);
        let resource = R::table_mut(self)
            .get_mut(handle)
            .ok_or(StaleHandleError)?;

        check_binding_fit(&resource.requirements(), memory.memory(), offset)?;

        if let Some(previous) = resource.binding_mut().take() {
            // A bound object cannot be bound again; swap in a fresh one.
            // SAFETY: The description was valid when first created.
            let (raw, requirements) =
                match unsafe { resource.create_native(driver.as_ref()) } {
                    Ok(created) => created,
                    Err(e) => {
                        *resource.binding_mut() = Some(previous);
                        return Err(BindMemoryError::Recreate(e));
                    }
                };
            let old = resource.raw();
            // SAFETY: old came from driver; callers guarantee no pending
            // work uses a resource while it is rebound.
            unsafe { R::destroy_native(driver.as_ref(), old) };
            resource.replace_native(raw, requirements);
            tracing::debug!("Recreated {:?} as {:?} for rebinding", old, raw);
            release_memory(allocator.as_ref(), previous.memory);
        }

        let native_offset = memory.memory().offset() + offset;
        bind(
            driver.as_ref(),
            resource.raw(),
            memory.memory().raw_memory(),
            native_offset,
        )?;

        let memory = memory.into_inner();
        let size = memory.size();
        *resource.binding_mut() = Some(MemoryBinding {
            memory,
            offset,
            size,
        });
        Ok(())
    }

    /// Recreate a buffer with `new_size` bytes and bind it again.
    ///
    /// The existing memory is reused when the new requirements still fit at
    /// the same offset; otherwise it is released and a new allocation is
    /// bound at offset zero. Contents are not preserved.
    pub fn realloc(
        &mut self,
        handle: Handle<Buffer>,
        new_size: vk::DeviceSize,
    ) -> Result<(), RecreateError> {
        if new_size == 0 {
            return Err(RecreateError::ZeroSize);
        }
        let driver = Arc::clone(&self.driver);
        let allocator = Arc::clone(&self.allocator);
        let buffer = self.buffers.get_mut(handle).ok_or(StaleHandleError)?;

        let mut desc = buffer.desc.clone();
        desc.size = new_size;
        let (raw, requirements) = create_raw_buffer(driver.as_ref(), &desc)
            .map_err(|result| RecreateError::Vulkan {
                call: Buffer::CREATE_CALL,
                result,
            })?;

        let old = buffer.raw;
        // SAFETY: old came from driver and the caller guarantees it is idle.
        unsafe { driver.destroy_buffer(old) };
        buffer.replace_native(raw, requirements);
        buffer.desc = desc;
        tracing::debug!("Reallocated buffer {:?} -> {:?} ({new_size} bytes)", old, raw);

        let fits = buffer.binding.as_ref().is_some_and(|b| {
            check_binding_fit(&requirements, &b.memory, b.offset).is_ok()
        });
        if fits {
            return rebind_in_place(driver.as_ref(), allocator.as_ref(), buffer);
        }

        if let Some(previous) = buffer.binding.take() {
            release_memory(allocator.as_ref(), previous.memory);
        }
        let request = MemoryRequest::new(
            &buffer.desc.name,
            requirements,
            buffer.desc.memory_usage(),
        );
        let memory = ManagedDeviceMemory::allocate(&allocator, &request)?;
        self.bind_memory(handle, memory, 0)?;
        Ok(())
    }

    /// Recreate the native object with identical parameters after the
    /// allocator moved its memory, and bind it to the same memory and
    /// offset. Image layouts go back to `UNDEFINED`.
    pub fn on_defragment<R: Bindable>(
        &mut self,
        handle: Handle<R>,
    ) -> Result<(), RecreateError> {
        let driver = Arc::clone(&self.driver);
        let allocator = Arc::clone(&self.allocator);
        let resource = R::table_mut(self)
            .get_mut(handle)
            .ok_or(StaleHandleError)?;
        if !resource.is_bound() {
            return Err(RecreateError::NotBound);
        }

        // SAFETY: The description was valid when first created.
        let (raw, requirements) =
            unsafe { resource.create_native(driver.as_ref()) }.map_err(
                |result| RecreateError::Vulkan {
                    call: R::CREATE_CALL,
                    result,
                },
            )?;
        let old = resource.raw();
        // SAFETY: old came from driver and the caller guarantees it is idle.
        unsafe { R::destroy_native(driver.as_ref(), old) };
        resource.replace_native(raw, requirements);
        tracing::debug!("Defragmented {:?} -> {:?}", old, raw);

        rebind_in_place(driver.as_ref(), allocator.as_ref(), resource)
    }

    /// Destroy the native object and release its memory.
    pub fn destroy<R: Bindable>(
        &mut self,
        handle: Handle<R>,
    ) -> Result<(), StaleHandleError> {
        let resource = R::table_mut(self).remove(handle).ok_or(StaleHandleError)?;
        release(self.driver.as_ref(), self.allocator.as_ref(), resource);
        Ok(())
    }

    /// Run `f` over the bytes of a buffer's memory range, flushing
    /// afterwards.
    pub fn map_buffer<T>(
        &mut self,
        handle: Handle<Buffer>,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Result<T, AccessMemoryError> {
        let allocator = Arc::clone(&self.allocator);
        let buffer = self.buffers.get_mut(handle).ok_or(StaleHandleError)?;
        let size = buffer.desc.size as usize;
        let binding = buffer.binding.as_mut().ok_or(AccessMemoryError::NotBound)?;
        let start = binding.offset as usize;
        let result = binding
            .memory
            .with_mapped(allocator.as_ref(), |bytes| f(&mut bytes[start..start + size]))?;
        Ok(result)
    }

    /// Copy a buffer's contents out through a host mapping.
    pub fn read_buffer_memory(
        &mut self,
        handle: Handle<Buffer>,
    ) -> Result<Vec<u8>, AccessMemoryError> {
        let allocator = Arc::clone(&self.allocator);
        let buffer = self.buffers.get_mut(handle).ok_or(StaleHandleError)?;
        let size = buffer.desc.size;
        let binding = buffer.binding.as_mut().ok_or(AccessMemoryError::NotBound)?;
        let offset = binding.offset;
        Ok(binding.memory.read_bytes(allocator.as_ref(), offset, size)?)
    }
}

fn rebind_in_place<D, A, R>(
    driver: &D,
    allocator: &A,
    resource: &mut R,
) -> Result<(), RecreateError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: Bindable,
{
    let raw = resource.raw();
    let Some(binding) = resource.binding_mut() else {
        return Err(RecreateError::NotBound);
    };
    let native_offset = binding.memory.offset() + binding.offset;
    // SAFETY: raw is the freshly created object and the binding passed the
    // fit check when it was made.
    let result = unsafe {
        R::bind_native(driver, raw, binding.memory.raw_memory(), native_offset)
    };
    if let Err(result) = result {
        if let Some(previous) = resource.binding_mut().take() {
            release_memory(allocator, previous.memory);
        }
        return Err(BindMemoryError::Vulkan {
            call: R::BIND_CALL,
            result,
        }
        .into());
    }
    Ok(())
}

fn release_memory<A: MemoryAllocator>(allocator: &A, mut memory: DeviceMemory) {
    memory.unmap(allocator);
    if let Err(e) = allocator.free(memory) {
        tracing::error!("Failed to free resource memory: {e}");
    }
}

fn release<D, A, R>(driver: &D, allocator: &A, mut resource: R)
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: Bindable,
{
    tracing::debug!("Destroying {:?} ({})", resource.raw(), resource.name());
    // SAFETY: The resource was removed from its table, so nothing else can
    // reach the handle; callers guarantee no pending work uses it.
    unsafe { R::destroy_native(driver, resource.raw()) };
    if let Some(binding) = resource.binding_mut().take() {
        release_memory(allocator, binding.memory);
    }
}

impl<D: ResourceDriver, A: MemoryAllocator> Drop for Resources<D, A> {
    fn drop(&mut self) {
        tracing::debug!(
            "Dropping resource tables ({} buffers, {} images)",
            self.buffers.len(),
            self.images.len()
        );
        for buffer in self.buffers.drain() {
            release(self.driver.as_ref(), self.allocator.as_ref(), buffer);
        }
        for image in self.images.drain() {
            release(self.driver.as_ref(), self.allocator.as_ref(), image);
        }
    }
}
