//! In-memory stand-ins for the device, used by unit tests.
//!
//! [`MockDriver`] hands out fake handles and records every create, bind and
//! destroy. [`HostAllocator`] backs each allocation with a boxed byte slice.
//! [`SoftwareRecorder`] executes recorded transfers against both on submit,
//! checking layouts the way validation would.

use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use ash::vk::{self, Handle as _};

use crate::arena::Handle;
use crate::binder::Resources;
use crate::capability::DeviceCapabilities;
use crate::command::RecorderState;
use crate::device::select_memory_type;
use crate::driver::ResourceDriver;
use crate::format::FormatCapabilityQuery;
use crate::instance::VkVersion;
use crate::layout::{self, Extent, ImageDimension};
use crate::memory::{
    AllocateMemoryError, DeviceMemory, FreeMemoryError, MapMemoryError,
    MemoryAllocator, MemoryBlock, MemoryInfo, MemoryRequest,
};
use crate::resource::Image;
use crate::transfer::{BarrierMasks, CommandRecorder};

const BUFFER_ALIGNMENT: vk::DeviceSize = 16;
const IMAGE_ALIGNMENT: vk::DeviceSize = 256;

// ---------------------------------------------------------------------------
// MockDriver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub(crate) struct MockImage {
    pub format: vk::Format,
    pub extent: Extent,
    pub dimension: ImageDimension,
    pub mip_levels: u32,
    pub array_layers: u32,
}

#[derive(Debug, Default)]
struct MockState {
    next_handle: u64,
    buffers: HashMap<u64, vk::DeviceSize>,
    images: HashMap<u64, MockImage>,
    bindings: HashMap<u64, (vk::DeviceMemory, vk::DeviceSize)>,
    device_groups: HashMap<u64, Vec<u32>>,
    restricted: HashMap<vk::Format, vk::FormatFeatureFlags>,
    fail_next_bind: Option<vk::Result>,
    create_buffer_calls: usize,
    create_image_calls: usize,
    destroyed: usize,
}

impl MockState {
    fn handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn bind(
        &mut self,
        raw: u64,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        if let Some(result) = self.fail_next_bind.take() {
            return Err(result);
        }
        self.bindings.insert(raw, (memory, offset));
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct MockDriver {
    capabilities: DeviceCapabilities,
    device_count: u32,
    state: Mutex<MockState>,
}

impl MockDriver {
    /// A single Vulkan 1.0 device with no extensions.
    pub fn new() -> Self {
        Self {
            capabilities: DeviceCapabilities::resolve(
                VkVersion::new(0, 1, 0, 0),
                &[],
            ),
            device_count: 1,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_device_group(
        mut self,
        capabilities: DeviceCapabilities,
        device_count: u32,
    ) -> Self {
        self.capabilities = capabilities;
        self.device_count = device_count;
        self
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Only report `features` for `format`, in every tiling.
    pub fn restrict_format(
        &self,
        format: vk::Format,
        features: vk::FormatFeatureFlags,
    ) {
        self.state().restricted.insert(format, features);
    }

    /// Fail the next bind call of any kind with `result`.
    pub fn fail_next_bind(&self, result: vk::Result) {
        self.state().fail_next_bind = Some(result);
    }

    pub fn bound_memory(
        &self,
        raw: u64,
    ) -> Option<(vk::DeviceMemory, vk::DeviceSize)> {
        self.state().bindings.get(&raw).copied()
    }

    pub fn device_group_indices(&self, raw: u64) -> Option<Vec<u32>> {
        self.state().device_groups.get(&raw).cloned()
    }

    pub fn image_info(&self, raw: u64) -> Option<MockImage> {
        self.state().images.get(&raw).copied()
    }

    pub fn create_buffer_calls(&self) -> usize {
        self.state().create_buffer_calls
    }

    pub fn create_image_calls(&self) -> usize {
        self.state().create_image_calls
    }

    pub fn destroyed_count(&self) -> usize {
        self.state().destroyed
    }
}

/// Device indices from a `VkBind*MemoryDeviceGroupInfo` in `p_next`.
///
/// # Safety
/// `p_next` must be a valid structure chain.
unsafe fn device_indices_in_chain(
    mut p_next: *const std::ffi::c_void,
) -> Option<Vec<u32>> {
    while !p_next.is_null() {
        // SAFETY: Every chained structure starts with sType and pNext.
        let base = unsafe { &*p_next.cast::<vk::BaseInStructure<'_>>() };
        let indices = match base.s_type {
            vk::StructureType::BIND_BUFFER_MEMORY_DEVICE_GROUP_INFO => {
                // SAFETY: sType identifies the structure.
                let info = unsafe {
                    &*p_next.cast::<vk::BindBufferMemoryDeviceGroupInfo<'_>>()
                };
                Some((info.p_device_indices, info.device_index_count))
            }
            vk::StructureType::BIND_IMAGE_MEMORY_DEVICE_GROUP_INFO => {
                // SAFETY: sType identifies the structure.
                let info = unsafe {
                    &*p_next.cast::<vk::BindImageMemoryDeviceGroupInfo<'_>>()
                };
                Some((info.p_device_indices, info.device_index_count))
            }
            _ => None,
        };
        if let Some((ptr, count)) = indices {
            if count == 0 {
                return Some(Vec::new());
            }
            // SAFETY: The structure points at `count` indices.
            return Some(unsafe {
                std::slice::from_raw_parts(ptr, count as usize).to_vec()
            });
        }
        p_next = base.p_next.cast();
    }
    None
}

impl FormatCapabilityQuery for MockDriver {
    fn format_features(
        &self,
        format: vk::Format,
        _tiling: vk::ImageTiling,
    ) -> vk::FormatFeatureFlags {
        use vk::FormatFeatureFlags as F;
        self.state().restricted.get(&format).copied().unwrap_or(
            F::SAMPLED_IMAGE
                | F::SAMPLED_IMAGE_FILTER_LINEAR
                | F::STORAGE_IMAGE
                | F::COLOR_ATTACHMENT
                | F::DEPTH_STENCIL_ATTACHMENT
                | F::BLIT_SRC
                | F::BLIT_DST
                | F::TRANSFER_SRC
                | F::TRANSFER_DST,
        )
    }
}

impl ResourceDriver for MockDriver {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn device_count(&self) -> u32 {
        self.device_count
    }

    unsafe fn create_buffer(
        &self,
        create_info: &vk::BufferCreateInfo<'_>,
    ) -> Result<vk::Buffer, vk::Result> {
        let mut state = self.state();
        state.create_buffer_calls += 1;
        let raw = state.handle();
        state.buffers.insert(raw, create_info.size);
        Ok(vk::Buffer::from_raw(raw))
    }

    unsafe fn destroy_buffer(&self, buffer: vk::Buffer) {
        let mut state = self.state();
        state.buffers.remove(&buffer.as_raw());
        state.bindings.remove(&buffer.as_raw());
        state.destroyed += 1;
    }

    unsafe fn buffer_memory_requirements(
        &self,
        buffer: vk::Buffer,
    ) -> vk::MemoryRequirements {
        let size = self.state().buffers.get(&buffer.as_raw()).copied();
        vk::MemoryRequirements {
            size: layout::align_up(size.unwrap_or(0), BUFFER_ALIGNMENT),
            alignment: BUFFER_ALIGNMENT,
            memory_type_bits: !0,
        }
    }

    unsafe fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.state().bind(buffer.as_raw(), memory, offset)
    }

    unsafe fn bind_buffer_memory2(
        &self,
        bind_infos: &[vk::BindBufferMemoryInfo<'_>],
    ) -> Result<(), vk::Result> {
        let mut state = self.state();
        for info in bind_infos {
            let raw = info.buffer.as_raw();
            state.bind(raw, info.memory, info.memory_offset)?;
            // SAFETY: Caller guarantees a valid chain.
            if let Some(indices) = unsafe { device_indices_in_chain(info.p_next) } {
                state.device_groups.insert(raw, indices);
            }
        }
        Ok(())
    }

    unsafe fn create_image(
        &self,
        create_info: &vk::ImageCreateInfo<'_>,
    ) -> Result<vk::Image, vk::Result> {
        let dimension = match create_info.image_type {
            vk::ImageType::TYPE_1D => ImageDimension::D1,
            vk::ImageType::TYPE_3D => ImageDimension::D3,
            _ => ImageDimension::D2,
        };
        let mut state = self.state();
        state.create_image_calls += 1;
        let raw = state.handle();
        state.images.insert(
            raw,
            MockImage {
                format: create_info.format,
                extent: create_info.extent.into(),
                dimension,
                mip_levels: create_info.mip_levels,
                array_layers: create_info.array_layers,
            },
        );
        Ok(vk::Image::from_raw(raw))
    }

    unsafe fn destroy_image(&self, image: vk::Image) {
        let mut state = self.state();
        state.images.remove(&image.as_raw());
        state.bindings.remove(&image.as_raw());
        state.destroyed += 1;
    }

    unsafe fn image_memory_requirements(
        &self,
        image: vk::Image,
    ) -> vk::MemoryRequirements {
        let size = self.image_info(image.as_raw()).and_then(|info| {
            layout::image_layout(
                info.extent,
                info.dimension,
                info.format,
                info.mip_levels,
                info.array_layers,
                1,
            )
            .ok()
        });
        vk::MemoryRequirements {
            size: layout::align_up(
                size.map_or(IMAGE_ALIGNMENT, |l| l.total_size),
                IMAGE_ALIGNMENT,
            ),
            alignment: IMAGE_ALIGNMENT,
            memory_type_bits: !0,
        }
    }

    unsafe fn bind_image_memory(
        &self,
        image: vk::Image,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.state().bind(image.as_raw(), memory, offset)
    }

    unsafe fn bind_image_memory2(
        &self,
        bind_infos: &[vk::BindImageMemoryInfo<'_>],
    ) -> Result<(), vk::Result> {
        let mut state = self.state();
        for info in bind_infos {
            let raw = info.image.as_raw();
            state.bind(raw, info.memory, info.memory_offset)?;
            // SAFETY: Caller guarantees a valid chain.
            if let Some(indices) = unsafe { device_indices_in_chain(info.p_next) } {
                state.device_groups.insert(raw, indices);
            }
        }
        Ok(())
    }

    unsafe fn name_object<H: vk::Handle + Copy>(&self, _object: H, _name: &str) {}
}

// ---------------------------------------------------------------------------
// HostAllocator
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct HostState {
    next_id: u64,
    blocks: HashMap<u64, Box<[u8]>>,
    fail_next_map: bool,
    fail_next_allocate: bool,
    unmap_calls: usize,
    flushed: Vec<(vk::DeviceSize, vk::DeviceSize)>,
}

/// Allocates from host memory, with one device-local, one coherent and one
/// coherent cached memory type.
#[derive(Debug)]
pub(crate) struct HostAllocator {
    types: [vk::MemoryType; 3],
    state: Mutex<HostState>,
}

impl HostAllocator {
    pub fn new() -> Self {
        use vk::MemoryPropertyFlags as F;
        let ty = |property_flags| vk::MemoryType {
            property_flags,
            heap_index: 0,
        };
        Self {
            types: [
                ty(F::DEVICE_LOCAL),
                ty(F::HOST_VISIBLE | F::HOST_COHERENT),
                ty(F::HOST_VISIBLE | F::HOST_COHERENT | F::HOST_CACHED),
            ],
            state: Mutex::new(HostState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn fail_next_map(&self) {
        self.state().fail_next_map = true;
    }

    pub fn fail_next_allocate(&self) {
        self.state().fail_next_allocate = true;
    }

    pub fn unmap_calls(&self) -> usize {
        self.state().unmap_calls
    }

    /// `(offset, size)` of every flush and invalidate, in call order.
    pub fn flushed_ranges(&self) -> Vec<(vk::DeviceSize, vk::DeviceSize)> {
        self.state().flushed.clone()
    }

    pub fn live_allocations(&self) -> usize {
        self.state().blocks.len()
    }

    /// Run `f` over the backing bytes of `memory`, if it is still live.
    pub fn with_block<T>(
        &self,
        memory: vk::DeviceMemory,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Option<T> {
        self.state().blocks.get_mut(&memory.as_raw()).map(|b| f(b))
    }
}

impl MemoryAllocator for HostAllocator {
    fn allocate(
        &self,
        request: &MemoryRequest<'_>,
    ) -> Result<DeviceMemory, AllocateMemoryError> {
        let requirements = request.requirements;
        let index = select_memory_type(
            &self.types,
            requirements.memory_type_bits,
            request.usage,
            request.required_flags,
        )
        .ok_or(AllocateMemoryError::NoCompatibleMemoryType {
            type_bits: requirements.memory_type_bits,
            required: request.required_flags,
        })?;

        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_allocate) {
            return Err(AllocateMemoryError::Vulkan(
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ));
        }
        state.next_id += 1;
        let id = state.next_id;
        state
            .blocks
            .insert(id, vec![0; requirements.size as usize].into_boxed_slice());

        Ok(DeviceMemory::new(
            MemoryInfo {
                raw: vk::DeviceMemory::from_raw(id),
                offset: 0,
                size: requirements.size,
                block_size: Some(requirements.size),
                alignment: requirements.alignment,
                memory_type_bits: requirements.memory_type_bits,
                memory_type_index: index,
                property_flags: self.types[index as usize].property_flags,
                priority: request.priority,
            },
            MemoryBlock::External(id),
        ))
    }

    fn free(&self, memory: DeviceMemory) -> Result<(), FreeMemoryError> {
        let (_, block) = memory.into_block();
        let MemoryBlock::External(id) = block else {
            return Err(FreeMemoryError::ForeignMemory);
        };
        self.state()
            .blocks
            .remove(&id)
            .map(drop)
            .ok_or(FreeMemoryError::ForeignMemory)
    }

    fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        64
    }

    unsafe fn map_raw(
        &self,
        memory: &DeviceMemory,
    ) -> Result<NonNull<u8>, MapMemoryError> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_map) {
            return Err(MapMemoryError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED));
        }
        state
            .blocks
            .get_mut(&memory.raw_memory().as_raw())
            .and_then(|block| NonNull::new(block.as_mut_ptr()))
            .ok_or(MapMemoryError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))
    }

    unsafe fn unmap_raw(&self, _memory: &DeviceMemory) {
        self.state().unmap_calls += 1;
    }

    unsafe fn flush_raw(
        &self,
        _memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.state().flushed.push((offset, size));
        Ok(())
    }

    unsafe fn invalidate_raw(
        &self,
        _memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        self.state().flushed.push((offset, size));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SoftwareRecorder
// ---------------------------------------------------------------------------

/// An owned copy of one recorded command.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    ImageBarrier {
        image: vk::Image,
        range: vk::ImageSubresourceRange,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
        masks: BarrierMasks,
        /// `(src, dst)` queue family indices.
        families: (u32, u32),
    },
    BufferBarrier {
        buffer: vk::Buffer,
        src_stage: vk::PipelineStageFlags2,
        src_access: vk::AccessFlags2,
        dst_stage: vk::PipelineStageFlags2,
        dst_access: vk::AccessFlags2,
        families: (u32, u32),
    },
    CopyBufferToImage {
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyBuffer {
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
}

type Subresource = (u64, u32, u32);

/// Executes transfers on submit against [`MockDriver`] objects and
/// [`HostAllocator`] memory.
///
/// Copies must cover whole, tightly packed subresources. Contents of a
/// subresource are discarded when it is transitioned out of `UNDEFINED`.
pub(crate) struct SoftwareRecorder {
    driver: Arc<MockDriver>,
    allocator: Arc<HostAllocator>,
    state: RecorderState,
    commands: Vec<Command>,
    layouts: HashMap<Subresource, vk::ImageLayout>,
    contents: HashMap<Subresource, Vec<u8>>,
    submissions: usize,
    fail_next_submit: Option<vk::Result>,
    queue_family: u32,
    queue_flags: vk::QueueFlags,
}

impl Command {
    /// Stage masks of a barrier, `None` for copies.
    pub fn stages(&self) -> Option<vk::PipelineStageFlags2> {
        match self {
            Command::ImageBarrier { masks, .. } => {
                Some(masks.src_stage | masks.dst_stage)
            }
            Command::BufferBarrier {
                src_stage,
                dst_stage,
                ..
            } => Some(*src_stage | *dst_stage),
            _ => None,
        }
    }
}

impl SoftwareRecorder {
    pub fn new(driver: Arc<MockDriver>, allocator: Arc<HostAllocator>) -> Self {
        Self {
            driver,
            allocator,
            state: RecorderState::Initial,
            commands: Vec::new(),
            layouts: HashMap::new(),
            contents: HashMap::new(),
            submissions: 0,
            fail_next_submit: None,
            queue_family: 0,
            queue_flags: vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::COMPUTE
                | vk::QueueFlags::TRANSFER,
        }
    }

    /// Record as if on queue family `family` with capabilities `flags`.
    pub fn on_queue(mut self, family: u32, flags: vk::QueueFlags) -> Self {
        self.queue_family = family;
        self.queue_flags = flags;
        self
    }

    /// Commands of the current or most recent recording.
    pub fn recorded(&self) -> Vec<Command> {
        self.commands.clone()
    }

    pub fn submissions(&self) -> usize {
        self.submissions
    }

    pub fn fail_next_submit(&mut self, result: vk::Result) {
        self.fail_next_submit = Some(result);
    }

    /// Executed contents of one subresource of `image`.
    pub fn image_bytes<D, A>(
        &self,
        resources: &Resources<D, A>,
        image: Handle<Image>,
        level: u32,
        layer: u32,
    ) -> Option<Vec<u8>>
    where
        D: ResourceDriver,
        A: MemoryAllocator,
    {
        let raw = resources.image(image)?.raw_image().as_raw();
        self.contents.get(&(raw, level, layer)).cloned()
    }

    fn buffer_bytes(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<Vec<u8>, vk::Result> {
        let (memory, base) = self
            .driver
            .bound_memory(buffer.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        let start = (base + offset) as usize;
        self.allocator
            .with_block(memory, |block| {
                block.get(start..start + size as usize).map(<[u8]>::to_vec)
            })
            .flatten()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)
    }

    fn write_buffer(
        &self,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        data: &[u8],
    ) -> Result<(), vk::Result> {
        let (memory, base) = self
            .driver
            .bound_memory(buffer.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        let start = (base + offset) as usize;
        self.allocator
            .with_block(memory, |block| {
                block
                    .get_mut(start..start + data.len())
                    .map(|dst| dst.copy_from_slice(data))
            })
            .flatten()
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)
    }

    fn layout_of(&self, key: Subresource) -> vk::ImageLayout {
        self.layouts
            .get(&key)
            .copied()
            .unwrap_or(vk::ImageLayout::UNDEFINED)
    }

    /// Subresources of `region` with their packed byte size.
    fn region_subresources(
        &self,
        image: vk::Image,
        layout: vk::ImageLayout,
        region: &vk::BufferImageCopy,
    ) -> Result<(Vec<Subresource>, vk::DeviceSize), vk::Result> {
        let info = self
            .driver
            .image_info(image.as_raw())
            .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
        let sub = region.image_subresource;
        let extent = layout::calculate_mip_extent(
            info.extent,
            info.dimension,
            sub.mip_level,
            info.mip_levels,
            info.format,
        );
        let requested = layout::format_info(info.format)
            .ok_or(vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?
            .round_to_blocks(region.image_extent.into());
        let offset = region.image_offset;
        let tight_rows = region.buffer_row_length == 0
            || region.buffer_row_length == region.image_extent.width;
        let tight_slices = region.buffer_image_height == 0
            || region.buffer_image_height == region.image_extent.height;
        let whole = (offset.x, offset.y, offset.z) == (0, 0, 0)
            && requested == extent
            && tight_rows
            && tight_slices;
        if !whole {
            return Err(vk::Result::ERROR_FEATURE_NOT_PRESENT);
        }
        let size = layout::mip_byte_size(extent, info.format)
            .map_err(|_| vk::Result::ERROR_FORMAT_NOT_SUPPORTED)?;

        let keys = (sub.base_array_layer..sub.base_array_layer + sub.layer_count)
            .map(|layer| (image.as_raw(), sub.mip_level, layer))
            .collect::<Vec<_>>();
        if keys.iter().any(|&key| self.layout_of(key) != layout) {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        Ok((keys, size))
    }

    fn execute(&mut self, command: &Command) -> Result<(), vk::Result> {
        match command {
            Command::ImageBarrier {
                image,
                range,
                old,
                new,
                ..
            } => {
                let info = self
                    .driver
                    .image_info(image.as_raw())
                    .ok_or(vk::Result::ERROR_VALIDATION_FAILED_EXT)?;
                let level_end = if range.level_count == vk::REMAINING_MIP_LEVELS {
                    info.mip_levels
                } else {
                    range.base_mip_level + range.level_count
                };
                let layer_end =
                    if range.layer_count == vk::REMAINING_ARRAY_LAYERS {
                        info.array_layers
                    } else {
                        range.base_array_layer + range.layer_count
                    };
                for layer in range.base_array_layer..layer_end {
                    for level in range.base_mip_level..level_end {
                        let key = (image.as_raw(), level, layer);
                        if *old == vk::ImageLayout::UNDEFINED {
                            self.contents.remove(&key);
                        } else if self.layout_of(key) != *old {
                            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
                        }
                        self.layouts.insert(key, *new);
                    }
                }
            }
            Command::BufferBarrier { .. } => {}
            Command::CopyBufferToImage {
                src,
                dst,
                layout,
                regions,
            } => {
                for region in regions {
                    let (keys, size) =
                        self.region_subresources(*dst, *layout, region)?;
                    for (i, key) in keys.into_iter().enumerate() {
                        let offset = region.buffer_offset + i as u64 * size;
                        let bytes = self.buffer_bytes(*src, offset, size)?;
                        self.contents.insert(key, bytes);
                    }
                }
            }
            Command::CopyImageToBuffer {
                src,
                layout,
                dst,
                regions,
            } => {
                for region in regions {
                    let (keys, size) =
                        self.region_subresources(*src, *layout, region)?;
                    for (i, key) in keys.into_iter().enumerate() {
                        let offset = region.buffer_offset + i as u64 * size;
                        let bytes = self
                            .contents
                            .get(&key)
                            .cloned()
                            .unwrap_or_else(|| vec![0; size as usize]);
                        self.write_buffer(*dst, offset, &bytes)?;
                    }
                }
            }
            Command::CopyBuffer { src, dst, regions } => {
                for region in regions {
                    let bytes =
                        self.buffer_bytes(*src, region.src_offset, region.size)?;
                    self.write_buffer(*dst, region.dst_offset, &bytes)?;
                }
            }
        }
        Ok(())
    }
}

/// # Safety
/// `ptr` addresses `count` values whenever `count` is non-zero.
unsafe fn owned<T: Copy>(ptr: *const T, count: u32) -> Vec<T> {
    if count == 0 {
        return Vec::new();
    }
    // SAFETY: Forwarded caller contract.
    unsafe { std::slice::from_raw_parts(ptr, count as usize) }.to_vec()
}

impl CommandRecorder for SoftwareRecorder {
    fn queue_family_index(&self) -> u32 {
        self.queue_family
    }

    fn queue_flags(&self) -> vk::QueueFlags {
        self.queue_flags
    }

    fn begin_recording(&mut self) -> Result<(), vk::Result> {
        if self.state == RecorderState::Pending {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        self.commands.clear();
        self.state = RecorderState::Recording;
        Ok(())
    }

    fn end_recording(&mut self) -> Result<(), vk::Result> {
        if self.state != RecorderState::Recording {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        self.state = RecorderState::Executable;
        Ok(())
    }

    unsafe fn pipeline_barrier(
        &mut self,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        // SAFETY: The arrays in dependency_info are valid for their counts.
        let images = unsafe {
            owned(
                dependency_info.p_image_memory_barriers,
                dependency_info.image_memory_barrier_count,
            )
        };
        // SAFETY: As above.
        let buffers = unsafe {
            owned(
                dependency_info.p_buffer_memory_barriers,
                dependency_info.buffer_memory_barrier_count,
            )
        };
        self.commands.extend(images.iter().map(|b| Command::ImageBarrier {
            image: b.image,
            range: b.subresource_range,
            old: b.old_layout,
            new: b.new_layout,
            masks: BarrierMasks {
                src_stage: b.src_stage_mask,
                src_access: b.src_access_mask,
                dst_stage: b.dst_stage_mask,
                dst_access: b.dst_access_mask,
            },
            families: (b.src_queue_family_index, b.dst_queue_family_index),
        }));
        self.commands
            .extend(buffers.iter().map(|b| Command::BufferBarrier {
                buffer: b.buffer,
                src_stage: b.src_stage_mask,
                src_access: b.src_access_mask,
                dst_stage: b.dst_stage_mask,
                dst_access: b.dst_access_mask,
                families: (b.src_queue_family_index, b.dst_queue_family_index),
            }));
    }

    unsafe fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(Command::CopyBufferToImage {
            src,
            dst,
            layout: dst_layout,
            regions: regions.to_vec(),
        });
    }

    unsafe fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(Command::CopyImageToBuffer {
            src,
            layout: src_layout,
            dst,
            regions: regions.to_vec(),
        });
    }

    unsafe fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.commands.push(Command::CopyBuffer {
            src,
            dst,
            regions: regions.to_vec(),
        });
    }

    fn submit_and_wait(&mut self) -> Result<(), vk::Result> {
        if self.state != RecorderState::Executable {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        if let Some(result) = self.fail_next_submit.take() {
            return Err(result);
        }
        let commands = std::mem::take(&mut self.commands);
        let executed = commands.iter().try_for_each(|c| self.execute(c));
        self.commands = commands;
        self.state = RecorderState::Initial;
        executed?;
        self.submissions += 1;
        Ok(())
    }
}
