//! Device memory and the allocators that hand it out.
//!
//! A [`DeviceMemory`] is one contiguous range of a native `VkDeviceMemory`
//! object. It may cover the whole native allocation (see
//! [`DedicatedAllocator`]) or a sub-range of a larger pool block (see
//! [`PooledAllocator`], backed by `gpu-allocator`).
//!
//! Mapping never nests: mapping an already mapped range is an error rather
//! than a silent pointer overwrite, and unmapping an unmapped range does
//! nothing.

use std::ptr::NonNull;
use std::sync::{Arc, Weak};

use ash::vk;
use bytemuck::Pod;
use gpu_allocator::{AllocationError, vulkan::Allocation};
use thiserror::Error;

use crate::device::{Device, MemoryUsage, select_memory_type};

/// Default `VkMemoryPriorityAllocateInfoEXT::priority`.
pub const DEFAULT_MEMORY_PRIORITY: f32 = 0.5;

#[derive(Debug, Error)]
pub enum AllocateMemoryError {
    #[error(
        "No memory type matches type bits {type_bits:#b} with flags \
         {required:?}"
    )]
    NoCompatibleMemoryType {
        type_bits: u32,
        required: vk::MemoryPropertyFlags,
    },

    #[error("GPU allocator error allocating memory: {0}")]
    Pool(AllocationError),

    #[error("Vulkan error allocating memory: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum FreeMemoryError {
    #[error("GPU allocator error freeing memory: {0}")]
    Pool(AllocationError),

    #[error("Memory was not allocated by this allocator")]
    ForeignMemory,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapMemoryError {
    #[error("Memory is already mapped")]
    AlreadyMapped,

    #[error("Memory is not host visible")]
    NotHostVisible,

    #[error("Vulkan error mapping memory: {0}")]
    Vulkan(vk::Result),

    #[error("Vulkan error flushing or invalidating mapped memory: {0}")]
    Flush(vk::Result),

    #[error(
        "Range (offset={offset}, size={size}) exceeds memory of {capacity} \
         bytes"
    )]
    OutOfBounds {
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
        capacity: vk::DeviceSize,
    },
}

/// Allocator-specific bookkeeping carried by a [`DeviceMemory`].
pub enum MemoryBlock {
    /// Sub-allocated from a `gpu-allocator` pool.
    Pooled(Allocation),
    /// A whole `VkDeviceMemory` object.
    Dedicated,
    /// Owned by some other allocator, identified by an opaque id.
    External(u64),
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryBlock::Pooled(_) => f.write_str("Pooled"),
            MemoryBlock::Dedicated => f.write_str("Dedicated"),
            MemoryBlock::External(id) => write!(f, "External({id})"),
        }
    }
}

/// Static facts about a memory range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryInfo {
    pub raw: vk::DeviceMemory,
    /// Start of this range inside `raw`.
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// Size of the whole `raw` object, when the allocator knows it.
    pub block_size: Option<vk::DeviceSize>,
    pub alignment: vk::DeviceSize,
    pub memory_type_bits: u32,
    pub memory_type_index: u32,
    pub property_flags: vk::MemoryPropertyFlags,
    pub priority: f32,
}

/// A range of native device memory.
pub struct DeviceMemory {
    info: MemoryInfo,
    mapped: Option<NonNull<u8>>,
    block: MemoryBlock,
}

// SAFETY: The mapped pointer is only dereferenced through &mut self, and the
// native memory object it points into is not tied to any thread.
unsafe impl Send for DeviceMemory {}
// SAFETY: Shared references never touch the mapped pointer.
unsafe impl Sync for DeviceMemory {}

impl std::fmt::Debug for DeviceMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceMemory")
            .field("raw", &self.info.raw)
            .field("offset", &self.info.offset)
            .field("size", &self.info.size)
            .field("mapped", &self.mapped.is_some())
            .field("block", &self.block)
            .finish_non_exhaustive()
    }
}

impl DeviceMemory {
    /// Wrap a freshly allocated range. Allocators call this.
    pub fn new(info: MemoryInfo, block: MemoryBlock) -> Self {
        Self {
            info,
            mapped: None,
            block,
        }
    }

    pub fn info(&self) -> &MemoryInfo {
        &self.info
    }

    pub fn raw_memory(&self) -> vk::DeviceMemory {
        self.info.raw
    }

    /// Offset of this range inside [`raw_memory`](Self::raw_memory).
    pub fn offset(&self) -> vk::DeviceSize {
        self.info.offset
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.info.size
    }

    pub fn alignment(&self) -> vk::DeviceSize {
        self.info.alignment
    }

    pub fn memory_type_bits(&self) -> u32 {
        self.info.memory_type_bits
    }

    pub fn priority(&self) -> f32 {
        self.info.priority
    }

    pub fn property_flags(&self) -> vk::MemoryPropertyFlags {
        self.info.property_flags
    }

    pub fn block(&self) -> &MemoryBlock {
        &self.block
    }

    pub fn into_block(self) -> (MemoryInfo, MemoryBlock) {
        (self.info, self.block)
    }

    pub fn is_host_visible(&self) -> bool {
        self.info
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self) -> bool {
        self.info
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Mapped pointer, `None` when unmapped.
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.mapped
    }

    /// Map the whole range.
    pub fn map<A>(&mut self, allocator: &A) -> Result<NonNull<u8>, MapMemoryError>
    where
        A: MemoryAllocator + ?Sized,
    {
        if self.mapped.is_some() {
            return Err(MapMemoryError::AlreadyMapped);
        }
        if !self.is_host_visible() {
            return Err(MapMemoryError::NotHostVisible);
        }
        // SAFETY: self was produced by allocator (caller contract of the
        // allocator pairing) and is not currently mapped.
        let ptr = unsafe { allocator.map_raw(self) }?;
        self.mapped = Some(ptr);
        Ok(ptr)
    }

    /// Unmap; a no-op when not mapped.
    pub fn unmap<A>(&mut self, allocator: &A)
    where
        A: MemoryAllocator + ?Sized,
    {
        if self.mapped.take().is_some() {
            // SAFETY: The range was mapped through this allocator.
            unsafe { allocator.unmap_raw(self) };
        }
    }

    /// Mapped bytes, `None` when unmapped.
    pub fn mapped_slice_mut(&mut self) -> Option<&mut [u8]> {
        let ptr = self.mapped?;
        // SAFETY: While mapped, ptr addresses `size` host-visible bytes that
        // only this object hands out, and &mut self prevents aliasing.
        Some(unsafe {
            std::slice::from_raw_parts_mut(ptr.as_ptr(), self.info.size as usize)
        })
    }

    /// Widen `offset..offset + size` to whole atoms of the native object.
    ///
    /// The rounded end may run into a neighbouring sub-allocation, which is
    /// harmless. When it would pass the end of `raw` (or could, because the
    /// object size is unknown) the length becomes `VK_WHOLE_SIZE`, which
    /// flushes to the end of the mapping.
    fn atom_range(
        &self,
        atom: vk::DeviceSize,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> (vk::DeviceSize, vk::DeviceSize) {
        let atom = atom.max(1);
        let begin = self.info.offset + offset;
        let start = begin - begin % atom;
        let end = (begin + size).div_ceil(atom) * atom;
        let fits = match self.info.block_size {
            Some(block) => end <= block,
            None => end <= self.info.offset + self.info.size,
        };
        if fits {
            (start, end - start)
        } else {
            (start, vk::WHOLE_SIZE)
        }
    }

    /// Make host writes to `offset..offset + size` visible to the device.
    ///
    /// Coherent memory needs no flush and returns immediately.
    pub fn flush<A>(
        &self,
        allocator: &A,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), MapMemoryError>
    where
        A: MemoryAllocator + ?Sized,
    {
        if self.is_host_coherent() || size == 0 {
            return Ok(());
        }
        self.check_range(offset, size)?;
        let (start, len) =
            self.atom_range(allocator.non_coherent_atom_size(), offset, size);
        // SAFETY: The range is mapped (non-coherent memory is only flushed
        // while mapped) and ends on an atom or at the end of the mapping.
        unsafe { allocator.flush_raw(self, start, len) }
            .map_err(MapMemoryError::Flush)
    }

    /// Make device writes to `offset..offset + size` visible to the host.
    pub fn invalidate<A>(
        &self,
        allocator: &A,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), MapMemoryError>
    where
        A: MemoryAllocator + ?Sized,
    {
        if self.is_host_coherent() || size == 0 {
            return Ok(());
        }
        self.check_range(offset, size)?;
        let (start, len) =
            self.atom_range(allocator.non_coherent_atom_size(), offset, size);
        // SAFETY: Same as flush.
        unsafe { allocator.invalidate_raw(self, start, len) }
            .map_err(MapMemoryError::Flush)
    }

    fn check_range(
        &self,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), MapMemoryError> {
        if offset.saturating_add(size) > self.info.size {
            return Err(MapMemoryError::OutOfBounds {
                offset,
                size,
                capacity: self.info.size,
            });
        }
        Ok(())
    }

    /// Map, run `f` over the mapped bytes, flush, then unmap.
    ///
    /// A failed map is returned as an error and `f` does not run.
    pub fn with_mapped<A, R>(
        &mut self,
        allocator: &A,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R, MapMemoryError>
    where
        A: MemoryAllocator + ?Sized,
    {
        self.map(allocator)?;
        let result = match self.mapped_slice_mut() {
            Some(bytes) => f(bytes),
            None => {
                self.unmap(allocator);
                return Err(MapMemoryError::NotHostVisible);
            }
        };
        let flushed = self.flush(allocator, 0, self.info.size);
        self.unmap(allocator);
        flushed.map(|()| result)
    }

    /// Copy `data` into the range at `offset`, mapping around the write.
    pub fn write_pod<A, T>(
        &mut self,
        allocator: &A,
        offset: vk::DeviceSize,
        data: &[T],
    ) -> Result<(), MapMemoryError>
    where
        A: MemoryAllocator + ?Sized,
        T: Pod,
    {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        self.check_range(offset, bytes.len() as vk::DeviceSize)?;
        self.with_mapped(allocator, |mapped| {
            let start = offset as usize;
            mapped[start..start + bytes.len()].copy_from_slice(bytes);
        })
    }

    /// Copy `len` bytes starting at `offset` out of the range.
    pub fn read_bytes<A>(
        &mut self,
        allocator: &A,
        offset: vk::DeviceSize,
        len: vk::DeviceSize,
    ) -> Result<Vec<u8>, MapMemoryError>
    where
        A: MemoryAllocator + ?Sized,
    {
        self.check_range(offset, len)?;
        self.map(allocator)?;
        let invalidated = self.invalidate(allocator, offset, len);
        let out = self.mapped_slice_mut().map(|mapped| {
            let start = offset as usize;
            mapped[start..start + len as usize].to_vec()
        });
        self.unmap(allocator);
        invalidated?;
        out.ok_or(MapMemoryError::NotHostVisible)
    }
}

/// What an allocation is for.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRequest<'a> {
    pub name: &'a str,
    pub requirements: vk::MemoryRequirements,
    pub usage: MemoryUsage,
    /// Flags the chosen memory type must have, on top of `usage` scoring.
    pub required_flags: vk::MemoryPropertyFlags,
    pub linear: bool,
    pub priority: f32,
    /// Physical devices of a device group the allocation is made on.
    pub device_mask: Option<u32>,
}

impl<'a> MemoryRequest<'a> {
    pub fn new(
        name: &'a str,
        requirements: vk::MemoryRequirements,
        usage: MemoryUsage,
    ) -> Self {
        let required_flags = match usage {
            MemoryUsage::GpuOnly => vk::MemoryPropertyFlags::empty(),
            MemoryUsage::CpuToGpu | MemoryUsage::GpuToCpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE
            }
        };
        Self {
            name,
            requirements,
            usage,
            required_flags,
            linear: true,
            priority: DEFAULT_MEMORY_PRIORITY,
            device_mask: None,
        }
    }

    pub fn linear(mut self, linear: bool) -> Self {
        self.linear = linear;
        self
    }

    pub fn priority(mut self, priority: f32) -> Self {
        self.priority = priority.clamp(0.0, 1.0);
        self
    }

    pub fn required_flags(mut self, flags: vk::MemoryPropertyFlags) -> Self {
        self.required_flags |= flags;
        self
    }

    pub fn device_mask(mut self, mask: u32) -> Self {
        self.device_mask = Some(mask);
        self
    }
}

/// Hands out and reclaims [`DeviceMemory`].
///
/// Implementations may be a trivial one-allocation-per-request allocator
/// or a pooling sub-allocator; the binder works with either. Pool access is
/// not synchronised across allocators shared between threads beyond what
/// the implementation itself does.
pub trait MemoryAllocator {
    fn allocate(
        &self,
        request: &MemoryRequest<'_>,
    ) -> Result<DeviceMemory, AllocateMemoryError>;

    fn free(&self, memory: DeviceMemory) -> Result<(), FreeMemoryError>;

    /// Granularity for flush and invalidate ranges.
    fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        1
    }

    /// Map `memory` and return a pointer to its first byte.
    ///
    /// # Safety
    /// `memory` must have been allocated by this allocator and must not be
    /// mapped already.
    unsafe fn map_raw(
        &self,
        memory: &DeviceMemory,
    ) -> Result<NonNull<u8>, MapMemoryError>;

    /// # Safety
    /// `memory` must be currently mapped through this allocator.
    unsafe fn unmap_raw(&self, memory: &DeviceMemory);

    /// Flush `size` bytes at absolute `offset` within the native memory.
    /// `size` is either a whole number of atoms or `VK_WHOLE_SIZE`.
    ///
    /// # Safety
    /// `memory` must be mapped and the range atom-aligned and in bounds.
    unsafe fn flush_raw(
        &self,
        memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result>;

    /// # Safety
    /// Same as [`flush_raw`](Self::flush_raw).
    unsafe fn invalidate_raw(
        &self,
        memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result>;
}

/// Memory that frees itself through its allocator when dropped.
///
/// Holds only a weak reference to the allocator: the pool outlives or
/// outranks the memory, never the other way round. If the allocator is gone
/// at drop time, its own teardown has already reclaimed the memory.
pub struct ManagedDeviceMemory<A: MemoryAllocator> {
    memory: Option<DeviceMemory>,
    allocator: Weak<A>,
}

impl<A: MemoryAllocator> std::fmt::Debug for ManagedDeviceMemory<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedDeviceMemory")
            .field("memory", &self.memory)
            .finish_non_exhaustive()
    }
}

impl<A: MemoryAllocator> ManagedDeviceMemory<A> {
    pub fn allocate(
        allocator: &Arc<A>,
        request: &MemoryRequest<'_>,
    ) -> Result<Self, AllocateMemoryError> {
        let memory = allocator.allocate(request)?;
        Ok(Self {
            memory: Some(memory),
            allocator: Arc::downgrade(allocator),
        })
    }

    pub fn memory(&self) -> &DeviceMemory {
        // Only None after into_inner, which consumes self.
        self.memory.as_ref().unwrap_or_else(|| unreachable!())
    }

    pub fn memory_mut(&mut self) -> &mut DeviceMemory {
        self.memory.as_mut().unwrap_or_else(|| unreachable!())
    }

    pub fn allocator(&self) -> Option<Arc<A>> {
        self.allocator.upgrade()
    }

    /// Give up ownership without freeing, e.g. to bind the memory to a
    /// resource.
    pub fn into_inner(mut self) -> DeviceMemory {
        self.memory.take().unwrap_or_else(|| unreachable!())
    }
}

impl<A: MemoryAllocator> Drop for ManagedDeviceMemory<A> {
    fn drop(&mut self) {
        let Some(mut memory) = self.memory.take() else {
            return;
        };
        let Some(allocator) = self.allocator.upgrade() else {
            tracing::warn!(
                "Allocator dropped before memory {:?}; leaving it to pool \
                 teardown",
                memory.raw_memory()
            );
            return;
        };
        memory.unmap(allocator.as_ref());
        tracing::debug!("Freeing memory {:?}", memory.raw_memory());
        if let Err(e) = allocator.free(memory) {
            tracing::error!("Failed to free device memory: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// PooledAllocator
// ---------------------------------------------------------------------------

/// Sub-allocates from the device's `gpu-allocator` pools.
///
/// Host-visible pool blocks are persistently mapped by `gpu-allocator`, so
/// mapping hands out the existing pointer and unmapping is bookkeeping only.
/// Priorities and device masks are not forwarded to pooled blocks.
#[derive(Debug)]
pub struct PooledAllocator {
    device: Arc<Device>,
}

impl PooledAllocator {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl MemoryAllocator for PooledAllocator {
    fn allocate(
        &self,
        request: &MemoryRequest<'_>,
    ) -> Result<DeviceMemory, AllocateMemoryError> {
        let type_bits = request.requirements.memory_type_bits;
        let Some(type_index) = select_memory_type(
            self.device.memory_types(),
            type_bits,
            request.usage,
            request.required_flags,
        ) else {
            return Err(AllocateMemoryError::NoCompatibleMemoryType {
                type_bits,
                required: request.required_flags,
            });
        };
        let requirements = vk::MemoryRequirements {
            memory_type_bits: 1 << type_index,
            ..request.requirements
        };

        let allocation = self
            .device
            .allocate_memory(
                request.name,
                requirements,
                request.usage,
                request.linear,
            )
            .map_err(AllocateMemoryError::Pool)?;

        let info = MemoryInfo {
            // SAFETY: The allocation was just returned by gpu-allocator for
            // this device and stays live until freed.
            raw: unsafe { allocation.memory() },
            offset: allocation.offset(),
            size: allocation.size(),
            // gpu-allocator does not report the size of its blocks.
            block_size: None,
            alignment: request.requirements.alignment,
            memory_type_bits: type_bits,
            memory_type_index: type_index,
            property_flags: allocation.memory_properties(),
            priority: request.priority,
        };
        Ok(DeviceMemory::new(info, MemoryBlock::Pooled(allocation)))
    }

    fn free(&self, memory: DeviceMemory) -> Result<(), FreeMemoryError> {
        match memory.into_block() {
            (_, MemoryBlock::Pooled(allocation)) => self
                .device
                .free_memory(allocation)
                .map_err(FreeMemoryError::Pool),
            _ => Err(FreeMemoryError::ForeignMemory),
        }
    }

    fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.device.non_coherent_atom_size()
    }

    unsafe fn map_raw(
        &self,
        memory: &DeviceMemory,
    ) -> Result<NonNull<u8>, MapMemoryError> {
        match memory.block() {
            MemoryBlock::Pooled(allocation) => allocation
                .mapped_ptr()
                .map(|p| p.cast::<u8>())
                .ok_or(MapMemoryError::NotHostVisible),
            _ => Err(MapMemoryError::NotHostVisible),
        }
    }

    unsafe fn unmap_raw(&self, _memory: &DeviceMemory) {}

    unsafe fn flush_raw(
        &self,
        memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory.raw_memory())
            .offset(offset)
            .size(size);
        // SAFETY: Caller guarantees the range is mapped, atom aligned and in
        // bounds.
        unsafe {
            self.device
                .flush_raw_mapped_memory_ranges(std::slice::from_ref(&range))
        }
    }

    unsafe fn invalidate_raw(
        &self,
        memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory.raw_memory())
            .offset(offset)
            .size(size);
        // SAFETY: Caller guarantees the range is mapped, atom aligned and in
        // bounds.
        unsafe {
            self.device.invalidate_raw_mapped_memory_ranges(
                std::slice::from_ref(&range),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// DedicatedAllocator
// ---------------------------------------------------------------------------

/// One `vkAllocateMemory` per request.
///
/// Chains `VkMemoryPriorityAllocateInfoEXT` when the device has memory
/// priorities, and `VkMemoryAllocateFlagsInfo` for device-group masks.
#[derive(Debug)]
pub struct DedicatedAllocator {
    device: Arc<Device>,
}

impl DedicatedAllocator {
    pub fn new(device: &Arc<Device>) -> Self {
        Self {
            device: Arc::clone(device),
        }
    }
}

impl MemoryAllocator for DedicatedAllocator {
    fn allocate(
        &self,
        request: &MemoryRequest<'_>,
    ) -> Result<DeviceMemory, AllocateMemoryError> {
        let type_bits = request.requirements.memory_type_bits;
        let Some(type_index) = select_memory_type(
            self.device.memory_types(),
            type_bits,
            request.usage,
            request.required_flags,
        ) else {
            return Err(AllocateMemoryError::NoCompatibleMemoryType {
                type_bits,
                required: request.required_flags,
            });
        };
        let property_flags =
            self.device.memory_types()[type_index as usize].property_flags;

        let atom = self.device.non_coherent_atom_size();
        let size = if property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
            && !property_flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT)
        {
            request.requirements.size.div_ceil(atom) * atom
        } else {
            request.requirements.size
        };

        let mut priority_info = vk::MemoryPriorityAllocateInfoEXT::default()
            .priority(request.priority);
        let mut flags_info = vk::MemoryAllocateFlagsInfo::default()
            .flags(vk::MemoryAllocateFlags::DEVICE_MASK)
            .device_mask(request.device_mask.unwrap_or(1));

        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(type_index);
        if self.device.capabilities().memory_priority {
            allocate_info = allocate_info.push_next(&mut priority_info);
        }
        if request.device_mask.is_some() && self.device.device_count() > 1 {
            allocate_info = allocate_info.push_next(&mut flags_info);
        }

        // SAFETY: allocate_info and its chain are live for the call and the
        // type index comes from this device's memory properties.
        let raw = unsafe { self.device.allocate_raw_memory(&allocate_info) }
            .map_err(AllocateMemoryError::Vulkan)?;

        // SAFETY: raw was just allocated from this device.
        let name_result =
            unsafe { self.device.set_object_name_str(raw, Some(request.name)) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name memory {:?}: {e}", raw);
        }

        Ok(DeviceMemory::new(
            MemoryInfo {
                raw,
                offset: 0,
                size,
                block_size: Some(size),
                alignment: request.requirements.alignment,
                memory_type_bits: type_bits,
                memory_type_index: type_index,
                property_flags,
                priority: request.priority,
            },
            MemoryBlock::Dedicated,
        ))
    }

    fn free(&self, memory: DeviceMemory) -> Result<(), FreeMemoryError> {
        match memory.into_block() {
            (info, MemoryBlock::Dedicated) => {
                // SAFETY: info.raw was allocated by this allocator and the
                // caller has released every binding to it.
                unsafe { self.device.free_raw_memory(info.raw) };
                Ok(())
            }
            _ => Err(FreeMemoryError::ForeignMemory),
        }
    }

    fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.device.non_coherent_atom_size()
    }

    unsafe fn map_raw(
        &self,
        memory: &DeviceMemory,
    ) -> Result<NonNull<u8>, MapMemoryError> {
        // SAFETY: Caller guarantees memory came from this allocator and is
        // not mapped.
        let ptr = unsafe {
            self.device.map_raw_memory(
                memory.raw_memory(),
                0,
                vk::WHOLE_SIZE,
            )
        }
        .map_err(MapMemoryError::Vulkan)?;
        NonNull::new(ptr.cast::<u8>()).ok_or(MapMemoryError::Vulkan(
            vk::Result::ERROR_MEMORY_MAP_FAILED,
        ))
    }

    unsafe fn unmap_raw(&self, memory: &DeviceMemory) {
        // SAFETY: Caller guarantees memory is mapped.
        unsafe { self.device.unmap_raw_memory(memory.raw_memory()) };
    }

    unsafe fn flush_raw(
        &self,
        memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory.raw_memory())
            .offset(offset)
            .size(size);
        // SAFETY: Caller guarantees the range is mapped and atom aligned.
        unsafe {
            self.device
                .flush_raw_mapped_memory_ranges(std::slice::from_ref(&range))
        }
    }

    unsafe fn invalidate_raw(
        &self,
        memory: &DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> Result<(), vk::Result> {
        let range = vk::MappedMemoryRange::default()
            .memory(memory.raw_memory())
            .offset(offset)
            .size(size);
        // SAFETY: Caller guarantees the range is mapped and atom aligned.
        unsafe {
            self.device.invalidate_raw_mapped_memory_ranges(
                std::slice::from_ref(&range),
            )
        }
    }
}
