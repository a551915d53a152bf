//! Uploads into buffers and images through staging memory, and readbacks.
//!
//! There are two ways in:
//!
//! - the prefilled path ([`record_image_upload`], [`record_buffer_upload`])
//!   records barrier, copy, barrier into a recorder the caller already
//!   began, and never submits;
//! - the host-data path ([`upload_image_data`], [`upload_buffer_data`])
//!   builds and fills its own staging buffer, records, submits, blocks on
//!   the fence and destroys the staging buffer again.
//!
//! Image layouts are tracked per (level, layer) in the resource table and
//! updated when the transitions are recorded.

use ash::vk;
use thiserror::Error;

use crate::arena::Handle;
use crate::binder::{
    AccessMemoryError, CreateResourceError, Resources, StaleHandleError,
};
use crate::driver::ResourceDriver;
use crate::layout::{
    self, CopyLayout, DEFAULT_OFFSET_ALIGNMENT, ExtentPolicy, LayoutError,
    MipmapLayout,
};
use crate::memory::MemoryAllocator;
use crate::resource::{
    Buffer, BufferDesc, BufferKind, Image, Resource, Sharing,
};
use crate::staging::{self, FillStagingError};

/// Where transfer commands go.
///
/// The recording calls are `unsafe`: they take raw handles that must stay
/// alive until the recorded work has finished executing.
pub trait CommandRecorder {
    /// Queue family the recording is submitted to.
    fn queue_family_index(&self) -> u32;

    /// Capabilities of that family. Barriers are limited to the pipeline
    /// stages these flags support.
    fn queue_flags(&self) -> vk::QueueFlags;

    /// Start a fresh recording, discarding anything recorded before.
    fn begin_recording(&mut self) -> Result<(), vk::Result>;

    fn end_recording(&mut self) -> Result<(), vk::Result>;

    /// # Safety
    /// The recorder is recording, and every handle in `dependency_info`
    /// stays valid until the submission that runs it completes.
    unsafe fn pipeline_barrier(
        &mut self,
        dependency_info: &vk::DependencyInfo<'_>,
    );

    /// # Safety
    /// Same as [`pipeline_barrier`](Self::pipeline_barrier). Every region is
    /// in bounds for both resources.
    unsafe fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    /// # Safety
    /// Same as [`copy_buffer_to_image`](Self::copy_buffer_to_image).
    unsafe fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );

    /// # Safety
    /// Same as [`copy_buffer_to_image`](Self::copy_buffer_to_image).
    unsafe fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    /// Submit the finished recording and block until it has executed.
    fn submit_and_wait(&mut self) -> Result<(), vk::Result>;
}

// ---------------------------------------------------------------------------
// Barrier masks
// ---------------------------------------------------------------------------

type Scope = (vk::PipelineStageFlags2, vk::AccessFlags2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierMasks {
    pub src_stage: vk::PipelineStageFlags2,
    pub src_access: vk::AccessFlags2,
    pub dst_stage: vk::PipelineStageFlags2,
    pub dst_access: vk::AccessFlags2,
}

impl BarrierMasks {
    /// Both halves cut down to what a queue with `flags` can execute.
    pub fn limited_to(self, flags: vk::QueueFlags) -> Self {
        let (src_stage, src_access) =
            limit_scope((self.src_stage, self.src_access), flags);
        let (dst_stage, dst_access) =
            limit_scope((self.dst_stage, self.dst_access), flags);
        Self {
            src_stage,
            src_access,
            dst_stage,
            dst_access,
        }
    }
}

/// Stages and accesses that use an image while it is in `layout`.
fn layout_scope(layout: vk::ImageLayout) -> Scope {
    use vk::AccessFlags2 as A;
    use vk::ImageLayout as L;
    use vk::PipelineStageFlags2 as S;

    match layout {
        L::UNDEFINED | L::PRESENT_SRC_KHR => (S::NONE, A::NONE),
        L::PREINITIALIZED => (S::HOST, A::HOST_WRITE),
        L::TRANSFER_DST_OPTIMAL => (S::COPY, A::TRANSFER_WRITE),
        L::TRANSFER_SRC_OPTIMAL => (S::COPY, A::TRANSFER_READ),
        L::SHADER_READ_ONLY_OPTIMAL => (
            S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            A::SHADER_SAMPLED_READ,
        ),
        L::COLOR_ATTACHMENT_OPTIMAL => (
            S::COLOR_ATTACHMENT_OUTPUT,
            A::COLOR_ATTACHMENT_READ | A::COLOR_ATTACHMENT_WRITE,
        ),
        L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => (
            S::EARLY_FRAGMENT_TESTS | S::LATE_FRAGMENT_TESTS,
            A::DEPTH_STENCIL_ATTACHMENT_READ
                | A::DEPTH_STENCIL_ATTACHMENT_WRITE,
        ),
        L::DEPTH_STENCIL_READ_ONLY_OPTIMAL => (
            S::EARLY_FRAGMENT_TESTS
                | S::LATE_FRAGMENT_TESTS
                | S::FRAGMENT_SHADER,
            A::DEPTH_STENCIL_ATTACHMENT_READ | A::SHADER_SAMPLED_READ,
        ),
        _ => (S::ALL_COMMANDS, A::MEMORY_READ | A::MEMORY_WRITE),
    }
}

/// Synchronization2 masks for a transition from `old` to `new`, for a
/// queue that supports every stage involved.
pub fn barrier_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> BarrierMasks {
    let (src_stage, src_access) = layout_scope(old);
    let (dst_stage, dst_access) = layout_scope(new);
    BarrierMasks {
        src_stage,
        src_access,
        dst_stage,
        dst_access,
    }
}

/// Stages and accesses that consume a buffer of `kind` once uploaded.
fn buffer_scope(kind: BufferKind) -> Scope {
    use vk::AccessFlags2 as A;
    use vk::PipelineStageFlags2 as S;

    match kind {
        BufferKind::Vertex => {
            (S::VERTEX_ATTRIBUTE_INPUT, A::VERTEX_ATTRIBUTE_READ)
        }
        BufferKind::Index => (S::INDEX_INPUT, A::INDEX_READ),
        BufferKind::Indirect => (S::DRAW_INDIRECT, A::INDIRECT_COMMAND_READ),
        BufferKind::UniformTexel => (
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            A::SHADER_READ,
        ),
        BufferKind::Storage => (
            S::VERTEX_SHADER | S::FRAGMENT_SHADER | S::COMPUTE_SHADER,
            A::SHADER_STORAGE_READ | A::SHADER_STORAGE_WRITE,
        ),
        BufferKind::Staging | BufferKind::Readback => {
            (S::HOST, A::HOST_READ | A::HOST_WRITE)
        }
    }
}

fn graphics_stages() -> vk::PipelineStageFlags2 {
    use vk::PipelineStageFlags2 as S;
    S::VERTEX_INPUT
        | S::VERTEX_ATTRIBUTE_INPUT
        | S::INDEX_INPUT
        | S::VERTEX_SHADER
        | S::TESSELLATION_CONTROL_SHADER
        | S::TESSELLATION_EVALUATION_SHADER
        | S::GEOMETRY_SHADER
        | S::FRAGMENT_SHADER
        | S::EARLY_FRAGMENT_TESTS
        | S::LATE_FRAGMENT_TESTS
        | S::COLOR_ATTACHMENT_OUTPUT
        | S::ALL_GRAPHICS
}

/// Remove the stages of `scope` a queue with `flags` cannot execute.
///
/// A scope left with no stage becomes `NONE` and grants no access. Work on
/// other queues then orders itself against the submission, or against the
/// acquire half of an ownership transfer. Every access in the scopes above
/// stays valid for any stage that survives.
fn limit_scope(scope: Scope, flags: vk::QueueFlags) -> Scope {
    use vk::PipelineStageFlags2 as S;
    use vk::QueueFlags as Q;

    let mut unsupported = S::empty();
    if !flags.contains(Q::GRAPHICS) {
        unsupported |= graphics_stages();
    }
    if !flags.contains(Q::COMPUTE) {
        unsupported |= S::COMPUTE_SHADER;
    }
    if !flags.intersects(Q::GRAPHICS | Q::COMPUTE) {
        unsupported |= S::DRAW_INDIRECT;
    }

    let (stage, access) = scope;
    if !stage.intersects(unsupported) {
        return scope;
    }
    let kept = stage & !unsupported;
    if kept.is_empty() {
        (S::NONE, vk::AccessFlags2::NONE)
    } else {
        (kept, access)
    }
}

/// `(from, to)` families when handing `sharing` over to `consumer` needs an
/// ownership transfer. Concurrent resources and same-family consumers need
/// none.
fn ownership_transfer(
    sharing: &Sharing,
    recording_family: u32,
    consumer: Option<u32>,
) -> Option<(u32, u32)> {
    let consumer = consumer?;
    (sharing.mode() == vk::SharingMode::EXCLUSIVE
        && consumer != recording_family)
        .then_some((recording_family, consumer))
}

fn image_barrier(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    queue: vk::QueueFlags,
) -> vk::ImageMemoryBarrier2<'static> {
    let masks = barrier_masks(old, new).limited_to(queue);
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(masks.src_stage)
        .src_access_mask(masks.src_access)
        .dst_stage_mask(masks.dst_stage)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
}

/// Release and acquire halves of moving an uploaded image from
/// TRANSFER_DST on family `from` to `new` on family `to`.
///
/// The release carries only the copy's writes. The acquire carries the
/// consumer's full scope, since it is recorded on the consumer's queue.
fn image_ownership_barriers(
    image: vk::Image,
    range: vk::ImageSubresourceRange,
    new: vk::ImageLayout,
    (from, to): (u32, u32),
) -> [vk::ImageMemoryBarrier2<'static>; 2] {
    let (dst_stage, dst_access) = layout_scope(new);
    let base = vk::ImageMemoryBarrier2::default()
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(new)
        .src_queue_family_index(from)
        .dst_queue_family_index(to)
        .image(image)
        .subresource_range(range);
    [
        base.src_stage_mask(COPY_WRITE.0)
            .src_access_mask(COPY_WRITE.1),
        base.dst_stage_mask(dst_stage).dst_access_mask(dst_access),
    ]
}

fn buffer_barrier(
    buffer: vk::Buffer,
    src: Scope,
    dst: Scope,
    queue: vk::QueueFlags,
) -> vk::BufferMemoryBarrier2<'static> {
    let (src, dst) = (limit_scope(src, queue), limit_scope(dst, queue));
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(src.0)
        .src_access_mask(src.1)
        .dst_stage_mask(dst.0)
        .dst_access_mask(dst.1)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE)
}

/// Buffer counterpart of [`image_ownership_barriers`].
fn buffer_ownership_barriers(
    buffer: vk::Buffer,
    consumer: Scope,
    (from, to): (u32, u32),
) -> [vk::BufferMemoryBarrier2<'static>; 2] {
    let base = vk::BufferMemoryBarrier2::default()
        .src_queue_family_index(from)
        .dst_queue_family_index(to)
        .buffer(buffer)
        .offset(0)
        .size(vk::WHOLE_SIZE);
    [
        base.src_stage_mask(COPY_WRITE.0)
            .src_access_mask(COPY_WRITE.1),
        base.dst_stage_mask(consumer.0).dst_access_mask(consumer.1),
    ]
}

const COPY_WRITE: Scope =
    (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_WRITE);
const COPY_READ: Scope =
    (vk::PipelineStageFlags2::COPY, vk::AccessFlags2::TRANSFER_READ);
const HOST_READ: Scope =
    (vk::PipelineStageFlags2::HOST, vk::AccessFlags2::HOST_READ);

// ---------------------------------------------------------------------------
// Configuration and errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Alignment of every subresource in a staging buffer. A power of two.
    pub offset_alignment: vk::DeviceSize,
    /// Staging ranges at least this large are cleared with
    /// [`staging::zero_fill`] before filling.
    pub zero_fill_threshold: usize,
    pub zero_fill_workers: usize,
    pub extent_policy: ExtentPolicy,
    /// Queue family that uses uploaded resources next. When it differs from
    /// the recorder's family, exclusive resources are released to it and the
    /// upload returns the matching acquire barrier.
    pub consumer_family: Option<u32>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            offset_alignment: DEFAULT_OFFSET_ALIGNMENT,
            zero_fill_threshold: 1 << 20,
            zero_fill_workers: 4,
            extent_policy: ExtentPolicy::Logical,
            consumer_family: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    StaleHandle(#[from] StaleHandleError),

    #[error("Resource {name:?} has no memory bound")]
    NotBound { name: String },

    #[error("Buffer {name:?} lacks usage {required:?}")]
    MissingBufferUsage {
        name: String,
        required: vk::BufferUsageFlags,
    },

    #[error("Image {name:?} lacks usage {required:?}")]
    MissingImageUsage {
        name: String,
        required: vk::ImageUsageFlags,
    },

    #[error("{0:?} is not a valid layout to transition into")]
    InvalidFinalLayout(vk::ImageLayout),

    #[error(
        "Layout covers {levels} levels x {layers} layers, image has \
         {image_levels} x {image_layers}"
    )]
    LayoutExceedsImage {
        levels: u32,
        layers: u32,
        image_levels: u32,
        image_layers: u32,
    },

    #[error(
        "Got {got} subresource slices for {layers} layers of up to \
         {mip_levels} levels"
    )]
    SliceCount {
        got: usize,
        layers: u32,
        mip_levels: u32,
    },

    #[error("Copy offset {offset} is not a multiple of {granularity}")]
    MisalignedOffset {
        offset: vk::DeviceSize,
        granularity: vk::DeviceSize,
    },

    #[error("Staging buffer is {size} bytes but the upload needs {needed}")]
    StagingTooSmall {
        needed: vk::DeviceSize,
        size: vk::DeviceSize,
    },

    #[error("Copy region {index} is empty or out of bounds")]
    RegionOutOfBounds { index: usize },

    #[error("Subresource (level {level}, layer {layer}) has undefined contents")]
    UndefinedContents { level: u32, layer: u32 },

    #[error(transparent)]
    Layout(#[from] LayoutError),

    #[error(transparent)]
    Fill(#[from] FillStagingError),

    #[error("Failed to create transfer buffer: {0}")]
    CreateBuffer(#[from] CreateResourceError),

    #[error(transparent)]
    Access(#[from] AccessMemoryError),

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

fn native(call: &'static str) -> impl Fn(vk::Result) -> TransferError {
    move |result| TransferError::Vulkan { call, result }
}

fn check_final_layout(layout: vk::ImageLayout) -> Result<(), TransferError> {
    match layout {
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => {
            Err(TransferError::InvalidFinalLayout(layout))
        }
        _ => Ok(()),
    }
}

fn bound_buffer<D, A>(
    resources: &Resources<D, A>,
    handle: Handle<Buffer>,
    required: vk::BufferUsageFlags,
) -> Result<&Buffer, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
{
    let buffer = resources.buffer(handle).ok_or(StaleHandleError)?;
    if !buffer.is_bound() {
        return Err(TransferError::NotBound {
            name: buffer.name().to_owned(),
        });
    }
    if !buffer.desc().usage().contains(required) {
        return Err(TransferError::MissingBufferUsage {
            name: buffer.name().to_owned(),
            required,
        });
    }
    Ok(buffer)
}

fn bound_image<D, A>(
    resources: &Resources<D, A>,
    handle: Handle<Image>,
    required: vk::ImageUsageFlags,
) -> Result<&Image, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
{
    let image = resources.image(handle).ok_or(StaleHandleError)?;
    if !image.is_bound() {
        return Err(TransferError::NotBound {
            name: image.name().to_owned(),
        });
    }
    if !image.desc().usage.contains(required) {
        return Err(TransferError::MissingImageUsage {
            name: image.name().to_owned(),
            required,
        });
    }
    Ok(image)
}

/// `bufferOffset` granularity for copies of `format`: a multiple of both 4
/// and the texel block size.
fn copy_offset_granularity(format: vk::Format) -> vk::DeviceSize {
    let block = layout::format_info(format)
        .map_or(1, |info| vk::DeviceSize::from(info.block_bytes));
    let (mut a, mut b) = (4, block);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    4 * block / a
}

/// Create a buffer that lives only for the duration of `f`.
fn with_transient_buffer<D, A, T>(
    resources: &mut Resources<D, A>,
    desc: BufferDesc,
    f: impl FnOnce(&mut Resources<D, A>, Handle<Buffer>) -> Result<T, TransferError>,
) -> Result<T, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
{
    let handle = resources.create_buffer(desc)?;
    let result = f(resources, handle);
    if resources.destroy(handle).is_err() {
        tracing::warn!("Transient buffer {:?} vanished before cleanup", handle);
    }
    result
}

// ---------------------------------------------------------------------------
// Prefilled staging path
// ---------------------------------------------------------------------------

/// An upload from a staging buffer the caller has already filled.
#[derive(Debug, Clone, Copy)]
pub struct StagedImageUpload<'a> {
    pub staging: Handle<Buffer>,
    pub image: Handle<Image>,
    /// Packed layout of the staging contents. Covers levels
    /// `0..layout.mip_levels` of layers `0..layout.array_layers`.
    pub layout: &'a MipmapLayout,
    pub copy_layout: CopyLayout,
    pub final_layout: vk::ImageLayout,
    pub extent_policy: ExtentPolicy,
    /// See [`TransferConfig::consumer_family`].
    pub consumer_family: Option<u32>,
}

/// What a recorded image upload leaves behind.
#[derive(Debug, Clone, Copy)]
pub struct UploadedImage {
    /// Subresources now tracked as being in the final layout.
    pub range: vk::ImageSubresourceRange,
    /// Acquire half of the ownership transfer, when the image was released
    /// to another queue family. Record it on that family's queue in a
    /// submission ordered after the upload.
    pub acquire: Option<vk::ImageMemoryBarrier2<'static>>,
}

/// Record the UNDEFINED → TRANSFER_DST barrier, one copy covering every
/// subresource in the layout, and the barrier into the final layout.
///
/// The uploaded range is marked as being in `final_layout`. The last
/// barrier only names stages the recorder's queue supports. For an
/// exclusive image consumed by another queue family it is a release, and
/// the acquire is returned. Nothing is submitted.
///
/// # Safety
/// `recorder` must be recording. Neither resource may be destroyed,
/// reallocated or defragmented until the recorded work has completed.
pub unsafe fn record_image_upload<D, A, R>(
    resources: &mut Resources<D, A>,
    recorder: &mut R,
    upload: &StagedImageUpload<'_>,
) -> Result<UploadedImage, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: CommandRecorder + ?Sized,
{
    check_final_layout(upload.final_layout)?;
    let staging = bound_buffer(
        resources,
        upload.staging,
        vk::BufferUsageFlags::TRANSFER_SRC,
    )?;
    let staging_raw = staging.raw_buffer();
    let staging_size = staging.size();
    let image = bound_image(
        resources,
        upload.image,
        vk::ImageUsageFlags::TRANSFER_DST,
    )?;
    let layout = upload.layout;
    if layout.mip_levels > image.mip_levels()
        || layout.array_layers > image.array_layers()
    {
        return Err(TransferError::LayoutExceedsImage {
            levels: layout.mip_levels,
            layers: layout.array_layers,
            image_levels: image.mip_levels(),
            image_layers: image.array_layers(),
        });
    }
    let needed = upload.copy_layout.buffer_offset + layout.total_size;
    if needed > staging_size {
        return Err(TransferError::StagingTooSmall {
            needed,
            size: staging_size,
        });
    }

    let desc = image.desc();
    let granularity = copy_offset_granularity(desc.format);
    let regions = layout::setup_copy_regions(
        layout,
        desc.extent,
        desc.dimension(),
        upload.copy_layout,
        upload.extent_policy,
        desc.format,
    );
    if let Some(bad) = regions
        .iter()
        .find(|r| r.buffer_offset % granularity != 0)
    {
        return Err(TransferError::MisalignedOffset {
            offset: bad.buffer_offset,
            granularity,
        });
    }
    let aspect = desc.aspect();
    let regions: Vec<vk::BufferImageCopy> =
        regions.iter().map(|r| r.to_vk(aspect)).collect();
    let range = vk::ImageSubresourceRange::default()
        .aspect_mask(aspect)
        .base_mip_level(0)
        .level_count(layout.mip_levels)
        .base_array_layer(0)
        .layer_count(layout.array_layers);
    let raw_image = image.raw_image();
    let queue = recorder.queue_flags();
    let handoff = ownership_transfer(
        image.sharing(),
        recorder.queue_family_index(),
        upload.consumer_family,
    );

    tracing::debug!(
        "Recording upload of {} regions into {:?} ({}), handoff {:?}",
        regions.len(),
        raw_image,
        image.name(),
        handoff
    );

    let to_transfer = [image_barrier(
        raw_image,
        range,
        vk::ImageLayout::UNDEFINED,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        queue,
    )];
    let (to_final, acquire) = match handoff {
        Some(families) => {
            let [release, acquire] = image_ownership_barriers(
                raw_image,
                range,
                upload.final_layout,
                families,
            );
            ([release], Some(acquire))
        }
        None => {
            let barrier = image_barrier(
                raw_image,
                range,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                upload.final_layout,
                queue,
            );
            ([barrier], None)
        }
    };
    // SAFETY: Both handles are bound resources of this table and the caller
    // keeps them alive until the work completes. Regions were built from a
    // layout that fits both the image and the staging buffer.
    unsafe {
        recorder.pipeline_barrier(
            &vk::DependencyInfo::default().image_memory_barriers(&to_transfer),
        );
        recorder.copy_buffer_to_image(
            staging_raw,
            raw_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &regions,
        );
        recorder.pipeline_barrier(
            &vk::DependencyInfo::default().image_memory_barriers(&to_final),
        );
    }

    if let Some(image) = resources.image_mut(upload.image) {
        image.set_layout(&range, upload.final_layout);
    }
    Ok(UploadedImage { range, acquire })
}

/// Record a staging-to-buffer copy bracketed by buffer barriers.
///
/// The barriers order the copy after, and before, the accesses the
/// destination's [`BufferKind`] implies, limited to the stages the
/// recorder's queue supports. An exclusive buffer consumed by another
/// family in `consumer_family` is released to it, and the acquire barrier
/// to record on that family's queue is returned.
///
/// # Safety
/// Same contract as [`record_image_upload`].
pub unsafe fn record_buffer_upload<D, A, R>(
    resources: &Resources<D, A>,
    recorder: &mut R,
    staging: Handle<Buffer>,
    dst: Handle<Buffer>,
    regions: &[vk::BufferCopy],
    consumer_family: Option<u32>,
) -> Result<Option<vk::BufferMemoryBarrier2<'static>>, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: CommandRecorder + ?Sized,
{
    let src =
        bound_buffer(resources, staging, vk::BufferUsageFlags::TRANSFER_SRC)?;
    let dst = bound_buffer(resources, dst, vk::BufferUsageFlags::TRANSFER_DST)?;
    if regions.is_empty() {
        return Err(TransferError::RegionOutOfBounds { index: 0 });
    }
    for (index, region) in regions.iter().enumerate() {
        let fits = |offset: vk::DeviceSize, limit: vk::DeviceSize| {
            offset
                .checked_add(region.size)
                .is_some_and(|end| end <= limit)
        };
        if region.size == 0
            || !fits(region.src_offset, src.size())
            || !fits(region.dst_offset, dst.size())
        {
            return Err(TransferError::RegionOutOfBounds { index });
        }
    }

    let queue = recorder.queue_flags();
    let raw_dst = dst.raw_buffer();
    let consumer = buffer_scope(dst.desc().kind);
    let handoff = ownership_transfer(
        dst.sharing(),
        recorder.queue_family_index(),
        consumer_family,
    );
    let before = [buffer_barrier(raw_dst, consumer, COPY_WRITE, queue)];
    let (after, acquire) = match handoff {
        Some(families) => {
            let [release, acquire] =
                buffer_ownership_barriers(raw_dst, consumer, families);
            ([release], Some(acquire))
        }
        None => ([buffer_barrier(raw_dst, COPY_WRITE, consumer, queue)], None),
    };
    // SAFETY: Both buffers are bound resources of this table, the regions
    // were bounds-checked, and the caller keeps them alive.
    unsafe {
        recorder.pipeline_barrier(
            &vk::DependencyInfo::default().buffer_memory_barriers(&before),
        );
        recorder.copy_buffer(src.raw_buffer(), raw_dst, regions);
        recorder.pipeline_barrier(
            &vk::DependencyInfo::default().buffer_memory_barriers(&after),
        );
    }
    Ok(acquire)
}

// ---------------------------------------------------------------------------
// Host-data path
// ---------------------------------------------------------------------------

fn finish_and_submit<R>(recorder: &mut R) -> Result<(), TransferError>
where
    R: CommandRecorder + ?Sized,
{
    recorder
        .end_recording()
        .map_err(native("vkEndCommandBuffer"))?;
    recorder
        .submit_and_wait()
        .map_err(native("vkQueueSubmit2"))
}

/// Upload host data into `image` and wait for it to land.
///
/// `levels` holds one slice per subresource, layer-major and level-minor,
/// covering levels `0..levels.len() / array_layers` of every layer. Each
/// slice must be exactly the packed size of its level. On success every
/// uploaded subresource is in `final_layout`.
pub fn upload_image_data<D, A, R>(
    resources: &mut Resources<D, A>,
    recorder: &mut R,
    image: Handle<Image>,
    levels: &[&[u8]],
    final_layout: vk::ImageLayout,
    config: &TransferConfig,
) -> Result<UploadedImage, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: CommandRecorder + ?Sized,
{
    let _span = tracing::debug_span!("upload_image_data").entered();
    check_final_layout(final_layout)?;

    let target = resources.image(image).ok_or(StaleHandleError)?;
    let layers = target.array_layers();
    let mip_levels = target.mip_levels();
    let per_layer = levels.len() / layers as usize;
    if levels.is_empty()
        || levels.len() % layers as usize != 0
        || per_layer > mip_levels as usize
    {
        return Err(TransferError::SliceCount {
            got: levels.len(),
            layers,
            mip_levels,
        });
    }

    let desc = target.desc();
    let layout = layout::image_layout(
        desc.extent,
        desc.dimension(),
        desc.format,
        per_layer as u32,
        layers,
        config.offset_alignment,
    )?;
    for (index, (slice, (_, size))) in
        levels.iter().zip(layout.ranges()).enumerate()
    {
        if slice.len() as vk::DeviceSize != size {
            return Err(FillStagingError::SliceSize {
                index,
                expected: size,
                got: slice.len(),
            }
            .into());
        }
    }

    let staging_desc = BufferDesc::new(
        format!("{} staging", target.name()),
        BufferKind::Staging,
        layout.total_size,
    );
    with_transient_buffer(resources, staging_desc, |resources, staging| {
        resources.map_buffer(staging, |bytes| {
            staging::fill_staging(
                bytes,
                levels,
                &layout,
                config.zero_fill_threshold,
                config.zero_fill_workers,
            )
        })??;

        let upload = StagedImageUpload {
            staging,
            image,
            layout: &layout,
            copy_layout: CopyLayout::default(),
            final_layout,
            extent_policy: config.extent_policy,
            consumer_family: config.consumer_family,
        };
        recorder
            .begin_recording()
            .map_err(native("vkBeginCommandBuffer"))?;
        // SAFETY: staging and image outlive the submission, which is
        // waited on before this closure returns.
        let uploaded =
            unsafe { record_image_upload(resources, recorder, &upload) }?;

        if let Err(e) = finish_and_submit(recorder) {
            // The transition never ran.
            if let Some(image) = resources.image_mut(image) {
                image.set_layout(&uploaded.range, vk::ImageLayout::UNDEFINED);
            }
            return Err(e);
        }
        Ok(uploaded)
    })
}

/// Upload `data` into `buffer` at `offset` and wait for it to land.
///
/// Returns the acquire barrier for `config.consumer_family` when the
/// buffer was released to it.
pub fn upload_buffer_data<D, A, R>(
    resources: &mut Resources<D, A>,
    recorder: &mut R,
    buffer: Handle<Buffer>,
    offset: vk::DeviceSize,
    data: &[u8],
    config: &TransferConfig,
) -> Result<Option<vk::BufferMemoryBarrier2<'static>>, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: CommandRecorder + ?Sized,
{
    let _span = tracing::debug_span!("upload_buffer_data").entered();
    let target =
        bound_buffer(resources, buffer, vk::BufferUsageFlags::TRANSFER_DST)?;
    if data.is_empty() {
        return Ok(None);
    }
    let size = data.len() as vk::DeviceSize;
    if offset.saturating_add(size) > target.size() {
        return Err(TransferError::RegionOutOfBounds { index: 0 });
    }

    let staging_desc = BufferDesc::new(
        format!("{} staging", target.name()),
        BufferKind::Staging,
        size,
    );
    with_transient_buffer(resources, staging_desc, |resources, staging| {
        resources.map_buffer(staging, |bytes| bytes.copy_from_slice(data))?;
        let regions = [vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size,
        }];
        recorder
            .begin_recording()
            .map_err(native("vkBeginCommandBuffer"))?;
        // SAFETY: Both buffers outlive the submission, which is waited on
        // before this closure returns.
        let acquire = unsafe {
            record_buffer_upload(
                resources,
                recorder,
                staging,
                buffer,
                &regions,
                config.consumer_family,
            )
        }?;
        finish_and_submit(recorder)?;
        Ok(acquire)
    })
}

// ---------------------------------------------------------------------------
// Readback
// ---------------------------------------------------------------------------

/// Copy every subresource of `image` back to the host.
///
/// Returns one byte vector per subresource, layer-major and level-minor,
/// each packed tightly. Subresources are transitioned to
/// `TRANSFER_SRC_OPTIMAL` for the copy and back afterwards, so the tracked
/// layouts are unchanged. The image must be owned by the recorder's queue
/// family, or shared concurrently.
pub fn read_image<D, A, R>(
    resources: &mut Resources<D, A>,
    recorder: &mut R,
    image: Handle<Image>,
    config: &TransferConfig,
) -> Result<Vec<Vec<u8>>, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: CommandRecorder + ?Sized,
{
    let _span = tracing::debug_span!("read_image").entered();
    let source =
        bound_image(resources, image, vk::ImageUsageFlags::TRANSFER_SRC)?;
    let desc = source.desc();
    let layout = layout::image_layout(
        desc.extent,
        desc.dimension(),
        desc.format,
        desc.mip_levels,
        desc.array_layers,
        config.offset_alignment,
    )?;
    let aspect = desc.aspect();
    let raw_image = source.raw_image();
    let queue = recorder.queue_flags();

    let mut to_source = Vec::new();
    let mut restore = Vec::new();
    for layer in 0..desc.array_layers {
        for level in 0..desc.mip_levels {
            let current = source
                .layout_of(level, layer)
                .unwrap_or(vk::ImageLayout::UNDEFINED);
            if current == vk::ImageLayout::UNDEFINED {
                return Err(TransferError::UndefinedContents { level, layer });
            }
            if current == vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
                continue;
            }
            let range = vk::ImageSubresourceRange::default()
                .aspect_mask(aspect)
                .base_mip_level(level)
                .level_count(1)
                .base_array_layer(layer)
                .layer_count(1);
            to_source.push(image_barrier(
                raw_image,
                range,
                current,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                queue,
            ));
            restore.push(image_barrier(
                raw_image,
                range,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                current,
                queue,
            ));
        }
    }

    let regions: Vec<vk::BufferImageCopy> = layout::setup_copy_regions(
        &layout,
        desc.extent,
        desc.dimension(),
        CopyLayout::default(),
        config.extent_policy,
        desc.format,
    )
    .iter()
    .map(|r| r.to_vk(aspect))
    .collect();
    let readback_desc = BufferDesc::new(
        format!("{} readback", source.name()),
        BufferKind::Readback,
        layout.total_size,
    );

    let bytes =
        with_transient_buffer(resources, readback_desc, |resources, readback| {
            let raw_readback = resources
                .buffer(readback)
                .ok_or(StaleHandleError)?
                .raw_buffer();
            let host_visible =
                [buffer_barrier(raw_readback, COPY_WRITE, HOST_READ, queue)];

            recorder
                .begin_recording()
                .map_err(native("vkBeginCommandBuffer"))?;
            // SAFETY: The image and readback buffer outlive the submission,
            // which is waited on before this closure returns. The barriers
            // start from the tracked layouts.
            unsafe {
                if !to_source.is_empty() {
                    recorder.pipeline_barrier(
                        &vk::DependencyInfo::default()
                            .image_memory_barriers(&to_source),
                    );
                }
                recorder.copy_image_to_buffer(
                    raw_image,
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    raw_readback,
                    &regions,
                );
                recorder.pipeline_barrier(
                    &vk::DependencyInfo::default()
                        .image_memory_barriers(&restore)
                        .buffer_memory_barriers(&host_visible),
                );
            }
            finish_and_submit(recorder)?;
            Ok(resources.read_buffer_memory(readback)?)
        })?;

    Ok(layout
        .ranges()
        .map(|(offset, size)| {
            bytes[offset as usize..(offset + size) as usize].to_vec()
        })
        .collect())
}

/// Copy the contents of `buffer` back to the host.
///
/// Ownership requirements are the same as for [`read_image`].
pub fn read_buffer<D, A, R>(
    resources: &mut Resources<D, A>,
    recorder: &mut R,
    buffer: Handle<Buffer>,
) -> Result<Vec<u8>, TransferError>
where
    D: ResourceDriver,
    A: MemoryAllocator,
    R: CommandRecorder + ?Sized,
{
    let _span = tracing::debug_span!("read_buffer").entered();
    let source =
        bound_buffer(resources, buffer, vk::BufferUsageFlags::TRANSFER_SRC)?;
    let raw_source = source.raw_buffer();
    let size = source.size();
    let producer = buffer_scope(source.desc().kind);
    let readback_desc = BufferDesc::new(
        format!("{} readback", source.name()),
        BufferKind::Readback,
        size,
    );

    with_transient_buffer(resources, readback_desc, |resources, readback| {
        let raw_readback = resources
            .buffer(readback)
            .ok_or(StaleHandleError)?
            .raw_buffer();
        let queue = recorder.queue_flags();
        let before = [buffer_barrier(raw_source, producer, COPY_READ, queue)];
        let after = [buffer_barrier(raw_readback, COPY_WRITE, HOST_READ, queue)];
        let regions = [vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        }];

        recorder
            .begin_recording()
            .map_err(native("vkBeginCommandBuffer"))?;
        // SAFETY: Both buffers outlive the submission, which is waited on
        // before this closure returns.
        unsafe {
            recorder.pipeline_barrier(
                &vk::DependencyInfo::default().buffer_memory_barriers(&before),
            );
            recorder.copy_buffer(raw_source, raw_readback, &regions);
            recorder.pipeline_barrier(
                &vk::DependencyInfo::default().buffer_memory_barriers(&after),
            );
        }
        finish_and_submit(recorder)?;
        Ok(resources.read_buffer_memory(readback)?)
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::layout::Extent;
    use crate::resource::{ImageDesc, ImageKind};
    use crate::testing::{Command, HostAllocator, MockDriver, SoftwareRecorder};

    type TestResources = Resources<MockDriver, HostAllocator>;

    fn setup() -> (TestResources, SoftwareRecorder) {
        let driver = Arc::new(MockDriver::new());
        let allocator = Arc::new(HostAllocator::new());
        let recorder =
            SoftwareRecorder::new(Arc::clone(&driver), Arc::clone(&allocator));
        (Resources::new(driver, allocator), recorder)
    }

    /// Distinct bytes for every (layer, level, offset).
    fn pattern(layout: &MipmapLayout) -> Vec<Vec<u8>> {
        layout
            .ranges()
            .enumerate()
            .map(|(idx, (_, size))| {
                (0..size)
                    .map(|i| (i as u8).wrapping_mul(7).wrapping_add(idx as u8 * 31))
                    .collect()
            })
            .collect()
    }

    fn slices(data: &[Vec<u8>]) -> Vec<&[u8]> {
        data.iter().map(Vec::as_slice).collect()
    }

    #[test]
    fn barrier_masks_follow_layouts() {
        let masks = barrier_masks(
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        assert_eq!(masks.src_stage, vk::PipelineStageFlags2::NONE);
        assert_eq!(masks.src_access, vk::AccessFlags2::NONE);
        assert_eq!(masks.dst_stage, vk::PipelineStageFlags2::COPY);
        assert_eq!(masks.dst_access, vk::AccessFlags2::TRANSFER_WRITE);

        let masks = barrier_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(masks.src_access, vk::AccessFlags2::TRANSFER_WRITE);
        assert!(masks.dst_stage.contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
        assert_eq!(masks.dst_access, vk::AccessFlags2::SHADER_SAMPLED_READ);
    }

    #[test]
    fn offset_granularity_covers_block_size() {
        assert_eq!(copy_offset_granularity(vk::Format::R8_UNORM), 4);
        assert_eq!(copy_offset_granularity(vk::Format::R8G8B8A8_UNORM), 4);
        assert_eq!(copy_offset_granularity(vk::Format::R8G8B8_UNORM), 12);
        assert_eq!(copy_offset_granularity(vk::Format::BC1_RGB_UNORM_BLOCK), 8);
        assert_eq!(copy_offset_granularity(vk::Format::BC7_UNORM_BLOCK), 16);
    }

    #[test]
    fn synchronous_upload_lands_in_final_layout_and_reads_back() {
        let (mut res, mut recorder) = setup();
        let desc = ImageDesc::new(
            "array",
            ImageKind::D2Array,
            vk::Format::R8_UNORM,
            Extent::new_2d(8, 8),
        )
        .mip_levels(4)
        .array_layers(2)
        .usage(vk::ImageUsageFlags::TRANSFER_SRC);
        let image = res.create_image(desc).unwrap();

        let layout = layout::image_layout(
            Extent::new_2d(8, 8),
            layout::ImageDimension::D2,
            vk::Format::R8_UNORM,
            4,
            2,
            4,
        )
        .unwrap();
        assert_eq!(layout.total_size, 176);
        let data = pattern(&layout);

        let config = TransferConfig::default();
        upload_image_data(
            &mut res,
            &mut recorder,
            image,
            &slices(&data),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &config,
        )
        .unwrap();

        let target = res.image(image).unwrap();
        let full = target.desc().full_range();
        assert_eq!(
            target.uniform_layout(&full),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert_eq!(
            target.current_layout(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        // Only the image is left; staging went back to the allocator.
        assert_eq!(res.buffer_count(), 0);
        assert_eq!(res.allocator().live_allocations(), 1);
        assert_eq!(recorder.submissions(), 1);

        let read = read_image(&mut res, &mut recorder, image, &config).unwrap();
        assert_eq!(read, data);
        assert_eq!(
            res.image(image).unwrap().uniform_layout(&full),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert_eq!(res.buffer_count(), 0);
    }

    #[test]
    fn prefilled_path_records_barrier_copy_barrier_without_submitting() {
        let (mut res, mut recorder) = setup();
        let image = res
            .create_image(ImageDesc::new(
                "small",
                ImageKind::D2,
                vk::Format::R8_UNORM,
                Extent::new_2d(4, 4),
            ))
            .unwrap();
        let layout = layout::image_layout(
            Extent::new_2d(4, 4),
            layout::ImageDimension::D2,
            vk::Format::R8_UNORM,
            1,
            1,
            4,
        )
        .unwrap();
        assert_eq!(layout.total_size, 16);

        let staging = res
            .create_buffer(BufferDesc::new("staging", BufferKind::Staging, 16))
            .unwrap();
        res.map_buffer(staging, |bytes| bytes.fill(9)).unwrap();

        recorder.begin_recording().unwrap();
        let upload = StagedImageUpload {
            staging,
            image,
            layout: &layout,
            copy_layout: CopyLayout::default(),
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            extent_policy: ExtentPolicy::Logical,
            consumer_family: None,
        };
        // SAFETY: Both resources outlive the submission below.
        unsafe { record_image_upload(&mut res, &mut recorder, &upload) }
            .unwrap();

        let raw_image = res.image(image).unwrap().raw_image();
        let recorded = recorder.recorded();
        assert_eq!(recorded.len(), 3);
        match &recorded[0] {
            Command::ImageBarrier {
                image,
                range,
                old,
                new,
                ..
            } => {
                assert_eq!(*image, raw_image);
                assert_eq!((range.level_count, range.layer_count), (1, 1));
                assert_eq!(*old, vk::ImageLayout::UNDEFINED);
                assert_eq!(*new, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            }
            other => panic!("expected a barrier, got {other:?}"),
        }
        match &recorded[1] {
            Command::CopyBufferToImage { layout, regions, .. } => {
                assert_eq!(*layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(regions.len(), 1);
                assert_eq!(regions[0].buffer_offset, 0);
                assert_eq!(regions[0].image_subresource.mip_level, 0);
                assert_eq!(regions[0].image_subresource.base_array_layer, 0);
                assert_eq!(regions[0].image_extent.width, 4);
                assert_eq!(regions[0].image_extent.height, 4);
                assert_eq!(regions[0].image_extent.depth, 1);
            }
            other => panic!("expected a copy, got {other:?}"),
        }
        assert!(matches!(
            recorded[2],
            Command::ImageBarrier {
                old: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                new: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                ..
            }
        ));
        assert_eq!(recorder.submissions(), 0);

        recorder.end_recording().unwrap();
        recorder.submit_and_wait().unwrap();
        let image_desc = res.image(image).unwrap().desc().clone();
        assert!(!image_desc.usage.contains(vk::ImageUsageFlags::TRANSFER_SRC));
        assert_eq!(recorder.image_bytes(&res, image, 0, 0), Some(vec![9; 16]));
    }

    #[test]
    fn partial_upload_only_transitions_uploaded_levels() {
        let (mut res, mut recorder) = setup();
        let image = res
            .create_image(
                ImageDesc::new(
                    "partial",
                    ImageKind::D2,
                    vk::Format::R8G8B8A8_UNORM,
                    Extent::new_2d(8, 8),
                )
                .mip_levels(4)
                .usage(vk::ImageUsageFlags::TRANSFER_SRC),
            )
            .unwrap();
        let level0 = vec![1_u8; 256];
        let level1 = vec![2_u8; 64];

        upload_image_data(
            &mut res,
            &mut recorder,
            image,
            &[&level0, &level1],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &TransferConfig::default(),
        )
        .unwrap();

        let target = res.image(image).unwrap();
        let shader_read = Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(target.layout_of(0, 0), shader_read);
        assert_eq!(target.layout_of(1, 0), shader_read);
        assert_eq!(target.layout_of(2, 0), Some(vk::ImageLayout::UNDEFINED));
        assert_eq!(target.layout_of(3, 0), Some(vk::ImageLayout::UNDEFINED));

        assert!(matches!(
            read_image(&mut res, &mut recorder, image, &TransferConfig::default()),
            Err(TransferError::UndefinedContents { level: 2, layer: 0 })
        ));
    }

    #[test]
    fn bad_slices_fail_before_any_staging_is_created() {
        let (mut res, mut recorder) = setup();
        let image = res
            .create_image(
                ImageDesc::new(
                    "t",
                    ImageKind::D2,
                    vk::Format::R8_UNORM,
                    Extent::new_2d(8, 8),
                )
                .mip_levels(4),
            )
            .unwrap();
        let config = TransferConfig::default();

        let err = upload_image_data(
            &mut res,
            &mut recorder,
            image,
            &[&[0; 64], &[0; 15]],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &config,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Fill(FillStagingError::SliceSize {
                index: 1,
                expected: 16,
                got: 15
            })
        ));

        let too_many: Vec<&[u8]> = vec![&[0_u8][..]; 5];
        assert!(matches!(
            upload_image_data(
                &mut res,
                &mut recorder,
                image,
                &too_many,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                &config,
            ),
            Err(TransferError::SliceCount { got: 5, .. })
        ));
        assert!(matches!(
            upload_image_data(
                &mut res,
                &mut recorder,
                image,
                &[&[0; 64]],
                vk::ImageLayout::UNDEFINED,
                &config,
            ),
            Err(TransferError::InvalidFinalLayout(_))
        ));
        assert_eq!(res.driver().create_buffer_calls(), 0);
        assert_eq!(recorder.submissions(), 0);
    }

    #[test]
    fn failed_submit_still_destroys_staging() {
        let (mut res, mut recorder) = setup();
        let image = res
            .create_image(ImageDesc::new(
                "t",
                ImageKind::D2,
                vk::Format::R8_UNORM,
                Extent::new_2d(4, 4),
            ))
            .unwrap();
        recorder.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);

        let err = upload_image_data(
            &mut res,
            &mut recorder,
            image,
            &[&[0; 16]],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &TransferConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            TransferError::Vulkan {
                call: "vkQueueSubmit2",
                result: vk::Result::ERROR_DEVICE_LOST,
            }
        ));
        assert_eq!(res.buffer_count(), 0);
        assert_eq!(res.allocator().live_allocations(), 1);
        assert_eq!(
            res.image(image).unwrap().layout_of(0, 0),
            Some(vk::ImageLayout::UNDEFINED)
        );
    }

    #[test]
    fn prefilled_path_validates_staging() {
        let (mut res, mut recorder) = setup();
        let image = res
            .create_image(ImageDesc::new(
                "t",
                ImageKind::D2,
                vk::Format::R8_UNORM,
                Extent::new_2d(4, 4),
            ))
            .unwrap();
        let layout = layout::setup_mip_offsets(&[16], 1, 4).unwrap();
        let readback = res
            .create_buffer(BufferDesc::new("rb", BufferKind::Readback, 16))
            .unwrap();
        let small = res
            .create_buffer(BufferDesc::new("small", BufferKind::Staging, 8))
            .unwrap();

        recorder.begin_recording().unwrap();
        let mut upload = StagedImageUpload {
            staging: readback,
            image,
            layout: &layout,
            copy_layout: CopyLayout::default(),
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            extent_policy: ExtentPolicy::Logical,
            consumer_family: None,
        };
        // SAFETY: Validation fails before anything is recorded.
        let err = unsafe { record_image_upload(&mut res, &mut recorder, &upload) }
            .unwrap_err();
        assert!(matches!(err, TransferError::MissingBufferUsage { .. }));

        upload.staging = small;
        // SAFETY: As above.
        let err = unsafe { record_image_upload(&mut res, &mut recorder, &upload) }
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::StagingTooSmall { needed: 16, size: 8 }
        ));
        assert!(recorder.recorded().is_empty());
    }

    #[test]
    fn buffer_upload_and_readback() {
        let (mut res, mut recorder) = setup();
        let buffer = res
            .create_buffer(BufferDesc::new("ssbo", BufferKind::Storage, 64))
            .unwrap();
        let data: Vec<u8> = (0..32).collect();

        let config = TransferConfig::default();
        let acquire =
            upload_buffer_data(&mut res, &mut recorder, buffer, 16, &data, &config)
                .unwrap();
        assert!(acquire.is_none());
        let raw = res.buffer(buffer).unwrap().raw_buffer();
        let recorded = recorder.recorded();
        assert_eq!(recorded.len(), 3);
        match (&recorded[0], &recorded[2]) {
            (
                Command::BufferBarrier {
                    buffer: first,
                    src_access,
                    dst_access,
                    ..
                },
                Command::BufferBarrier {
                    buffer: last,
                    src_access: after_src,
                    dst_access: after_dst,
                    ..
                },
            ) => {
                assert_eq!((*first, *last), (raw, raw));
                assert_eq!(*dst_access, vk::AccessFlags2::TRANSFER_WRITE);
                assert_eq!(*after_src, vk::AccessFlags2::TRANSFER_WRITE);
                assert_eq!(src_access, after_dst);
                assert!(after_dst.contains(vk::AccessFlags2::SHADER_STORAGE_READ));
            }
            other => panic!("expected buffer barriers, got {other:?}"),
        }

        let read = read_buffer(&mut res, &mut recorder, buffer).unwrap();
        assert_eq!(read.len(), 64);
        assert!(read[..16].iter().all(|&b| b == 0));
        assert_eq!(&read[16..48], data.as_slice());
        assert!(read[48..].iter().all(|&b| b == 0));
        assert_eq!(res.buffer_count(), 1);

        assert!(matches!(
            upload_buffer_data(&mut res, &mut recorder, buffer, 40, &data, &config),
            Err(TransferError::RegionOutOfBounds { index: 0 })
        ));
        let vertex = res
            .create_buffer(BufferDesc::new("vb", BufferKind::Vertex, 16))
            .unwrap();
        assert!(matches!(
            read_buffer(&mut res, &mut recorder, vertex),
            Err(TransferError::MissingBufferUsage { .. })
        ));
    }

    fn transfer_only() -> vk::QueueFlags {
        vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING
    }

    /// Stages a queue without graphics or compute must never see.
    fn foreign_stages() -> vk::PipelineStageFlags2 {
        graphics_stages()
            | vk::PipelineStageFlags2::COMPUTE_SHADER
            | vk::PipelineStageFlags2::DRAW_INDIRECT
    }

    fn assert_no_foreign_stages(recorder: &SoftwareRecorder) {
        let recorded = recorder.recorded();
        assert!(recorded.iter().any(|c| c.stages().is_some()));
        for command in &recorded {
            if let Some(stages) = command.stages() {
                assert!(
                    !stages.intersects(foreign_stages()),
                    "{command:?} names stages a transfer queue lacks"
                );
            }
        }
    }

    #[test]
    fn scopes_are_limited_to_queue_capabilities() {
        use vk::AccessFlags2 as A;
        use vk::PipelineStageFlags2 as S;
        use vk::QueueFlags as Q;

        let sampled = layout_scope(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(limit_scope(sampled, Q::GRAPHICS | Q::COMPUTE), sampled);
        assert_eq!(
            limit_scope(sampled, Q::COMPUTE | Q::TRANSFER),
            (S::COMPUTE_SHADER, A::SHADER_SAMPLED_READ)
        );
        assert_eq!(limit_scope(sampled, transfer_only()), (S::NONE, A::NONE));

        let indirect = buffer_scope(BufferKind::Indirect);
        assert_eq!(limit_scope(indirect, Q::COMPUTE), indirect);
        assert_eq!(limit_scope(indirect, Q::TRANSFER), (S::NONE, A::NONE));

        // Scopes every queue supports pass through.
        assert_eq!(limit_scope(COPY_WRITE, Q::TRANSFER), COPY_WRITE);
        assert_eq!(limit_scope(HOST_READ, Q::TRANSFER), HOST_READ);
        let general = layout_scope(vk::ImageLayout::GENERAL);
        assert_eq!(limit_scope(general, Q::TRANSFER), general);

        let masks = barrier_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        )
        .limited_to(Q::COMPUTE);
        assert_eq!(masks.src_stage, S::COPY);
        assert_eq!(masks.dst_stage, S::NONE);
        assert_eq!(masks.dst_access, A::NONE);
    }

    #[test]
    fn transfer_only_queue_records_no_graphics_or_compute_stages() {
        let (mut res, recorder) = setup();
        let mut recorder = recorder.on_queue(2, transfer_only());
        let config = TransferConfig::default();

        let image = res
            .create_image(
                ImageDesc::new(
                    "tex",
                    ImageKind::D2,
                    vk::Format::R8G8B8A8_UNORM,
                    Extent::new_2d(4, 4),
                )
                .mip_levels(3)
                .usage(vk::ImageUsageFlags::TRANSFER_SRC),
            )
            .unwrap();
        let levels = [vec![1_u8; 64], vec![2; 16], vec![3; 4]];
        let uploaded = upload_image_data(
            &mut res,
            &mut recorder,
            image,
            &slices(&levels),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &config,
        )
        .unwrap();
        assert!(uploaded.acquire.is_none());
        assert_no_foreign_stages(&recorder);
        match recorder.recorded().last() {
            Some(Command::ImageBarrier { masks, new, .. }) => {
                assert_eq!(*new, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                assert_eq!(masks.src_stage, vk::PipelineStageFlags2::COPY);
                assert_eq!(masks.dst_stage, vk::PipelineStageFlags2::NONE);
                assert_eq!(masks.dst_access, vk::AccessFlags2::NONE);
            }
            other => panic!("expected the final image barrier, got {other:?}"),
        }

        let read = read_image(&mut res, &mut recorder, image, &config).unwrap();
        assert_eq!(read, levels);
        assert_no_foreign_stages(&recorder);

        for kind in [
            BufferKind::Vertex,
            BufferKind::Index,
            BufferKind::Indirect,
            BufferKind::UniformTexel,
            BufferKind::Storage,
        ] {
            let buffer = res
                .create_buffer(BufferDesc::new("b", kind, 32))
                .unwrap();
            upload_buffer_data(&mut res, &mut recorder, buffer, 0, &[7; 32], &config)
                .unwrap();
            assert_no_foreign_stages(&recorder);
            if kind == BufferKind::Storage {
                let read = read_buffer(&mut res, &mut recorder, buffer).unwrap();
                assert_eq!(read, vec![7; 32]);
                assert_no_foreign_stages(&recorder);
            }
        }
    }

    #[test]
    fn compute_queue_keeps_compute_stages() {
        let (mut res, recorder) = setup();
        let mut recorder = recorder
            .on_queue(1, vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER);
        let buffer = res
            .create_buffer(BufferDesc::new("ssbo", BufferKind::Storage, 16))
            .unwrap();
        upload_buffer_data(
            &mut res,
            &mut recorder,
            buffer,
            0,
            &[1; 16],
            &TransferConfig::default(),
        )
        .unwrap();

        match recorder.recorded().last() {
            Some(Command::BufferBarrier {
                dst_stage,
                dst_access,
                ..
            }) => {
                assert_eq!(*dst_stage, vk::PipelineStageFlags2::COMPUTE_SHADER);
                assert!(dst_access.contains(vk::AccessFlags2::SHADER_STORAGE_READ));
            }
            other => panic!("expected a buffer barrier, got {other:?}"),
        }
    }

    #[test]
    fn exclusive_resources_are_released_to_the_consumer_family() {
        let (mut res, recorder) = setup();
        let mut recorder = recorder.on_queue(2, transfer_only());
        let config = TransferConfig {
            consumer_family: Some(0),
            ..TransferConfig::default()
        };

        let image = res
            .create_image(ImageDesc::new(
                "tex",
                ImageKind::D2,
                vk::Format::R8_UNORM,
                Extent::new_2d(4, 4),
            ))
            .unwrap();
        let uploaded = upload_image_data(
            &mut res,
            &mut recorder,
            image,
            &[&[5; 16]],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &config,
        )
        .unwrap();
        assert_no_foreign_stages(&recorder);
        match recorder.recorded().last() {
            Some(Command::ImageBarrier {
                masks,
                families,
                old,
                new,
                ..
            }) => {
                assert_eq!(*families, (2, 0));
                assert_eq!(*old, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(*new, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
                assert_eq!(masks.src_access, vk::AccessFlags2::TRANSFER_WRITE);
                assert_eq!(masks.dst_stage, vk::PipelineStageFlags2::NONE);
            }
            other => panic!("expected a release barrier, got {other:?}"),
        }

        let acquire = uploaded.acquire.expect("image should be released");
        let raw_image = res.image(image).unwrap().raw_image();
        assert_eq!(acquire.image, raw_image);
        assert_eq!(acquire.src_queue_family_index, 2);
        assert_eq!(acquire.dst_queue_family_index, 0);
        assert_eq!(acquire.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(acquire.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let range = acquire.subresource_range;
        assert_eq!(
            (range.level_count, range.layer_count),
            (uploaded.range.level_count, uploaded.range.layer_count)
        );
        assert_eq!(acquire.src_stage_mask, vk::PipelineStageFlags2::NONE);
        assert!(acquire
            .dst_stage_mask
            .contains(vk::PipelineStageFlags2::FRAGMENT_SHADER));
        assert_eq!(acquire.dst_access_mask, vk::AccessFlags2::SHADER_SAMPLED_READ);

        let buffer = res
            .create_buffer(BufferDesc::new("vb", BufferKind::Vertex, 8))
            .unwrap();
        let acquire =
            upload_buffer_data(&mut res, &mut recorder, buffer, 0, &[1; 8], &config)
                .unwrap()
                .expect("buffer should be released");
        assert_eq!(
            (acquire.src_queue_family_index, acquire.dst_queue_family_index),
            (2, 0)
        );
        assert_eq!(
            acquire.dst_stage_mask,
            vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT
        );
        assert!(matches!(
            recorder.recorded().last(),
            Some(Command::BufferBarrier { families: (2, 0), .. })
        ));
    }

    #[test]
    fn shared_or_same_family_resources_keep_ownership() {
        let (mut res, recorder) = setup();
        let mut recorder = recorder.on_queue(2, transfer_only());
        let ignored = (vk::QUEUE_FAMILY_IGNORED, vk::QUEUE_FAMILY_IGNORED);

        let shared = res
            .create_image(
                ImageDesc::new(
                    "shared",
                    ImageKind::D2,
                    vk::Format::R8_UNORM,
                    Extent::new_2d(4, 4),
                )
                .sharing(Sharing::Concurrent(vec![0, 2])),
            )
            .unwrap();
        let to_graphics = TransferConfig {
            consumer_family: Some(0),
            ..TransferConfig::default()
        };
        let uploaded = upload_image_data(
            &mut res,
            &mut recorder,
            shared,
            &[&[1; 16]],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &to_graphics,
        )
        .unwrap();
        assert!(uploaded.acquire.is_none());
        assert!(matches!(
            recorder.recorded().last(),
            Some(Command::ImageBarrier { families, .. }) if *families == ignored
        ));

        let exclusive = res
            .create_image(ImageDesc::new(
                "exclusive",
                ImageKind::D2,
                vk::Format::R8_UNORM,
                Extent::new_2d(4, 4),
            ))
            .unwrap();
        let same_family = TransferConfig {
            consumer_family: Some(2),
            ..TransferConfig::default()
        };
        let uploaded = upload_image_data(
            &mut res,
            &mut recorder,
            exclusive,
            &[&[1; 16]],
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            &same_family,
        )
        .unwrap();
        assert!(uploaded.acquire.is_none());
        assert!(matches!(
            recorder.recorded().last(),
            Some(Command::ImageBarrier { families, .. }) if *families == ignored
        ));
    }
}
