//! Buffers and images as seen by the binder.
//!
//! Neither type owns a device reference; both live inside a
//! [`Resources`](crate::binder::Resources) table and are addressed through
//! [`Handle`](crate::arena::Handle)s. Native creation, binding and
//! destruction go through the table.

use ash::vk;
use thiserror::Error;

use crate::device::{MemoryUsage, dedup_queue_families};
use crate::format::required_features;
use crate::layout::{Extent, ImageDimension, format_info};
use crate::memory::DeviceMemory;

// ---------------------------------------------------------------------------
// Sharing
// ---------------------------------------------------------------------------

/// Queue family ownership of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Sharing {
    #[default]
    Exclusive,
    /// Accessed concurrently from every listed family.
    Concurrent(Vec<u32>),
}

impl Sharing {
    pub fn mode(&self) -> vk::SharingMode {
        match self.queue_families().len() {
            0 | 1 => vk::SharingMode::EXCLUSIVE,
            _ => vk::SharingMode::CONCURRENT,
        }
    }

    /// Distinct queue families; empty for exclusive sharing.
    ///
    /// A concurrent list that collapses to a single family is lowered as
    /// exclusive, since Vulkan requires at least two for concurrent mode.
    pub fn queue_families(&self) -> Vec<u32> {
        match self {
            Sharing::Exclusive => Vec::new(),
            Sharing::Concurrent(families) => {
                let families = dedup_queue_families(families);
                if families.len() < 2 { Vec::new() } else { families }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Memory binding
// ---------------------------------------------------------------------------

/// The memory currently backing a resource.
#[derive(Debug)]
pub struct MemoryBinding {
    pub memory: DeviceMemory,
    /// Bind offset relative to the start of `memory`.
    pub offset: vk::DeviceSize,
    /// Size of `memory` at bind time.
    pub size: vk::DeviceSize,
}

/// Properties shared by buffers and images.
pub trait Resource {
    fn name(&self) -> &str;

    fn sharing(&self) -> &Sharing;

    /// Requirements of the current native object.
    fn requirements(&self) -> vk::MemoryRequirements;

    fn binding(&self) -> Option<&MemoryBinding>;

    /// A resource may only be used for recording once this is true.
    fn is_bound(&self) -> bool {
        self.binding().is_some()
    }

    /// Raw handle as an integer, for logging and tests.
    fn raw_u64(&self) -> u64;
}

// ---------------------------------------------------------------------------
// Buffers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferKind {
    /// Host-written source of transfers.
    Staging,
    Vertex,
    Index,
    Storage,
    Indirect,
    UniformTexel,
    /// Host-read destination of transfers.
    Readback,
}

impl BufferKind {
    pub fn usage(self) -> vk::BufferUsageFlags {
        use vk::BufferUsageFlags as U;
        match self {
            BufferKind::Staging => U::TRANSFER_SRC,
            BufferKind::Readback => U::TRANSFER_DST,
            BufferKind::Vertex => U::VERTEX_BUFFER | U::TRANSFER_DST,
            BufferKind::Index => U::INDEX_BUFFER | U::TRANSFER_DST,
            BufferKind::Storage => {
                U::STORAGE_BUFFER | U::TRANSFER_DST | U::TRANSFER_SRC
            }
            BufferKind::Indirect => U::INDIRECT_BUFFER | U::TRANSFER_DST,
            BufferKind::UniformTexel => {
                U::UNIFORM_TEXEL_BUFFER | U::TRANSFER_DST
            }
        }
    }

    /// Default memory for this kind. Dynamic buffers are written from the
    /// host every frame and so live in host-visible memory.
    pub fn memory_usage(self, dynamic: bool) -> MemoryUsage {
        match self {
            BufferKind::Staging => MemoryUsage::CpuToGpu,
            BufferKind::Readback => MemoryUsage::GpuToCpu,
            _ if dynamic => MemoryUsage::CpuToGpu,
            _ => MemoryUsage::GpuOnly,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferDesc {
    pub name: String,
    pub kind: BufferKind,
    pub size: vk::DeviceSize,
    pub sharing: Sharing,
    pub flags: vk::BufferCreateFlags,
    /// Usage on top of what `kind` implies.
    pub extra_usage: vk::BufferUsageFlags,
    pub dynamic: bool,
}

impl BufferDesc {
    pub fn new(
        name: impl Into<String>,
        kind: BufferKind,
        size: vk::DeviceSize,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            size,
            sharing: Sharing::Exclusive,
            flags: vk::BufferCreateFlags::empty(),
            extra_usage: vk::BufferUsageFlags::empty(),
            dynamic: false,
        }
    }

    pub fn sharing(mut self, sharing: Sharing) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn extra_usage(mut self, usage: vk::BufferUsageFlags) -> Self {
        self.extra_usage |= usage;
        self
    }

    pub fn dynamic(mut self, dynamic: bool) -> Self {
        self.dynamic = dynamic;
        self
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.kind.usage() | self.extra_usage
    }

    pub fn memory_usage(&self) -> MemoryUsage {
        self.kind.memory_usage(self.dynamic)
    }

    /// Lower into a create info. `families` must come from
    /// [`Sharing::queue_families`] on this desc.
    pub fn create_info<'a>(
        &self,
        families: &'a [u32],
    ) -> vk::BufferCreateInfo<'a> {
        let info = vk::BufferCreateInfo::default()
            .flags(self.flags)
            .size(self.size)
            .usage(self.usage())
            .sharing_mode(self.sharing.mode());
        if families.is_empty() {
            info
        } else {
            info.queue_family_indices(families)
        }
    }
}

pub struct Buffer {
    pub(crate) raw: vk::Buffer,
    pub(crate) desc: BufferDesc,
    pub(crate) requirements: vk::MemoryRequirements,
    pub(crate) binding: Option<MemoryBinding>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("raw", &self.raw)
            .field("name", &self.desc.name)
            .field("size", &self.desc.size)
            .field("bound", &self.binding.is_some())
            .finish_non_exhaustive()
    }
}

impl Buffer {
    pub fn raw_buffer(&self) -> vk::Buffer {
        self.raw
    }

    pub fn desc(&self) -> &BufferDesc {
        &self.desc
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.desc.size
    }
}

impl Resource for Buffer {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn sharing(&self) -> &Sharing {
        &self.desc.sharing
    }

    fn requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    fn binding(&self) -> Option<&MemoryBinding> {
        self.binding.as_ref()
    }

    fn raw_u64(&self) -> u64 {
        vk::Handle::as_raw(self.raw)
    }
}

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    D1,
    D1Array,
    D2,
    D2Array,
    D3,
    Cube,
}

impl ImageKind {
    pub fn dimension(self) -> ImageDimension {
        match self {
            ImageKind::D1 | ImageKind::D1Array => ImageDimension::D1,
            ImageKind::D2 | ImageKind::D2Array | ImageKind::Cube => {
                ImageDimension::D2
            }
            ImageKind::D3 => ImageDimension::D3,
        }
    }

    pub fn image_type(self) -> vk::ImageType {
        self.dimension().into()
    }

    pub fn create_flags(self) -> vk::ImageCreateFlags {
        match self {
            ImageKind::Cube => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        }
    }

    pub fn view_type(self, array_layers: u32) -> vk::ImageViewType {
        match self {
            ImageKind::D1 => vk::ImageViewType::TYPE_1D,
            ImageKind::D1Array => vk::ImageViewType::TYPE_1D_ARRAY,
            ImageKind::D2 => vk::ImageViewType::TYPE_2D,
            ImageKind::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
            ImageKind::D3 => vk::ImageViewType::TYPE_3D,
            ImageKind::Cube if array_layers > 6 => {
                vk::ImageViewType::CUBE_ARRAY
            }
            ImageKind::Cube => vk::ImageViewType::CUBE,
        }
    }

    pub fn is_array(self) -> bool {
        matches!(self, ImageKind::D1Array | ImageKind::D2Array | ImageKind::Cube)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidImageDesc {
    #[error("Image extent has a zero component: {0:?}")]
    ZeroExtent(Extent),

    #[error("Image must have at least one mip level")]
    ZeroMipLevels,

    #[error("{requested} mip levels requested, extent allows at most {max}")]
    TooManyMipLevels { requested: u32, max: u32 },

    #[error("Image must have at least one array layer")]
    ZeroArrayLayers,

    #[error("{kind:?} images take exactly one array layer, got {layers}")]
    LayersForKind { kind: ImageKind, layers: u32 },

    #[error("Cube images need a multiple of six layers, got {0}")]
    CubeLayers(u32),

    #[error("Cube faces must be square, got {width}x{height}")]
    NonSquareCube { width: u32, height: u32 },

    #[error("Multisampled images cannot have mip levels")]
    MultisampledMips,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDesc {
    pub name: String,
    pub kind: ImageKind,
    pub format: vk::Format,
    pub extent: Extent,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub tiling: vk::ImageTiling,
    pub usage: vk::ImageUsageFlags,
    pub sharing: Sharing,
    /// Levels will be produced by blitting, so the format needs blit
    /// support.
    pub generate_mips: bool,
}

impl ImageDesc {
    pub fn new(
        name: impl Into<String>,
        kind: ImageKind,
        format: vk::Format,
        extent: Extent,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            format,
            extent: extent.restricted_to(kind.dimension()),
            mip_levels: 1,
            array_layers: if kind == ImageKind::Cube { 6 } else { 1 },
            samples: vk::SampleCountFlags::TYPE_1,
            tiling: vk::ImageTiling::OPTIMAL,
            usage: vk::ImageUsageFlags::SAMPLED
                | vk::ImageUsageFlags::TRANSFER_DST,
            sharing: Sharing::Exclusive,
            generate_mips: false,
        }
    }

    pub fn mip_levels(mut self, mip_levels: u32) -> Self {
        self.mip_levels = mip_levels;
        self
    }

    /// Full mip chain down to 1x1x1.
    pub fn full_mip_chain(mut self) -> Self {
        self.mip_levels = self.extent.max_mip_levels(self.kind.dimension());
        self
    }

    pub fn array_layers(mut self, array_layers: u32) -> Self {
        self.array_layers = array_layers;
        self
    }

    pub fn usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.usage |= usage;
        self
    }

    pub fn tiling(mut self, tiling: vk::ImageTiling) -> Self {
        self.tiling = tiling;
        self
    }

    pub fn samples(mut self, samples: vk::SampleCountFlags) -> Self {
        self.samples = samples;
        self
    }

    pub fn sharing(mut self, sharing: Sharing) -> Self {
        self.sharing = sharing;
        self
    }

    pub fn generate_mips(mut self, generate_mips: bool) -> Self {
        self.generate_mips = generate_mips;
        self
    }

    pub fn dimension(&self) -> ImageDimension {
        self.kind.dimension()
    }

    pub fn validate(&self) -> Result<(), InvalidImageDesc> {
        if self.extent.width == 0
            || self.extent.height == 0
            || self.extent.depth == 0
        {
            return Err(InvalidImageDesc::ZeroExtent(self.extent));
        }
        if self.mip_levels == 0 {
            return Err(InvalidImageDesc::ZeroMipLevels);
        }
        let max = self.extent.max_mip_levels(self.dimension());
        if self.mip_levels > max {
            return Err(InvalidImageDesc::TooManyMipLevels {
                requested: self.mip_levels,
                max,
            });
        }
        if self.array_layers == 0 {
            return Err(InvalidImageDesc::ZeroArrayLayers);
        }
        match self.kind {
            ImageKind::D1 | ImageKind::D2 | ImageKind::D3
                if self.array_layers != 1 =>
            {
                return Err(InvalidImageDesc::LayersForKind {
                    kind: self.kind,
                    layers: self.array_layers,
                });
            }
            ImageKind::Cube => {
                if self.array_layers % 6 != 0 {
                    return Err(InvalidImageDesc::CubeLayers(self.array_layers));
                }
                if self.extent.width != self.extent.height {
                    return Err(InvalidImageDesc::NonSquareCube {
                        width: self.extent.width,
                        height: self.extent.height,
                    });
                }
            }
            _ => {}
        }
        if self.samples != vk::SampleCountFlags::TYPE_1 && self.mip_levels > 1
        {
            return Err(InvalidImageDesc::MultisampledMips);
        }
        Ok(())
    }

    /// Format features this image needs for its usage.
    pub fn required_features(&self) -> vk::FormatFeatureFlags {
        required_features(self.usage, self.generate_mips)
    }

    pub fn aspect(&self) -> vk::ImageAspectFlags {
        aspect_for_format(self.format)
    }

    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(self.aspect())
            .base_mip_level(0)
            .level_count(self.mip_levels)
            .base_array_layer(0)
            .layer_count(self.array_layers)
    }

    pub fn create_info<'a>(
        &self,
        families: &'a [u32],
    ) -> vk::ImageCreateInfo<'a> {
        let info = vk::ImageCreateInfo::default()
            .flags(self.kind.create_flags())
            .image_type(self.kind.image_type())
            .format(self.format)
            .extent(self.extent.into())
            .mip_levels(self.mip_levels)
            .array_layers(self.array_layers)
            .samples(self.samples)
            .tiling(self.tiling)
            .usage(self.usage)
            .sharing_mode(self.sharing.mode())
            .initial_layout(vk::ImageLayout::UNDEFINED);
        if families.is_empty() {
            info
        } else {
            info.queue_family_indices(families)
        }
    }
}

pub fn aspect_for_format(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM
        | vk::Format::X8_D24_UNORM_PACK32
        | vk::Format::D32_SFLOAT => vk::ImageAspectFlags::DEPTH,
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::COLOR,
    }
}

pub struct Image {
    pub(crate) raw: vk::Image,
    pub(crate) desc: ImageDesc,
    pub(crate) requirements: vk::MemoryRequirements,
    pub(crate) binding: Option<MemoryBinding>,
    /// One entry per (layer, level), layer-major.
    layouts: Vec<vk::ImageLayout>,
    current_layout: vk::ImageLayout,
}

impl std::fmt::Debug for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Image")
            .field("raw", &self.raw)
            .field("name", &self.desc.name)
            .field("format", &self.desc.format)
            .field("extent", &self.desc.extent)
            .field("current_layout", &self.current_layout)
            .finish_non_exhaustive()
    }
}

impl Image {
    pub(crate) fn new(
        raw: vk::Image,
        desc: ImageDesc,
        requirements: vk::MemoryRequirements,
    ) -> Self {
        let count = desc.mip_levels as usize * desc.array_layers as usize;
        Self {
            raw,
            desc,
            requirements,
            binding: None,
            layouts: vec![vk::ImageLayout::UNDEFINED; count],
            current_layout: vk::ImageLayout::UNDEFINED,
        }
    }

    pub fn raw_image(&self) -> vk::Image {
        self.raw
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }

    pub fn format(&self) -> vk::Format {
        self.desc.format
    }

    pub fn extent(&self) -> Extent {
        self.desc.extent
    }

    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }

    pub fn array_layers(&self) -> u32 {
        self.desc.array_layers
    }

    pub fn is_block_compressed(&self) -> bool {
        format_info(self.desc.format).is_some_and(|i| i.is_block_compressed())
    }

    fn index(&self, level: u32, layer: u32) -> Option<usize> {
        (level < self.desc.mip_levels && layer < self.desc.array_layers).then(
            || layer as usize * self.desc.mip_levels as usize + level as usize,
        )
    }

    /// Tracked layout of one subresource.
    pub fn layout_of(&self, level: u32, layer: u32) -> Option<vk::ImageLayout> {
        self.index(level, layer).map(|idx| self.layouts[idx])
    }

    /// The layout shared by every subresource in `range`, or `None` when
    /// they differ or the range is out of bounds.
    pub fn uniform_layout(
        &self,
        range: &vk::ImageSubresourceRange,
    ) -> Option<vk::ImageLayout> {
        let mut seen = None;
        for layer in range.base_array_layer
            ..range.base_array_layer.checked_add(range.layer_count)?
        {
            for level in
                range.base_mip_level..range.base_mip_level.checked_add(range.level_count)?
            {
                let layout = self.layout_of(level, layer)?;
                match seen {
                    None => seen = Some(layout),
                    Some(prev) if prev != layout => return None,
                    Some(_) => {}
                }
            }
        }
        seen
    }

    /// The most recently transitioned layout, whatever range it covered.
    pub fn current_layout(&self) -> vk::ImageLayout {
        self.current_layout
    }

    pub(crate) fn set_layout(
        &mut self,
        range: &vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
    ) {
        let levels = self.desc.mip_levels;
        let layers = self.desc.array_layers;
        let level_end = range.base_mip_level.saturating_add(range.level_count);
        let layer_end =
            range.base_array_layer.saturating_add(range.layer_count);
        for layer in range.base_array_layer..layer_end.min(layers) {
            for level in range.base_mip_level..level_end.min(levels) {
                let idx = layer as usize * levels as usize + level as usize;
                self.layouts[idx] = layout;
            }
        }
        self.current_layout = layout;
    }

    pub(crate) fn reset_layouts(&mut self) {
        self.layouts.fill(vk::ImageLayout::UNDEFINED);
        self.current_layout = vk::ImageLayout::UNDEFINED;
    }
}

impl Resource for Image {
    fn name(&self) -> &str {
        &self.desc.name
    }

    fn sharing(&self) -> &Sharing {
        &self.desc.sharing
    }

    fn requirements(&self) -> vk::MemoryRequirements {
        self.requirements
    }

    fn binding(&self) -> Option<&MemoryBinding> {
        self.binding.as_ref()
    }

    fn raw_u64(&self) -> u64 {
        vk::Handle::as_raw(self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(
        base_level: u32,
        levels: u32,
        base_layer: u32,
        layers: u32,
    ) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange::default()
            .aspect_mask(vk::ImageAspectFlags::COLOR)
            .base_mip_level(base_level)
            .level_count(levels)
            .base_array_layer(base_layer)
            .layer_count(layers)
    }

    #[test]
    fn concurrent_sharing_needs_two_families() {
        assert_eq!(Sharing::Exclusive.mode(), vk::SharingMode::EXCLUSIVE);
        let single = Sharing::Concurrent(vec![1, 1]);
        assert_eq!(single.mode(), vk::SharingMode::EXCLUSIVE);
        assert!(single.queue_families().is_empty());

        let both = Sharing::Concurrent(vec![2, 0, 2]);
        assert_eq!(both.mode(), vk::SharingMode::CONCURRENT);
        assert_eq!(both.queue_families(), vec![2, 0]);
    }

    #[test]
    fn buffer_kinds_pick_memory() {
        assert_eq!(BufferKind::Staging.memory_usage(false), MemoryUsage::CpuToGpu);
        assert_eq!(BufferKind::Vertex.memory_usage(false), MemoryUsage::GpuOnly);
        assert_eq!(BufferKind::Vertex.memory_usage(true), MemoryUsage::CpuToGpu);
        assert_eq!(
            BufferKind::Readback.memory_usage(true),
            MemoryUsage::GpuToCpu
        );
        let desc = BufferDesc::new("idx", BufferKind::Index, 64)
            .extra_usage(vk::BufferUsageFlags::STORAGE_BUFFER);
        assert!(desc.usage().contains(
            vk::BufferUsageFlags::INDEX_BUFFER
                | vk::BufferUsageFlags::STORAGE_BUFFER
        ));
    }

    #[test]
    fn image_desc_validation() {
        let base = ImageDesc::new(
            "t",
            ImageKind::D2,
            vk::Format::R8_UNORM,
            Extent::new_2d(8, 8),
        );
        assert_eq!(base.validate(), Ok(()));
        assert_eq!(
            base.clone().mip_levels(5).validate(),
            Err(InvalidImageDesc::TooManyMipLevels {
                requested: 5,
                max: 4
            })
        );
        assert_eq!(
            base.clone().array_layers(2).validate(),
            Err(InvalidImageDesc::LayersForKind {
                kind: ImageKind::D2,
                layers: 2
            })
        );

        let cube = ImageDesc::new(
            "c",
            ImageKind::Cube,
            vk::Format::R8_UNORM,
            Extent::new_2d(8, 8),
        );
        assert_eq!(cube.array_layers, 6);
        assert_eq!(cube.validate(), Ok(()));
        assert_eq!(
            cube.clone().array_layers(8).validate(),
            Err(InvalidImageDesc::CubeLayers(8))
        );
        assert_eq!(cube.kind.view_type(12), vk::ImageViewType::CUBE_ARRAY);

        let flat = ImageDesc::new(
            "1d",
            ImageKind::D1,
            vk::Format::R8_UNORM,
            Extent::new_3d(16, 4, 4),
        );
        assert_eq!(flat.extent, Extent::new_1d(16));
        assert_eq!(flat.full_mip_chain().mip_levels, 5);
    }

    #[test]
    fn layouts_tracked_per_subresource() {
        let desc = ImageDesc::new(
            "t",
            ImageKind::D2Array,
            vk::Format::R8_UNORM,
            Extent::new_2d(8, 8),
        )
        .mip_levels(4)
        .array_layers(2);
        let mut image = Image::new(vk::Image::null(), desc, Default::default());

        let full = image.desc().full_range();
        assert_eq!(image.uniform_layout(&full), Some(vk::ImageLayout::UNDEFINED));

        image.set_layout(&range(1, 2, 1, 1), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(
            image.layout_of(1, 1),
            Some(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        );
        assert_eq!(image.layout_of(1, 0), Some(vk::ImageLayout::UNDEFINED));
        assert_eq!(image.layout_of(3, 1), Some(vk::ImageLayout::UNDEFINED));
        assert_eq!(image.layout_of(4, 0), None);
        assert_eq!(image.uniform_layout(&full), None);
        assert_eq!(
            image.current_layout(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );

        image.reset_layouts();
        assert_eq!(image.uniform_layout(&full), Some(vk::ImageLayout::UNDEFINED));
        assert_eq!(image.current_layout(), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn depth_formats_use_depth_aspect() {
        assert_eq!(
            aspect_for_format(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            aspect_for_format(vk::Format::BC7_UNORM_BLOCK),
            vk::ImageAspectFlags::COLOR
        );
    }
}
