//! Mip chain byte layouts and buffer-to-image copy regions.
//!
//! Everything in this module is pure arithmetic over extents and format
//! block footprints. No Vulkan calls are made; the results are consumed by
//! [`crate::transfer`] to fill staging buffers and record copies.
//!
//! Staging buffers are packed layer-major, level-minor:
//!
//! ```text
//! | L0 m0 | L0 m1 | .. | L0 mN-1 | L1 m0 | .. | LL-1 mN-1 |
//! ```
//!
//! Every level starts on an `alignment` boundary.

use ash::vk;
use thiserror::Error;

/// Buffer offset granularity used for packed mip chains.
///
/// `vkCmdCopyBufferToImage` requires buffer offsets to be a multiple of 4.
pub const DEFAULT_OFFSET_ALIGNMENT: vk::DeviceSize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Format {0:?} has no known texel block footprint")]
    UnknownFormat(vk::Format),

    #[error("Offset alignment must be non-zero")]
    ZeroAlignment,

    #[error("Offset alignment {0} is not a power of two")]
    NonPowerOfTwoAlignment(vk::DeviceSize),

    #[error("A mip chain needs at least one level")]
    ZeroMipLevels,

    #[error("An image needs at least one array layer")]
    ZeroArrayLayers,
}

/// A 1-3 dimensional size in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl Extent {
    pub const ZERO: Self = Self {
        width: 0,
        height: 0,
        depth: 0,
    };

    pub fn new(width: u32, height: u32, depth: u32) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn new_1d(width: u32) -> Self {
        Self::new(width, 1, 1)
    }

    pub fn new_2d(width: u32, height: u32) -> Self {
        Self::new(width, height, 1)
    }

    pub fn new_3d(width: u32, height: u32, depth: u32) -> Self {
        Self::new(width, height, depth)
    }

    pub fn is_zero(&self) -> bool {
        self.width == 0 || self.height == 0 || self.depth == 0
    }

    /// Number of texels covered by this extent.
    pub fn texel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.depth)
    }

    /// Clamp the components a lower-dimensional image ignores to 1.
    pub fn restricted_to(self, dimension: ImageDimension) -> Self {
        match dimension {
            ImageDimension::D1 => Self::new(self.width, 1, 1),
            ImageDimension::D2 => Self::new(self.width, self.height, 1),
            ImageDimension::D3 => self,
        }
    }

    /// The largest number of mip levels this extent can hold.
    pub fn max_mip_levels(&self, dimension: ImageDimension) -> u32 {
        let e = self.restricted_to(dimension);
        let largest = e.width.max(e.height).max(e.depth).max(1);
        u32::BITS - largest.leading_zeros()
    }
}

impl From<Extent> for vk::Extent3D {
    fn from(value: Extent) -> Self {
        vk::Extent3D {
            width: value.width,
            height: value.height,
            depth: value.depth,
        }
    }
}

impl From<vk::Extent3D> for Extent {
    fn from(value: vk::Extent3D) -> Self {
        Self::new(value.width, value.height, value.depth)
    }
}

/// Dimensionality of an image. Ordered so that `D1 < D2 < D3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ImageDimension {
    D1,
    D2,
    D3,
}

impl From<ImageDimension> for vk::ImageType {
    fn from(value: ImageDimension) -> Self {
        match value {
            ImageDimension::D1 => vk::ImageType::TYPE_1D,
            ImageDimension::D2 => vk::ImageType::TYPE_2D,
            ImageDimension::D3 => vk::ImageType::TYPE_3D,
        }
    }
}

/// Texel block footprint of a format.
///
/// Uncompressed formats have a 1x1x1 block whose size is the texel size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatInfo {
    pub block_width: u32,
    pub block_height: u32,
    pub block_depth: u32,
    pub block_bytes: u32,
}

impl FormatInfo {
    const fn texel(bytes: u32) -> Self {
        Self {
            block_width: 1,
            block_height: 1,
            block_depth: 1,
            block_bytes: bytes,
        }
    }

    const fn block(width: u32, height: u32, bytes: u32) -> Self {
        Self {
            block_width: width,
            block_height: height,
            block_depth: 1,
            block_bytes: bytes,
        }
    }

    pub fn is_block_compressed(&self) -> bool {
        self.block_width > 1 || self.block_height > 1 || self.block_depth > 1
    }

    /// Number of blocks needed to cover `extent` along each axis.
    pub fn blocks_for(&self, extent: Extent) -> (u32, u32, u32) {
        (
            extent.width.div_ceil(self.block_width),
            extent.height.div_ceil(self.block_height),
            extent.depth.div_ceil(self.block_depth),
        )
    }

    /// Round `extent` up to whole blocks.
    pub fn round_to_blocks(&self, extent: Extent) -> Extent {
        let (w, h, d) = self.blocks_for(extent);
        Extent::new(
            w * self.block_width,
            h * self.block_height,
            d * self.block_depth,
        )
    }
}

/// Look up the block footprint of `format`.
///
/// Covers the colour, depth and compressed formats used for sampled
/// textures. Returns `None` for multi-planar and combined depth/stencil
/// formats, whose packed size depends on the copied aspect.
pub fn format_info(format: vk::Format) -> Option<FormatInfo> {
    use vk::Format as F;

    let texel = FormatInfo::texel;
    let block = FormatInfo::block;

    let info = match format {
        F::R8_UNORM | F::R8_SNORM | F::R8_UINT | F::R8_SINT | F::R8_SRGB
        | F::S8_UINT => texel(1),

        F::R8G8_UNORM
        | F::R8G8_SNORM
        | F::R8G8_UINT
        | F::R8G8_SINT
        | F::R8G8_SRGB
        | F::R16_UNORM
        | F::R16_SNORM
        | F::R16_UINT
        | F::R16_SINT
        | F::R16_SFLOAT
        | F::D16_UNORM => texel(2),

        F::R8G8B8_UNORM
        | F::R8G8B8_SNORM
        | F::R8G8B8_UINT
        | F::R8G8B8_SINT
        | F::R8G8B8_SRGB
        | F::B8G8R8_UNORM
        | F::B8G8R8_SNORM
        | F::B8G8R8_UINT
        | F::B8G8R8_SINT
        | F::B8G8R8_SRGB => texel(3),

        F::R8G8B8A8_UNORM
        | F::R8G8B8A8_SNORM
        | F::R8G8B8A8_UINT
        | F::R8G8B8A8_SINT
        | F::R8G8B8A8_SRGB
        | F::B8G8R8A8_UNORM
        | F::B8G8R8A8_SNORM
        | F::B8G8R8A8_UINT
        | F::B8G8R8A8_SINT
        | F::B8G8R8A8_SRGB
        | F::A2B10G10R10_UNORM_PACK32
        | F::A2R10G10B10_UNORM_PACK32
        | F::B10G11R11_UFLOAT_PACK32
        | F::E5B9G9R9_UFLOAT_PACK32
        | F::R16G16_UNORM
        | F::R16G16_SNORM
        | F::R16G16_UINT
        | F::R16G16_SINT
        | F::R16G16_SFLOAT
        | F::R32_UINT
        | F::R32_SINT
        | F::R32_SFLOAT
        | F::D32_SFLOAT
        | F::X8_D24_UNORM_PACK32 => texel(4),

        F::R16G16B16A16_UNORM
        | F::R16G16B16A16_SNORM
        | F::R16G16B16A16_UINT
        | F::R16G16B16A16_SINT
        | F::R16G16B16A16_SFLOAT
        | F::R32G32_UINT
        | F::R32G32_SINT
        | F::R32G32_SFLOAT => texel(8),

        F::R32G32B32_UINT | F::R32G32B32_SINT | F::R32G32B32_SFLOAT => {
            texel(12)
        }

        F::R32G32B32A32_UINT
        | F::R32G32B32A32_SINT
        | F::R32G32B32A32_SFLOAT => texel(16),

        F::BC1_RGB_UNORM_BLOCK
        | F::BC1_RGB_SRGB_BLOCK
        | F::BC1_RGBA_UNORM_BLOCK
        | F::BC1_RGBA_SRGB_BLOCK
        | F::BC4_UNORM_BLOCK
        | F::BC4_SNORM_BLOCK
        | F::ETC2_R8G8B8_UNORM_BLOCK
        | F::ETC2_R8G8B8_SRGB_BLOCK
        | F::ETC2_R8G8B8A1_UNORM_BLOCK
        | F::ETC2_R8G8B8A1_SRGB_BLOCK
        | F::EAC_R11_UNORM_BLOCK
        | F::EAC_R11_SNORM_BLOCK => block(4, 4, 8),

        F::BC2_UNORM_BLOCK
        | F::BC2_SRGB_BLOCK
        | F::BC3_UNORM_BLOCK
        | F::BC3_SRGB_BLOCK
        | F::BC5_UNORM_BLOCK
        | F::BC5_SNORM_BLOCK
        | F::BC6H_UFLOAT_BLOCK
        | F::BC6H_SFLOAT_BLOCK
        | F::BC7_UNORM_BLOCK
        | F::BC7_SRGB_BLOCK
        | F::ETC2_R8G8B8A8_UNORM_BLOCK
        | F::ETC2_R8G8B8A8_SRGB_BLOCK
        | F::EAC_R11G11_UNORM_BLOCK
        | F::EAC_R11G11_SNORM_BLOCK
        | F::ASTC_4X4_UNORM_BLOCK
        | F::ASTC_4X4_SRGB_BLOCK => block(4, 4, 16),

        F::ASTC_5X4_UNORM_BLOCK | F::ASTC_5X4_SRGB_BLOCK => block(5, 4, 16),
        F::ASTC_5X5_UNORM_BLOCK | F::ASTC_5X5_SRGB_BLOCK => block(5, 5, 16),
        F::ASTC_6X5_UNORM_BLOCK | F::ASTC_6X5_SRGB_BLOCK => block(6, 5, 16),
        F::ASTC_6X6_UNORM_BLOCK | F::ASTC_6X6_SRGB_BLOCK => block(6, 6, 16),
        F::ASTC_8X5_UNORM_BLOCK | F::ASTC_8X5_SRGB_BLOCK => block(8, 5, 16),
        F::ASTC_8X6_UNORM_BLOCK | F::ASTC_8X6_SRGB_BLOCK => block(8, 6, 16),
        F::ASTC_8X8_UNORM_BLOCK | F::ASTC_8X8_SRGB_BLOCK => block(8, 8, 16),
        F::ASTC_10X5_UNORM_BLOCK | F::ASTC_10X5_SRGB_BLOCK => {
            block(10, 5, 16)
        }
        F::ASTC_10X6_UNORM_BLOCK | F::ASTC_10X6_SRGB_BLOCK => {
            block(10, 6, 16)
        }
        F::ASTC_10X8_UNORM_BLOCK | F::ASTC_10X8_SRGB_BLOCK => {
            block(10, 8, 16)
        }
        F::ASTC_10X10_UNORM_BLOCK | F::ASTC_10X10_SRGB_BLOCK => {
            block(10, 10, 16)
        }
        F::ASTC_12X10_UNORM_BLOCK | F::ASTC_12X10_SRGB_BLOCK => {
            block(12, 10, 16)
        }
        F::ASTC_12X12_UNORM_BLOCK | F::ASTC_12X12_SRGB_BLOCK => {
            block(12, 12, 16)
        }

        _ => return None,
    };
    Some(info)
}

/// Which extent a copy region carries for block-compressed formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtentPolicy {
    /// The halved texel extent, unrounded. Valid because every level's
    /// extent reaches the image edge.
    #[default]
    Logical,
    /// The extent rounded up to whole blocks.
    BlockRounded,
}

/// Round `value` up to the next multiple of `alignment`. A zero alignment
/// leaves `value` unchanged.
///
/// Layout entry points reject alignments that are not powers of two with
/// [`LayoutError`] before they get here.
pub fn align_up(value: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    if alignment.is_power_of_two() {
        (value + alignment - 1) & !(alignment - 1)
    } else if alignment == 0 {
        value
    } else {
        value.next_multiple_of(alignment)
    }
}

fn check_alignment(alignment: vk::DeviceSize) -> Result<(), LayoutError> {
    if alignment == 0 {
        Err(LayoutError::ZeroAlignment)
    } else if !alignment.is_power_of_two() {
        Err(LayoutError::NonPowerOfTwoAlignment(alignment))
    } else {
        Ok(())
    }
}

fn halve(extent: Extent, dimension: ImageDimension) -> Extent {
    Extent {
        width: (extent.width >> 1).max(1),
        height: if dimension > ImageDimension::D1 {
            (extent.height >> 1).max(1)
        } else {
            1
        },
        depth: if dimension > ImageDimension::D2 {
            (extent.depth >> 1).max(1)
        } else {
            1
        },
    }
}

/// Extent of mip `level` of an image whose level 0 is `base`.
///
/// Width is halved always, height only for 2-D and 3-D images, depth only
/// for 3-D images; each halving is floored at 1. When `format` is block
/// compressed the result is rounded up to whole blocks.
///
/// Returns [`Extent::ZERO`] when `level >= mip_levels`; callers must treat
/// that as invalid.
pub fn calculate_mip_extent(
    base: Extent,
    dimension: ImageDimension,
    level: u32,
    mip_levels: u32,
    format: vk::Format,
) -> Extent {
    if level >= mip_levels {
        return Extent::ZERO;
    }

    let base = base.restricted_to(dimension);
    let shift = |v: u32| v.checked_shr(level).unwrap_or(0).max(1);
    let extent = Extent {
        width: shift(base.width),
        height: if dimension > ImageDimension::D1 {
            shift(base.height)
        } else {
            1
        },
        depth: if dimension > ImageDimension::D2 {
            shift(base.depth)
        } else {
            1
        },
    };

    match format_info(format) {
        Some(info) if info.is_block_compressed() => {
            info.round_to_blocks(extent)
        }
        _ => extent,
    }
}

/// Packed byte size of one subresource with the given extent.
pub fn mip_byte_size(
    extent: Extent,
    format: vk::Format,
) -> Result<vk::DeviceSize, LayoutError> {
    let info = format_info(format).ok_or(LayoutError::UnknownFormat(format))?;
    let (w, h, d) = info.blocks_for(extent);
    Ok(u64::from(w)
        * u64::from(h)
        * u64::from(d)
        * u64::from(info.block_bytes))
}

/// Packed byte sizes of every level of a mip chain.
pub fn level_sizes(
    base: Extent,
    dimension: ImageDimension,
    mip_levels: u32,
    format: vk::Format,
) -> Result<Vec<vk::DeviceSize>, LayoutError> {
    if mip_levels == 0 {
        return Err(LayoutError::ZeroMipLevels);
    }
    (0..mip_levels)
        .map(|level| {
            let extent =
                calculate_mip_extent(base, dimension, level, mip_levels, format);
            mip_byte_size(extent, format)
        })
        .collect()
}

/// A computed description of one mip level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MipLevelDescriptor {
    pub level: u32,
    pub extent: Extent,
    pub byte_size: vk::DeviceSize,
    pub offset: vk::DeviceSize,
}

/// Per-subresource offsets into a packed staging buffer.
///
/// `offsets` holds one entry per (layer, level) pair, layer-major and
/// level-minor, so entry `layer * mip_levels + level` is where that
/// subresource starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MipmapLayout {
    pub offsets: Vec<vk::DeviceSize>,
    pub level_sizes: Vec<vk::DeviceSize>,
    pub total_size: vk::DeviceSize,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub alignment: vk::DeviceSize,
}

impl MipmapLayout {
    pub fn subresource_count(&self) -> usize {
        self.offsets.len()
    }

    pub fn offset(&self, layer: u32, level: u32) -> Option<vk::DeviceSize> {
        if layer >= self.array_layers || level >= self.mip_levels {
            return None;
        }
        let idx = layer as usize * self.mip_levels as usize + level as usize;
        self.offsets.get(idx).copied()
    }

    /// Unpadded byte size of the subresource at flattened index `idx`, or
    /// `None` past the last subresource.
    pub fn size_at(&self, idx: usize) -> Option<vk::DeviceSize> {
        if idx >= self.offsets.len() {
            return None;
        }
        let level = idx.checked_rem(self.mip_levels as usize)?;
        self.level_sizes.get(level).copied()
    }

    /// `(offset, size)` pairs for every subresource in flattened order.
    pub fn ranges(
        &self,
    ) -> impl Iterator<Item = (vk::DeviceSize, vk::DeviceSize)> + '_ {
        self.offsets
            .iter()
            .enumerate()
            .filter_map(|(idx, &offset)| Some((offset, self.size_at(idx)?)))
    }
}

/// Build the packed offset table for `array_layers` copies of a mip chain
/// whose unpadded level sizes are `mip_sizes`.
///
/// Each level size is aligned up before the next offset is accumulated.
/// Every layer but the last also pushes the trailing pivot that starts the
/// next layer; the last layer does not, so the table ends with the start of
/// the final subresource and the end of the buffer is `total_size`.
pub fn setup_mip_offsets(
    mip_sizes: &[vk::DeviceSize],
    array_layers: u32,
    alignment: vk::DeviceSize,
) -> Result<MipmapLayout, LayoutError> {
    check_alignment(alignment)?;
    if mip_sizes.is_empty() {
        return Err(LayoutError::ZeroMipLevels);
    }
    if array_layers == 0 {
        return Err(LayoutError::ZeroArrayLayers);
    }

    let levels = mip_sizes.len();
    let layers = array_layers as usize;
    let mut offsets = Vec::with_capacity(levels * layers);
    offsets.push(0);

    let mut cursor: vk::DeviceSize = 0;
    for layer in 0..layers {
        for (level, &size) in mip_sizes.iter().enumerate() {
            cursor += align_up(size, alignment);
            let is_final = layer + 1 == layers && level + 1 == levels;
            if !is_final {
                offsets.push(cursor);
            }
        }
    }

    Ok(MipmapLayout {
        offsets,
        level_sizes: mip_sizes.to_vec(),
        total_size: cursor,
        mip_levels: levels as u32,
        array_layers,
        alignment,
    })
}

/// Compute the packed layout for a whole image in one step.
pub fn image_layout(
    base: Extent,
    dimension: ImageDimension,
    format: vk::Format,
    mip_levels: u32,
    array_layers: u32,
    alignment: vk::DeviceSize,
) -> Result<MipmapLayout, LayoutError> {
    let sizes = level_sizes(base, dimension, mip_levels, format)?;
    setup_mip_offsets(&sizes, array_layers, alignment)
}

/// Describe each level of a single layer.
pub fn describe_mip_chain(
    base: Extent,
    dimension: ImageDimension,
    format: vk::Format,
    mip_levels: u32,
    alignment: vk::DeviceSize,
) -> Result<Vec<MipLevelDescriptor>, LayoutError> {
    let layout =
        image_layout(base, dimension, format, mip_levels, 1, alignment)?;
    Ok((0..mip_levels)
        .map(|level| MipLevelDescriptor {
            level,
            extent: calculate_mip_extent(
                base, dimension, level, mip_levels, format,
            ),
            byte_size: layout.level_sizes[level as usize],
            offset: layout.offsets[level as usize],
        })
        .collect())
}

/// Caller supplied base addressing for copy regions.
///
/// Zero `row_length` / `image_height` mean tightly packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyLayout {
    pub buffer_offset: vk::DeviceSize,
    pub row_length: u32,
    pub image_height: u32,
}

/// One buffer-to-image copy, targeting a single (level, layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRegion {
    pub buffer_offset: vk::DeviceSize,
    pub row_length: u32,
    pub image_height: u32,
    pub mip_level: u32,
    pub base_array_layer: u32,
    pub image_offset: vk::Offset3D,
    pub image_extent: Extent,
}

impl CopyRegion {
    pub fn to_vk(&self, aspect: vk::ImageAspectFlags) -> vk::BufferImageCopy {
        vk::BufferImageCopy {
            buffer_offset: self.buffer_offset,
            buffer_row_length: self.row_length,
            buffer_image_height: self.image_height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: aspect,
                mip_level: self.mip_level,
                base_array_layer: self.base_array_layer,
                layer_count: 1,
            },
            image_offset: self.image_offset,
            image_extent: self.image_extent.into(),
        }
    }
}

/// Pair every entry of `layout` with its target subresource and extent.
///
/// Region `i` targets `mip_level = i % mip_levels` and
/// `base_array_layer = i / mip_levels`, which is only correct because
/// [`setup_mip_offsets`] emits offsets layer-major, level-minor.
///
/// Extents are derived by halving the previous level rather than from the
/// level index. The result equals [`calculate_mip_extent`] for every level
/// (rounded for [`ExtentPolicy::BlockRounded`], unrounded otherwise).
pub fn setup_copy_regions(
    layout: &MipmapLayout,
    base: Extent,
    dimension: ImageDimension,
    copy_layout: CopyLayout,
    policy: ExtentPolicy,
    format: vk::Format,
) -> Vec<CopyRegion> {
    let levels = layout.mip_levels;
    let rounding = match policy {
        ExtentPolicy::BlockRounded => {
            format_info(format).filter(FormatInfo::is_block_compressed)
        }
        ExtentPolicy::Logical => None,
    };

    let base = base.restricted_to(dimension);
    let mut extent = base;
    let mut regions = Vec::with_capacity(layout.offsets.len());

    for (i, &offset) in layout.offsets.iter().enumerate() {
        let i = i as u32;
        let mip_level = i % levels;
        if mip_level == 0 {
            extent = base;
        } else {
            extent = halve(extent, dimension);
        }

        let image_extent = match rounding {
            Some(info) => info.round_to_blocks(extent),
            None => extent,
        };

        regions.push(CopyRegion {
            buffer_offset: copy_layout.buffer_offset + offset,
            row_length: copy_layout.row_length,
            image_height: copy_layout.image_height,
            mip_level,
            base_array_layer: i / levels,
            image_offset: vk::Offset3D::default(),
            image_extent,
        });
    }

    regions
}
