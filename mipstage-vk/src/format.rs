//! Format feature queries.
//!
//! Image creation checks the requested format against the tiling features
//! its usage needs before any native object is created, so an unsupported
//! format fails fast with a descriptive error.

use ash::vk;
use thiserror::Error;

use crate::device::Device;

/// Reports which tiling features a format supports.
pub trait FormatCapabilityQuery {
    fn format_features(
        &self,
        format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> vk::FormatFeatureFlags;
}

impl<T> FormatCapabilityQuery for &T
where
    T: FormatCapabilityQuery + ?Sized,
{
    fn format_features(
        &self,
        format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> vk::FormatFeatureFlags {
        (*self).format_features(format, tiling)
    }
}

impl FormatCapabilityQuery for Device {
    fn format_features(
        &self,
        format: vk::Format,
        tiling: vk::ImageTiling,
    ) -> vk::FormatFeatureFlags {
        // SAFETY: The physical device was selected from the parent instance.
        let props = unsafe {
            self.parent().get_raw_physical_device_format_properties(
                self.physical_device(),
                format,
            )
        };
        features_for_tiling(&props, tiling)
    }
}

/// Pick the feature set matching `tiling` out of `props`.
pub fn features_for_tiling(
    props: &vk::FormatProperties,
    tiling: vk::ImageTiling,
) -> vk::FormatFeatureFlags {
    match tiling {
        vk::ImageTiling::LINEAR => props.linear_tiling_features,
        _ => props.optimal_tiling_features,
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "Format {format:?} with {tiling:?} tiling lacks required features \
     {missing:?} (supported: {supported:?})"
)]
pub struct FormatCapabilityError {
    pub format: vk::Format,
    pub tiling: vk::ImageTiling,
    pub missing: vk::FormatFeatureFlags,
    pub supported: vk::FormatFeatureFlags,
}

/// Format features an image with `usage` needs.
pub fn required_features(
    usage: vk::ImageUsageFlags,
    needs_blit: bool,
) -> vk::FormatFeatureFlags {
    use vk::FormatFeatureFlags as F;
    use vk::ImageUsageFlags as U;

    let mut required = F::empty();
    if usage.contains(U::SAMPLED) {
        required |= F::SAMPLED_IMAGE;
    }
    if usage.contains(U::STORAGE) {
        required |= F::STORAGE_IMAGE;
    }
    if usage.contains(U::TRANSFER_DST) {
        required |= F::TRANSFER_DST;
    }
    if usage.contains(U::TRANSFER_SRC) {
        required |= F::TRANSFER_SRC;
    }
    if usage.contains(U::COLOR_ATTACHMENT) {
        required |= F::COLOR_ATTACHMENT;
    }
    if usage.contains(U::DEPTH_STENCIL_ATTACHMENT) {
        required |= F::DEPTH_STENCIL_ATTACHMENT;
    }
    if needs_blit {
        required |= F::BLIT_SRC | F::BLIT_DST;
    }
    required
}

pub fn check_format_support<Q>(
    query: &Q,
    format: vk::Format,
    tiling: vk::ImageTiling,
    required: vk::FormatFeatureFlags,
) -> Result<(), FormatCapabilityError>
where
    Q: FormatCapabilityQuery + ?Sized,
{
    let supported = query.format_features(format, tiling);
    let missing = required & !supported;
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FormatCapabilityError {
            format,
            tiling,
            missing,
            supported,
        })
    }
}
