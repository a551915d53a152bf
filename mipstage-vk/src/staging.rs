//! Filling mapped staging memory from host slices.

use std::thread;

use ash::vk;
use thiserror::Error;

use crate::layout::MipmapLayout;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FillStagingError {
    #[error("Expected {expected} subresource slices, got {got}")]
    SliceCount { expected: usize, got: usize },

    #[error(
        "Subresource slice {index} is {got} bytes but the layout expects {expected}"
    )]
    SliceSize {
        index: usize,
        expected: vk::DeviceSize,
        got: usize,
    },

    #[error("Staging range is {got} bytes but the layout needs {needed}")]
    DestinationTooSmall { needed: vk::DeviceSize, got: usize },
}

/// Zero `bytes` using up to `workers` scoped threads.
///
/// The range is split into equal contiguous chunks, one per worker, and
/// every thread is joined before returning. With `workers <= 1` the fill
/// runs on the calling thread.
pub fn zero_fill(bytes: &mut [u8], workers: usize) {
    if workers <= 1 || bytes.len() < workers {
        bytes.fill(0);
        return;
    }

    let chunk = bytes.len().div_ceil(workers);
    thread::scope(|scope| {
        for part in bytes.chunks_mut(chunk) {
            scope.spawn(move || part.fill(0));
        }
    });
}

/// Copy every subresource slice into its offset in `dst`.
///
/// `levels` is ordered layer-major, level-minor, exactly like
/// `layout.offsets`. Bytes not covered by a slice are zeroed: with one bulk
/// [`zero_fill`] when `dst` is at least `zero_fill_threshold` bytes, or gap
/// by gap otherwise.
pub fn fill_staging(
    dst: &mut [u8],
    levels: &[&[u8]],
    layout: &MipmapLayout,
    zero_fill_threshold: usize,
    zero_fill_workers: usize,
) -> Result<(), FillStagingError> {
    if levels.len() != layout.subresource_count() {
        return Err(FillStagingError::SliceCount {
            expected: layout.subresource_count(),
            got: levels.len(),
        });
    }
    if (dst.len() as vk::DeviceSize) < layout.total_size {
        return Err(FillStagingError::DestinationTooSmall {
            needed: layout.total_size,
            got: dst.len(),
        });
    }
    for (index, (slice, (_, size))) in
        levels.iter().zip(layout.ranges()).enumerate()
    {
        if slice.len() as vk::DeviceSize != size {
            return Err(FillStagingError::SliceSize {
                index,
                expected: size,
                got: slice.len(),
            });
        }
    }

    let bulk_zero = dst.len() >= zero_fill_threshold;
    if bulk_zero {
        zero_fill(dst, zero_fill_workers);
    }

    let mut cursor = 0usize;
    for (slice, (offset, _)) in levels.iter().zip(layout.ranges()) {
        let start = offset as usize;
        if !bulk_zero {
            dst[cursor..start].fill(0);
        }
        let end = start + slice.len();
        dst[start..end].copy_from_slice(slice);
        cursor = end;
    }
    if !bulk_zero {
        dst[cursor..].fill(0);
    }

    Ok(())
}
