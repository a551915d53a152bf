//! The submit fence used by [`TransferRecorder`](crate::command::TransferRecorder).
//!
//! Every synchronous copy is one submission followed by a host wait. The
//! fence remembers whether a submission holds it, so waiting on a fence
//! that nothing will signal reports [`WaitFenceError::NotSubmitted`] and
//! does not hang.

use std::sync::Arc;

use ash::vk;
use thiserror::Error;

use crate::device::Device;

#[derive(Debug, Error)]
pub enum CreateFenceError {
    #[error("Vulkan error creating fence: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WaitFenceError {
    #[error("Fence wait timed out")]
    Timeout,
    #[error("Vulkan error waiting for fence: {0}")]
    Vulkan(vk::Result),
    #[error("No submission holds this fence")]
    NotSubmitted,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Fence handed to a second submission before it was reset")]
pub struct AlreadySubmittedError;

/// Binary fence owned by a single recorder. Starts unsignaled.
pub struct Fence {
    parent: Arc<Device>,
    handle: vk::Fence,
    pending: bool,
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fence")
            .field("handle", &self.handle)
            .field("pending", &self.pending)
            .finish_non_exhaustive()
    }
}

impl Fence {
    pub fn new(
        device: &Arc<Device>,
        name: Option<&str>,
    ) -> Result<Self, CreateFenceError> {
        let create_info = vk::FenceCreateInfo::default();

        // SAFETY: create_info has no borrowed pointers.
        let handle = unsafe { device.create_raw_fence(&create_info) }
            .map_err(CreateFenceError::Vulkan)?;

        // SAFETY: handle was just created from device.
        if let Err(e) = unsafe { device.set_object_name_str(handle, name) } {
            tracing::warn!("Failed to name fence {:?}: {e}", handle);
        }

        Ok(Self {
            parent: Arc::clone(device),
            handle,
            pending: false,
        })
    }

    pub fn raw_fence(&self) -> vk::Fence {
        self.handle
    }

    /// # Safety
    /// `raw_fence()` must have been passed to a queue submission that will
    /// signal it.
    pub unsafe fn mark_submitted(
        &mut self,
    ) -> Result<(), AlreadySubmittedError> {
        if self.pending {
            return Err(AlreadySubmittedError);
        }
        self.pending = true;
        Ok(())
    }

    /// Block for up to `timeout_ns` (`u64::MAX` means no limit), then put
    /// the fence back in the unsignaled state for the next submission.
    pub fn wait_and_reset(
        &mut self,
        timeout_ns: u64,
    ) -> Result<(), WaitFenceError> {
        if !self.pending {
            return Err(WaitFenceError::NotSubmitted);
        }
        // SAFETY: handle is a live fence created from parent.
        unsafe {
            self.parent
                .wait_for_raw_fences(&[self.handle], true, timeout_ns)
        }
        .map_err(|e| match e {
            vk::Result::TIMEOUT => WaitFenceError::Timeout,
            e => WaitFenceError::Vulkan(e),
        })?;
        // SAFETY: The wait succeeded, so the submission holding the fence
        // has retired, and &mut self blocks a resubmission in between.
        unsafe { self.parent.reset_raw_fences(&[self.handle]) }
            .map_err(WaitFenceError::Vulkan)?;
        self.pending = false;
        Ok(())
    }
}

impl Drop for Fence {
    fn drop(&mut self) {
        tracing::debug!("Dropping fence {:?}", self.handle);
        // SAFETY: handle was created from parent. The recorder waits out its
        // submission before it lets the fence go.
        unsafe { self.parent.destroy_raw_fence(self.handle) };
    }
}
