//! Command pools, command buffers and the [`TransferRecorder`] that
//! submits recorded copies to the device's transfer queue.
//!
//! [`ResettableCommandPool`] hands out [`ResettableCommandBuffer`]s that go
//! back to the pool when dropped, for reuse. [`TransferRecorder`] owns one
//! such buffer plus a [`Fence`](crate::sync::Fence) and implements
//! [`CommandRecorder`] for the synchronous transfer path: one submission,
//! then a blocking wait.

use std::{
    marker::PhantomData,
    sync::{Arc, mpsc},
};

use ash::vk;
use thiserror::Error;

use crate::device::Device;
use crate::sync::{CreateFenceError, Fence, WaitFenceError};
use crate::transfer::CommandRecorder;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum CreateCommandPoolError {
    #[error("Vulkan error creating command pool: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum AllocateCommandBufferError {
    #[error("Vulkan error allocating command buffer: {0}")]
    Vulkan(vk::Result),
}

#[derive(Debug, Error)]
pub enum CreateTransferRecorderError {
    #[error("Failed to create transfer command pool: {0}")]
    Pool(#[from] CreateCommandPoolError),
    #[error("Failed to allocate transfer command buffer: {0}")]
    CommandBuffer(#[from] AllocateCommandBufferError),
    #[error("Failed to create transfer fence: {0}")]
    Fence(#[from] CreateFenceError),
}

// ---------------------------------------------------------------------------
// CommandPoolShared
// ---------------------------------------------------------------------------

/// The raw pool, co-owned by the pool wrapper and every buffer allocated
/// from it. Destroyed when the last owner goes away.
struct CommandPoolShared {
    parent: Arc<Device>,
    pool: vk::CommandPool,
}

impl Drop for CommandPoolShared {
    fn drop(&mut self) {
        tracing::debug!("Dropping command pool {:?}", self.pool);
        // SAFETY: pool was created from parent. Every ResettableCommandBuffer
        // holds an Arc to this value, so none of them is alive anymore.
        // Destroying the pool frees its command buffers.
        unsafe { self.parent.destroy_raw_command_pool(self.pool) };
    }
}

// ---------------------------------------------------------------------------
// ResettableCommandPool
// ---------------------------------------------------------------------------

/// A command pool whose buffers can be reset one at a time.
///
/// Pool operations need external synchronization, so the wrapper is
/// `!Sync`. Buffers hand their raw handle back through a channel when
/// dropped and the next allocation reuses it.
pub struct ResettableCommandPool {
    shared: Arc<CommandPoolShared>,
    sender: mpsc::Sender<vk::CommandBuffer>,
    receiver: mpsc::Receiver<vk::CommandBuffer>,
    _not_sync: PhantomData<std::cell::Cell<()>>,
}

impl std::fmt::Debug for ResettableCommandPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandPool")
            .field("pool", &self.shared.pool)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandPool {
    pub fn new(
        device: &Arc<Device>,
        queue_family: u32,
        name: Option<&str>,
    ) -> Result<Self, CreateCommandPoolError> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );

        // SAFETY: Callers pass a queue family the device was created with.
        let pool = unsafe { device.create_raw_command_pool(&create_info) }
            .map_err(CreateCommandPoolError::Vulkan)?;

        // SAFETY: pool was just created from device.
        let name_result = unsafe { device.set_object_name_str(pool, name) };
        if let Err(e) = name_result {
            tracing::warn!("Failed to name command pool {:?}: {e}", pool);
        }

        let (sender, receiver) = mpsc::channel();
        Ok(Self {
            shared: Arc::new(CommandPoolShared {
                parent: Arc::clone(device),
                pool,
            }),
            sender,
            receiver,
            _not_sync: PhantomData,
        })
    }

    /// Allocate one primary command buffer, reusing a returned handle when
    /// there is one.
    ///
    /// Surplus returned handles are freed. The buffer may hold stale
    /// commands and must be reset before recording.
    pub fn allocate_command_buffer(
        &self,
    ) -> Result<ResettableCommandBuffer, AllocateCommandBufferError> {
        let mut returned: Vec<vk::CommandBuffer> =
            std::iter::from_fn(|| self.receiver.try_recv().ok()).collect();

        let handle = match returned.pop() {
            Some(recycled) => {
                if !returned.is_empty() {
                    // SAFETY: Every returned handle came from this pool and
                    // its owner dropped it only after its work finished.
                    // This type is !Sync, so the pool is not used
                    // concurrently.
                    unsafe {
                        self.shared.parent.free_raw_command_buffers(
                            self.shared.pool,
                            &returned,
                        )
                    };
                }
                recycled
            }
            None => {
                let allocate_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.shared.pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);

                // SAFETY: allocate_info names a live pool from parent, and
                // this type is !Sync.
                let mut buffers = unsafe {
                    self.shared
                        .parent
                        .allocate_raw_command_buffers(&allocate_info)
                }
                .map_err(AllocateCommandBufferError::Vulkan)?;
                buffers.pop().ok_or(AllocateCommandBufferError::Vulkan(
                    vk::Result::ERROR_UNKNOWN,
                ))?
            }
        };

        Ok(ResettableCommandBuffer {
            _pool: Arc::clone(&self.shared),
            parent: Arc::clone(&self.shared.parent),
            handle,
            return_sender: self.sender.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// ResettableCommandBuffer
// ---------------------------------------------------------------------------

/// A primary command buffer from a [`ResettableCommandPool`].
///
/// State sequencing is the caller's job, so the recording calls are
/// `unsafe`.
pub struct ResettableCommandBuffer {
    _pool: Arc<CommandPoolShared>,
    parent: Arc<Device>,
    handle: vk::CommandBuffer,
    return_sender: mpsc::Sender<vk::CommandBuffer>,
}

impl std::fmt::Debug for ResettableCommandBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResettableCommandBuffer")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl ResettableCommandBuffer {
    /// # Safety
    /// The buffer must not be pending execution.
    pub unsafe fn reset(&mut self) -> Result<(), vk::Result> {
        // SAFETY: The pool was created with RESET_COMMAND_BUFFER and the
        // caller guarantees the buffer is not pending.
        unsafe {
            self.parent.reset_raw_command_buffer(
                self.handle,
                vk::CommandBufferResetFlags::empty(),
            )
        }
    }

    /// # Safety
    /// The buffer must be in the initial state.
    pub unsafe fn begin(
        &mut self,
        flags: vk::CommandBufferUsageFlags,
    ) -> Result<(), vk::Result> {
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        // SAFETY: Caller guarantees the initial state.
        unsafe {
            self.parent
                .begin_raw_command_buffer(self.handle, &begin_info)
        }
    }

    /// # Safety
    /// The buffer must be in the recording state.
    pub unsafe fn end(&mut self) -> Result<(), vk::Result> {
        // SAFETY: Caller guarantees the recording state.
        unsafe { self.parent.end_raw_command_buffer(self.handle) }
    }

    pub fn raw_command_buffer(&self) -> vk::CommandBuffer {
        self.handle
    }
}

impl Drop for ResettableCommandBuffer {
    fn drop(&mut self) {
        // A closed channel means the pool wrapper is gone; destroying the
        // pool reclaims the handle.
        let _ = self.return_sender.send(self.handle);
    }
}

// ---------------------------------------------------------------------------
// TransferRecorder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Initial,
    Recording,
    Executable,
    /// Submitted, fence not yet observed.
    Pending,
}

/// Records onto one command buffer and submits it to the device's transfer
/// queue, blocking on a fence.
pub struct TransferRecorder {
    device: Arc<Device>,
    command_buffer: ResettableCommandBuffer,
    fence: Fence,
    state: RecorderState,
}

impl std::fmt::Debug for TransferRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRecorder")
            .field("command_buffer", &self.command_buffer.handle)
            .field("fence", &self.fence)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

fn wait_error_code(e: WaitFenceError) -> vk::Result {
    match e {
        WaitFenceError::Timeout => vk::Result::TIMEOUT,
        WaitFenceError::Vulkan(result) => result,
        WaitFenceError::NotSubmitted => vk::Result::ERROR_UNKNOWN,
    }
}

impl TransferRecorder {
    pub fn new(
        device: &Arc<Device>,
    ) -> Result<Self, CreateTransferRecorderError> {
        let pool = ResettableCommandPool::new(
            device,
            device.transfer_queue_family(),
            Some("mipstage transfer pool"),
        )?;
        let command_buffer = pool.allocate_command_buffer()?;
        let fence = Fence::new(device, Some("mipstage transfer fence"))?;
        Ok(Self {
            device: Arc::clone(device),
            command_buffer,
            fence,
            state: RecorderState::Initial,
        })
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    fn wait_pending(&mut self) -> Result<(), vk::Result> {
        if self.state == RecorderState::Pending {
            self.fence.wait_and_reset(u64::MAX).map_err(wait_error_code)?;
            self.state = RecorderState::Initial;
        }
        Ok(())
    }
}

impl CommandRecorder for TransferRecorder {
    fn queue_family_index(&self) -> u32 {
        self.device.transfer_queue_family()
    }

    fn queue_flags(&self) -> vk::QueueFlags {
        self.device.transfer_queue_flags()
    }

    fn begin_recording(&mut self) -> Result<(), vk::Result> {
        // An abandoned recording is discarded by the reset below.
        self.wait_pending()?;
        // SAFETY: Any earlier submission was waited on above, so the
        // buffer is not pending.
        unsafe { self.command_buffer.reset() }?;
        // SAFETY: The reset put the buffer in the initial state.
        unsafe {
            self.command_buffer
                .begin(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT)
        }?;
        self.state = RecorderState::Recording;
        Ok(())
    }

    fn end_recording(&mut self) -> Result<(), vk::Result> {
        if self.state != RecorderState::Recording {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        // SAFETY: state tracking says the buffer is recording.
        unsafe { self.command_buffer.end() }?;
        self.state = RecorderState::Executable;
        Ok(())
    }

    unsafe fn pipeline_barrier(
        &mut self,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        debug_assert_eq!(self.state, RecorderState::Recording);
        // SAFETY: Caller guarantees the recording state and handle validity.
        unsafe {
            self.device.cmd_pipeline_barrier2(
                self.command_buffer.raw_command_buffer(),
                dependency_info,
            )
        }
    }

    unsafe fn copy_buffer_to_image(
        &mut self,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        debug_assert_eq!(self.state, RecorderState::Recording);
        // SAFETY: Caller guarantees the recording state and handle validity.
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer.raw_command_buffer(),
                src,
                dst,
                dst_layout,
                regions,
            )
        }
    }

    unsafe fn copy_image_to_buffer(
        &mut self,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        debug_assert_eq!(self.state, RecorderState::Recording);
        // SAFETY: Caller guarantees the recording state and handle validity.
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.command_buffer.raw_command_buffer(),
                src,
                src_layout,
                dst,
                regions,
            )
        }
    }

    unsafe fn copy_buffer(
        &mut self,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        debug_assert_eq!(self.state, RecorderState::Recording);
        // SAFETY: Caller guarantees the recording state and handle validity.
        unsafe {
            self.device.cmd_copy_buffer(
                self.command_buffer.raw_command_buffer(),
                src,
                dst,
                regions,
            )
        }
    }

    fn submit_and_wait(&mut self) -> Result<(), vk::Result> {
        if self.state != RecorderState::Executable {
            return Err(vk::Result::ERROR_VALIDATION_FAILED_EXT);
        }
        let _span = tracing::debug_span!("transfer_submit_and_wait").entered();

        let command_buffer_infos = [vk::CommandBufferSubmitInfo::default()
            .command_buffer(self.command_buffer.raw_command_buffer())];
        let submits = [vk::SubmitInfo2::default()
            .command_buffer_infos(&command_buffer_infos)];

        // SAFETY: The command buffer is executable and from this device. The
        // fence is unsignaled: it starts that way and is reset after every
        // wait.
        unsafe {
            self.device
                .transfer_queue_submit2(&submits, self.fence.raw_fence())
        }?;
        self.state = RecorderState::Pending;
        // SAFETY: The fence was passed to the submission above.
        unsafe { self.fence.mark_submitted() }
            .map_err(|_| vk::Result::ERROR_UNKNOWN)?;

        self.wait_pending()
    }
}

impl Drop for TransferRecorder {
    fn drop(&mut self) {
        if let Err(e) = self.wait_pending() {
            tracing::warn!(
                "Transfer recorder dropped with unfinished work: {e}"
            );
        }
    }
}
