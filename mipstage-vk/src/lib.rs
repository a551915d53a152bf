//! Mip-chain layouts, resource memory binding and staged image transfers on
//! Vulkan, built on [`ash`].
//!
//! > **Personal project.** This crate is not intended for general use
//! > and makes no API stability guarantees.
//!
//! # Layers
//!
//! ```text
//! transfer   record_image_upload / upload_image_data / read_image
//!    │
//!    ├── layout   mip extents, packed offsets, copy regions (pure)
//!    ├── staging  filling mapped staging memory
//!    └── binder   Resources<D, A>: create, bind, realloc, defragment
//!           ├── driver    ResourceDriver (Device, or a mock in tests)
//!           └── memory    MemoryAllocator (gpu-allocator pools, dedicated)
//! ```
//!
//! The transfer layer talks to the GPU only through [`transfer::CommandRecorder`];
//! [`command::TransferRecorder`] is the implementation over a command
//! buffer, a fence and the device's transfer queue.
//!
//! # Naming conventions
//!
//! | prefix  | meaning                                   |
//! |---------|-------------------------------------------|
//! | `raw_*` | accepts or returns a raw `ash::vk` handle |
//! | `ash_*` | returns the `ash` wrapper object          |

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod arena;
pub mod binder;
pub mod capability;
pub mod command;
pub mod device;
pub mod driver;
pub mod format;
pub mod instance;
pub mod layout;
pub mod memory;
pub mod resource;
pub mod staging;
pub mod sync;
pub mod transfer;

#[cfg(test)]
pub(crate) mod testing;

pub use ash;
