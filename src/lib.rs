//! # Scoria
//!
//! The command buffer and resource dependency tracking core of a Vulkan renderer.
//!
//! Callers hand Scoria a render target, the buffers and images their shaders use and the
//! pipeline state, and record draws, dispatches and copies. Scoria works out everything
//! Vulkan needs around those commands:
//!
//! - Image layouts, tracked per sub-resource range, and the barriers moving between them.
//! - Read-after-write and write-after-write hazards within a command buffer.
//! - Render pass boundaries, including deferred clears.
//! - Semaphores ordering submissions on one queue and across queues.
//! - Ownership transfers of exclusive resources between queue families.
//! - When a resource is no longer referenced by any recording or submission.
//!
//! ## Overview
//!
//! A [`Device`] owns the queues, the command buffer pool and the query pool. It talks
//! to Vulkan through a [`Driver`](driver::Driver): [`AshDriver`](driver::AshDriver) on a
//! real device, or [`HeadlessDriver`](driver::HeadlessDriver) which records every call
//! instead of executing it.
//!
//! ```no_run
//! use std::sync::Arc;
//! use scoria::prelude::*;
//!
//! # fn main() -> Result<(), scoria::Error> {
//! let driver = Arc::new(HeadlessDriver::new());
//! let config = DeviceConfig::default().with_queue(QueueType::Graphics, 0, 1);
//! let mut device = Device::new(driver, config)?;
//!
//! let mut cb = device.create_command_buffer(QueueType::Graphics, 0)?;
//! // ... record ...
//! cb.submit(&mut device, 0)?;
//! # Ok(())
//! # }
//! ```
//!
//! ### Command Recording
//!
//! [`CommandBuffer`](command::CommandBuffer) is the handle the application records into.
//! Every submit swaps in a fresh native command buffer, so the handle stays usable for
//! the whole frame. See [`command`] for how recording tracks resources.
//!
//! ### Synchronization
//!
//! Submissions on one queue are chained with binary semaphores automatically. Work on
//! other queues is waited on by passing their bits, from [`Device::queue_mask`], as the
//! sync mask of [`CommandBuffer::submit`](command::CommandBuffer::submit).
//!
//! ### Queries
//!
//! [`Query`](query::Query) measures GPU time or counts samples across any number of
//! submissions.

mod alloc;
pub mod buffer;
pub mod command;
pub mod config;
pub mod device;
pub mod driver;
pub mod framebuffer;
pub mod image;
pub mod pipeline;
pub mod query;
pub mod queue;
pub mod resource;
pub mod swapchain;
pub mod sync;
pub mod tracking;
pub mod utils;

use ash::vk;

pub use alloc::Allocator;
pub use device::Device;
pub use queue::Queue;

pub use ash;

/// Queues of one type that can be addressed by a sync mask.
pub const MAX_QUEUES_PER_TYPE: u32 = 8;
/// Default upper bound on live command buffers per queue family.
pub const MAX_CB_PER_QUEUE_FAMILY: usize = 256;
/// Semaphores a submission signals for other queues to wait on.
pub const MAX_CB_DEPENDENCIES: usize = 2;
/// Color attachments per framebuffer.
pub const MAX_RENDER_TARGETS: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("no queues selected for {0:?} queues")]
    MissingQueueFamily(queue::QueueType),
    #[error("the device has no graphics queue")]
    NoGraphicsQueue,
}

pub mod prelude {
    pub use crate::{
        Allocator, Device, Error, ash,
        ash::vk,
        buffer::Buffer,
        command::{CommandBuffer, RenderTarget},
        config::DeviceConfig,
        driver::{AshDriver, Driver, HeadlessDriver},
        framebuffer::{Framebuffer, FramebufferBuffers, RenderSurfaceMask},
        image::{Image, ImageDesc, ImageUsage},
        pipeline::{ComputePipeline, GpuParams, GraphicsPipeline},
        query::{Query, QueryKind},
        queue::{PresentOutcome, Queue, QueueType},
        resource::Resource,
        swapchain::{AcquireOutcome, SwapChain, SwapChainDesc},
        tracking::Access,
        utils::AsVkHandle,
    };
}
