//! GPU memory allocation.
//!
//! [`Allocator`] wraps the Vulkan Memory Allocator library. Create one per device with
//! [`Allocator::new`] and hand clones of it to [`Buffer::new`](crate::buffer::Buffer::new)
//! and [`Image::new`](crate::image::Image::new).

use std::{ops::Deref, sync::Arc};

use ash::prelude::VkResult;

use crate::driver::AshDriver;

/// A reference-counted VMA allocator.
///
/// The allocator keeps the device alive until every buffer and image allocated from it
/// has been dropped.
#[derive(Clone)]
pub struct Allocator(Arc<AllocatorInner>);
struct AllocatorInner {
    inner: vk_mem::Allocator,
    // Dropped after `inner`.
    _driver: Arc<AshDriver>,
}

impl Allocator {
    pub fn new(driver: Arc<AshDriver>) -> VkResult<Self> {
        let info = vk_mem::AllocatorCreateInfo::new(
            driver.instance(),
            driver.device(),
            driver.physical_device(),
        );
        let alloc = unsafe { vk_mem::Allocator::new(info)? };
        tracing::debug!("created memory allocator");
        Ok(Self(Arc::new(AllocatorInner {
            inner: alloc,
            _driver: driver,
        })))
    }
}

impl Deref for Allocator {
    type Target = vk_mem::Allocator;

    fn deref(&self) -> &Self::Target {
        &self.0.inner
    }
}
