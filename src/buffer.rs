//! Tracked buffers.

use ash::{prelude::VkResult, vk};
use vk_mem::Alloc;

use crate::{
    Allocator,
    resource::{Resource, ResourceUsage},
    utils::AsVkHandle,
};

pub struct Buffer {
    handle: vk::Buffer,
    size: vk::DeviceSize,
    memory: Option<(Allocator, vk_mem::Allocation)>,
    tracking: ResourceUsage,
}

impl Buffer {
    /// Create a buffer in device-local memory.
    ///
    /// An `exclusive` buffer is owned by a single queue family at a time and gets queue
    /// ownership transfers when used from another family.
    pub fn new(
        allocator: Allocator,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        exclusive: bool,
    ) -> VkResult<Self> {
        let (handle, allocation) = unsafe {
            allocator.create_buffer(
                &vk::BufferCreateInfo {
                    size,
                    usage,
                    sharing_mode: vk::SharingMode::EXCLUSIVE,
                    ..Default::default()
                },
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    ..Default::default()
                },
            )?
        };
        Ok(Self {
            handle,
            size,
            memory: Some((allocator, allocation)),
            tracking: ResourceUsage::new(exclusive),
        })
    }

    /// Track a buffer whose memory is owned elsewhere.
    pub fn from_raw(handle: vk::Buffer, size: vk::DeviceSize, exclusive: bool) -> Self {
        Self {
            handle,
            size,
            memory: None,
            tracking: ResourceUsage::new(exclusive),
        }
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        if let Some((allocator, allocation)) = &mut self.memory {
            unsafe {
                allocator.destroy_buffer(self.handle, allocation);
            }
        }
    }
}

impl AsVkHandle for Buffer {
    type Handle = vk::Buffer;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Buffer {
    fn usage(&self) -> &ResourceUsage {
        &self.tracking
    }
}
