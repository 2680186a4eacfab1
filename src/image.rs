//! Tracked images.
//!
//! Besides the native handle, an [`Image`] remembers the layout every (layer, mip)
//! sub-resource was left in by the last submitted command buffer. The command buffer
//! uses that to transition sub-resources into the layout it first expects them in, and
//! stores the final layouts back on submission.

use std::sync::{Mutex, MutexGuard};

use ash::{prelude::VkResult, vk};
use bitflags::bitflags;
use glam::UVec3;
use vk_mem::Alloc;

use crate::{
    Allocator,
    resource::{Resource, ResourceUsage},
    tracking::{layout_access_flags, optimal_layout},
    utils::AsVkHandle,
};

bitflags! {
    /// What an image is used for besides being sampled.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ImageUsage: u32 {
        const RENDER_TARGET = 1 << 0;
        const DEPTH_STENCIL = 1 << 1;
        /// Bound as a storage image.
        const LOAD_STORE = 1 << 2;
        /// Written by the host every frame.
        const DYNAMIC = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: ImageUsage,
    /// Owned by one queue family at a time.
    pub exclusive: bool,
    pub initial_layout: vk::ImageLayout,
}

impl Default for ImageDesc {
    fn default() -> Self {
        Self {
            format: vk::Format::R8G8B8A8_UNORM,
            extent: vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
            mip_levels: 1,
            array_layers: 1,
            usage: ImageUsage::empty(),
            exclusive: false,
            initial_layout: vk::ImageLayout::UNDEFINED,
        }
    }
}

enum Memory {
    /// Owned by someone else, such as a swap chain.
    External,
    Allocated {
        allocator: Allocator,
        allocation: vk_mem::Allocation,
    },
}

pub struct Image {
    handle: vk::Image,
    desc: ImageDesc,
    aspects: vk::ImageAspectFlags,
    layouts: Mutex<Vec<vk::ImageLayout>>,
    tracking: ResourceUsage,
    memory: Memory,
}

impl Drop for Image {
    fn drop(&mut self) {
        if let Memory::Allocated {
            allocator,
            allocation,
        } = &mut self.memory
        {
            unsafe {
                allocator.destroy_image(self.handle, allocation);
            }
        }
    }
}

impl Image {
    /// Create an image in device-local memory.
    pub fn new(
        allocator: Allocator,
        info: &vk::ImageCreateInfo,
        usage: ImageUsage,
        exclusive: bool,
    ) -> VkResult<Self> {
        let (handle, allocation) = unsafe {
            allocator.create_image(
                info,
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    ..Default::default()
                },
            )?
        };
        let desc = ImageDesc {
            format: info.format,
            extent: info.extent,
            mip_levels: info.mip_levels,
            array_layers: info.array_layers,
            usage,
            exclusive,
            initial_layout: info.initial_layout,
        };
        Ok(Self::with_memory(
            handle,
            desc,
            Memory::Allocated {
                allocator,
                allocation,
            },
        ))
    }

    /// Track an image whose memory is owned elsewhere.
    pub fn from_raw(handle: vk::Image, desc: ImageDesc) -> Self {
        Self::with_memory(handle, desc, Memory::External)
    }

    fn with_memory(handle: vk::Image, desc: ImageDesc, memory: Memory) -> Self {
        let count = (desc.mip_levels * desc.array_layers) as usize;
        Self {
            handle,
            aspects: format_aspects(desc.format),
            layouts: Mutex::new(vec![desc.initial_layout; count]),
            tracking: ResourceUsage::new(desc.exclusive),
            desc,
            memory,
        }
    }

    pub fn handle(&self) -> vk::Image {
        self.handle
    }
    pub fn format(&self) -> vk::Format {
        self.desc.format
    }
    pub fn extent(&self) -> UVec3 {
        UVec3::new(
            self.desc.extent.width,
            self.desc.extent.height,
            self.desc.extent.depth,
        )
    }
    pub fn aspects(&self) -> vk::ImageAspectFlags {
        self.aspects
    }
    pub fn mip_levels(&self) -> u32 {
        self.desc.mip_levels
    }
    pub fn array_layers(&self) -> u32 {
        self.desc.array_layers
    }
    pub fn image_usage(&self) -> ImageUsage {
        self.desc.usage
    }

    pub fn subresource_range(
        &self,
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
    ) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: self.aspects,
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        }
    }
    pub fn full_range(&self) -> vk::ImageSubresourceRange {
        self.subresource_range(0, self.desc.mip_levels, 0, self.desc.array_layers)
    }

    /// Layout a sub-resource was left in by the last submitted command buffer.
    pub fn layout(&self, layer: u32, mip: u32) -> vk::ImageLayout {
        self.layouts()[self.layout_index(layer, mip)]
    }
    pub fn set_layout(&self, range: &vk::ImageSubresourceRange, layout: vk::ImageLayout) {
        let mut layouts = self.layouts();
        for layer in range.base_array_layer..range.base_array_layer + range.layer_count {
            for mip in range.base_mip_level..range.base_mip_level + range.level_count {
                layouts[self.layout_index(layer, mip)] = layout;
            }
        }
    }

    pub fn access_flags(&self, layout: vk::ImageLayout, read_only: bool) -> vk::AccessFlags2 {
        layout_access_flags(layout, read_only, self.desc.usage)
    }
    /// Layout the image is kept in while bound for shader use.
    pub fn optimal_layout(&self) -> vk::ImageLayout {
        optimal_layout(self.desc.usage)
    }

    /// Barriers keeping every sub-resource of `range` in its current layout, one per run
    /// of consecutive layers sharing a layout. Only the source side is filled in.
    pub(crate) fn barriers(
        &self,
        range: &vk::ImageSubresourceRange,
        out: &mut Vec<vk::ImageMemoryBarrier2<'static>>,
    ) {
        let layouts = self.layouts();
        let layer_end = range.base_array_layer + range.layer_count;
        for mip in range.base_mip_level..range.base_mip_level + range.level_count {
            let mut run_start = range.base_array_layer;
            while run_start < layer_end {
                let layout = layouts[self.layout_index(run_start, mip)];
                let mut run_end = run_start + 1;
                while run_end < layer_end && layouts[self.layout_index(run_end, mip)] == layout {
                    run_end += 1;
                }
                out.push(
                    vk::ImageMemoryBarrier2::default()
                        .image(self.handle)
                        .old_layout(layout)
                        .new_layout(layout)
                        .src_access_mask(self.access_flags(layout, false))
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .subresource_range(vk::ImageSubresourceRange {
                            aspect_mask: range.aspect_mask,
                            base_mip_level: mip,
                            level_count: 1,
                            base_array_layer: run_start,
                            layer_count: run_end - run_start,
                        }),
                );
                run_start = run_end;
            }
        }
    }

    fn layout_index(&self, layer: u32, mip: u32) -> usize {
        (layer * self.desc.mip_levels + mip) as usize
    }
    fn layouts(&self) -> MutexGuard<'_, Vec<vk::ImageLayout>> {
        self.layouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl AsVkHandle for Image {
    type Handle = vk::Image;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Image {
    fn usage(&self) -> &ResourceUsage {
        &self.tracking
    }
}

pub fn format_aspects(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D16_UNORM | vk::Format::D32_SFLOAT | vk::Format::X8_D24_UNORM_PACK32 => {
            vk::ImageAspectFlags::DEPTH
        }
        vk::Format::D16_UNORM_S8_UINT
        | vk::Format::D24_UNORM_S8_UINT
        | vk::Format::D32_SFLOAT_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        vk::Format::S8_UINT => vk::ImageAspectFlags::STENCIL,
        _ => vk::ImageAspectFlags::COLOR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn array_image() -> Image {
        Image::from_raw(
            vk::Image::from_raw(7),
            ImageDesc {
                mip_levels: 2,
                array_layers: 4,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_layouts_per_subresource() {
        let image = array_image();
        assert_eq!(image.layout(3, 1), vk::ImageLayout::UNDEFINED);
        image.set_layout(
            &image.subresource_range(1, 1, 1, 2),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );
        assert_eq!(image.layout(1, 1), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.layout(2, 1), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.layout(1, 0), vk::ImageLayout::UNDEFINED);
        assert_eq!(image.layout(3, 1), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_barriers_group_layer_runs() {
        let image = array_image();
        image.set_layout(
            &image.subresource_range(0, 1, 1, 2),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );
        let mut barriers = Vec::new();
        image.barriers(&image.subresource_range(0, 1, 0, 4), &mut barriers);
        let runs: Vec<_> = barriers
            .iter()
            .map(|b| {
                (
                    b.subresource_range.base_array_layer,
                    b.subresource_range.layer_count,
                    b.old_layout,
                )
            })
            .collect();
        assert_eq!(
            runs,
            vec![
                (0, 1, vk::ImageLayout::UNDEFINED),
                (1, 2, vk::ImageLayout::TRANSFER_DST_OPTIMAL),
                (3, 1, vk::ImageLayout::UNDEFINED),
            ]
        );
        assert_eq!(barriers[1].src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
    }

    #[test]
    fn test_format_aspects() {
        assert_eq!(
            format_aspects(vk::Format::D24_UNORM_S8_UINT),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(
            format_aspects(vk::Format::B8G8R8A8_SRGB),
            vk::ImageAspectFlags::COLOR
        );
    }
}
