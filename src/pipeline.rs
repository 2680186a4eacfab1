//! Pipeline state objects and the resources bound alongside them.
//!
//! Pipelines are compiled outside of this crate; [`GraphicsPipeline`] and
//! [`ComputePipeline`] take ownership of the native handle and carry the state the
//! command buffer needs to validate render target use. [`GpuParams`] bundles the
//! descriptor sets of a draw or dispatch together with the images and buffers they
//! reference, so those can be tracked.

use std::sync::Arc;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    buffer::Buffer,
    driver::Driver,
    framebuffer::RenderSurfaceMask,
    image::Image,
    resource::{Resource, ResourceUsage},
    tracking::Access,
    utils::AsVkHandle,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphicsPipelineInfo {
    /// Color attachments the pipeline never writes.
    pub color_read_only: RenderSurfaceMask,
    /// Depth and stencil writes are disabled.
    pub depth_read_only: bool,
    /// The scissor rectangle is used. Otherwise the scissor covers the whole target.
    pub scissor_enabled: bool,
}

pub struct GraphicsPipeline {
    driver: Arc<dyn Driver>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    info: GraphicsPipelineInfo,
    usage: ResourceUsage,
}

impl GraphicsPipeline {
    /// Takes ownership of `handle`. The layout stays owned by the caller.
    pub fn from_raw(
        driver: Arc<dyn Driver>,
        handle: vk::Pipeline,
        layout: vk::PipelineLayout,
        info: GraphicsPipelineInfo,
    ) -> Self {
        Self {
            driver,
            handle,
            layout,
            info,
            usage: ResourceUsage::default(),
        }
    }
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
    pub fn is_color_read_only(&self, index: usize) -> bool {
        self.info
            .color_read_only
            .contains(RenderSurfaceMask::color(index))
    }
    pub fn is_depth_read_only(&self) -> bool {
        self.info.depth_read_only
    }
    pub fn is_scissor_enabled(&self) -> bool {
        self.info.scissor_enabled
    }
}

impl AsVkHandle for GraphicsPipeline {
    type Handle = vk::Pipeline;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for GraphicsPipeline {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        self.driver.destroy_pipeline(self.handle);
    }
}

pub struct ComputePipeline {
    driver: Arc<dyn Driver>,
    handle: vk::Pipeline,
    layout: vk::PipelineLayout,
    usage: ResourceUsage,
}

impl ComputePipeline {
    /// Takes ownership of `handle`. The layout stays owned by the caller.
    pub fn from_raw(
        driver: Arc<dyn Driver>,
        handle: vk::Pipeline,
        layout: vk::PipelineLayout,
    ) -> Self {
        Self {
            driver,
            handle,
            layout,
            usage: ResourceUsage::default(),
        }
    }
    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl AsVkHandle for ComputePipeline {
    type Handle = vk::Pipeline;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for ComputePipeline {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        self.driver.destroy_pipeline(self.handle);
    }
}

#[derive(Clone)]
pub struct ImageBinding {
    pub image: Arc<Image>,
    pub range: vk::ImageSubresourceRange,
    pub access: Access,
    /// Layout the shader expects. `None` selects the image's optimal layout.
    pub layout: Option<vk::ImageLayout>,
}

#[derive(Clone)]
pub struct BufferBinding {
    pub buffer: Arc<Buffer>,
    pub access: Access,
}

/// Descriptor sets for one draw or dispatch, and everything they reference.
#[derive(Clone, Default)]
pub struct GpuParams {
    pub sets: SmallVec<[vk::DescriptorSet; 4]>,
    pub images: Vec<ImageBinding>,
    pub buffers: Vec<BufferBinding>,
}

impl GpuParams {
    pub fn with_image(mut self, image: Arc<Image>, access: Access) -> Self {
        let range = image.full_range();
        self.images.push(ImageBinding {
            image,
            range,
            access,
            layout: None,
        });
        self
    }
    pub fn with_buffer(mut self, buffer: Arc<Buffer>, access: Access) -> Self {
        self.buffers.push(BufferBinding { buffer, access });
        self
    }
    pub fn with_set(mut self, set: vk::DescriptorSet) -> Self {
        self.sets.push(set);
        self
    }
}
