//! The native Vulkan entry points used by the tracking core.
//!
//! Command buffers, queues and swap chains never call `ash` directly. They go through a
//! [`Driver`], which is implemented over a real logical device by [`AshDriver`] and
//! without any GPU by [`HeadlessDriver`]. The headless driver records every command into
//! a log so that the barriers and render passes derived from the tracked state can be
//! inspected.
//!
//! Creation and queue operations are fallible and return [`VkResult`]. Recording
//! functions mirror `vkCmd*` and return nothing.
use ash::{prelude::VkResult, vk};
use smallvec::SmallVec;

use crate::MAX_RENDER_TARGETS;

mod ash_device;
mod headless;

pub use ash_device::AshDriver;
pub use headless::{HeadlessDriver, Recorded, RecordedBatch};

/// One command buffer of a batched queue submission.
#[derive(Debug, Clone, Copy)]
pub struct SubmitBatch<'a> {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: &'a [vk::Semaphore],
    pub signal_semaphores: &'a [vk::Semaphore],
}

/// A single-subpass render pass.
#[derive(Debug, Clone, Default)]
pub struct RenderPassDesc {
    pub attachments: SmallVec<[vk::AttachmentDescription; MAX_RENDER_TARGETS + 1]>,
    pub color_references: SmallVec<[vk::AttachmentReference; MAX_RENDER_TARGETS]>,
    pub depth_reference: Option<vk::AttachmentReference>,
}

#[derive(Debug, Clone, Copy)]
pub struct FramebufferDesc<'a> {
    pub render_pass: vk::RenderPass,
    pub attachments: &'a [vk::ImageView],
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

pub trait Driver: Send + Sync {
    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn create_fence(&self) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// Waits up to `timeout` nanoseconds. Returns whether the fence is signaled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<bool>;

    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    fn create_event(&self) -> VkResult<vk::Event>;
    fn destroy_event(&self, event: vk::Event);

    fn create_query_pool(&self, ty: vk::QueryType, count: u32) -> VkResult<vk::QueryPool>;
    fn destroy_query_pool(&self, pool: vk::QueryPool);
    /// Non-blocking read of one 64-bit query result. `None` while not yet available.
    fn query_result(&self, pool: vk::QueryPool, index: u32) -> VkResult<Option<u64>>;

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass>;
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> VkResult<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue;
    fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()>;
    /// Returns whether the swap chain is suboptimal.
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool>;
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// Returns the acquired image index and whether the swap chain is suboptimal.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)>;

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    );
    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    );
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer);
    fn cmd_clear_attachments(
        &self,
        command_buffer: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        rects: &[vk::ClearRect],
    );
    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    );
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    );
    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    );
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    );
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32);
    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    );
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32);
    fn cmd_set_event(&self, command_buffer: vk::CommandBuffer, event: vk::Event);
    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    );
    fn cmd_begin_query(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        index: u32,
        flags: vk::QueryControlFlags,
    );
    fn cmd_end_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, index: u32);
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags2,
        pool: vk::QueryPool,
        index: u32,
    );
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );
    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );
}
