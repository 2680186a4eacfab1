//! # Command Recording
//!
//! This module records commands while tracking every resource they reference.
//!
//! While recording, a command buffer is responsible for:
//! - Resource Lifetimes. Every image, buffer, pipeline, framebuffer, event and query a
//!   command references is kept alive until the submission has completed on the GPU, and
//!   is told when it becomes bound, used, done or unbound (see [`crate::resource`]).
//! - Image Layouts. Images are tracked per sub-resource range. The command buffer knows the
//!   layout each range is in, the layout the next command needs, and the layout it has to be
//!   left in when the command buffer completes. Transitions between them are batched into
//!   pipeline barriers issued right before the next render pass, dispatch or copy.
//! - Render Passes. Render passes are started lazily by the first draw after a render target
//!   change, and ended whenever a command needs to touch one of the attachments from outside.
//! - Hazards. Shader and transfer accesses to the same resource within one command buffer
//!   are ordered with memory barriers computed by [`ResourceState`](crate::tracking::ResourceState).
//!
//! ## Key Components
//!
//! - [`CmdBuffer`]: One native command buffer together with its tracked state.
//! - [`CommandBuffer`]: The handle the application records into. It swaps in a fresh
//!   [`CmdBuffer`] on every submission.
//! - [`CommandBufferPool`]: Per queue family pools of reusable [`CmdBuffer`]s.
//!
//! ## Lifecycle
//!
//! ```text
//! Ready -> Recording <-> RecordingRenderPass
//!            |
//!            v
//!      RecordingDone -> Submitted -> (reset) -> Ready
//! ```
mod compute;
mod handle;
mod pool;
mod render;
mod submit;
mod tracker;
mod transfer;

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use ash::{prelude::VkResult, vk};
use glam::Vec4;
use smallvec::SmallVec;

pub use handle::CommandBuffer;
pub use pool::CommandBufferPool;
pub(crate) use pool::NativePool;
pub use render::RenderTarget;
pub(crate) use tracker::{BufferInfo, ImageInfo, SubresourceInfo, TrackedResource, UsageKind};

use crate::{
    MAX_CB_DEPENDENCIES, MAX_RENDER_TARGETS,
    driver::Driver,
    framebuffer::{ClearMask, Framebuffer, FramebufferBuffers, RenderSurfaceMask},
    image::Image,
    pipeline::{ComputePipeline, GpuParams, GraphicsPipeline},
    query::{Query, QuerySlot},
    resource::{Resource, ResourceId, UseFlags},
    swapchain::SwapChain,
    sync::{Event, Semaphore},
    tracking::{Access, MemoryBarrier, access_pipeline_stages, range_contains},
    utils::AsVkHandle,
};

/// Where a [`CmdBuffer`] is in its lifecycle.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum CmdBufferState {
    /// Reset and waiting in its pool.
    Ready,
    Recording,
    /// Recording, inside a render pass.
    RecordingRenderPass,
    /// Recording has ended. The buffer can be submitted.
    RecordingDone,
    /// Submitted to a queue and possibly still executing.
    Submitted,
}

/// A native command buffer together with the state tracked while recording it.
pub struct CmdBuffer {
    driver: Arc<dyn Driver>,
    pool: Arc<NativePool>,
    handle: vk::CommandBuffer,
    fence: vk::Fence,
    /// Whether `fence` was handed to the last queue submission of this buffer.
    fence_submitted: bool,
    fence_timeout: u64,
    id: u32,
    queue_family: u32,
    state: CmdBufferState,
    global_queue_idx: Option<u32>,

    resources: HashMap<ResourceId, TrackedResource>,
    images: HashMap<ResourceId, ImageInfo>,
    buffers: HashMap<ResourceId, BufferInfo>,
    swap_chains: HashMap<ResourceId, Arc<SwapChain>>,
    queries: Vec<Arc<Query>>,

    queued_layout_transitions: HashSet<ResourceId>,
    pending_barrier: MemoryBarrier,
    queued_events: Vec<Arc<Event>>,
    queued_query_resets: Vec<QuerySlot>,

    intra_semaphore: Option<Arc<Semaphore>>,
    inter_semaphores: SmallVec<[Arc<Semaphore>; MAX_CB_DEPENDENCIES]>,
    granted_inter_semaphores: usize,

    framebuffer: Option<Arc<Framebuffer>>,
    render_target_read_only: FramebufferBuffers,
    render_target_load_mask: RenderSurfaceMask,
    graphics_pipeline: Option<Arc<GraphicsPipeline>>,
    compute_pipeline: Option<Arc<ComputePipeline>>,
    params: Option<Arc<GpuParams>>,
    params_dirty: bool,
    bound_sets: SmallVec<[vk::DescriptorSet; 4]>,
    bind_graphics_sets: bool,
    bind_compute_sets: bool,
    gfx_pipeline_requires_bind: bool,
    cmp_pipeline_requires_bind: bool,

    /// Normalized `(x, y, width, height)`.
    viewport: Vec4,
    scissor: vk::Rect2D,
    stencil_ref: u32,
    viewport_requires_bind: bool,
    scissor_requires_bind: bool,
    stencil_ref_requires_bind: bool,

    clear_mask: ClearMask,
    clear_values: [vk::ClearValue; MAX_RENDER_TARGETS + 1],
    clear_area: vk::Rect2D,
}

impl AsVkHandle for CmdBuffer {
    type Handle = vk::CommandBuffer;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl CmdBuffer {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        pool: Arc<NativePool>,
        id: u32,
        fence_timeout: u64,
    ) -> VkResult<Self> {
        let handle = driver.allocate_command_buffer(pool.handle())?;
        let fence = match driver.create_fence() {
            Ok(fence) => fence,
            Err(err) => {
                driver.free_command_buffer(pool.handle(), handle);
                return Err(err);
            }
        };
        Ok(Self {
            queue_family: pool.queue_family(),
            driver,
            pool,
            handle,
            fence,
            fence_submitted: false,
            fence_timeout,
            id,
            state: CmdBufferState::Ready,
            global_queue_idx: None,
            resources: HashMap::new(),
            images: HashMap::new(),
            buffers: HashMap::new(),
            swap_chains: HashMap::new(),
            queries: Vec::new(),
            queued_layout_transitions: HashSet::new(),
            pending_barrier: MemoryBarrier::default(),
            queued_events: Vec::new(),
            queued_query_resets: Vec::new(),
            intra_semaphore: None,
            inter_semaphores: SmallVec::new(),
            granted_inter_semaphores: 0,
            framebuffer: None,
            render_target_read_only: FramebufferBuffers::empty(),
            render_target_load_mask: RenderSurfaceMask::empty(),
            graphics_pipeline: None,
            compute_pipeline: None,
            params: None,
            params_dirty: false,
            bound_sets: SmallVec::new(),
            bind_graphics_sets: true,
            bind_compute_sets: true,
            gfx_pipeline_requires_bind: true,
            cmp_pipeline_requires_bind: true,
            viewport: Vec4::new(0.0, 0.0, 1.0, 1.0),
            scissor: vk::Rect2D::default(),
            stencil_ref: 0,
            viewport_requires_bind: true,
            scissor_requires_bind: true,
            stencil_ref_requires_bind: true,
            clear_mask: ClearMask::empty(),
            clear_values: [vk::ClearValue::default(); MAX_RENDER_TARGETS + 1],
            clear_area: vk::Rect2D::default(),
        })
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }
    pub fn fence(&self) -> vk::Fence {
        self.fence
    }
    /// Index of this buffer within its pool.
    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }
    pub fn state(&self) -> CmdBufferState {
        self.state
    }
    /// Global index of the queue this buffer was last submitted on.
    pub fn global_queue_idx(&self) -> Option<u32> {
        self.global_queue_idx
    }
    pub fn is_recording(&self) -> bool {
        matches!(
            self.state,
            CmdBufferState::Recording | CmdBufferState::RecordingRenderPass
        )
    }
    pub fn is_in_render_pass(&self) -> bool {
        self.state == CmdBufferState::RecordingRenderPass
    }
    pub fn is_ready_for_submit(&self) -> bool {
        self.state == CmdBufferState::RecordingDone
    }
    pub fn is_submitted(&self) -> bool {
        self.state == CmdBufferState::Submitted
    }

    pub fn begin(&mut self) -> VkResult<()> {
        assert_eq!(
            self.state,
            CmdBufferState::Ready,
            "Command buffer must be reset before it can begin recording"
        );
        self.driver.begin_command_buffer(self.handle)?;
        self.state = CmdBufferState::Recording;
        Ok(())
    }

    /// Ends recording. A render pass still open is ended, and a pending clear is executed.
    pub fn end(&mut self) -> VkResult<()> {
        if self.is_in_render_pass() {
            self.end_render_pass();
        }
        assert_eq!(
            self.state,
            CmdBufferState::Recording,
            "Command buffer must be recording to end"
        );
        if !self.clear_mask.is_empty() {
            self.execute_clear_pass();
        }
        self.driver.end_command_buffer(self.handle)?;
        self.state = CmdBufferState::RecordingDone;
        Ok(())
    }

    /// Returns the buffer to [`CmdBufferState::Ready`] and forgets every tracked resource.
    ///
    /// Resources of a submitted buffer are told their use is done. Resources of a buffer
    /// that was never submitted are told they were unbound.
    pub fn reset(&mut self) {
        let was_submitted = self.state == CmdBufferState::Submitted;
        let was_ready = self.state == CmdBufferState::Ready;
        self.state = CmdBufferState::Ready;
        if !was_ready && let Err(err) = self.driver.reset_command_buffer(self.handle) {
            tracing::error!(?err, "failed to reset command buffer");
        }

        let global_idx = self.global_queue_idx.unwrap_or(0);
        let notify = |resource: &dyn Resource, flags: UseFlags| {
            if was_submitted {
                resource.notify_done(global_idx, flags);
            } else {
                resource.notify_unbound();
            }
        };
        for tracked in self.resources.values() {
            notify(&*tracked.resource, tracked.flags);
        }
        for info in self.images.values() {
            notify(&*info.image, info.flags);
        }
        for info in self.buffers.values() {
            notify(&*info.buffer, info.flags);
        }

        self.resources.clear();
        self.images.clear();
        self.buffers.clear();
        self.swap_chains.clear();
        self.queries.clear();
        self.queued_layout_transitions.clear();
        self.pending_barrier = MemoryBarrier::default();
        self.queued_events.clear();
        self.queued_query_resets.clear();
        self.intra_semaphore = None;
        self.inter_semaphores.clear();
        self.granted_inter_semaphores = 0;
        self.fence_submitted = false;
        self.global_queue_idx = None;
        self.clear_binding_state();
    }

    pub(crate) fn clear_binding_state(&mut self) {
        self.framebuffer = None;
        self.render_target_read_only = FramebufferBuffers::empty();
        self.render_target_load_mask = RenderSurfaceMask::empty();
        self.graphics_pipeline = None;
        self.compute_pipeline = None;
        self.params = None;
        self.params_dirty = false;
        self.bound_sets.clear();
        self.bind_graphics_sets = true;
        self.bind_compute_sets = true;
        self.gfx_pipeline_requires_bind = true;
        self.cmp_pipeline_requires_bind = true;
        self.viewport_requires_bind = true;
        self.scissor_requires_bind = true;
        self.stencil_ref_requires_bind = true;
        self.clear_mask = ClearMask::empty();
    }

    /// Whether the GPU has finished executing the buffer. With `block` this waits up to
    /// the configured fence timeout.
    pub fn check_fence_status(&self, block: bool) -> VkResult<bool> {
        if !self.fence_submitted {
            return Ok(self.state != CmdBufferState::Submitted);
        }
        let timeout = if block { self.fence_timeout } else { 0 };
        self.driver.wait_for_fence(self.fence, timeout)
    }

    pub(crate) fn reset_fence(&mut self) -> VkResult<()> {
        self.driver.reset_fence(self.fence)
    }

    pub(crate) fn set_signal_semaphores(
        &mut self,
        intra: Arc<Semaphore>,
        inter: SmallVec<[Arc<Semaphore>; MAX_CB_DEPENDENCIES]>,
    ) {
        self.intra_semaphore = Some(intra);
        self.inter_semaphores = inter;
        self.granted_inter_semaphores = 0;
    }

    pub(crate) fn mark_submitted(&mut self, fenced: bool) {
        self.state = CmdBufferState::Submitted;
        self.fence_submitted = fenced;
    }

    /// Semaphore signaled when this buffer completes, which the next submission on the
    /// same queue waits on.
    pub fn intra_queue_semaphore(&self) -> Option<&Arc<Semaphore>> {
        self.intra_semaphore.as_ref()
    }

    /// Hands out one of the semaphores this buffer signals for other queues to wait on.
    /// `None` once all of them were handed out.
    pub fn request_inter_queue_semaphore(&mut self) -> Option<Arc<Semaphore>> {
        let semaphore = self
            .inter_semaphores
            .get(self.granted_inter_semaphores)
            .cloned()?;
        self.granted_inter_semaphores += 1;
        Some(semaphore)
    }

    /// Keeps `resource` alive and reports its use until the buffer completes.
    pub fn register_resource(&mut self, resource: Arc<dyn Resource>, flags: UseFlags) {
        let id = resource.id();
        match self.resources.entry(id) {
            std::collections::hash_map::Entry::Occupied(mut entry) => {
                let tracked = entry.get_mut();
                assert!(!tracked.used, "Registering a resource with a submitted command buffer");
                tracked.flags |= flags;
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                resource.notify_bound();
                entry.insert(TrackedResource {
                    resource,
                    flags,
                    used: false,
                });
            }
        }
    }

    pub fn is_resource_tracked(&self, id: ResourceId) -> bool {
        self.resources.contains_key(&id)
            || self.images.contains_key(&id)
            || self.buffers.contains_key(&id)
    }

    /// Signals `event` once all prior commands complete. Inside a render pass the signal
    /// is deferred until the pass ends.
    pub fn set_event(&mut self, event: Arc<Event>) {
        assert!(self.is_recording(), "Command buffer must be recording");
        self.register_resource(event.clone(), UseFlags::WRITE);
        if self.is_in_render_pass() {
            self.queued_events.push(event);
        } else {
            self.driver.cmd_set_event(self.handle, event.handle());
        }
    }

    /// Resets one query slot. Resets requested inside a render pass are executed by a
    /// separate command buffer submitted ahead of this one.
    pub fn reset_query(&mut self, slot: QuerySlot) {
        assert!(self.is_recording(), "Command buffer must be recording");
        if self.is_in_render_pass() {
            self.queued_query_resets.push(slot);
        } else {
            self.driver
                .cmd_reset_query_pool(self.handle, slot.pool, slot.index, 1);
        }
    }

    pub(crate) fn take_query_resets(&mut self) -> Vec<QuerySlot> {
        std::mem::take(&mut self.queued_query_resets)
    }

    pub(crate) fn write_timestamp(&mut self, stage: vk::PipelineStageFlags2, slot: QuerySlot) {
        self.driver
            .cmd_write_timestamp(self.handle, stage, slot.pool, slot.index);
    }
    pub(crate) fn begin_query(&mut self, slot: QuerySlot, flags: vk::QueryControlFlags) {
        self.driver
            .cmd_begin_query(self.handle, slot.pool, slot.index, flags);
    }
    pub(crate) fn end_query(&mut self, slot: QuerySlot) {
        self.driver.cmd_end_query(self.handle, slot.pool, slot.index);
    }

    pub(crate) fn register_query(&mut self, query: Arc<Query>) {
        if !self.queries.iter().any(|q| Arc::ptr_eq(q, &query)) {
            self.register_resource(query.clone(), UseFlags::WRITE);
            self.queries.push(query);
        }
    }

    /// Queries begun in this buffer and not yet ended.
    pub fn in_progress_queries(&self) -> Vec<Arc<Query>> {
        self.queries
            .iter()
            .filter(|query| query.is_in_progress())
            .cloned()
            .collect()
    }

    /// Global memory barrier, recorded immediately.
    pub fn memory_barrier(&mut self, src: Access, dst: Access) {
        let barrier = MemoryBarrier { src, dst }.to_vk();
        self.driver.cmd_pipeline_barrier(
            self.handle,
            &vk::DependencyInfo::default().memory_barriers(std::slice::from_ref(&barrier)),
        );
    }

    /// Barrier on a whole buffer, recorded immediately.
    pub fn buffer_barrier(&mut self, buffer: vk::Buffer, src: vk::AccessFlags2, dst: vk::AccessFlags2) {
        let barrier = vk::BufferMemoryBarrier2::default()
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .src_access_mask(src)
            .dst_access_mask(dst)
            .src_stage_mask(access_pipeline_stages(src, vk::PipelineStageFlags2::TOP_OF_PIPE))
            .dst_stage_mask(access_pipeline_stages(dst, vk::PipelineStageFlags2::BOTTOM_OF_PIPE))
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED);
        self.driver.cmd_pipeline_barrier(
            self.handle,
            &vk::DependencyInfo::default().buffer_memory_barriers(std::slice::from_ref(&barrier)),
        );
    }

    /// Transitions `range` of `image` from `old_layout` to `new_layout`, recorded
    /// immediately. The tracked layout is not updated.
    pub fn set_layout(
        &mut self,
        image: &Image,
        src: vk::AccessFlags2,
        dst: vk::AccessFlags2,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        range: vk::ImageSubresourceRange,
    ) {
        let barrier = crate::tracking::with_access_stages(
            vk::ImageMemoryBarrier2::default()
                .image(image.handle())
                .src_access_mask(src)
                .dst_access_mask(dst)
                .old_layout(old_layout)
                .new_layout(new_layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .subresource_range(range),
        );
        self.driver.cmd_pipeline_barrier(
            self.handle,
            &vk::DependencyInfo::default().image_memory_barriers(std::slice::from_ref(&barrier)),
        );
    }

    /// Layout `range` of `image` will be in when the next command of this buffer executes.
    ///
    /// Inside a render pass an attachment of the bound framebuffer reports the layout the
    /// pass uses for it. Untracked images report the layout the last submission left them in.
    pub fn current_layout(
        &self,
        image: &Image,
        range: &vk::ImageSubresourceRange,
        in_render_pass: bool,
    ) -> vk::ImageLayout {
        let Some(info) = self.images.get(&image.id()) else {
            return image.layout(range.base_array_layer, range.base_mip_level);
        };
        let Some(sub) = info
            .subresources
            .iter()
            .find(|sub| range_contains(&sub.range, range.base_array_layer, range.base_mip_level))
        else {
            return image.layout(range.base_array_layer, range.base_mip_level);
        };
        if sub.is_fb_attachment
            && in_render_pass
            && let Some(framebuffer) = &self.framebuffer
        {
            let read = self.fb_read_mask();
            if info.image.aspects().intersects(
                vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL,
            ) {
                return crate::framebuffer::depth_layout(read);
            }
            let index = framebuffer
                .color_attachments()
                .iter()
                .position(|attachment| attachment.image.id() == image.id())
                .unwrap_or(0);
            return crate::framebuffer::color_layout(read.contains(RenderSurfaceMask::color(index)));
        }
        sub.required_layout
    }

    /// Surfaces of the bound framebuffer that shaders read during the current pass.
    pub fn fb_read_mask(&self) -> RenderSurfaceMask {
        let mut mask = RenderSurfaceMask::empty();
        let Some(framebuffer) = &self.framebuffer else {
            return mask;
        };
        let is_shader_input = |attachment: &crate::framebuffer::FramebufferAttachment| {
            self.images.get(&attachment.image.id()).is_some_and(|info| {
                info.subresources.iter().any(|sub| {
                    range_contains(&sub.range, attachment.base_layer, attachment.mip_level)
                        && sub.is_shader_input
                })
            })
        };
        for (i, attachment) in framebuffer.color_attachments().iter().enumerate() {
            if is_shader_input(attachment) {
                mask |= RenderSurfaceMask::color(i);
            }
        }
        if let Some(depth) = framebuffer.depth_attachment() {
            if is_shader_input(depth)
                || self
                    .render_target_read_only
                    .contains(FramebufferBuffers::DEPTH)
            {
                mask |= RenderSurfaceMask::DEPTH;
            }
            if self
                .render_target_read_only
                .contains(FramebufferBuffers::STENCIL)
            {
                mask |= RenderSurfaceMask::STENCIL;
            }
        }
        mask
    }

    pub fn framebuffer(&self) -> Option<&Arc<Framebuffer>> {
        self.framebuffer.as_ref()
    }
    pub fn clear_mask(&self) -> ClearMask {
        self.clear_mask
    }
    pub fn clear_values(&self) -> &[vk::ClearValue; MAX_RENDER_TARGETS + 1] {
        &self.clear_values
    }
    pub fn clear_area(&self) -> vk::Rect2D {
        self.clear_area
    }
    /// Tracked sub-resource ranges of `image`.
    pub fn subresources(&self, image: &Image) -> &[SubresourceInfo] {
        self.images
            .get(&image.id())
            .map_or(&[], |info| info.subresources.as_slice())
    }
    pub fn has_pending_layout_transitions(&self) -> bool {
        !self.queued_layout_transitions.is_empty()
    }
}

impl Drop for CmdBuffer {
    fn drop(&mut self) {
        if self.state == CmdBufferState::Submitted && self.fence_submitted {
            match self.driver.wait_for_fence(self.fence, self.fence_timeout) {
                Ok(true) => {}
                Ok(false) => tracing::warn!(
                    "Freeing a command buffer before done executing because fence wait expired!"
                ),
                Err(err) => tracing::warn!(?err, "Failed to wait for command buffer fence"),
            }
        }
        if self.state != CmdBufferState::Ready {
            self.reset();
        }
        self.driver.destroy_fence(self.fence);
        self.driver.free_command_buffer(self.pool.handle(), self.handle);
    }
}
