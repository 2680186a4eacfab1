use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Mutex, MutexGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use ash::{prelude::VkResult, vk, vk::Handle};

use super::{Driver, FramebufferDesc, RenderPassDesc, SubmitBatch};

/// A command or queue operation observed by the [`HeadlessDriver`].
#[derive(Clone)]
pub enum Recorded {
    Begin {
        command_buffer: vk::CommandBuffer,
    },
    End {
        command_buffer: vk::CommandBuffer,
    },
    Reset {
        command_buffer: vk::CommandBuffer,
    },
    PipelineBarrier {
        command_buffer: vk::CommandBuffer,
        memory: Vec<vk::MemoryBarrier2<'static>>,
        buffers: Vec<vk::BufferMemoryBarrier2<'static>>,
        images: Vec<vk::ImageMemoryBarrier2<'static>>,
    },
    BeginRenderPass {
        command_buffer: vk::CommandBuffer,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: Vec<vk::ClearValue>,
    },
    EndRenderPass {
        command_buffer: vk::CommandBuffer,
    },
    ClearAttachments {
        command_buffer: vk::CommandBuffer,
        attachments: Vec<vk::ClearAttachment>,
        rects: Vec<vk::ClearRect>,
    },
    BindPipeline {
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    },
    BindDescriptorSets {
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        sets: Vec<vk::DescriptorSet>,
    },
    BindVertexBuffers {
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: Vec<vk::Buffer>,
    },
    BindIndexBuffer {
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        index_type: vk::IndexType,
    },
    SetViewport {
        command_buffer: vk::CommandBuffer,
        viewport: vk::Viewport,
    },
    SetScissor {
        command_buffer: vk::CommandBuffer,
        scissor: vk::Rect2D,
    },
    SetStencilReference {
        command_buffer: vk::CommandBuffer,
        reference: u32,
    },
    Draw {
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
    },
    DrawIndexed {
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
    },
    Dispatch {
        command_buffer: vk::CommandBuffer,
        groups: [u32; 3],
    },
    SetEvent {
        command_buffer: vk::CommandBuffer,
        event: vk::Event,
    },
    ResetQueryPool {
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    },
    BeginQuery {
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        index: u32,
    },
    EndQuery {
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        index: u32,
    },
    WriteTimestamp {
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        index: u32,
    },
    CopyBuffer {
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
    },
    CopyBufferToImage {
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        layout: vk::ImageLayout,
    },
    CopyImageToBuffer {
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        layout: vk::ImageLayout,
        dst: vk::Buffer,
    },
    Submit {
        queue: vk::Queue,
        batches: Vec<RecordedBatch>,
        fence: vk::Fence,
    },
    Present {
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: Vec<vk::Semaphore>,
    },
}

impl Recorded {
    /// The command buffer a recording command was recorded into.
    pub fn command_buffer(&self) -> Option<vk::CommandBuffer> {
        use Recorded::*;
        match self {
            Begin { command_buffer }
            | End { command_buffer }
            | Reset { command_buffer }
            | PipelineBarrier { command_buffer, .. }
            | BeginRenderPass { command_buffer, .. }
            | EndRenderPass { command_buffer }
            | ClearAttachments { command_buffer, .. }
            | BindPipeline { command_buffer, .. }
            | BindDescriptorSets { command_buffer, .. }
            | BindVertexBuffers { command_buffer, .. }
            | BindIndexBuffer { command_buffer, .. }
            | SetViewport { command_buffer, .. }
            | SetScissor { command_buffer, .. }
            | SetStencilReference { command_buffer, .. }
            | Draw { command_buffer, .. }
            | DrawIndexed { command_buffer, .. }
            | Dispatch { command_buffer, .. }
            | SetEvent { command_buffer, .. }
            | ResetQueryPool { command_buffer, .. }
            | BeginQuery { command_buffer, .. }
            | EndQuery { command_buffer, .. }
            | WriteTimestamp { command_buffer, .. }
            | CopyBuffer { command_buffer, .. }
            | CopyBufferToImage { command_buffer, .. }
            | CopyImageToBuffer { command_buffer, .. } => Some(*command_buffer),
            Submit { .. } | Present { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecordedBatch {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

#[derive(Default)]
struct HeadlessState {
    log: Vec<Recorded>,
    fences: HashMap<vk::Fence, bool>,
    manual_fences: bool,
    live_semaphores: HashSet<vk::Semaphore>,
    swapchain_images: HashMap<vk::SwapchainKHR, u32>,
    next_image: HashMap<vk::SwapchainKHR, u32>,
    acquire_script: VecDeque<VkResult<u32>>,
    present_result: Option<vk::Result>,
    submit_failure: Option<vk::Result>,
    query_results: HashMap<(vk::QueryPool, u32), u64>,
}

/// A [`Driver`] without a GPU.
///
/// Handles are unique fake values. Every command and queue operation is appended to a
/// log. Submitted fences signal immediately unless [`HeadlessDriver::set_manual_fences`]
/// is enabled, in which case they stay unsignaled until [`HeadlessDriver::signal_fence`]
/// or a blocking wait.
pub struct HeadlessDriver {
    next_handle: AtomicU64,
    state: Mutex<HeadlessState>,
}

impl Default for HeadlessDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDriver {
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(0x1000),
            state: Mutex::default(),
        }
    }

    fn handle<T: Handle>(&self) -> T {
        T::from_raw(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }
    fn state(&self) -> MutexGuard<'_, HeadlessState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
    fn record(&self, command: Recorded) {
        self.state().log.push(command);
    }

    pub fn log(&self) -> Vec<Recorded> {
        self.state().log.clone()
    }
    pub fn take_log(&self) -> Vec<Recorded> {
        std::mem::take(&mut self.state().log)
    }
    /// Commands recorded into `command_buffer`, oldest first.
    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<Recorded> {
        self.state()
            .log
            .iter()
            .filter(|command| command.command_buffer() == Some(command_buffer))
            .cloned()
            .collect()
    }
    pub fn submissions(&self) -> Vec<Recorded> {
        self.state()
            .log
            .iter()
            .filter(|command| matches!(command, Recorded::Submit { .. }))
            .cloned()
            .collect()
    }

    /// Keep submitted fences unsignaled until signaled explicitly.
    pub fn set_manual_fences(&self, manual: bool) {
        self.state().manual_fences = manual;
    }
    pub fn signal_fence(&self, fence: vk::Fence) {
        self.state().fences.insert(fence, true);
    }
    pub fn is_fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn live_semaphores(&self) -> usize {
        self.state().live_semaphores.len()
    }

    /// Image indices (or errors) returned by the next acquires, in order. Once the script
    /// runs out, images are handed out round-robin.
    pub fn script_acquire(&self, results: impl IntoIterator<Item = VkResult<u32>>) {
        self.state().acquire_script.extend(results);
    }
    pub fn set_present_result(&self, result: Option<vk::Result>) {
        self.state().present_result = result;
    }
    /// Fails the next queue submission with `result`.
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state().submit_failure = Some(result);
    }
    pub fn set_swapchain_image_count(&self, swapchain: vk::SwapchainKHR, count: u32) {
        self.state().swapchain_images.insert(swapchain, count);
    }
    pub fn set_query_result(&self, pool: vk::QueryPool, index: u32, value: u64) {
        self.state().query_results.insert((pool, index), value);
    }
}

impl Driver for HeadlessDriver {
    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        tracing::trace!(queue_family, "headless command pool");
        Ok(self.handle())
    }
    fn destroy_command_pool(&self, _pool: vk::CommandPool) {}
    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        Ok(self.handle())
    }
    fn free_command_buffer(&self, _pool: vk::CommandPool, _command_buffer: vk::CommandBuffer) {}
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(Recorded::Begin { command_buffer });
        Ok(())
    }
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(Recorded::End { command_buffer });
        Ok(())
    }
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.record(Recorded::Reset { command_buffer });
        Ok(())
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        let fence = self.handle();
        self.state().fences.insert(fence, false);
        Ok(fence)
    }
    fn destroy_fence(&self, fence: vk::Fence) {
        self.state().fences.remove(&fence);
    }
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.state().fences.insert(fence, false);
        Ok(())
    }
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<bool> {
        let mut state = self.state();
        let signaled = state.fences.entry(fence).or_insert(false);
        if !*signaled && timeout > 0 {
            // A blocking wait stands in for the GPU finishing the work.
            *signaled = true;
        }
        Ok(*signaled)
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        let semaphore = self.handle();
        self.state().live_semaphores.insert(semaphore);
        Ok(semaphore)
    }
    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state().live_semaphores.remove(&semaphore);
    }
    fn create_event(&self) -> VkResult<vk::Event> {
        Ok(self.handle())
    }
    fn destroy_event(&self, _event: vk::Event) {}

    fn create_query_pool(&self, _ty: vk::QueryType, _count: u32) -> VkResult<vk::QueryPool> {
        Ok(self.handle())
    }
    fn destroy_query_pool(&self, _pool: vk::QueryPool) {}
    fn query_result(&self, pool: vk::QueryPool, index: u32) -> VkResult<Option<u64>> {
        Ok(self.state().query_results.get(&(pool, index)).copied())
    }

    fn create_render_pass(&self, _desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        Ok(self.handle())
    }
    fn destroy_render_pass(&self, _render_pass: vk::RenderPass) {}
    fn create_framebuffer(&self, _desc: &FramebufferDesc<'_>) -> VkResult<vk::Framebuffer> {
        Ok(self.handle())
    }
    fn destroy_framebuffer(&self, _framebuffer: vk::Framebuffer) {}
    fn create_image_view(&self, _info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        Ok(self.handle())
    }
    fn destroy_image_view(&self, _view: vk::ImageView) {}
    fn destroy_pipeline(&self, _pipeline: vk::Pipeline) {}

    fn get_queue(&self, _family: u32, _index: u32) -> vk::Queue {
        self.handle()
    }
    fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut state = self.state();
        if let Some(err) = state.submit_failure.take() {
            return Err(err);
        }
        if fence != vk::Fence::null() {
            let signaled = !state.manual_fences;
            state.fences.insert(fence, signaled);
        }
        state.log.push(Recorded::Submit {
            queue,
            batches: batches
                .iter()
                .map(|batch| RecordedBatch {
                    command_buffer: batch.command_buffer,
                    wait_semaphores: batch.wait_semaphores.to_vec(),
                    signal_semaphores: batch.signal_semaphores.to_vec(),
                })
                .collect(),
            fence,
        });
        Ok(())
    }
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let mut state = self.state();
        state.log.push(Recorded::Present {
            queue,
            swapchain,
            image_index,
            wait_semaphores: wait_semaphores.to_vec(),
        });
        match state.present_result {
            None => Ok(false),
            Some(vk::Result::SUBOPTIMAL_KHR) => Ok(true),
            Some(err) => Err(err),
        }
    }
    fn queue_wait_idle(&self, _queue: vk::Queue) -> VkResult<()> {
        Ok(())
    }
    fn device_wait_idle(&self) -> VkResult<()> {
        let mut state = self.state();
        for signaled in state.fences.values_mut() {
            *signaled = true;
        }
        Ok(())
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR> {
        let swapchain = self.handle();
        self.state()
            .swapchain_images
            .insert(swapchain, info.min_image_count.max(1));
        Ok(swapchain)
    }
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state();
        state.swapchain_images.remove(&swapchain);
        state.next_image.remove(&swapchain);
    }
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        let count = self
            .state()
            .swapchain_images
            .get(&swapchain)
            .copied()
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        Ok((0..count).map(|_| self.handle()).collect())
    }
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state();
        if let Some(scripted) = state.acquire_script.pop_front() {
            return scripted.map(|index| (index, false));
        }
        let count = state.swapchain_images.get(&swapchain).copied().unwrap_or(1);
        let next = state.next_image.entry(swapchain).or_insert(0);
        let index = *next;
        *next = (index + 1) % count;
        Ok((index, false))
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        let memory = unsafe {
            slice_or_empty(
                dependency_info.p_memory_barriers,
                dependency_info.memory_barrier_count,
            )
        };
        let buffers = unsafe {
            slice_or_empty(
                dependency_info.p_buffer_memory_barriers,
                dependency_info.buffer_memory_barrier_count,
            )
        };
        let images = unsafe {
            slice_or_empty(
                dependency_info.p_image_memory_barriers,
                dependency_info.image_memory_barrier_count,
            )
        };
        self.record(Recorded::PipelineBarrier {
            command_buffer,
            memory: memory.iter().map(memory_barrier).collect(),
            buffers: buffers.iter().map(buffer_barrier).collect(),
            images: images.iter().map(image_barrier).collect(),
        });
    }
    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    ) {
        let clear_values = unsafe {
            slice_or_empty(begin_info.p_clear_values, begin_info.clear_value_count)
        };
        self.record(Recorded::BeginRenderPass {
            command_buffer,
            render_pass: begin_info.render_pass,
            framebuffer: begin_info.framebuffer,
            area: begin_info.render_area,
            clear_values: clear_values.to_vec(),
        });
    }
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        self.record(Recorded::EndRenderPass { command_buffer });
    }
    fn cmd_clear_attachments(
        &self,
        command_buffer: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        rects: &[vk::ClearRect],
    ) {
        self.record(Recorded::ClearAttachments {
            command_buffer,
            attachments: attachments.to_vec(),
            rects: rects.to_vec(),
        });
    }
    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        self.record(Recorded::BindPipeline {
            command_buffer,
            bind_point,
            pipeline,
        });
    }
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        _layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        self.record(Recorded::BindDescriptorSets {
            command_buffer,
            bind_point,
            sets: sets.to_vec(),
        });
    }
    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        _offsets: &[vk::DeviceSize],
    ) {
        self.record(Recorded::BindVertexBuffers {
            command_buffer,
            first_binding,
            buffers: buffers.to_vec(),
        });
    }
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        _offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        self.record(Recorded::BindIndexBuffer {
            command_buffer,
            buffer,
            index_type,
        });
    }
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        self.record(Recorded::SetViewport {
            command_buffer,
            viewport,
        });
    }
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.record(Recorded::SetScissor {
            command_buffer,
            scissor,
        });
    }
    fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32) {
        self.record(Recorded::SetStencilReference {
            command_buffer,
            reference,
        });
    }
    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        _first_instance: u32,
    ) {
        self.record(Recorded::Draw {
            command_buffer,
            vertex_count,
            instance_count,
            first_vertex,
        });
    }
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        _first_instance: u32,
    ) {
        self.record(Recorded::DrawIndexed {
            command_buffer,
            index_count,
            instance_count,
            first_index,
            vertex_offset,
        });
    }
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        self.record(Recorded::Dispatch {
            command_buffer,
            groups: [x, y, z],
        });
    }
    fn cmd_set_event(&self, command_buffer: vk::CommandBuffer, event: vk::Event) {
        self.record(Recorded::SetEvent {
            command_buffer,
            event,
        });
    }
    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        self.record(Recorded::ResetQueryPool {
            command_buffer,
            pool,
            first,
            count,
        });
    }
    fn cmd_begin_query(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        index: u32,
        _flags: vk::QueryControlFlags,
    ) {
        self.record(Recorded::BeginQuery {
            command_buffer,
            pool,
            index,
        });
    }
    fn cmd_end_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, index: u32) {
        self.record(Recorded::EndQuery {
            command_buffer,
            pool,
            index,
        });
    }
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        _stage: vk::PipelineStageFlags2,
        pool: vk::QueryPool,
        index: u32,
    ) {
        self.record(Recorded::WriteTimestamp {
            command_buffer,
            pool,
            index,
        });
    }
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        _regions: &[vk::BufferCopy],
    ) {
        self.record(Recorded::CopyBuffer {
            command_buffer,
            src,
            dst,
        });
    }
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.record(Recorded::CopyBufferToImage {
            command_buffer,
            src,
            dst,
            layout: dst_layout,
        });
    }
    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        _regions: &[vk::BufferImageCopy],
    ) {
        self.record(Recorded::CopyImageToBuffer {
            command_buffer,
            src,
            layout: src_layout,
            dst,
        });
    }
}

unsafe fn slice_or_empty<'a, T>(ptr: *const T, count: u32) -> &'a [T] {
    if ptr.is_null() || count == 0 {
        &[]
    } else {
        unsafe { std::slice::from_raw_parts(ptr, count as usize) }
    }
}

fn memory_barrier(b: &vk::MemoryBarrier2<'_>) -> vk::MemoryBarrier2<'static> {
    vk::MemoryBarrier2::default()
        .src_stage_mask(b.src_stage_mask)
        .src_access_mask(b.src_access_mask)
        .dst_stage_mask(b.dst_stage_mask)
        .dst_access_mask(b.dst_access_mask)
}

fn buffer_barrier(b: &vk::BufferMemoryBarrier2<'_>) -> vk::BufferMemoryBarrier2<'static> {
    vk::BufferMemoryBarrier2::default()
        .src_stage_mask(b.src_stage_mask)
        .src_access_mask(b.src_access_mask)
        .dst_stage_mask(b.dst_stage_mask)
        .dst_access_mask(b.dst_access_mask)
        .src_queue_family_index(b.src_queue_family_index)
        .dst_queue_family_index(b.dst_queue_family_index)
        .buffer(b.buffer)
        .offset(b.offset)
        .size(b.size)
}

fn image_barrier(b: &vk::ImageMemoryBarrier2<'_>) -> vk::ImageMemoryBarrier2<'static> {
    vk::ImageMemoryBarrier2::default()
        .src_stage_mask(b.src_stage_mask)
        .src_access_mask(b.src_access_mask)
        .dst_stage_mask(b.dst_stage_mask)
        .dst_access_mask(b.dst_access_mask)
        .old_layout(b.old_layout)
        .new_layout(b.new_layout)
        .src_queue_family_index(b.src_queue_family_index)
        .dst_queue_family_index(b.dst_queue_family_index)
        .image(b.image)
        .subresource_range(b.subresource_range)
}
