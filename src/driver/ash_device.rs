use ash::{prelude::VkResult, vk};

use super::{Driver, FramebufferDesc, RenderPassDesc, SubmitBatch};

/// [`Driver`] over a real logical device.
///
/// Owns the `ash::Device` and destroys it on drop. The instance must outlive it.
pub struct AshDriver {
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    swapchain: ash::khr::swapchain::Device,
}

impl AshDriver {
    /// # Safety
    /// `device` must have been created from `physical_device` of `instance` with the
    /// `VK_KHR_swapchain` extension and the `synchronization2` feature enabled.
    pub unsafe fn new(
        instance: ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
    ) -> Self {
        let swapchain = ash::khr::swapchain::Device::new(&instance, &device);
        Self {
            instance,
            physical_device,
            device,
            swapchain,
        }
    }
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }
    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }
    pub fn device(&self) -> &ash::Device {
        &self.device
    }
}

impl Drop for AshDriver {
    fn drop(&mut self) {
        tracing::info!(device = ?self.device.handle(), "drop device");
        unsafe {
            self.device.destroy_device(None);
        }
    }
}

fn subpass_dependencies() -> [vk::SubpassDependency; 2] {
    let stages = vk::PipelineStageFlags::ALL_COMMANDS;
    let access = vk::AccessFlags::MEMORY_READ | vk::AccessFlags::MEMORY_WRITE;
    [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            dst_stage_mask: stages,
            src_access_mask: access,
            dst_access_mask: access,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: stages,
            dst_stage_mask: stages,
            src_access_mask: access,
            dst_access_mask: access,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ]
}

impl Driver for AshDriver {
    fn create_command_pool(&self, queue_family: u32) -> VkResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        unsafe { self.device.create_command_pool(&info, None) }
    }
    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) }
    }
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&info)? };
        Ok(buffers[0])
    }
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) }
    }
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &info) }
    }
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }
    fn reset_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe {
            self.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
        }
    }

    fn create_fence(&self) -> VkResult<vk::Fence> {
        unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None) }
    }
    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<bool> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => Err(err),
        }
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
        }
    }
    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }
    fn create_event(&self) -> VkResult<vk::Event> {
        unsafe { self.device.create_event(&vk::EventCreateInfo::default(), None) }
    }
    fn destroy_event(&self, event: vk::Event) {
        unsafe { self.device.destroy_event(event, None) }
    }

    fn create_query_pool(&self, ty: vk::QueryType, count: u32) -> VkResult<vk::QueryPool> {
        let info = vk::QueryPoolCreateInfo::default()
            .query_type(ty)
            .query_count(count);
        unsafe { self.device.create_query_pool(&info, None) }
    }
    fn destroy_query_pool(&self, pool: vk::QueryPool) {
        unsafe { self.device.destroy_query_pool(pool, None) }
    }
    fn query_result(&self, pool: vk::QueryPool, index: u32) -> VkResult<Option<u64>> {
        let mut data = [0u64; 1];
        let result = unsafe {
            self.device.get_query_pool_results(
                pool,
                index,
                &mut data,
                vk::QueryResultFlags::TYPE_64,
            )
        };
        match result {
            Ok(()) => Ok(Some(data[0])),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> VkResult<vk::RenderPass> {
        let mut subpass = vk::SubpassDescription::default()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&desc.color_references);
        if let Some(depth) = desc.depth_reference.as_ref() {
            subpass = subpass.depth_stencil_attachment(depth);
        }
        let dependencies = subpass_dependencies();
        let info = vk::RenderPassCreateInfo::default()
            .attachments(&desc.attachments)
            .subpasses(std::slice::from_ref(&subpass))
            .dependencies(&dependencies);
        unsafe { self.device.create_render_pass(&info, None) }
    }
    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        unsafe { self.device.destroy_render_pass(render_pass, None) }
    }
    fn create_framebuffer(&self, desc: &FramebufferDesc<'_>) -> VkResult<vk::Framebuffer> {
        let info = vk::FramebufferCreateInfo::default()
            .render_pass(desc.render_pass)
            .attachments(desc.attachments)
            .width(desc.width)
            .height(desc.height)
            .layers(desc.layers);
        unsafe { self.device.create_framebuffer(&info, None) }
    }
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) }
    }
    fn create_image_view(&self, info: &vk::ImageViewCreateInfo<'_>) -> VkResult<vk::ImageView> {
        unsafe { self.device.create_image_view(info, None) }
    }
    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) }
    }
    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        unsafe { self.device.destroy_pipeline(pipeline, None) }
    }

    fn get_queue(&self, family: u32, index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family, index) }
    }
    fn queue_submit(
        &self,
        queue: vk::Queue,
        batches: &[SubmitBatch<'_>],
        fence: vk::Fence,
    ) -> VkResult<()> {
        let mut semaphore_infos: Vec<vk::SemaphoreSubmitInfo> = Vec::new();
        let mut command_buffer_infos: Vec<vk::CommandBufferSubmitInfo> =
            Vec::with_capacity(batches.len());
        let mut offsets = Vec::with_capacity(batches.len());
        for batch in batches {
            let wait_start = semaphore_infos.len();
            semaphore_infos.extend(batch.wait_semaphores.iter().map(|&semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            }));
            let signal_start = semaphore_infos.len();
            semaphore_infos.extend(batch.signal_semaphores.iter().map(|&semaphore| {
                vk::SemaphoreSubmitInfo::default()
                    .semaphore(semaphore)
                    .stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            }));
            offsets.push((wait_start, signal_start, semaphore_infos.len()));
            command_buffer_infos
                .push(vk::CommandBufferSubmitInfo::default().command_buffer(batch.command_buffer));
        }
        let submits: Vec<vk::SubmitInfo2> = offsets
            .iter()
            .zip(command_buffer_infos.iter())
            .map(|(&(wait, signal, end), command_buffer)| {
                vk::SubmitInfo2::default()
                    .wait_semaphore_infos(&semaphore_infos[wait..signal])
                    .signal_semaphore_infos(&semaphore_infos[signal..end])
                    .command_buffer_infos(std::slice::from_ref(command_buffer))
            })
            .collect();
        unsafe { self.device.queue_submit2(queue, &submits, fence) }
    }
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> VkResult<bool> {
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::default()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        unsafe { self.swapchain.queue_present(queue, &info) }
    }
    fn queue_wait_idle(&self, queue: vk::Queue) -> VkResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }
    }
    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }

    fn create_swapchain(&self, info: &vk::SwapchainCreateInfoKHR<'_>) -> VkResult<vk::SwapchainKHR> {
        unsafe { self.swapchain.create_swapchain(info, None) }
    }
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain.destroy_swapchain(swapchain, None) }
    }
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        unsafe { self.swapchain.get_swapchain_images(swapchain) }
    }
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> VkResult<(u32, bool)> {
        unsafe {
            self.swapchain
                .acquire_next_image(swapchain, u64::MAX, semaphore, vk::Fence::null())
        }
    }

    fn cmd_pipeline_barrier(
        &self,
        command_buffer: vk::CommandBuffer,
        dependency_info: &vk::DependencyInfo<'_>,
    ) {
        unsafe {
            self.device
                .cmd_pipeline_barrier2(command_buffer, dependency_info)
        }
    }
    fn cmd_begin_render_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        begin_info: &vk::RenderPassBeginInfo<'_>,
    ) {
        unsafe {
            self.device.cmd_begin_render_pass(
                command_buffer,
                begin_info,
                vk::SubpassContents::INLINE,
            )
        }
    }
    fn cmd_end_render_pass(&self, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.cmd_end_render_pass(command_buffer) }
    }
    fn cmd_clear_attachments(
        &self,
        command_buffer: vk::CommandBuffer,
        attachments: &[vk::ClearAttachment],
        rects: &[vk::ClearRect],
    ) {
        unsafe {
            self.device
                .cmd_clear_attachments(command_buffer, attachments, rects)
        }
    }
    fn cmd_bind_pipeline(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        pipeline: vk::Pipeline,
    ) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, bind_point, pipeline)
        }
    }
    fn cmd_bind_descriptor_sets(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: vk::PipelineBindPoint,
        layout: vk::PipelineLayout,
        sets: &[vk::DescriptorSet],
    ) {
        unsafe {
            self.device
                .cmd_bind_descriptor_sets(command_buffer, bind_point, layout, 0, sets, &[])
        }
    }
    fn cmd_bind_vertex_buffers(
        &self,
        command_buffer: vk::CommandBuffer,
        first_binding: u32,
        buffers: &[vk::Buffer],
        offsets: &[vk::DeviceSize],
    ) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(command_buffer, first_binding, buffers, offsets)
        }
    }
    fn cmd_bind_index_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        buffer: vk::Buffer,
        offset: vk::DeviceSize,
        index_type: vk::IndexType,
    ) {
        unsafe {
            self.device
                .cmd_bind_index_buffer(command_buffer, buffer, offset, index_type)
        }
    }
    fn cmd_set_viewport(&self, command_buffer: vk::CommandBuffer, viewport: vk::Viewport) {
        unsafe { self.device.cmd_set_viewport(command_buffer, 0, &[viewport]) }
    }
    fn cmd_set_scissor(&self, command_buffer: vk::CommandBuffer, scissor: vk::Rect2D) {
        unsafe { self.device.cmd_set_scissor(command_buffer, 0, &[scissor]) }
    }
    fn cmd_set_stencil_reference(&self, command_buffer: vk::CommandBuffer, reference: u32) {
        unsafe {
            self.device.cmd_set_stencil_reference(
                command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                reference,
            )
        }
    }
    fn cmd_draw(
        &self,
        command_buffer: vk::CommandBuffer,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw(
                command_buffer,
                vertex_count,
                instance_count,
                first_vertex,
                first_instance,
            )
        }
    }
    fn cmd_draw_indexed(
        &self,
        command_buffer: vk::CommandBuffer,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    ) {
        unsafe {
            self.device.cmd_draw_indexed(
                command_buffer,
                index_count,
                instance_count,
                first_index,
                vertex_offset,
                first_instance,
            )
        }
    }
    fn cmd_dispatch(&self, command_buffer: vk::CommandBuffer, x: u32, y: u32, z: u32) {
        unsafe { self.device.cmd_dispatch(command_buffer, x, y, z) }
    }
    fn cmd_set_event(&self, command_buffer: vk::CommandBuffer, event: vk::Event) {
        unsafe {
            self.device
                .cmd_set_event(command_buffer, event, vk::PipelineStageFlags::ALL_COMMANDS)
        }
    }
    fn cmd_reset_query_pool(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        first: u32,
        count: u32,
    ) {
        unsafe {
            self.device
                .cmd_reset_query_pool(command_buffer, pool, first, count)
        }
    }
    fn cmd_begin_query(
        &self,
        command_buffer: vk::CommandBuffer,
        pool: vk::QueryPool,
        index: u32,
        flags: vk::QueryControlFlags,
    ) {
        unsafe {
            self.device
                .cmd_begin_query(command_buffer, pool, index, flags)
        }
    }
    fn cmd_end_query(&self, command_buffer: vk::CommandBuffer, pool: vk::QueryPool, index: u32) {
        unsafe { self.device.cmd_end_query(command_buffer, pool, index) }
    }
    fn cmd_write_timestamp(
        &self,
        command_buffer: vk::CommandBuffer,
        stage: vk::PipelineStageFlags2,
        pool: vk::QueryPool,
        index: u32,
    ) {
        unsafe {
            self.device
                .cmd_write_timestamp2(command_buffer, stage, pool, index)
        }
    }
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) }
    }
    fn cmd_copy_buffer_to_image(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Image,
        dst_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer_to_image(command_buffer, src, dst, dst_layout, regions)
        }
    }
    fn cmd_copy_image_to_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Image,
        src_layout: vk::ImageLayout,
        dst: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_image_to_buffer(command_buffer, src, src_layout, dst, regions)
        }
    }
}
