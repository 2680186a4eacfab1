use std::sync::Arc;

use ash::{prelude::VkResult, vk};
use glam::Vec4;
use smallvec::SmallVec;

use super::{CmdBuffer, CmdBufferState, UsageKind};
use crate::{
    MAX_RENDER_TARGETS,
    buffer::Buffer,
    framebuffer::{ClearMask, Framebuffer, FramebufferBuffers, RenderSurfaceMask},
    pipeline::{GpuParams, GraphicsPipeline},
    resource::{Resource, UseFlags},
    swapchain::{AcquireOutcome, SwapChain},
    tracking::{Access, with_access_stages},
    utils::{AsVkHandle, normalized_to_rect, same_rect},
};

/// What a command buffer renders into.
#[derive(Clone)]
pub enum RenderTarget {
    Framebuffer(Arc<Framebuffer>),
    /// The current back buffer of a swap chain, acquired on demand.
    Window(Arc<SwapChain>),
}

impl CmdBuffer {
    /// Binds a render target for the following draws.
    ///
    /// `read_only` selects depth or stencil surfaces that are bound read-only, and `load`
    /// the surfaces whose contents are preserved from before the pass. Setting the target
    /// that is already bound with the same masks does nothing. Otherwise the current
    /// render pass is ended, or a pending clear of the old target is executed.
    ///
    /// Binding a window acquires its next back buffer if none is held. An out of date swap
    /// chain is reported as `ERROR_OUT_OF_DATE_KHR`.
    pub fn set_render_target(
        &mut self,
        target: Option<RenderTarget>,
        read_only: FramebufferBuffers,
        mut load: RenderSurfaceMask,
    ) -> VkResult<()> {
        assert!(self.is_recording(), "Command buffer must be recording");
        let (framebuffer, swap_chain) = match target {
            None => (None, None),
            Some(RenderTarget::Framebuffer(framebuffer)) => (Some(framebuffer), None),
            Some(RenderTarget::Window(swap_chain)) => {
                if swap_chain.ensure_back_buffer()? == AcquireOutcome::OutOfDate {
                    return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
                }
                (Some(swap_chain.back_buffer().framebuffer), Some(swap_chain))
            }
        };

        // Depth and stencil share an attachment and are loaded together.
        let depth = load.contains(RenderSurfaceMask::DEPTH);
        let stencil = load.contains(RenderSurfaceMask::STENCIL);
        if depth != stencil {
            tracing::warn!(
                "Depth and stencil loads must match. Loading both surfaces of the attachment."
            );
            load |= RenderSurfaceMask::DEPTH | RenderSurfaceMask::STENCIL;
        }

        let same_framebuffer = match (&self.framebuffer, &framebuffer) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same_framebuffer
            && self.render_target_read_only == read_only
            && self.render_target_load_mask == load
        {
            return Ok(());
        }

        if self.is_in_render_pass() {
            self.end_render_pass();
        } else if !self.clear_mask.is_empty() {
            self.execute_clear_pass();
        }

        if let Some(old) = self.framebuffer.take() {
            self.clear_fb_attachment_flags(&old);
        }

        self.framebuffer = framebuffer.clone();
        self.render_target_read_only = read_only;
        self.render_target_load_mask = load;

        // The descriptor sets need re-registering against the new attachments.
        let params = self.params.clone();
        self.set_gpu_params(params);

        if let Some(swap_chain) = swap_chain {
            self.register_resource(swap_chain.clone(), UseFlags::READ);
            self.swap_chains.insert(swap_chain.id(), swap_chain);
        }
        if let Some(framebuffer) = &framebuffer {
            self.register_framebuffer(framebuffer, load);
        }
        self.gfx_pipeline_requires_bind = true;
        Ok(())
    }

    pub(crate) fn unbind_render_target(&mut self) {
        // Unbinding never acquires, so it cannot fail.
        let _ = self.set_render_target(
            None,
            self.render_target_read_only,
            self.render_target_load_mask,
        );
    }

    pub fn set_graphics_pipeline(&mut self, pipeline: Option<Arc<GraphicsPipeline>>) {
        let same = match (&self.graphics_pipeline, &pipeline) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }
        self.graphics_pipeline = pipeline;
        self.gfx_pipeline_requires_bind = true;
    }

    /// Sets the descriptor sets and bound resources used by the following draws and
    /// dispatches.
    pub fn set_gpu_params(&mut self, params: Option<Arc<GpuParams>>) {
        self.params_dirty = params.is_some();
        if params.is_none() {
            self.bound_sets.clear();
        }
        self.params = params;
        self.bind_graphics_sets = true;
        self.bind_compute_sets = true;
    }

    /// Sets the viewport as a normalized `(x, y, width, height)` rectangle of the target.
    pub fn set_viewport(&mut self, area: Vec4) {
        if self.viewport == area {
            return;
        }
        self.viewport = area;
        self.viewport_requires_bind = true;
    }

    /// Scissor rectangle in pixels. Only applied by pipelines with the scissor test enabled.
    pub fn set_scissor_rect(&mut self, rect: vk::Rect2D) {
        if same_rect(&self.scissor, &rect) {
            return;
        }
        self.scissor = rect;
        self.scissor_requires_bind = true;
    }

    pub fn set_stencil_ref(&mut self, value: u32) {
        if self.stencil_ref == value {
            return;
        }
        self.stencil_ref = value;
        self.stencil_ref_requires_bind = true;
    }

    pub fn set_vertex_buffers(&mut self, first_binding: u32, buffers: &[Option<Arc<Buffer>>]) {
        if buffers.is_empty() {
            return;
        }
        let mut handles: SmallVec<[vk::Buffer; 8]> = SmallVec::new();
        for buffer in buffers {
            match buffer {
                Some(buffer) => {
                    self.register_buffer(buffer, Access::VERTEX_READ);
                    handles.push(buffer.handle());
                }
                None => handles.push(vk::Buffer::null()),
            }
        }
        let offsets: SmallVec<[vk::DeviceSize; 8]> = SmallVec::from_elem(0, handles.len());
        self.driver
            .cmd_bind_vertex_buffers(self.handle, first_binding, &handles, &offsets);
    }

    pub fn set_index_buffer(&mut self, buffer: Option<Arc<Buffer>>, index_type: vk::IndexType) {
        let Some(buffer) = buffer else {
            return;
        };
        self.register_buffer(&buffer, Access::INDEX_READ);
        self.driver
            .cmd_bind_index_buffer(self.handle, buffer.handle(), 0, index_type);
    }

    /// Clears surfaces of the whole render target.
    ///
    /// `targets` selects which color attachments `buffers` with [`FramebufferBuffers::COLOR`]
    /// applies to.
    pub fn clear_render_target(
        &mut self,
        buffers: FramebufferBuffers,
        color: Vec4,
        depth: f32,
        stencil: u32,
        targets: RenderSurfaceMask,
    ) {
        let Some(framebuffer) = &self.framebuffer else {
            return;
        };
        let area = framebuffer.full_area();
        self.clear_area_of(area, buffers, color, depth, stencil, targets);
    }

    /// Clears surfaces within the current viewport.
    pub fn clear_viewport(
        &mut self,
        buffers: FramebufferBuffers,
        color: Vec4,
        depth: f32,
        stencil: u32,
        targets: RenderSurfaceMask,
    ) {
        let Some(framebuffer) = &self.framebuffer else {
            return;
        };
        let area = normalized_to_rect(self.viewport, framebuffer.width(), framebuffer.height());
        self.clear_area_of(area, buffers, color, depth, stencil, targets);
    }

    /// Inside a render pass the attachments are cleared directly. Outside of one the clear
    /// is deferred and folded into the load operations of the next pass.
    fn clear_area_of(
        &mut self,
        area: vk::Rect2D,
        buffers: FramebufferBuffers,
        color: Vec4,
        depth: f32,
        stencil: u32,
        targets: RenderSurfaceMask,
    ) {
        if buffers.is_empty() {
            return;
        }
        let Some(framebuffer) = self.framebuffer.clone() else {
            return;
        };
        let color_value = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: color.to_array(),
            },
        };
        let depth_value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
        };

        if self.is_in_render_pass() {
            let mut attachments: SmallVec<[vk::ClearAttachment; MAX_RENDER_TARGETS + 1]> =
                SmallVec::new();
            let mut base_layer = None;
            let mut check_layer = |layer: u32| match base_layer {
                None => base_layer = Some(layer),
                Some(base) if base != layer => tracing::error!(
                    "Cannot clear attachments with different base layers in one call"
                ),
                Some(_) => {}
            };
            if buffers.contains(FramebufferBuffers::COLOR) {
                for (i, attachment) in framebuffer.color_attachments().iter().enumerate() {
                    if !targets.contains(RenderSurfaceMask::color(i)) {
                        continue;
                    }
                    check_layer(attachment.base_layer);
                    attachments.push(vk::ClearAttachment {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        color_attachment: i as u32,
                        clear_value: color_value,
                    });
                }
            }
            if let Some(attachment) = framebuffer.depth_attachment() {
                let mut aspect_mask = vk::ImageAspectFlags::empty();
                if buffers.contains(FramebufferBuffers::DEPTH) {
                    aspect_mask |= vk::ImageAspectFlags::DEPTH;
                }
                if buffers.contains(FramebufferBuffers::STENCIL) {
                    aspect_mask |= vk::ImageAspectFlags::STENCIL;
                }
                aspect_mask &= attachment.image.aspects();
                if !aspect_mask.is_empty() {
                    check_layer(attachment.base_layer);
                    attachments.push(vk::ClearAttachment {
                        aspect_mask,
                        color_attachment: 0,
                        clear_value: depth_value,
                    });
                }
            }
            if attachments.is_empty() {
                return;
            }
            let rect = vk::ClearRect {
                rect: area,
                base_array_layer: base_layer.unwrap_or(0),
                layer_count: framebuffer.layers(),
            };
            self.driver
                .cmd_clear_attachments(self.handle, &attachments, std::slice::from_ref(&rect));
            return;
        }

        let mut clear_mask = ClearMask::empty();
        let mut values = self.clear_values;
        if buffers.contains(FramebufferBuffers::COLOR) {
            for i in 0..framebuffer.color_attachments().len() {
                if targets.contains(RenderSurfaceMask::color(i)) {
                    clear_mask |= RenderSurfaceMask::color(i);
                    values[i] = color_value;
                }
            }
        }
        if framebuffer.has_depth() {
            if buffers.contains(FramebufferBuffers::DEPTH) {
                clear_mask |= RenderSurfaceMask::DEPTH;
            }
            if buffers.contains(FramebufferBuffers::STENCIL) {
                clear_mask |= RenderSurfaceMask::STENCIL;
            }
            if buffers.intersects(FramebufferBuffers::DEPTH | FramebufferBuffers::STENCIL) {
                values[framebuffer.color_attachments().len()] = depth_value;
            }
        }
        if clear_mask.is_empty() {
            return;
        }

        // Only one clear area can be folded into a pass.
        if !self.clear_mask.is_empty() && !same_rect(&self.clear_area, &area) {
            self.execute_clear_pass();
        }
        self.clear_mask |= clear_mask;
        self.clear_values = values;
        self.clear_area = area;
    }

    pub fn is_ready_for_render(&self) -> bool {
        self.graphics_pipeline.is_some() && self.framebuffer.is_some()
    }

    pub fn draw(&mut self, vertex_offset: u32, vertex_count: u32, instance_count: u32) {
        if !self.prepare_draw() {
            return;
        }
        self.driver.cmd_draw(
            self.handle,
            vertex_count,
            instance_count.max(1),
            vertex_offset,
            0,
        );
    }

    pub fn draw_indexed(
        &mut self,
        start_index: u32,
        index_count: u32,
        vertex_offset: i32,
        instance_count: u32,
    ) {
        if !self.prepare_draw() {
            return;
        }
        self.driver.cmd_draw_indexed(
            self.handle,
            index_count,
            instance_count.max(1),
            start_index,
            vertex_offset,
            0,
        );
    }

    /// Brings the buffer into a state where a draw can be recorded. Returns `false` if
    /// the draw has to be skipped.
    fn prepare_draw(&mut self) -> bool {
        if !self.is_ready_for_render() {
            return false;
        }
        self.bind_gpu_params();
        if !self.is_in_render_pass() && !self.begin_render_pass() {
            return false;
        }
        if self.gfx_pipeline_requires_bind {
            self.bind_graphics_pipeline();
        } else {
            self.bind_dynamic_states(false);
        }
        if self.bind_graphics_sets {
            if !self.bound_sets.is_empty()
                && let Some(pipeline) = &self.graphics_pipeline
            {
                self.driver.cmd_bind_descriptor_sets(
                    self.handle,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout(),
                    &self.bound_sets,
                );
            }
            self.bind_graphics_sets = false;
        }
        true
    }

    /// Registers the resources referenced by the bound parameters, if they changed.
    pub(crate) fn bind_gpu_params(&mut self) {
        if !self.params_dirty {
            return;
        }
        let Some(params) = self.params.clone() else {
            self.bound_sets.clear();
            self.params_dirty = false;
            return;
        };
        for binding in &params.images {
            let layout = binding
                .layout
                .unwrap_or_else(|| binding.image.optimal_layout());
            self.register_image(
                &binding.image,
                binding.range,
                layout,
                layout,
                binding.access,
                UsageKind::ShaderBind,
            );
        }
        for binding in &params.buffers {
            self.register_buffer(&binding.buffer, binding.access);
        }
        self.bound_sets = params.sets.clone();
        self.params_dirty = false;
        self.bind_graphics_sets = true;
        self.bind_compute_sets = true;
    }

    fn bind_graphics_pipeline(&mut self) {
        let Some(pipeline) = self.graphics_pipeline.clone() else {
            return;
        };
        if let Some(framebuffer) = self.framebuffer.clone() {
            for (i, attachment) in framebuffer.color_attachments().iter().enumerate() {
                let is_shader_input = self
                    .find_subresource_mut(&attachment.image, attachment.base_layer, attachment.mip_level)
                    .is_some_and(|sub| sub.is_shader_input);
                if is_shader_input && !pipeline.is_color_read_only(i) {
                    tracing::warn!(
                        attachment = i,
                        "Color attachment is sampled while the pipeline writes to it"
                    );
                }
            }
            if let Some(depth) = framebuffer.depth_attachment() {
                let is_shader_input = self
                    .find_subresource_mut(&depth.image, depth.base_layer, depth.mip_level)
                    .is_some_and(|sub| sub.is_shader_input);
                if is_shader_input && !pipeline.is_depth_read_only() {
                    tracing::warn!("Depth attachment is sampled while the pipeline writes to it");
                }
            }
        }
        self.register_resource(pipeline.clone(), UseFlags::READ);
        self.driver.cmd_bind_pipeline(
            self.handle,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline.vk_handle(),
        );
        self.bind_dynamic_states(true);
        self.gfx_pipeline_requires_bind = false;
    }

    fn bind_dynamic_states(&mut self, force: bool) {
        let Some(framebuffer) = self.framebuffer.clone() else {
            return;
        };
        let width = framebuffer.width() as f32;
        let height = framebuffer.height() as f32;
        if self.viewport_requires_bind || force {
            self.driver.cmd_set_viewport(
                self.handle,
                vk::Viewport {
                    x: self.viewport.x * width,
                    y: self.viewport.y * height,
                    width: self.viewport.z * width,
                    height: self.viewport.w * height,
                    min_depth: 0.0,
                    max_depth: 1.0,
                },
            );
            self.viewport_requires_bind = false;
        }
        if self.stencil_ref_requires_bind || force {
            self.driver
                .cmd_set_stencil_reference(self.handle, self.stencil_ref);
            self.stencil_ref_requires_bind = false;
        }
        if self.scissor_requires_bind || force {
            let scissor_enabled = self
                .graphics_pipeline
                .as_ref()
                .is_some_and(|pipeline| pipeline.is_scissor_enabled());
            let scissor = if scissor_enabled {
                self.scissor
            } else {
                framebuffer.full_area()
            };
            self.driver.cmd_set_scissor(self.handle, scissor);
            self.scissor_requires_bind = false;
        }
    }

    /// Starts a render pass on the bound framebuffer. Returns whether a pass was started.
    pub(crate) fn begin_render_pass(&mut self) -> bool {
        assert_eq!(
            self.state,
            CmdBufferState::Recording,
            "Cannot begin a render pass outside of recording"
        );
        let Some(framebuffer) = self.framebuffer.clone() else {
            tracing::warn!("Attempting to begin a render pass but no render target is bound");
            return false;
        };
        if !self.clear_mask.is_empty() && !same_rect(&self.clear_area, &framebuffer.full_area()) {
            self.execute_clear_pass();
        }
        self.execute_layout_transitions();

        let read = self.fb_read_mask();
        let (render_pass, native) =
            match framebuffer.variant(self.render_target_load_mask, read, self.clear_mask) {
                Ok(variant) => variant,
                Err(err) => {
                    tracing::error!(?err, "Failed to create render pass");
                    return false;
                }
            };
        let clear_count = framebuffer.num_clear_entries(self.clear_mask) as usize;
        self.driver.cmd_begin_render_pass(
            self.handle,
            &vk::RenderPassBeginInfo::default()
                .render_pass(render_pass)
                .framebuffer(native)
                .render_area(framebuffer.full_area())
                .clear_values(&self.clear_values[..clear_count]),
        );
        self.clear_mask = ClearMask::empty();
        self.state = CmdBufferState::RecordingRenderPass;
        true
    }

    /// Ends the current render pass and records the events that were deferred by it.
    pub fn end_render_pass(&mut self) {
        assert_eq!(
            self.state,
            CmdBufferState::RecordingRenderPass,
            "Not inside a render pass"
        );
        self.driver.cmd_end_render_pass(self.handle);
        for event in std::mem::take(&mut self.queued_events) {
            self.driver.cmd_set_event(self.handle, event.handle());
        }
        self.reset_pass_touched();
        self.update_final_layouts();
        self.state = CmdBufferState::Recording;
        // Resources must be re-registered against the next pass.
        self.params_dirty = self.params.is_some();
    }

    /// Runs a render pass that does nothing but execute the pending clear.
    pub(crate) fn execute_clear_pass(&mut self) {
        assert_eq!(
            self.state,
            CmdBufferState::Recording,
            "Clear passes are executed outside of render passes"
        );
        let Some(framebuffer) = self.framebuffer.clone() else {
            self.clear_mask = ClearMask::empty();
            return;
        };
        self.execute_layout_transitions();
        match framebuffer.variant(
            self.render_target_load_mask,
            RenderSurfaceMask::empty(),
            self.clear_mask,
        ) {
            Ok((render_pass, native)) => {
                let clear_count = framebuffer.num_clear_entries(self.clear_mask) as usize;
                self.driver.cmd_begin_render_pass(
                    self.handle,
                    &vk::RenderPassBeginInfo::default()
                        .render_pass(render_pass)
                        .framebuffer(native)
                        .render_area(self.clear_area)
                        .clear_values(&self.clear_values[..clear_count]),
                );
                self.driver.cmd_end_render_pass(self.handle);
                self.update_final_layouts();
            }
            Err(err) => tracing::error!(?err, "Failed to create clear render pass"),
        }
        self.clear_mask = ClearMask::empty();
    }

    /// Records the queued image layout transitions and the pending hazard barrier as a
    /// single pipeline barrier.
    pub fn execute_layout_transitions(&mut self) {
        let mut image_barriers: Vec<vk::ImageMemoryBarrier2<'static>> = Vec::new();
        for id in std::mem::take(&mut self.queued_layout_transitions) {
            let Some(info) = self.images.get_mut(&id) else {
                continue;
            };
            for sub in info.subresources.iter_mut() {
                if !sub.has_transitioned || sub.current_layout == sub.required_layout {
                    continue;
                }
                image_barriers.push(with_access_stages(
                    vk::ImageMemoryBarrier2::default()
                        .image(info.image.handle())
                        .src_access_mask(info.image.access_flags(sub.current_layout, false))
                        .dst_access_mask(
                            info.image
                                .access_flags(sub.required_layout, sub.is_read_only),
                        )
                        .old_layout(sub.current_layout)
                        .new_layout(sub.required_layout)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .subresource_range(sub.range),
                ));
                sub.current_layout = sub.required_layout;
                sub.is_read_only = true;
                sub.has_transitioned = true;
            }
        }
        let memory = std::mem::take(&mut self.pending_barrier);
        if image_barriers.is_empty() && memory.is_empty() {
            return;
        }
        let memory_barriers: SmallVec<[vk::MemoryBarrier2<'static>; 1]> = if memory.is_empty() {
            SmallVec::new()
        } else {
            smallvec::smallvec![memory.to_vk()]
        };
        self.driver.cmd_pipeline_barrier(
            self.handle,
            &vk::DependencyInfo::default()
                .memory_barriers(&memory_barriers)
                .image_memory_barriers(&image_barriers),
        );
    }

    /// Records the layouts the render pass left the attachments of the bound framebuffer in.
    fn update_final_layouts(&mut self) {
        let Some(framebuffer) = self.framebuffer.clone() else {
            return;
        };
        let attachments = framebuffer
            .color_attachments()
            .iter()
            .chain(framebuffer.depth_attachment());
        for attachment in attachments {
            if let Some(sub) = self.find_subresource_mut(
                &attachment.image,
                attachment.base_layer,
                attachment.mip_level,
            ) {
                sub.current_layout = sub.final_layout;
                sub.required_layout = sub.final_layout;
                sub.has_transitioned = true;
            }
        }
    }

    /// Whether a memory barrier is waiting to be recorded.
    pub fn has_pending_barrier(&self) -> bool {
        !self.pending_barrier.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::Handle;

    use super::*;
    use crate::{
        command::{CommandBufferPool, UsageKind},
        driver::{HeadlessDriver, Recorded},
        framebuffer::tests::color_and_depth,
        image::{Image, ImageDesc, ImageUsage},
        pipeline::GraphicsPipelineInfo,
    };

    struct Harness {
        headless: Arc<HeadlessDriver>,
        pool: CommandBufferPool,
    }

    impl Harness {
        fn new() -> Self {
            let headless = Arc::new(HeadlessDriver::new());
            let pool = CommandBufferPool::new(headless.clone(), [0], 8, 1_000_000).unwrap();
            Self { headless, pool }
        }
        fn buffer(&mut self) -> Box<CmdBuffer> {
            self.pool.get_buffer(0).unwrap()
        }
        fn pipeline(&self) -> Arc<GraphicsPipeline> {
            Arc::new(GraphicsPipeline::from_raw(
                self.headless.clone(),
                vk::Pipeline::from_raw(0x77),
                vk::PipelineLayout::from_raw(0x78),
                GraphicsPipelineInfo::default(),
            ))
        }
        fn framebuffer(&self, colors: usize) -> Arc<Framebuffer> {
            Arc::new(color_and_depth(self.headless.clone(), colors))
        }
        fn commands(&self, cb: &CmdBuffer) -> Vec<Recorded> {
            self.headless.commands(cb.handle())
        }
    }

    fn sampled_image() -> Arc<Image> {
        Arc::new(Image::from_raw(
            vk::Image::from_raw(0x5000),
            ImageDesc {
                usage: ImageUsage::RENDER_TARGET,
                ..Default::default()
            },
        ))
    }

    fn count<F: Fn(&Recorded) -> bool>(commands: &[Recorded], f: F) -> usize {
        commands.iter().filter(|c| f(c)).count()
    }

    #[test]
    fn test_draw_begins_render_pass_lazily() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        let framebuffer = harness.framebuffer(1);
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(framebuffer)),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        assert!(!cb.is_in_render_pass());
        // No pipeline yet: the draw is skipped.
        cb.draw(0, 3, 1);
        assert!(!cb.is_in_render_pass());

        cb.set_graphics_pipeline(Some(harness.pipeline()));
        cb.draw(0, 3, 0);
        cb.draw(0, 3, 2);
        assert!(cb.is_in_render_pass());
        let commands = harness.commands(&cb);
        assert_eq!(
            count(&commands, |c| matches!(c, Recorded::BeginRenderPass { .. })),
            1
        );
        assert_eq!(
            count(&commands, |c| matches!(c, Recorded::BindPipeline { .. })),
            1
        );
        let instances: Vec<u32> = commands
            .iter()
            .filter_map(|c| match c {
                Recorded::Draw { instance_count, .. } => Some(*instance_count),
                _ => None,
            })
            .collect();
        assert_eq!(instances, vec![1, 2]);
    }

    #[test]
    fn test_deferred_clear_becomes_load_op() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        let framebuffer = harness.framebuffer(1);
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(framebuffer.clone())),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        cb.clear_render_target(
            FramebufferBuffers::COLOR,
            Vec4::new(1.0, 0.0, 0.0, 1.0),
            1.0,
            0,
            RenderSurfaceMask::ALL,
        );
        cb.clear_render_target(
            FramebufferBuffers::COLOR,
            Vec4::new(0.0, 1.0, 0.0, 1.0),
            1.0,
            0,
            RenderSurfaceMask::ALL,
        );
        // Both clears cover the same area and merge; the later color wins.
        assert_eq!(cb.clear_mask(), RenderSurfaceMask::COLOR0);
        assert_eq!(unsafe { cb.clear_values()[0].color.float32 }, [0.0, 1.0, 0.0, 1.0]);

        cb.set_graphics_pipeline(Some(harness.pipeline()));
        cb.draw(0, 3, 1);
        assert!(cb.clear_mask().is_empty());
        let (render_pass, _) = framebuffer
            .variant(
                RenderSurfaceMask::empty(),
                RenderSurfaceMask::empty(),
                RenderSurfaceMask::COLOR0,
            )
            .unwrap();
        let begins: Vec<_> = harness
            .commands(&cb)
            .into_iter()
            .filter_map(|c| match c {
                Recorded::BeginRenderPass {
                    render_pass,
                    clear_values,
                    ..
                } => Some((render_pass, clear_values.len())),
                _ => None,
            })
            .collect();
        assert_eq!(begins, vec![(render_pass, 1)]);
    }

    #[test]
    fn test_clear_of_other_area_flushes_pending_clear() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(harness.framebuffer(1))),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        cb.clear_render_target(
            FramebufferBuffers::COLOR,
            Vec4::ONE,
            1.0,
            0,
            RenderSurfaceMask::ALL,
        );
        cb.set_viewport(Vec4::new(0.0, 0.0, 0.5, 0.5));
        cb.clear_viewport(
            FramebufferBuffers::COLOR,
            Vec4::ZERO,
            1.0,
            0,
            RenderSurfaceMask::ALL,
        );
        let commands = harness.commands(&cb);
        assert_eq!(
            count(&commands, |c| matches!(c, Recorded::BeginRenderPass { .. })),
            1
        );
        assert_eq!(cb.clear_area().extent.width, 32);
        assert_eq!(cb.clear_area().extent.height, 16);
    }

    #[test]
    fn test_clear_inside_pass_clears_attachments() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(harness.framebuffer(2))),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        cb.set_graphics_pipeline(Some(harness.pipeline()));
        cb.draw(0, 3, 1);
        cb.clear_render_target(
            FramebufferBuffers::COLOR | FramebufferBuffers::DEPTH,
            Vec4::ZERO,
            1.0,
            0,
            RenderSurfaceMask::COLOR1,
        );
        let cleared = harness
            .commands(&cb)
            .into_iter()
            .find_map(|c| match c {
                Recorded::ClearAttachments { attachments, .. } => Some(attachments),
                _ => None,
            })
            .unwrap();
        assert_eq!(cleared.len(), 2);
        assert_eq!(cleared[0].color_attachment, 1);
        assert_eq!(cleared[1].aspect_mask, vk::ImageAspectFlags::DEPTH);
    }

    #[test]
    fn test_sampling_attachment_of_other_target_transitions_layout() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        let first = harness.framebuffer(1);
        let image = first.color_attachments()[0].image.clone();
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(first)),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::COLOR0,
        )
        .unwrap();
        cb.set_graphics_pipeline(Some(harness.pipeline()));
        cb.draw(0, 3, 1);

        cb.set_render_target(
            Some(RenderTarget::Framebuffer(harness.framebuffer(1))),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        assert!(!cb.is_in_render_pass());
        let range = image.full_range();
        cb.register_image(
            &image,
            range,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::FRAGMENT_SHADER_READ,
            UsageKind::ShaderBind,
        );
        assert!(cb.has_pending_layout_transitions());
        cb.execute_layout_transitions();

        let barrier = harness
            .commands(&cb)
            .into_iter()
            .filter_map(|c| match c {
                Recorded::PipelineBarrier { images, .. } => Some(images),
                _ => None,
            })
            .flatten()
            .find(|b| b.image == image.handle())
            .unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        let sub = &cb.subresources(&image)[0];
        assert_eq!(sub.current_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(sub.final_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_sampling_bound_attachment_ends_pass() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        let framebuffer = harness.framebuffer(1);
        let image = framebuffer.color_attachments()[0].image.clone();
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(framebuffer)),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        cb.set_graphics_pipeline(Some(harness.pipeline()));
        cb.draw(0, 3, 1);
        assert!(cb.is_in_render_pass());

        let params = GpuParams::default().with_image(image.clone(), Access::FRAGMENT_SHADER_READ);
        cb.set_gpu_params(Some(Arc::new(params)));
        cb.draw(0, 3, 1);
        // The pass restarted with the attachment read by shaders.
        assert!(cb.fb_read_mask().contains(RenderSurfaceMask::COLOR0));
        assert_eq!(
            count(&harness.commands(&cb), |c| matches!(c, Recorded::BeginRenderPass { .. })),
            2
        );
        assert_eq!(
            cb.current_layout(&image, &image.full_range(), true),
            vk::ImageLayout::GENERAL
        );
    }

    #[test]
    fn test_set_same_render_target_is_noop() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        let framebuffer = harness.framebuffer(1);
        let target = || Some(RenderTarget::Framebuffer(framebuffer.clone()));
        cb.set_render_target(target(), FramebufferBuffers::empty(), RenderSurfaceMask::empty())
            .unwrap();
        cb.set_graphics_pipeline(Some(harness.pipeline()));
        cb.draw(0, 3, 1);
        cb.set_render_target(target(), FramebufferBuffers::empty(), RenderSurfaceMask::empty())
            .unwrap();
        assert!(cb.is_in_render_pass());
        // Mismatched depth and stencil loads are widened to both.
        cb.set_render_target(target(), FramebufferBuffers::empty(), RenderSurfaceMask::DEPTH)
            .unwrap();
        assert!(!cb.is_in_render_pass());
        assert_eq!(
            cb.render_target_load_mask,
            RenderSurfaceMask::DEPTH | RenderSurfaceMask::STENCIL
        );
    }

    #[test]
    fn test_events_in_pass_are_deferred() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(harness.framebuffer(1))),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        cb.set_graphics_pipeline(Some(harness.pipeline()));
        cb.draw(0, 3, 1);
        let event = Arc::new(crate::sync::Event::new(harness.headless.clone()).unwrap());
        cb.set_event(event.clone());
        assert_eq!(
            count(&harness.commands(&cb), |c| matches!(c, Recorded::SetEvent { .. })),
            0
        );
        cb.end_render_pass();
        let commands = harness.commands(&cb);
        let end = commands
            .iter()
            .position(|c| matches!(c, Recorded::EndRenderPass { .. }))
            .unwrap();
        assert!(matches!(commands[end + 1], Recorded::SetEvent { event: e, .. } if e == event.handle()));
    }

    #[test]
    fn test_shader_write_then_read_inserts_barrier() {
        let mut harness = Harness::new();
        let mut cb = harness.buffer();
        let image = sampled_image();
        let range = image.full_range();
        cb.register_image(
            &image,
            range,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            Access::COMPUTE_WRITE,
            UsageKind::ShaderBind,
        );
        assert!(!cb.has_pending_barrier());
        cb.register_image(
            &image,
            range,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            Access::FRAGMENT_SHADER_READ,
            UsageKind::ShaderBind,
        );
        assert!(cb.has_pending_barrier());
        cb.execute_layout_transitions();
        let memory = harness
            .commands(&cb)
            .into_iter()
            .find_map(|c| match c {
                Recorded::PipelineBarrier { memory, .. } => Some(memory),
                _ => None,
            })
            .unwrap();
        assert_eq!(memory[0].src_access_mask, vk::AccessFlags2::SHADER_WRITE);
        assert_eq!(memory[0].dst_access_mask, vk::AccessFlags2::SHADER_READ);
    }
}
