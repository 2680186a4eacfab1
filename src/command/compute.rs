//! Compute pipeline binding and dispatch.

use std::sync::Arc;

use ash::vk;
use glam::UVec3;

use super::CmdBuffer;
use crate::{pipeline::ComputePipeline, resource::UseFlags, utils::AsVkHandle};

impl CmdBuffer {
    pub fn set_compute_pipeline(&mut self, pipeline: Option<Arc<ComputePipeline>>) {
        let same = match (&self.compute_pipeline, &pipeline) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if same {
            return;
        }
        self.compute_pipeline = pipeline;
        self.cmp_pipeline_requires_bind = true;
    }

    /// Dispatches compute work with the bound compute pipeline.
    ///
    /// Dispatches cannot happen inside a render pass, so the render target is unbound
    /// first. Its pending clear, if any, is executed by the unbind.
    pub fn dispatch(&mut self, groups: UVec3) {
        assert!(self.is_recording(), "Command buffer must be recording");
        let Some(pipeline) = self.compute_pipeline.clone() else {
            tracing::warn!("Dispatch without a compute pipeline bound");
            return;
        };
        if self.is_in_render_pass() {
            self.end_render_pass();
        }
        self.unbind_render_target();

        self.bind_gpu_params();
        self.execute_layout_transitions();

        if self.cmp_pipeline_requires_bind {
            self.register_resource(pipeline.clone(), UseFlags::READ);
            self.driver.cmd_bind_pipeline(
                self.handle,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.vk_handle(),
            );
            self.cmp_pipeline_requires_bind = false;
        }
        if self.bind_compute_sets {
            if !self.bound_sets.is_empty() {
                self.driver.cmd_bind_descriptor_sets(
                    self.handle,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline.layout(),
                    &self.bound_sets,
                );
            }
            self.bind_compute_sets = false;
        }

        self.driver
            .cmd_dispatch(self.handle, groups.x, groups.y, groups.z);

        // Bindings of the next dispatch are tracked as a new pass.
        self.reset_pass_touched();
        self.params_dirty = self.params.is_some();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk::{self, Handle};
    use glam::UVec3;

    use crate::{
        command::{CommandBufferPool, RenderTarget},
        driver::{HeadlessDriver, Recorded},
        framebuffer::{FramebufferBuffers, RenderSurfaceMask, tests::color_and_depth},
        image::{Image, ImageDesc, ImageUsage},
        pipeline::{ComputePipeline, GpuParams},
        tracking::Access,
    };

    fn storage_image() -> Arc<Image> {
        Arc::new(Image::from_raw(
            vk::Image::from_raw(0x9000),
            ImageDesc {
                usage: ImageUsage::LOAD_STORE,
                ..Default::default()
            },
        ))
    }

    #[test]
    fn test_dispatch_unbinds_render_target() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut cb = pool.get_buffer(0).unwrap();
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(Arc::new(color_and_depth(
                headless.clone(),
                1,
            )))),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        let pipeline = Arc::new(ComputePipeline::from_raw(
            headless.clone(),
            vk::Pipeline::from_raw(0x42),
            vk::PipelineLayout::from_raw(0x43),
        ));
        cb.set_compute_pipeline(Some(pipeline));
        cb.dispatch(UVec3::new(4, 2, 1));
        cb.dispatch(UVec3::new(1, 1, 1));
        assert!(cb.framebuffer().is_none());

        let commands = headless.commands(cb.handle());
        let binds = commands
            .iter()
            .filter(|c| matches!(c, Recorded::BindPipeline { .. }))
            .count();
        assert_eq!(binds, 1);
        let groups: Vec<[u32; 3]> = commands
            .iter()
            .filter_map(|c| match c {
                Recorded::Dispatch { groups, .. } => Some(*groups),
                _ => None,
            })
            .collect();
        assert_eq!(groups, vec![[4, 2, 1], [1, 1, 1]]);
    }

    #[test]
    fn test_storage_write_between_dispatches_needs_barrier() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut cb = pool.get_buffer(0).unwrap();
        let pipeline = Arc::new(ComputePipeline::from_raw(
            headless.clone(),
            vk::Pipeline::from_raw(0x44),
            vk::PipelineLayout::from_raw(0x45),
        ));
        let image = storage_image();
        cb.set_compute_pipeline(Some(pipeline));
        cb.set_gpu_params(Some(Arc::new(
            GpuParams::default().with_image(image.clone(), Access::COMPUTE_WRITE),
        )));
        cb.dispatch(UVec3::ONE);
        cb.set_gpu_params(Some(Arc::new(
            GpuParams::default().with_image(image.clone(), Access::COMPUTE_READ),
        )));
        cb.dispatch(UVec3::ONE);

        let commands = headless.commands(cb.handle());
        let second_dispatch = commands
            .iter()
            .rposition(|c| matches!(c, Recorded::Dispatch { .. }))
            .unwrap();
        let barrier = commands[..second_dispatch]
            .iter()
            .rev()
            .find_map(|c| match c {
                Recorded::PipelineBarrier { memory, .. } => Some(memory.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(barrier[0].src_access_mask, vk::AccessFlags2::SHADER_WRITE);
        assert_eq!(barrier[0].dst_access_mask, vk::AccessFlags2::SHADER_READ);
        // Storage images stay in GENERAL.
        assert_eq!(
            cb.subresources(&image)[0].current_layout,
            vk::ImageLayout::GENERAL
        );
    }
}
