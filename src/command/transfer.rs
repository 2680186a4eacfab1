//! Buffer and image transfer commands.
//!
//! Copies run outside of render passes. Images are moved into the transfer layout with a
//! barrier recorded right before the copy, and registered as transfer uses so that the
//! next shader or attachment use transitions them out of it again.
use std::sync::Arc;

use ash::vk;

use super::{CmdBuffer, UsageKind};
use crate::{buffer::Buffer, image::Image, tracking::Access};

impl CmdBuffer {
    /// Copies regions of `src` into `dst`.
    pub fn copy_buffer(&mut self, src: &Arc<Buffer>, dst: &Arc<Buffer>, regions: &[vk::BufferCopy]) {
        assert!(self.is_recording(), "Command buffer must be recording");
        if self.is_in_render_pass() {
            self.end_render_pass();
        }
        self.register_buffer(src, Access::COPY_READ);
        self.register_buffer(dst, Access::COPY_WRITE);
        self.execute_layout_transitions();
        self.driver
            .cmd_copy_buffer(self.handle, src.handle(), dst.handle(), regions);
    }

    /// Copies the contents of the whole buffer into another buffer. The copy size is the
    /// smaller of the two sizes.
    pub fn copy_buffer_whole(&mut self, src: &Arc<Buffer>, dst: &Arc<Buffer>) {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: src.size().min(dst.size()),
        };
        self.copy_buffer(src, dst, std::slice::from_ref(&region));
    }

    /// Uploads buffer contents into `range` of `dst`.
    pub fn copy_buffer_to_image(
        &mut self,
        src: &Arc<Buffer>,
        dst: &Arc<Image>,
        range: vk::ImageSubresourceRange,
        regions: &[vk::BufferImageCopy],
    ) {
        self.prepare_image_transfer(dst, range, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        self.register_buffer(src, Access::COPY_READ);
        self.register_image(
            dst,
            range,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Access::COPY_WRITE,
            UsageKind::Transfer,
        );
        self.execute_layout_transitions();
        self.driver.cmd_copy_buffer_to_image(
            self.handle,
            src.handle(),
            dst.handle(),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            regions,
        );
    }

    /// Reads back `range` of `src` into a buffer.
    pub fn copy_image_to_buffer(
        &mut self,
        src: &Arc<Image>,
        range: vk::ImageSubresourceRange,
        dst: &Arc<Buffer>,
        regions: &[vk::BufferImageCopy],
    ) {
        self.prepare_image_transfer(src, range, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        self.register_image(
            src,
            range,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Access::COPY_READ,
            UsageKind::Transfer,
        );
        self.register_buffer(dst, Access::COPY_WRITE);
        self.execute_layout_transitions();
        self.driver.cmd_copy_image_to_buffer(
            self.handle,
            src.handle(),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst.handle(),
            regions,
        );
    }

    /// Ends the render pass, flushes queued transitions and moves `range` into `layout`.
    fn prepare_image_transfer(
        &mut self,
        image: &Arc<Image>,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
    ) {
        assert!(self.is_recording(), "Command buffer must be recording");
        if self.is_in_render_pass() {
            self.end_render_pass();
        }
        self.execute_layout_transitions();
        let old_layout = self.current_layout(image, &range, false);
        if old_layout != layout {
            let src = image.access_flags(old_layout, false);
            let dst = image.access_flags(layout, layout == vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            self.set_layout(image, src, dst, old_layout, layout, range);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ash::vk::{self, Handle};

    use crate::{
        buffer::Buffer,
        command::{CommandBufferPool, UsageKind},
        driver::{HeadlessDriver, Recorded},
        image::{Image, ImageDesc, ImageUsage},
        tracking::Access,
    };

    fn texture() -> Arc<Image> {
        Arc::new(Image::from_raw(
            vk::Image::from_raw(0xa000),
            ImageDesc {
                usage: ImageUsage::RENDER_TARGET,
                mip_levels: 2,
                ..Default::default()
            },
        ))
    }

    fn buffer(raw: u64) -> Arc<Buffer> {
        Arc::new(Buffer::from_raw(vk::Buffer::from_raw(raw), 256, false))
    }

    #[test]
    fn test_copy_chain_inserts_read_after_write_barrier() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut cb = pool.get_buffer(0).unwrap();
        let (a, b, c) = (buffer(0xb1), buffer(0xb2), buffer(0xb3));
        cb.copy_buffer_whole(&a, &b);
        cb.copy_buffer_whole(&b, &c);

        let commands = headless.commands(cb.handle());
        let barriers: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                Recorded::PipelineBarrier { memory, .. } => Some(memory.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0][0].src_access_mask, vk::AccessFlags2::TRANSFER_WRITE);
        assert_eq!(barriers[0][0].dst_access_mask, vk::AccessFlags2::TRANSFER_READ);
        assert!(matches!(commands.last(), Some(Recorded::CopyBuffer { src, .. }) if *src == b.handle()));
    }

    #[test]
    fn test_upload_then_sample() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut cb = pool.get_buffer(0).unwrap();
        let image = texture();
        let staging = buffer(0xc1);
        let range = image.subresource_range(0, 1, 0, 1);
        cb.copy_buffer_to_image(&staging, &image, range, &[vk::BufferImageCopy::default()]);

        let subs = cb.subresources(&image);
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].initial_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(subs[0].has_external_transition);
        assert!(!subs[0].is_shader_input);

        let commands = headless.commands(cb.handle());
        let upload = commands
            .iter()
            .position(|c| matches!(c, Recorded::CopyBufferToImage { .. }))
            .unwrap();
        let Recorded::PipelineBarrier { images, .. } = &commands[upload - 1] else {
            panic!("expected a layout transition before the copy");
        };
        assert_eq!(images[0].old_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(images[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);

        cb.register_image(
            &image,
            range,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::FRAGMENT_SHADER_READ,
            UsageKind::ShaderBind,
        );
        assert!(cb.has_pending_layout_transitions());
        assert!(cb.has_pending_barrier());
        assert_eq!(
            cb.current_layout(&image, &range, false),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
    }

    #[test]
    fn test_readback_uses_transfer_src() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut cb = pool.get_buffer(0).unwrap();
        let image = texture();
        let readback = buffer(0xd1);
        cb.copy_image_to_buffer(&image, image.full_range(), &readback, &[]);
        let copy = headless
            .commands(cb.handle())
            .into_iter()
            .find_map(|c| match c {
                Recorded::CopyImageToBuffer { layout, dst, .. } => Some((layout, dst)),
                _ => None,
            })
            .unwrap();
        assert_eq!(copy, (vk::ImageLayout::TRANSFER_SRC_OPTIMAL, readback.handle()));
        assert!(cb.subresources(&image)[0].is_read_only);
    }
}
