//! Render targets.
//!
//! A [`Framebuffer`] is a set of color attachments plus an optional depth-stencil
//! attachment. The native render pass and framebuffer objects depend on which
//! attachments are loaded, cleared, or read by shaders during the pass, so they are
//! created lazily per combination and cached.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use ash::{prelude::VkResult, vk};
use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{
    MAX_RENDER_TARGETS,
    driver::{Driver, FramebufferDesc, RenderPassDesc},
    image::Image,
    resource::{Resource, ResourceUsage},
    utils::full_rect,
};

bitflags! {
    /// Selects individual surfaces of a render target.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RenderSurfaceMask: u32 {
        const COLOR0 = 1 << 0;
        const COLOR1 = 1 << 1;
        const COLOR2 = 1 << 2;
        const COLOR3 = 1 << 3;
        const COLOR4 = 1 << 4;
        const COLOR5 = 1 << 5;
        const COLOR6 = 1 << 6;
        const COLOR7 = 1 << 7;
        const DEPTH = 1 << 30;
        const STENCIL = 1 << 31;
    }
}

impl RenderSurfaceMask {
    pub const ALL: Self = Self::all();

    pub fn color(index: usize) -> Self {
        Self::from_bits_truncate(1 << index)
    }
}

/// Surfaces cleared when a render pass begins.
pub type ClearMask = RenderSurfaceMask;

bitflags! {
    /// Kinds of render target buffers, used for clears and read-only flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FramebufferBuffers: u32 {
        const COLOR = 1 << 0;
        const DEPTH = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

#[derive(Clone)]
pub struct FramebufferAttachment {
    pub image: Arc<Image>,
    pub view: vk::ImageView,
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
    /// Layout the render pass leaves the attachment in.
    pub final_layout: vk::ImageLayout,
}

impl FramebufferAttachment {
    pub fn range(&self) -> vk::ImageSubresourceRange {
        self.image
            .subresource_range(self.mip_level, 1, self.base_layer, self.layer_count)
    }
}

pub struct FramebufferInfo {
    pub colors: Vec<FramebufferAttachment>,
    pub depth: Option<FramebufferAttachment>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
}

type VariantKey = (RenderSurfaceMask, RenderSurfaceMask, ClearMask);

pub struct Framebuffer {
    driver: Arc<dyn Driver>,
    width: u32,
    height: u32,
    layers: u32,
    colors: SmallVec<[FramebufferAttachment; MAX_RENDER_TARGETS]>,
    depth: Option<FramebufferAttachment>,
    variants: Mutex<HashMap<VariantKey, (vk::RenderPass, vk::Framebuffer)>>,
    usage: ResourceUsage,
}

impl Framebuffer {
    pub fn new(driver: Arc<dyn Driver>, info: FramebufferInfo) -> Self {
        assert!(
            info.colors.len() <= MAX_RENDER_TARGETS,
            "Framebuffers support at most {MAX_RENDER_TARGETS} color attachments"
        );
        Self {
            driver,
            width: info.width,
            height: info.height,
            layers: info.layers.max(1),
            colors: info.colors.into_iter().collect(),
            depth: info.depth,
            variants: Mutex::new(HashMap::new()),
            usage: ResourceUsage::default(),
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }
    pub fn height(&self) -> u32 {
        self.height
    }
    pub fn layers(&self) -> u32 {
        self.layers
    }
    pub fn full_area(&self) -> vk::Rect2D {
        full_rect(self.width, self.height)
    }
    pub fn color_attachments(&self) -> &[FramebufferAttachment] {
        &self.colors
    }
    pub fn depth_attachment(&self) -> Option<&FramebufferAttachment> {
        self.depth.as_ref()
    }
    pub fn has_depth(&self) -> bool {
        self.depth.is_some()
    }
    pub fn attachment_count(&self) -> usize {
        self.colors.len() + self.depth.is_some() as usize
    }

    /// Number of clear values a render pass begin needs for `clear`.
    pub fn num_clear_entries(&self, clear: ClearMask) -> u32 {
        if clear.is_empty() {
            return 0;
        }
        if clear == ClearMask::ALL
            || (clear.intersects(ClearMask::DEPTH | ClearMask::STENCIL) && self.has_depth())
        {
            return self.attachment_count() as u32;
        }
        let highest = (0..MAX_RENDER_TARGETS)
            .rev()
            .find(|&i| clear.contains(RenderSurfaceMask::color(i)))
            .map_or(0, |i| i + 1);
        highest.min(self.colors.len()) as u32
    }

    /// Render pass and framebuffer for one combination of loaded, shader-read and cleared
    /// surfaces.
    pub fn variant(
        &self,
        load: RenderSurfaceMask,
        read: RenderSurfaceMask,
        clear: ClearMask,
    ) -> VkResult<(vk::RenderPass, vk::Framebuffer)> {
        let mut variants = self
            .variants
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(variant) = variants.get(&(load, read, clear)) {
            return Ok(*variant);
        }
        let desc = self.render_pass_desc(load, read, clear);
        let render_pass = self.driver.create_render_pass(&desc)?;
        let views: SmallVec<[vk::ImageView; MAX_RENDER_TARGETS + 1]> = self
            .colors
            .iter()
            .chain(self.depth.iter())
            .map(|attachment| attachment.view)
            .collect();
        let framebuffer = match self.driver.create_framebuffer(&FramebufferDesc {
            render_pass,
            attachments: &views,
            width: self.width,
            height: self.height,
            layers: self.layers,
        }) {
            Ok(framebuffer) => framebuffer,
            Err(err) => {
                self.driver.destroy_render_pass(render_pass);
                return Err(err);
            }
        };
        tracing::debug!(?load, ?read, ?clear, "created render pass variant");
        variants.insert((load, read, clear), (render_pass, framebuffer));
        Ok((render_pass, framebuffer))
    }

    pub(crate) fn render_pass_desc(
        &self,
        load: RenderSurfaceMask,
        read: RenderSurfaceMask,
        clear: ClearMask,
    ) -> RenderPassDesc {
        let mut desc = RenderPassDesc::default();
        for (i, attachment) in self.colors.iter().enumerate() {
            let surface = RenderSurfaceMask::color(i);
            let (load_op, initial_layout) = if clear.contains(surface) {
                (vk::AttachmentLoadOp::CLEAR, vk::ImageLayout::UNDEFINED)
            } else if load.contains(surface) {
                (
                    vk::AttachmentLoadOp::LOAD,
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                )
            } else {
                (vk::AttachmentLoadOp::DONT_CARE, vk::ImageLayout::UNDEFINED)
            };
            desc.attachments.push(vk::AttachmentDescription {
                format: attachment.image.format(),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                initial_layout,
                final_layout: attachment.final_layout,
                ..Default::default()
            });
            desc.color_references.push(vk::AttachmentReference {
                attachment: i as u32,
                layout: color_layout(read.contains(surface)),
            });
        }
        if let Some(attachment) = &self.depth {
            let op = |surface: RenderSurfaceMask| {
                if clear.contains(surface) {
                    vk::AttachmentLoadOp::CLEAR
                } else if load.contains(surface) {
                    vk::AttachmentLoadOp::LOAD
                } else {
                    vk::AttachmentLoadOp::DONT_CARE
                }
            };
            let loaded = load.intersects(RenderSurfaceMask::DEPTH | RenderSurfaceMask::STENCIL)
                && !clear.contains(RenderSurfaceMask::DEPTH | RenderSurfaceMask::STENCIL);
            desc.attachments.push(vk::AttachmentDescription {
                format: attachment.image.format(),
                samples: vk::SampleCountFlags::TYPE_1,
                load_op: op(RenderSurfaceMask::DEPTH),
                store_op: vk::AttachmentStoreOp::STORE,
                stencil_load_op: op(RenderSurfaceMask::STENCIL),
                stencil_store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: if loaded {
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                } else {
                    vk::ImageLayout::UNDEFINED
                },
                final_layout: attachment.final_layout,
                ..Default::default()
            });
            desc.depth_reference = Some(vk::AttachmentReference {
                attachment: self.colors.len() as u32,
                layout: depth_layout(read),
            });
        }
        desc
    }
}

/// Layout of a color attachment inside the pass.
pub fn color_layout(shader_read: bool) -> vk::ImageLayout {
    if shader_read {
        vk::ImageLayout::GENERAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

/// Layout of the depth-stencil attachment inside the pass.
pub fn depth_layout(read: RenderSurfaceMask) -> vk::ImageLayout {
    match (
        read.contains(RenderSurfaceMask::DEPTH),
        read.contains(RenderSurfaceMask::STENCIL),
    ) {
        (true, true) => vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        (true, false) => vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL,
        (false, true) => vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL,
        (false, false) => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    }
}

impl Resource for Framebuffer {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Drop for Framebuffer {
    fn drop(&mut self) {
        let variants = self
            .variants
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for (_, (render_pass, framebuffer)) in variants.drain() {
            self.driver.destroy_framebuffer(framebuffer);
            self.driver.destroy_render_pass(render_pass);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        driver::HeadlessDriver,
        image::{ImageDesc, ImageUsage},
    };
    use ash::vk::Handle;

    pub(crate) fn attachment(
        format: vk::Format,
        usage: ImageUsage,
        final_layout: vk::ImageLayout,
    ) -> FramebufferAttachment {
        static NEXT: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0x100);
        let raw = NEXT.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        FramebufferAttachment {
            image: Arc::new(Image::from_raw(
                vk::Image::from_raw(raw),
                ImageDesc {
                    format,
                    usage,
                    ..Default::default()
                },
            )),
            view: vk::ImageView::from_raw(raw),
            mip_level: 0,
            base_layer: 0,
            layer_count: 1,
            final_layout,
        }
    }

    pub(crate) fn color_and_depth(driver: Arc<dyn Driver>, colors: usize) -> Framebuffer {
        Framebuffer::new(
            driver,
            FramebufferInfo {
                colors: (0..colors)
                    .map(|_| {
                        attachment(
                            vk::Format::R8G8B8A8_UNORM,
                            ImageUsage::RENDER_TARGET,
                            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                        )
                    })
                    .collect(),
                depth: Some(attachment(
                    vk::Format::D24_UNORM_S8_UINT,
                    ImageUsage::DEPTH_STENCIL,
                    vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                )),
                width: 64,
                height: 32,
                layers: 1,
            },
        )
    }

    #[test]
    fn test_variants_are_cached() {
        let framebuffer = color_and_depth(Arc::new(HeadlessDriver::new()), 2);
        let a = framebuffer
            .variant(RenderSurfaceMask::empty(), RenderSurfaceMask::empty(), ClearMask::COLOR0)
            .unwrap();
        let b = framebuffer
            .variant(RenderSurfaceMask::empty(), RenderSurfaceMask::empty(), ClearMask::COLOR0)
            .unwrap();
        let c = framebuffer
            .variant(RenderSurfaceMask::ALL, RenderSurfaceMask::empty(), ClearMask::empty())
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_render_pass_ops_and_layouts() {
        let framebuffer = color_and_depth(Arc::new(HeadlessDriver::new()), 2);
        let desc = framebuffer.render_pass_desc(
            RenderSurfaceMask::COLOR1 | RenderSurfaceMask::DEPTH | RenderSurfaceMask::STENCIL,
            RenderSurfaceMask::COLOR1 | RenderSurfaceMask::DEPTH,
            ClearMask::COLOR0,
        );
        assert_eq!(desc.attachments[0].load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(desc.attachments[0].initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(desc.attachments[1].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(
            desc.attachments[1].initial_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            desc.color_references[0].layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(desc.color_references[1].layout, vk::ImageLayout::GENERAL);
        let depth = desc.depth_reference.unwrap();
        assert_eq!(depth.attachment, 2);
        assert_eq!(
            depth.layout,
            vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            desc.attachments[2].initial_layout,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
    }

    #[test]
    fn test_num_clear_entries() {
        let framebuffer = color_and_depth(Arc::new(HeadlessDriver::new()), 3);
        assert_eq!(framebuffer.num_clear_entries(ClearMask::empty()), 0);
        assert_eq!(framebuffer.num_clear_entries(ClearMask::COLOR1), 2);
        assert_eq!(framebuffer.num_clear_entries(ClearMask::COLOR7), 3);
        assert_eq!(framebuffer.num_clear_entries(ClearMask::STENCIL), 4);
        assert_eq!(framebuffer.num_clear_entries(ClearMask::ALL), 4);
    }
}
