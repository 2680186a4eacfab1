//! Per command buffer resource and image layout tracking.
//!
//! Each image referenced by a command buffer is described by a set of pairwise disjoint
//! sub-resource ranges. A range remembers four layouts:
//!
//! - `initial`: the layout the range must be in when the command buffer starts executing.
//!   Brought about by a barrier recorded in a separate command buffer at submit time.
//! - `current`: the layout the range is in at this point of the recording.
//! - `required`: the layout the next command using the range needs.
//! - `final`: the layout the range is left in when the command buffer completes.
//!
//! Registering a use that overlaps only part of an existing range first cuts that range
//! along the edges of the new one, so that every range is described by a single record.
use std::{collections::hash_map::Entry, sync::Arc};

use ash::vk;

use super::CmdBuffer;
use crate::{
    buffer::Buffer,
    framebuffer::{Framebuffer, FramebufferBuffers, RenderSurfaceMask},
    image::Image,
    resource::{Resource, UseFlags},
    tracking::{
        Access, MemoryBarrier, ResourceState, cut_range, range_contains, ranges_overlap,
        same_range,
    },
};

pub(crate) struct TrackedResource {
    pub resource: Arc<dyn Resource>,
    pub flags: UseFlags,
    pub used: bool,
}

pub(crate) struct ImageInfo {
    pub image: Arc<Image>,
    pub flags: UseFlags,
    pub used: bool,
    pub subresources: Vec<SubresourceInfo>,
}

pub(crate) struct BufferInfo {
    pub buffer: Arc<Buffer>,
    pub flags: UseFlags,
    pub used: bool,
    pub access: Access,
    pub hazard: ResourceState,
}

/// What an image is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// Read or written by shaders through a descriptor.
    ShaderBind,
    /// Attachment of the bound framebuffer.
    Framebuffer,
    /// Source or destination of a copy. The layout change was recorded by the caller.
    Transfer,
}

/// Tracked state of one sub-resource range of an image.
#[derive(Debug, Clone)]
pub struct SubresourceInfo {
    pub range: vk::ImageSubresourceRange,
    pub initial_layout: vk::ImageLayout,
    pub current_layout: vk::ImageLayout,
    pub required_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
    pub is_fb_attachment: bool,
    pub is_shader_input: bool,
    pub is_read_only: bool,
    pub is_initial_read_only: bool,
    /// The range has been transitioned within this buffer, so its initial layout is fixed.
    pub has_transitioned: bool,
    /// A barrier recorded by the caller brought the range into its first layout.
    pub has_external_transition: bool,
    /// Touched since the last render pass or dispatch.
    pub(crate) pass_touched: bool,
    pub(crate) hazard: ResourceState,
}

impl SubresourceInfo {
    fn new(
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
        access: Access,
        kind: UsageKind,
    ) -> Self {
        let transfer = kind == UsageKind::Transfer;
        let is_read_only = transfer || !access.use_flags().contains(UseFlags::WRITE);
        let mut hazard = ResourceState::default();
        if kind != UsageKind::Framebuffer {
            hazard.transition(access, false);
        }
        Self {
            range,
            initial_layout: layout,
            current_layout: layout,
            required_layout: layout,
            final_layout,
            is_fb_attachment: kind == UsageKind::Framebuffer,
            is_shader_input: kind == UsageKind::ShaderBind,
            is_read_only,
            is_initial_read_only: is_read_only,
            has_transitioned: transfer,
            has_external_transition: transfer,
            pass_touched: true,
            hazard,
        }
    }

    /// Applies a new use of the range.
    fn update(
        &mut self,
        layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
        access: Access,
        kind: UsageKind,
        depth_read_only: bool,
    ) -> Update {
        let is_fb = kind == UsageKind::Framebuffer;
        let transfer = kind == UsageKind::Transfer;
        let write = access.use_flags().contains(UseFlags::WRITE);

        if !transfer {
            self.is_read_only &= !write;
        }

        if transfer {
            self.required_layout = layout;
        } else if layout != vk::ImageLayout::UNDEFINED {
            if is_fb {
                self.required_layout = layout;
            } else if !self.is_fb_attachment {
                let first_use_in_pass = !self.is_shader_input;
                if first_use_in_pass || self.required_layout == vk::ImageLayout::UNDEFINED {
                    self.required_layout = layout;
                } else if self.required_layout != layout {
                    // Two different layouts needed by the same pass.
                    self.required_layout = vk::ImageLayout::GENERAL;
                }
            }
        }

        if !is_fb && !self.is_fb_attachment {
            self.final_layout = self.required_layout;
        } else if is_fb {
            self.final_layout = final_layout;
        }

        let mut queue_transition = false;
        if transfer {
            self.current_layout = self.required_layout;
            self.has_transitioned = true;
        } else if !self.has_transitioned {
            self.initial_layout = self.required_layout;
            self.current_layout = self.required_layout;
            self.is_initial_read_only = self.is_read_only;
        } else if self.current_layout != self.required_layout {
            queue_transition = true;
        }

        let mut reset_render_pass = false;
        if is_fb {
            if !self.is_fb_attachment {
                self.is_fb_attachment = true;
                reset_render_pass = self.is_shader_input;
            }
        } else if kind == UsageKind::ShaderBind && !self.is_shader_input {
            self.is_shader_input = true;
            reset_render_pass = if self.is_fb_attachment {
                // A depth buffer bound read-only can stay attached while sampled.
                self.required_layout != vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    || !depth_read_only
            } else {
                self.current_layout != self.required_layout
            };
        }

        let barrier = if is_fb {
            MemoryBarrier::default()
        } else {
            self.hazard.transition(access, false)
        };
        self.pass_touched = true;
        Update {
            reset_render_pass,
            queue_transition,
            barrier,
        }
    }
}

#[derive(Default)]
struct Update {
    reset_render_pass: bool,
    queue_transition: bool,
    barrier: MemoryBarrier,
}

impl std::ops::BitOrAssign for Update {
    fn bitor_assign(&mut self, rhs: Self) {
        self.reset_render_pass |= rhs.reset_render_pass;
        self.queue_transition |= rhs.queue_transition;
        self.barrier |= rhs.barrier;
    }
}

impl CmdBuffer {
    /// Tracks a use of `range` of `image`.
    ///
    /// `layout` is the layout the use requires and `final_layout` the layout an attachment
    /// is left in by the render pass. Ends the current render pass when the new use cannot
    /// coexist with it, either because the range must change layout or because a hazard
    /// barrier is needed.
    pub(crate) fn register_image(
        &mut self,
        image: &Arc<Image>,
        range: vk::ImageSubresourceRange,
        layout: vk::ImageLayout,
        final_layout: vk::ImageLayout,
        access: Access,
        kind: UsageKind,
    ) {
        assert!(self.is_recording(), "Command buffer must be recording");
        let flags = access.use_flags();
        let depth_read_only = self
            .render_target_read_only
            .intersects(FramebufferBuffers::DEPTH | FramebufferBuffers::STENCIL);
        let id = image.id();

        let outcome = match self.images.entry(id) {
            Entry::Vacant(entry) => {
                image.notify_bound();
                entry.insert(ImageInfo {
                    image: image.clone(),
                    flags,
                    used: false,
                    subresources: vec![SubresourceInfo::new(
                        range,
                        layout,
                        final_layout,
                        access,
                        kind,
                    )],
                });
                Update::default()
            }
            Entry::Occupied(mut entry) => {
                let info = entry.get_mut();
                assert!(!info.used, "Registering an image with a submitted command buffer");
                info.flags |= flags;
                register_subresources(
                    &mut info.subresources,
                    range,
                    layout,
                    final_layout,
                    access,
                    kind,
                    depth_read_only,
                )
            }
        };

        if outcome.queue_transition {
            self.queued_layout_transitions.insert(id);
        }
        self.pending_barrier |= outcome.barrier;
        if (outcome.reset_render_pass || !outcome.barrier.is_empty()) && self.is_in_render_pass() {
            self.end_render_pass();
            // Ending the pass clears the per-pass flags, but this use belongs to the next pass.
            if let Some(info) = self.images.get_mut(&id) {
                for sub in info
                    .subresources
                    .iter_mut()
                    .filter(|sub| ranges_overlap(&sub.range, &range))
                {
                    sub.pass_touched = true;
                    sub.is_shader_input |= kind == UsageKind::ShaderBind;
                    sub.is_read_only = !flags.contains(UseFlags::WRITE);
                }
            }
        }
    }

    /// Tracks a use of `buffer`. A hazard against an earlier use in this command buffer
    /// ends the render pass and queues a memory barrier.
    pub(crate) fn register_buffer(&mut self, buffer: &Arc<Buffer>, access: Access) {
        assert!(self.is_recording(), "Command buffer must be recording");
        let flags = access.use_flags();
        let barrier = match self.buffers.entry(buffer.id()) {
            Entry::Vacant(entry) => {
                buffer.notify_bound();
                let mut hazard = ResourceState::default();
                hazard.transition(access, false);
                entry.insert(BufferInfo {
                    buffer: buffer.clone(),
                    flags,
                    used: false,
                    access,
                    hazard,
                });
                MemoryBarrier::default()
            }
            Entry::Occupied(mut entry) => {
                let info = entry.get_mut();
                assert!(!info.used, "Registering a buffer with a submitted command buffer");
                info.flags |= flags;
                info.access |= access;
                info.hazard.transition(access, false)
            }
        };
        if !barrier.is_empty() {
            self.pending_barrier |= barrier;
            if self.is_in_render_pass() {
                self.end_render_pass();
            }
        }
    }

    /// Tracks every attachment of `framebuffer` for use as a render target.
    pub(crate) fn register_framebuffer(
        &mut self,
        framebuffer: &Arc<Framebuffer>,
        load: RenderSurfaceMask,
    ) {
        self.register_resource(framebuffer.clone(), UseFlags::WRITE);
        for (i, attachment) in framebuffer.color_attachments().iter().enumerate() {
            let loaded = load.contains(RenderSurfaceMask::color(i));
            let (layout, access) = if loaded {
                (
                    vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                    Access::COLOR_ATTACHMENT_READ_WRITE,
                )
            } else {
                (vk::ImageLayout::UNDEFINED, Access::COLOR_ATTACHMENT_WRITE)
            };
            self.register_image(
                &attachment.image,
                attachment.range(),
                layout,
                attachment.final_layout,
                access,
                UsageKind::Framebuffer,
            );
        }
        if let Some(depth) = framebuffer.depth_attachment() {
            let layout = if load.intersects(RenderSurfaceMask::DEPTH | RenderSurfaceMask::STENCIL) {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::UNDEFINED
            };
            self.register_image(
                &depth.image,
                depth.range(),
                layout,
                depth.final_layout,
                Access::DEPTH_STENCIL_ATTACHMENT_READ_WRITE,
                UsageKind::Framebuffer,
            );
        }
    }

    /// Forgets that the attachments of `framebuffer` are bound as render targets.
    pub(crate) fn clear_fb_attachment_flags(&mut self, framebuffer: &Framebuffer) {
        let attachments = framebuffer
            .color_attachments()
            .iter()
            .chain(framebuffer.depth_attachment());
        for attachment in attachments {
            if let Some(info) = self.images.get_mut(&attachment.image.id()) {
                for sub in info.subresources.iter_mut() {
                    sub.is_fb_attachment = false;
                }
            }
        }
    }

    /// Sub-resource record of `image` containing (`layer`, `mip`).
    pub(crate) fn find_subresource_mut(
        &mut self,
        image: &Image,
        layer: u32,
        mip: u32,
    ) -> Option<&mut SubresourceInfo> {
        self.images
            .get_mut(&image.id())?
            .subresources
            .iter_mut()
            .find(|sub| range_contains(&sub.range, layer, mip))
    }

    /// Clears the per-pass flags of everything touched since the last pass or dispatch.
    pub(crate) fn reset_pass_touched(&mut self) {
        for info in self.images.values_mut() {
            for sub in info.subresources.iter_mut().filter(|sub| sub.pass_touched) {
                sub.is_shader_input = false;
                sub.is_read_only = true;
                sub.pass_touched = false;
            }
        }
    }
}

/// Applies a use of `range` to the disjoint ranges of one image, splitting records that
/// only partially overlap it.
fn register_subresources(
    subresources: &mut Vec<SubresourceInfo>,
    range: vk::ImageSubresourceRange,
    layout: vk::ImageLayout,
    final_layout: vk::ImageLayout,
    access: Access,
    kind: UsageKind,
    depth_read_only: bool,
) -> Update {
    let first_overlap = subresources
        .iter()
        .position(|sub| ranges_overlap(&sub.range, &range));
    if let Some(i) = first_overlap
        && same_range(&subresources[i].range, &range)
    {
        return subresources[i].update(layout, final_layout, access, kind, depth_read_only);
    }

    let mut outcome = Update::default();
    let mut covered: Vec<vk::ImageSubresourceRange> = Vec::new();
    let mut result = Vec::with_capacity(subresources.len() + 4);
    for sub in subresources.drain(..) {
        if !ranges_overlap(&sub.range, &range) {
            result.push(sub);
            continue;
        }
        for piece in cut_range(&sub.range, &range) {
            let mut split = sub.clone();
            split.range = piece;
            if ranges_overlap(&piece, &range) {
                outcome |= split.update(layout, final_layout, access, kind, depth_read_only);
                covered.push(piece);
            }
            result.push(split);
        }
    }

    // Parts of the new range no existing record covered.
    let mut uncovered = vec![range];
    for piece in &covered {
        uncovered = uncovered
            .into_iter()
            .flat_map(|source| {
                if ranges_overlap(&source, piece) {
                    cut_range(&source, piece)
                        .into_iter()
                        .filter(|part| !ranges_overlap(part, piece))
                        .collect()
                } else {
                    vec![source]
                }
            })
            .collect();
    }
    for part in uncovered {
        result.push(SubresourceInfo::new(
            part,
            layout,
            final_layout,
            access,
            kind,
        ));
    }
    *subresources = result;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(layers: std::ops::Range<u32>, mips: std::ops::Range<u32>) -> vk::ImageSubresourceRange {
        vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: mips.start,
            level_count: mips.end - mips.start,
            base_array_layer: layers.start,
            layer_count: layers.end - layers.start,
        }
    }

    fn area(subresources: &[SubresourceInfo]) -> u32 {
        subresources
            .iter()
            .map(|sub| sub.range.layer_count * sub.range.level_count)
            .sum()
    }

    #[test]
    fn test_partial_overlap_keeps_ranges_disjoint() {
        let mut subresources = vec![SubresourceInfo::new(
            range(0..4, 0..1),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::SHADER_READ,
            UsageKind::ShaderBind,
        )];
        register_subresources(
            &mut subresources,
            range(2..6, 0..1),
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::GENERAL,
            Access::SHADER_WRITE,
            UsageKind::ShaderBind,
            false,
        );
        assert_eq!(area(&subresources), 6);
        for (i, a) in subresources.iter().enumerate() {
            for b in &subresources[i + 1..] {
                assert!(!ranges_overlap(&a.range, &b.range));
            }
        }
        let fresh = subresources
            .iter()
            .find(|sub| range_contains(&sub.range, 5, 0))
            .unwrap();
        assert_eq!(fresh.required_layout, vk::ImageLayout::GENERAL);
        assert!(!fresh.is_read_only);
    }

    #[test]
    fn test_conflicting_layouts_in_one_pass_promote_to_general() {
        let mut sub = SubresourceInfo::new(
            range(0..1, 0..1),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::SHADER_READ,
            UsageKind::ShaderBind,
        );
        sub.update(
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            Access::SHADER_READ,
            UsageKind::ShaderBind,
            false,
        );
        assert_eq!(sub.required_layout, vk::ImageLayout::GENERAL);
        assert_eq!(sub.final_layout, vk::ImageLayout::GENERAL);
        // Nothing has transitioned yet, so the first layout moves along.
        assert_eq!(sub.initial_layout, vk::ImageLayout::GENERAL);
    }

    #[test]
    fn test_transfer_use_is_an_external_transition() {
        let sub = SubresourceInfo::new(
            range(0..1, 0..1),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Access::COPY_WRITE,
            UsageKind::Transfer,
        );
        assert!(sub.has_external_transition);
        assert!(sub.has_transitioned);
        assert!(sub.is_read_only);
    }

    #[test]
    fn test_attachment_sampled_in_pass_requests_reset() {
        let mut sub = SubresourceInfo::new(
            range(0..1, 0..1),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::COLOR_ATTACHMENT_WRITE,
            UsageKind::Framebuffer,
        );
        let update = sub.update(
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::FRAGMENT_SHADER_READ,
            UsageKind::ShaderBind,
            false,
        );
        assert!(update.reset_render_pass);
        assert!(sub.is_shader_input);
        // Attachments keep the layout the render pass gives them.
        assert_eq!(sub.required_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }
}
