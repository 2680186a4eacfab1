//! Hazard tracking primitives.
//!
//! Everything in here is a pure function of its inputs. The command buffer tracker in
//! [`crate::command`] owns the per-resource state and calls into this module to work out
//! which barriers a new access requires.
//!
//! # Access
//!
//! An [`Access`] is a pipeline stage paired with an access mask. Registering a resource
//! for some purpose always comes with one, and the read/write kind of the use is derived
//! from the access mask with [`Access::use_flags`].
//!
//! # Hazards
//!
//! [`ResourceState`] remembers the last write and the pipeline stages that have read the
//! resource since. [`ResourceState::transition`] returns the [`MemoryBarrier`] needed
//! before the next access and then records that access:
//!
//! - read after write: a memory barrier from the write to the read,
//! - write after read: an execution dependency from the reading stages,
//! - write after write: a full memory barrier,
//! - read after read: nothing, unless the new read happens at an earlier stage than
//!   the data was made visible at.
//!
//! # Sub-resource ranges
//!
//! Images are tracked per (mip level × array layer) rectangle. [`cut_range`] splits one
//! rectangle along the edges of another so that the tracker can keep the ranges of an
//! image pairwise disjoint.
use std::{
    fmt::Debug,
    ops::{BitOr, BitOrAssign},
};

use ash::vk;
use smallvec::SmallVec;

use crate::{image::ImageUsage, resource::UseFlags};

#[derive(Clone, Copy, PartialEq, Eq, Default, Debug)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}
impl BitOr for Access {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            stage: self.stage | rhs.stage,
            access: self.access | rhs.access,
        }
    }
}
impl BitOrAssign for Access {
    fn bitor_assign(&mut self, rhs: Self) {
        self.stage |= rhs.stage;
        self.access |= rhs.access;
    }
}

impl Access {
    pub const NONE: Access = Access {
        stage: vk::PipelineStageFlags2::NONE,
        access: vk::AccessFlags2::NONE,
    };
    pub const VERTEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_INPUT,
        access: vk::AccessFlags2::VERTEX_ATTRIBUTE_READ,
    };
    pub const INDEX_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_INPUT,
        access: vk::AccessFlags2::INDEX_READ,
    };
    pub const VERTEX_SHADER_READ: Access = Access {
        stage: vk::PipelineStageFlags2::VERTEX_SHADER,
        access: vk::AccessFlags2::SHADER_READ,
    };
    pub const FRAGMENT_SHADER_READ: Access = Access {
        stage: vk::PipelineStageFlags2::FRAGMENT_SHADER,
        access: vk::AccessFlags2::SHADER_READ,
    };
    /// Read from any shader stage of a graphics or compute pipeline.
    pub const SHADER_READ: Access = Access {
        stage: SHADER_STAGES,
        access: vk::AccessFlags2::SHADER_READ,
    };
    /// Written from any shader stage of a graphics or compute pipeline.
    pub const SHADER_WRITE: Access = Access {
        stage: SHADER_STAGES,
        access: vk::AccessFlags2::SHADER_WRITE,
    };
    pub const COMPUTE_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_READ,
    };
    pub const COMPUTE_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COMPUTE_SHADER,
        access: vk::AccessFlags2::SHADER_WRITE,
    };
    pub const COPY_READ: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_READ,
    };
    pub const COPY_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COPY,
        access: vk::AccessFlags2::TRANSFER_WRITE,
    };
    pub const COLOR_ATTACHMENT_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    };
    /// A loaded color attachment is read before it is written.
    pub const COLOR_ATTACHMENT_READ_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw(),
        ),
    };
    pub const DEPTH_STENCIL_ATTACHMENT_READ: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ,
    };
    pub const DEPTH_STENCIL_ATTACHMENT_READ_WRITE: Access = Access {
        stage: vk::PipelineStageFlags2::from_raw(
            vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS.as_raw()
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS.as_raw(),
        ),
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw(),
        ),
    };
    pub const ALL_COMMANDS: Access = Access {
        stage: vk::PipelineStageFlags2::ALL_COMMANDS,
        access: vk::AccessFlags2::from_raw(
            vk::AccessFlags2::MEMORY_READ.as_raw() | vk::AccessFlags2::MEMORY_WRITE.as_raw(),
        ),
    };
    pub fn is_writeonly(&self) -> bool {
        if self.access == vk::AccessFlags2::empty() {
            return false;
        }
        // Clear all the write bits. If nothing is left, that means there's no read bits.
        self.access & !ALL_WRITE_BITS == vk::AccessFlags2::NONE
    }

    pub fn is_readonly(&self) -> bool {
        if self.access == vk::AccessFlags2::empty() {
            return false;
        }
        // Clear all the read bits. If nothing is left, that means there's no write bits.
        self.access & !ALL_READ_BITS == vk::AccessFlags2::NONE
    }

    /// Read/write kind of this access, as reported to the resource.
    pub fn use_flags(&self) -> UseFlags {
        let mut flags = UseFlags::empty();
        if self.access.intersects(ALL_READ_BITS) {
            flags |= UseFlags::READ;
        }
        if self.access.intersects(ALL_WRITE_BITS) {
            flags |= UseFlags::WRITE;
        }
        flags
    }
}

/// Write hazard state of a buffer or of one image sub-resource.
///
/// Only accesses recorded into the same command buffer are tracked. Ordering against
/// other submissions is provided by the semaphore chain of the queue.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct ResourceState {
    /// The pipeline stage and access flags of the most recent write operation.
    pub write: Access,

    /// Accumulated pipeline stages that have read from the resource since the last write.
    ///
    /// Reset to empty when a new write occurs.
    pub reads: vk::PipelineStageFlags2,
}
impl Debug for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceState")
            .field("write_stage", &self.write.stage)
            .field("write_access", &self.write.access)
            .field("pending_read_stages", &self.reads)
            .finish()
    }
}

/// A global memory barrier expressed as a source and destination [`Access`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBarrier {
    pub src: Access,
    pub dst: Access,
}
impl BitOr for MemoryBarrier {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self {
            src: self.src | rhs.src,
            dst: self.dst | rhs.dst,
        }
    }
}
impl BitOrAssign for MemoryBarrier {
    fn bitor_assign(&mut self, rhs: Self) {
        self.src |= rhs.src;
        self.dst |= rhs.dst;
    }
}
impl MemoryBarrier {
    pub fn is_empty(&self) -> bool {
        self.src.stage.is_empty() && self.dst.stage.is_empty()
    }

    pub(crate) fn to_vk(self) -> vk::MemoryBarrier2<'static> {
        vk::MemoryBarrier2::default()
            .src_stage_mask(self.src.stage)
            .src_access_mask(self.src.access)
            .dst_stage_mask(self.dst.stage)
            .dst_access_mask(self.dst.access)
    }
}

impl ResourceState {
    /// Computes the minimal barrier needed before `next`, then records `next` as the most
    /// recent access.
    ///
    /// `with_layout_transition` is set when the access also requires an image layout
    /// change. The transition counts as a write, so the destination access mask is kept
    /// even for what would otherwise be an execution-only dependency.
    ///
    /// Returns an empty barrier when nothing has to wait.
    pub fn transition(&mut self, next: Access, with_layout_transition: bool) -> MemoryBarrier {
        let mut barrier = MemoryBarrier {
            src: self.write,
            dst: next,
        };
        let never_written = self.write == Access::default();
        if never_written
            && (self.reads.is_empty() || (next.is_readonly() && !with_layout_transition))
        {
            // Nothing in this command buffer touched the resource in a conflicting way.
            if with_layout_transition {
                barrier.src = Access::default();
            } else {
                barrier = MemoryBarrier::default();
            }
        } else if next.is_readonly() && !with_layout_transition {
            if let Some(ordering) = utils::compare_pipeline_stages(self.reads, next.stage) {
                if ordering.is_gt() {
                    barrier.src.stage = self.reads;
                    barrier.src.access = vk::AccessFlags2::empty();
                    barrier.dst.access = vk::AccessFlags2::empty();
                } else {
                    // it has already been made visible at the desired stage
                    barrier = MemoryBarrier::default();
                }
            }
        } else if !self.reads.is_empty() {
            // Write after read only needs an execution dependency, unless the layout
            // transition itself has to be made visible to the new write.
            barrier.src.stage = self.reads;
            barrier.src.access = vk::AccessFlags2::empty();
            if !with_layout_transition {
                barrier.dst.access = vk::AccessFlags2::empty();
            }
        }
        if next.is_readonly() {
            self.reads = utils::earlier_stage(self.reads, next.stage);
        } else {
            self.write = next;
            self.reads = vk::PipelineStageFlags2::empty();
        }
        barrier
    }
}

/// Every shader stage of the graphics and compute pipelines.
pub const SHADER_STAGES: vk::PipelineStageFlags2 = vk::PipelineStageFlags2::from_raw(
    vk::PipelineStageFlags2::VERTEX_SHADER.as_raw()
        | vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER.as_raw()
        | vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER.as_raw()
        | vk::PipelineStageFlags2::GEOMETRY_SHADER.as_raw()
        | vk::PipelineStageFlags2::FRAGMENT_SHADER.as_raw()
        | vk::PipelineStageFlags2::COMPUTE_SHADER.as_raw(),
);

pub const ALL_WRITE_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::SHADER_WRITE.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE.as_raw()
        | vk::AccessFlags2::TRANSFER_WRITE.as_raw()
        | vk::AccessFlags2::HOST_WRITE.as_raw()
        | vk::AccessFlags2::MEMORY_WRITE.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_WRITE.as_raw(),
);
pub const ALL_READ_BITS: vk::AccessFlags2 = vk::AccessFlags2::from_raw(
    vk::AccessFlags2::INDIRECT_COMMAND_READ.as_raw()
        | vk::AccessFlags2::INDEX_READ.as_raw()
        | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ.as_raw()
        | vk::AccessFlags2::UNIFORM_READ.as_raw()
        | vk::AccessFlags2::INPUT_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::SHADER_READ.as_raw()
        | vk::AccessFlags2::COLOR_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ.as_raw()
        | vk::AccessFlags2::TRANSFER_READ.as_raw()
        | vk::AccessFlags2::HOST_READ.as_raw()
        | vk::AccessFlags2::MEMORY_READ.as_raw()
        | vk::AccessFlags2::SHADER_SAMPLED_READ.as_raw()
        | vk::AccessFlags2::SHADER_STORAGE_READ.as_raw(),
);

/// Access mask an image in `layout` is used with.
///
/// `GENERAL` depends on what the image was created for: storage images may be written by
/// shaders, render targets and depth buffers may be used as attachments in that layout.
pub fn layout_access_flags(
    layout: vk::ImageLayout,
    read_only: bool,
    usage: ImageUsage,
) -> vk::AccessFlags2 {
    match layout {
        vk::ImageLayout::GENERAL => {
            let mut flags = vk::AccessFlags2::SHADER_READ;
            if usage.contains(ImageUsage::LOAD_STORE) && !read_only {
                flags |= vk::AccessFlags2::SHADER_WRITE;
            }
            if usage.contains(ImageUsage::RENDER_TARGET) {
                flags |= vk::AccessFlags2::COLOR_ATTACHMENT_READ;
                if !read_only {
                    flags |= vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
                }
            } else if usage.contains(ImageUsage::DEPTH_STENCIL) {
                flags |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ;
                if !read_only {
                    flags |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
                }
            }
            flags
        }
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL => {
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE
        }
        vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        | vk::ImageLayout::DEPTH_READ_ONLY_STENCIL_ATTACHMENT_OPTIMAL
        | vk::ImageLayout::DEPTH_ATTACHMENT_STENCIL_READ_ONLY_OPTIMAL => {
            vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ | vk::AccessFlags2::SHADER_READ
        }
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags2::SHADER_READ,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags2::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags2::TRANSFER_WRITE,
        vk::ImageLayout::PRESENT_SRC_KHR => vk::AccessFlags2::MEMORY_READ,
        vk::ImageLayout::UNDEFINED | vk::ImageLayout::PREINITIALIZED => vk::AccessFlags2::empty(),
        other => {
            tracing::warn!(layout = ?other, "no access flags known for image layout");
            vk::AccessFlags2::empty()
        }
    }
}

/// Pipeline stages that perform `access`, or `fallback` when none do.
pub fn access_pipeline_stages(
    access: vk::AccessFlags2,
    fallback: vk::PipelineStageFlags2,
) -> vk::PipelineStageFlags2 {
    let mut stages = vk::PipelineStageFlags2::empty();
    if access.intersects(vk::AccessFlags2::INDIRECT_COMMAND_READ) {
        stages |= vk::PipelineStageFlags2::DRAW_INDIRECT;
    }
    if access.intersects(vk::AccessFlags2::INDEX_READ | vk::AccessFlags2::VERTEX_ATTRIBUTE_READ) {
        stages |= vk::PipelineStageFlags2::VERTEX_INPUT;
    }
    if access.intersects(
        vk::AccessFlags2::UNIFORM_READ
            | vk::AccessFlags2::SHADER_READ
            | vk::AccessFlags2::SHADER_WRITE,
    ) {
        stages |= SHADER_STAGES;
    }
    if access.intersects(vk::AccessFlags2::INPUT_ATTACHMENT_READ) {
        stages |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if access.intersects(
        vk::AccessFlags2::COLOR_ATTACHMENT_READ | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE,
    ) {
        stages |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
    }
    if access.intersects(
        vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
            | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE,
    ) {
        stages |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
    }
    if access.intersects(vk::AccessFlags2::TRANSFER_READ | vk::AccessFlags2::TRANSFER_WRITE) {
        stages |= vk::PipelineStageFlags2::TRANSFER;
    }
    if access.intersects(vk::AccessFlags2::HOST_READ | vk::AccessFlags2::HOST_WRITE) {
        stages |= vk::PipelineStageFlags2::HOST;
    }
    if stages.is_empty() { fallback } else { stages }
}

/// Fills in the stage masks of an image barrier from its access masks.
pub(crate) fn with_access_stages(
    barrier: vk::ImageMemoryBarrier2<'static>,
) -> vk::ImageMemoryBarrier2<'static> {
    let src = access_pipeline_stages(
        barrier.src_access_mask,
        vk::PipelineStageFlags2::TOP_OF_PIPE,
    );
    let dst = access_pipeline_stages(
        barrier.dst_access_mask,
        vk::PipelineStageFlags2::BOTTOM_OF_PIPE,
    );
    barrier.src_stage_mask(src).dst_stage_mask(dst)
}

/// Layout an image is kept in while it is bound for shader use.
pub fn optimal_layout(usage: ImageUsage) -> vk::ImageLayout {
    if usage.contains(ImageUsage::LOAD_STORE) {
        vk::ImageLayout::GENERAL
    } else if usage.contains(ImageUsage::RENDER_TARGET) {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    } else if usage.contains(ImageUsage::DEPTH_STENCIL) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else if usage.contains(ImageUsage::DYNAMIC) {
        vk::ImageLayout::GENERAL
    } else {
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
    }
}

pub fn same_range(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    a.aspect_mask == b.aspect_mask
        && a.base_mip_level == b.base_mip_level
        && a.level_count == b.level_count
        && a.base_array_layer == b.base_array_layer
        && a.layer_count == b.layer_count
}

/// Whether the (layer × mip) rectangles of two ranges intersect.
pub fn ranges_overlap(a: &vk::ImageSubresourceRange, b: &vk::ImageSubresourceRange) -> bool {
    let a_layer_end = a.base_array_layer + a.layer_count;
    let b_layer_end = b.base_array_layer + b.layer_count;
    let a_mip_end = a.base_mip_level + a.level_count;
    let b_mip_end = b.base_mip_level + b.level_count;
    a.base_array_layer < b_layer_end
        && b.base_array_layer < a_layer_end
        && a.base_mip_level < b_mip_end
        && b.base_mip_level < a_mip_end
}

pub fn range_contains(range: &vk::ImageSubresourceRange, layer: u32, mip: u32) -> bool {
    layer >= range.base_array_layer
        && layer < range.base_array_layer + range.layer_count
        && mip >= range.base_mip_level
        && mip < range.base_mip_level + range.level_count
}

/// Splits `to_cut` along the edges of `cut_with`.
///
/// The layers are cut first, producing up to two pieces outside of `cut_with` and one
/// inside. The inside piece is then cut along the mip levels. The returned pieces
/// partition `to_cut`, and at most one of them overlaps `cut_with`. When the ranges do
/// not overlap, `to_cut` is returned unchanged.
pub fn cut_range(
    to_cut: &vk::ImageSubresourceRange,
    cut_with: &vk::ImageSubresourceRange,
) -> SmallVec<[vk::ImageSubresourceRange; 5]> {
    let mut pieces = SmallVec::new();
    if !ranges_overlap(to_cut, cut_with) {
        pieces.push(*to_cut);
        return pieces;
    }

    let layer_end = to_cut.base_array_layer + to_cut.layer_count;
    let cut_layer_begin = to_cut.base_array_layer.max(cut_with.base_array_layer);
    let cut_layer_end = layer_end.min(cut_with.base_array_layer + cut_with.layer_count);

    let left = cut_layer_begin - to_cut.base_array_layer;
    if left > 0 {
        pieces.push(vk::ImageSubresourceRange {
            layer_count: left,
            ..*to_cut
        });
    }
    let right = layer_end - cut_layer_end;
    if right > 0 {
        pieces.push(vk::ImageSubresourceRange {
            base_array_layer: cut_layer_end,
            layer_count: right,
            ..*to_cut
        });
    }

    let middle = vk::ImageSubresourceRange {
        base_array_layer: cut_layer_begin,
        layer_count: cut_layer_end - cut_layer_begin,
        ..*to_cut
    };
    let mip_end = to_cut.base_mip_level + to_cut.level_count;
    let cut_mip_begin = to_cut.base_mip_level.max(cut_with.base_mip_level);
    let cut_mip_end = mip_end.min(cut_with.base_mip_level + cut_with.level_count);

    let top = cut_mip_begin - to_cut.base_mip_level;
    if top > 0 {
        pieces.push(vk::ImageSubresourceRange {
            level_count: top,
            ..middle
        });
    }
    let bottom = mip_end - cut_mip_end;
    if bottom > 0 {
        pieces.push(vk::ImageSubresourceRange {
            base_mip_level: cut_mip_end,
            level_count: bottom,
            ..middle
        });
    }
    pieces.push(vk::ImageSubresourceRange {
        base_mip_level: cut_mip_begin,
        level_count: cut_mip_end - cut_mip_begin,
        ..middle
    });
    pieces
}

mod utils {
    use ash::vk;
    use std::cmp::Ordering;
    const GRAPHICS_PIPELINE_ORDER: [vk::PipelineStageFlags2; 11] = [
        vk::PipelineStageFlags2::DRAW_INDIRECT,
        vk::PipelineStageFlags2::INDEX_INPUT,
        vk::PipelineStageFlags2::VERTEX_ATTRIBUTE_INPUT,
        vk::PipelineStageFlags2::VERTEX_SHADER,
        vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER,
        vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER,
        vk::PipelineStageFlags2::GEOMETRY_SHADER,
        vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS,
        vk::PipelineStageFlags2::FRAGMENT_SHADER,
        vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS,
        vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
    ];
    const COMPUTE_PIPELINE_ORDER: [vk::PipelineStageFlags2; 2] = [
        vk::PipelineStageFlags2::DRAW_INDIRECT,
        vk::PipelineStageFlags2::COMPUTE_SHADER,
    ];
    const ALL_ORDERS: [&[vk::PipelineStageFlags2]; 2] =
        [&GRAPHICS_PIPELINE_ORDER, &COMPUTE_PIPELINE_ORDER];
    /// Compare two pipeline stages. Returns Some([`Ordering::Less`]) if `a` is earlier than `b`,
    /// [`Ordering::Equal`] if they are the same, [`Ordering::Greater`] if `a` is later than `b`,
    /// and [`None`] if they are not mutually ordered.
    pub fn compare_pipeline_stages(
        a: vk::PipelineStageFlags2,
        b: vk::PipelineStageFlags2,
    ) -> Option<Ordering> {
        if a == b {
            return Some(Ordering::Equal);
        }
        for order in ALL_ORDERS.iter() {
            let first_index = order.iter().position(|&x| a.contains(x));
            let second_index = order.iter().position(|&x| b.contains(x));
            if let Some(first_index) = first_index
                && let Some(second_index) = second_index
            {
                return first_index.partial_cmp(&second_index);
            }
        }
        None
    }
    pub fn earlier_stage(
        a: vk::PipelineStageFlags2,
        b: vk::PipelineStageFlags2,
    ) -> vk::PipelineStageFlags2 {
        if let Some(ordering) = compare_pipeline_stages(a, b) {
            if ordering.is_le() { a } else { b }
        } else {
            a | b
        }
    }
}
