//! Submission of a recorded command buffer.
//!
//! Before a command buffer can execute, the resources it references may need work that
//! could not be recorded into it:
//!
//! - Query resets requested inside a render pass run in a helper buffer submitted first.
//! - Exclusive resources last used by another queue family need an ownership transfer.
//!   The release half runs on a queue of the old family, the acquire half on this queue.
//! - Sub-resources whose tracked initial layout differs from the layout the previous
//!   submission left them in are transitioned by a helper buffer on this queue.
//!
//! Ordering between the helpers and the command buffer comes from the semaphore chain
//! of each queue, plus the caller's sync mask for other queues.
use std::{collections::BTreeMap, sync::Arc};

use ash::{prelude::VkResult, vk};

use super::CmdBuffer;
use crate::{
    device::Device,
    driver::Driver,
    image::Image,
    queue::{QueueType, global_queue_idx, global_queue_mask},
    resource::{Resource, ownership_source},
    tracking::with_access_stages,
};

/// Barriers recorded into one helper command buffer.
#[derive(Default)]
pub(crate) struct TransitionBarriers {
    pub buffers: Vec<vk::BufferMemoryBarrier2<'static>>,
    pub images: Vec<vk::ImageMemoryBarrier2<'static>>,
}

impl TransitionBarriers {
    fn is_empty(&self) -> bool {
        self.buffers.is_empty() && self.images.is_empty()
    }

    fn record(&self, driver: &dyn Driver, command_buffer: vk::CommandBuffer) {
        driver.cmd_pipeline_barrier(
            command_buffer,
            &vk::DependencyInfo::default()
                .buffer_memory_barriers(&self.buffers)
                .image_memory_barriers(&self.images),
        );
    }
}

pub(crate) struct FinalLayout {
    image: Arc<Image>,
    range: vk::ImageSubresourceRange,
    layout: vk::ImageLayout,
}

impl CmdBuffer {
    /// Barriers that must run before this buffer, keyed by the queue family they are
    /// recorded for. The entry of this buffer's own family holds the initial layout
    /// transitions.
    pub(crate) fn collect_submit_barriers(&self) -> BTreeMap<u32, TransitionBarriers> {
        let family = self.queue_family;
        let mut out: BTreeMap<u32, TransitionBarriers> = BTreeMap::new();

        for info in self.buffers.values() {
            let Some(source) = ownership_source(info.buffer.usage(), family) else {
                continue;
            };
            out.entry(source).or_default().buffers.push(
                vk::BufferMemoryBarrier2::default()
                    .buffer(info.buffer.handle())
                    .offset(0)
                    .size(vk::WHOLE_SIZE)
                    .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                    .src_access_mask(info.access.access)
                    .dst_access_mask(info.access.access)
                    .src_queue_family_index(source)
                    .dst_queue_family_index(family),
            );
        }

        for info in self.images.values() {
            let image = &info.image;
            if let Some(source) = ownership_source(image.usage(), family) {
                let barriers = &mut out.entry(source).or_default().images;
                for sub in &info.subresources {
                    let start = barriers.len();
                    image.barriers(&sub.range, barriers);
                    for barrier in &mut barriers[start..] {
                        *barrier = barrier
                            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
                            .dst_access_mask(barrier.src_access_mask)
                            .src_queue_family_index(source)
                            .dst_queue_family_index(family);
                    }
                }
            }

            for sub in &info.subresources {
                let initial = sub.initial_layout;
                if initial != vk::ImageLayout::UNDEFINED && !sub.has_external_transition {
                    let range = &sub.range;
                    let mismatch = (range.base_array_layer
                        ..range.base_array_layer + range.layer_count)
                        .flat_map(|layer| {
                            (range.base_mip_level..range.base_mip_level + range.level_count)
                                .map(move |mip| (layer, mip))
                        })
                        .any(|(layer, mip)| image.layout(layer, mip) != initial);
                    if mismatch {
                        let barriers = &mut out.entry(family).or_default().images;
                        let start = barriers.len();
                        image.barriers(range, barriers);
                        for barrier in &mut barriers[start..] {
                            *barrier = with_access_stages(
                                barrier
                                    .new_layout(initial)
                                    .dst_access_mask(
                                        image.access_flags(initial, sub.is_initial_read_only),
                                    ),
                            );
                        }
                    }
                }
            }
        }
        out
    }

    /// Layouts this buffer leaves its images in, to be tracked once it was submitted.
    pub(crate) fn final_layouts(&self) -> Vec<FinalLayout> {
        self.images
            .values()
            .flat_map(|info| {
                info.subresources.iter().map(|sub| FinalLayout {
                    image: info.image.clone(),
                    range: sub.range,
                    layout: sub.final_layout,
                })
            })
            .collect()
    }

    /// Reports every tracked resource as used by the queue with `global_idx` and drops the
    /// binding state, which does not survive the submission.
    pub(crate) fn finish_submission(&mut self, global_idx: u32) {
        self.global_queue_idx = Some(global_idx);
        let family = self.queue_family;
        for tracked in self.resources.values_mut() {
            tracked.used = true;
            tracked.resource.notify_used(global_idx, family, tracked.flags);
        }
        for info in self.images.values_mut() {
            info.used = true;
            info.image.notify_used(global_idx, family, info.flags);
        }
        for info in self.buffers.values_mut() {
            info.used = true;
            info.buffer.notify_used(global_idx, family, info.flags);
        }
        self.clear_binding_state();
        self.queued_layout_transitions.clear();
        self.swap_chains.clear();
    }
}

impl Device {
    /// Queue of `queue_family` to run ownership releases on, preferring one that is idle.
    fn find_queue_for_family(&self, queue_family: u32) -> Option<(QueueType, u32)> {
        let ty = QueueType::ALL
            .into_iter()
            .find(|&ty| self.num_queues(ty) > 0 && self.queue_family(ty) == Some(queue_family))?;
        let idle = (0..self.num_queues(ty)).find(|&idx| !self.queue(ty, idx).is_executing());
        Some((ty, idle.unwrap_or(0)))
    }

    /// Submits `cb` on queue `queue_idx` of type `ty`, after every queue in `sync_mask`
    /// has finished its last submission.
    pub(crate) fn submit_command_buffer(
        &mut self,
        mut cb: Box<CmdBuffer>,
        ty: QueueType,
        queue_idx: u32,
        mut sync_mask: u32,
    ) -> VkResult<()> {
        let family = cb.queue_family();
        let global_idx = global_queue_idx(ty, queue_idx);
        let driver = self.driver().clone();

        let resets = cb.take_query_resets();
        if !resets.is_empty() {
            let mut helper = self.command_pool_mut().get_buffer(family)?;
            for slot in resets {
                helper.reset_query(slot);
            }
            helper.end()?;
            self.queue_mut(ty, queue_idx).queue_submit(helper, &[]);
        }

        let barriers = cb.collect_submit_barriers();
        let final_layouts = cb.final_layouts();

        // Release halves of the ownership transfers, on the old families.
        for (&source, transition) in &barriers {
            if source == family || transition.is_empty() {
                continue;
            }
            let Some((other_ty, other_idx)) = self.find_queue_for_family(source) else {
                tracing::error!(
                    family = source,
                    "No queue of the owning family to release resources on"
                );
                continue;
            };
            let mut helper = self.command_pool_mut().get_buffer(source)?;
            transition.record(&*driver, helper.handle());
            helper.end()?;
            sync_mask |= global_queue_mask(other_ty, other_idx);
            tracing::debug!(family = source, "releasing resource ownership");
            self.queue_mut(other_ty, other_idx).submit(helper, &[])?;
        }

        sync_mask &= !global_queue_mask(ty, queue_idx);
        let mut waits = self.sync_semaphores(sync_mask);
        for swap_chain in cb.swap_chains.values() {
            if let Some(semaphore) = swap_chain.back_buffer_wait() {
                waits.push(semaphore);
                swap_chain.notify_back_buffer_wait_issued();
            }
        }

        // Acquire halves and initial layout transitions, on this queue. The semaphore
        // chain of the queue orders everything after the first buffer.
        for transition in barriers.values() {
            if transition.is_empty() {
                continue;
            }
            let mut helper = self.command_pool_mut().get_buffer(family)?;
            transition.record(&*driver, helper.handle());
            helper.end()?;
            self.queue_mut(ty, queue_idx)
                .queue_submit(helper, &std::mem::take(&mut waits));
        }

        cb.finish_submission(global_idx);
        let queue = self.queue_mut(ty, queue_idx);
        queue.queue_submit(cb, &waits);
        queue.submit_queued()?;

        for update in final_layouts {
            update.image.set_layout(&update.range, update.layout);
        }
        Ok(())
    }
}
