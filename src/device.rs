//! The device context.
//!
//! [`Device`] owns the queues, the command buffer pool and the query pool of one logical
//! device, and is passed explicitly to everything that submits work.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use scoria::prelude::*;
//! # fn frame(device: &mut Device, swap_chain: Arc<SwapChain>) -> ash::prelude::VkResult<()> {
//! let mut cb = device.create_command_buffer(QueueType::Graphics, 0)?;
//! cb.set_render_target(
//!     Some(RenderTarget::Window(swap_chain.clone())),
//!     FramebufferBuffers::empty(),
//!     RenderSurfaceMask::empty(),
//! )?;
//! // ... draws ...
//! cb.submit(device, 0)?;
//! device.present(QueueType::Graphics, 0, &swap_chain, 0)?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use ash::prelude::VkResult;

use crate::{
    Error, MAX_QUEUES_PER_TYPE,
    alloc::Allocator,
    command::{CommandBuffer, CommandBufferPool},
    config::DeviceConfig,
    driver::Driver,
    query::QueryPool,
    queue::{
        PresentOutcome, QUEUE_TYPE_COUNT, Queue, QueueType, global_queue_mask, queue_idx_and_type,
    },
    resource::MAX_UNIQUE_QUEUES,
    swapchain::SwapChain,
    sync::Semaphore,
};

pub struct Device {
    // Queues return their command buffers to the pool when dropped, so they go first.
    queues: [Vec<Queue>; QUEUE_TYPE_COUNT],
    pool: CommandBufferPool,
    query_pool: QueryPool,
    allocator: Option<Allocator>,
    config: DeviceConfig,
    driver: Arc<dyn Driver>,
}

impl Device {
    pub fn new(driver: Arc<dyn Driver>, config: DeviceConfig) -> Result<Self, Error> {
        if config.queue(QueueType::Graphics).is_none() {
            return Err(Error::NoGraphicsQueue);
        }
        let families = QueueType::ALL
            .into_iter()
            .filter_map(|ty| config.queue(ty))
            .map(|selection| selection.family_index);
        let pool = CommandBufferPool::new(
            driver.clone(),
            families,
            config.command_buffers_per_family,
            config.fence_timeout_ns,
        )?;

        let mut queues: [Vec<Queue>; QUEUE_TYPE_COUNT] = Default::default();
        for ty in QueueType::ALL {
            let Some(selection) = config.queue(ty) else {
                continue;
            };
            if selection.queue_count == 0 {
                return Err(Error::MissingQueueFamily(ty));
            }
            tracing::info!(
                ?ty,
                family = selection.family_index,
                count = selection.queue_count,
                "creating queues"
            );
            queues[ty.index()] = (0..selection.queue_count)
                .map(|index| {
                    Queue::new(
                        driver.clone(),
                        ty,
                        index,
                        selection.family_index,
                        pool.recycler(),
                    )
                })
                .collect();
        }

        Ok(Self {
            queues,
            pool,
            query_pool: QueryPool::new(
                driver.clone(),
                config.query_block_size,
                config.timestamp_period,
            ),
            allocator: None,
            config,
            driver,
        })
    }

    pub fn with_allocator(mut self, allocator: Allocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }
    pub fn allocator(&self) -> Option<&Allocator> {
        self.allocator.as_ref()
    }
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Queue family backing `ty`, if the device has queues of that type.
    pub fn queue_family(&self, ty: QueueType) -> Option<u32> {
        if self.num_queues(ty) == 0 {
            return None;
        }
        self.config.queue(ty).map(|selection| selection.family_index)
    }
    pub fn num_queues(&self, ty: QueueType) -> u32 {
        self.queues[ty.index()].len() as u32
    }
    /// # Panics
    /// When `idx` is out of range for `ty`.
    pub fn queue(&self, ty: QueueType, idx: u32) -> &Queue {
        &self.queues[ty.index()][idx as usize]
    }
    pub fn queue_mut(&mut self, ty: QueueType, idx: u32) -> &mut Queue {
        &mut self.queues[ty.index()][idx as usize]
    }

    /// Sync mask bits of queue `idx` of `ty`.
    ///
    /// Queue indices wrap around the number of queues of the type, so every index that
    /// maps to the same queue is included.
    pub fn queue_mask(&self, ty: QueueType, idx: u32) -> u32 {
        let count = self.num_queues(ty);
        if count == 0 {
            return 0;
        }
        let mut mask = 0;
        let mut alias = idx % count;
        while alias < MAX_QUEUES_PER_TYPE {
            mask |= global_queue_mask(ty, alias);
            alias += count;
        }
        mask
    }

    pub fn query_pool(&self) -> &QueryPool {
        &self.query_pool
    }
    pub fn query_pool_mut(&mut self) -> &mut QueryPool {
        &mut self.query_pool
    }
    pub(crate) fn command_pool_mut(&mut self) -> &mut CommandBufferPool {
        &mut self.pool
    }

    /// Resolves a queue request, falling back to the graphics queues when the device has
    /// none of the requested type.
    fn resolve_queue(&self, ty: QueueType, idx: u32) -> (QueueType, u32) {
        let ty = if self.num_queues(ty) == 0 {
            QueueType::Graphics
        } else {
            ty
        };
        (ty, idx % self.num_queues(ty))
    }

    /// A command buffer in the recording state, submitting to queue `idx` of `ty`.
    pub fn create_command_buffer(&mut self, ty: QueueType, idx: u32) -> VkResult<CommandBuffer> {
        let (ty, idx) = self.resolve_queue(ty, idx);
        let family = self.queue(ty, idx).family_index();
        let buffer = self.pool.get_buffer(family)?;
        Ok(CommandBuffer::new(
            buffer,
            ty,
            idx,
            self.queue_mask(ty, idx),
            self.pool.recycler(),
        ))
    }

    /// Semaphores signaled by the last submission of every queue in `sync_mask`.
    ///
    /// Queues without a submission in flight need no wait. Each submission hands out a
    /// limited number of semaphores; requests beyond that are dropped with an error.
    pub fn sync_semaphores(&mut self, sync_mask: u32) -> Vec<Arc<Semaphore>> {
        let mut semaphores = Vec::new();
        let mut mask = sync_mask;
        while mask != 0 {
            let global_idx = mask.trailing_zeros();
            mask &= mask - 1;
            if global_idx as usize >= MAX_UNIQUE_QUEUES {
                break;
            }
            let (ty, idx) = queue_idx_and_type(global_idx);
            if idx >= self.num_queues(ty) {
                continue;
            }
            let Some(cb) = self.queue_mut(ty, idx).last_command_buffer_mut() else {
                continue;
            };
            match cb.request_inter_queue_semaphore() {
                Some(semaphore) => semaphores.push(semaphore),
                None => tracing::error!(
                    queue = global_idx,
                    "Cannot allocate a new semaphore, the command buffer already handed out \
                     all of its inter-queue semaphores"
                ),
            }
        }
        semaphores
    }

    /// Reclaims completed submissions on every queue without blocking.
    pub fn refresh_states(&mut self) -> VkResult<()> {
        for queue in self.queues.iter_mut().flatten() {
            queue.refresh_states(false, false)?;
        }
        Ok(())
    }

    /// Blocks until the GPU is idle, then reclaims everything.
    pub fn wait_idle(&mut self) -> VkResult<()> {
        self.driver.device_wait_idle()?;
        for queue in self.queues.iter_mut().flatten() {
            queue.refresh_states(false, true)?;
        }
        Ok(())
    }

    /// Presents the back buffer of `swap_chain` on queue `idx` of `ty`, once the queues in
    /// `sync_mask` and the back buffer's acquire are done.
    pub fn present(
        &mut self,
        ty: QueueType,
        idx: u32,
        swap_chain: &SwapChain,
        sync_mask: u32,
    ) -> VkResult<PresentOutcome> {
        let (ty, idx) = self.resolve_queue(ty, idx);
        let mut waits = self.sync_semaphores(sync_mask & !self.queue_mask(ty, idx));
        if let Some(semaphore) = swap_chain.back_buffer_wait() {
            waits.push(semaphore);
            swap_chain.notify_back_buffer_wait_issued();
        }
        self.queue_mut(ty, idx).present(swap_chain, &waits)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(err) = self.wait_idle() {
            tracing::warn!(?err, "failed to wait for device idle during shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use ash::vk::{self, Handle};

    use super::*;
    use crate::{
        buffer::Buffer,
        command::{RenderTarget, UsageKind},
        driver::{HeadlessDriver, Recorded, RecordedBatch},
        framebuffer::{FramebufferBuffers, RenderSurfaceMask, tests::color_and_depth},
        image::{Image, ImageDesc},
        pipeline::{GraphicsPipeline, GraphicsPipelineInfo},
        query::{Query, QueryKind},
        resource::Resource,
        swapchain::SwapChainDesc,
        tracking::Access,
    };

    fn device(headless: &Arc<HeadlessDriver>) -> Device {
        let config = DeviceConfig::default()
            .with_queue(QueueType::Graphics, 0, 2)
            .with_queue(QueueType::Compute, 1, 1)
            .with_command_buffers_per_family(16);
        Device::new(headless.clone(), config).unwrap()
    }

    /// The batches of every submission, in order.
    fn batches(headless: &HeadlessDriver) -> Vec<(vk::Queue, Vec<RecordedBatch>, vk::Fence)> {
        headless
            .submissions()
            .into_iter()
            .filter_map(|s| match s {
                Recorded::Submit {
                    queue,
                    batches,
                    fence,
                } => Some((queue, batches, fence)),
                _ => None,
            })
            .collect()
    }

    fn sampled_image(raw: u64, layout: vk::ImageLayout, exclusive: bool) -> Arc<Image> {
        Arc::new(Image::from_raw(
            vk::Image::from_raw(raw),
            ImageDesc {
                exclusive,
                initial_layout: layout,
                ..Default::default()
            },
        ))
    }

    fn sample(cb: &mut CommandBuffer, image: &Arc<Image>) {
        cb.register_image(
            image,
            image.full_range(),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::FRAGMENT_SHADER_READ,
            UsageKind::ShaderBind,
        );
    }

    fn image_barriers(
        headless: &HeadlessDriver,
        cb: vk::CommandBuffer,
    ) -> Vec<vk::ImageMemoryBarrier2<'static>> {
        headless
            .commands(cb)
            .into_iter()
            .filter_map(|c| match c {
                Recorded::PipelineBarrier { images, .. } => Some(images),
                _ => None,
            })
            .flatten()
            .collect()
    }

    #[test]
    fn test_device_requires_graphics_queue() {
        let headless = Arc::new(HeadlessDriver::new());
        let config = DeviceConfig::default().with_queue(QueueType::Compute, 1, 1);
        assert!(matches!(
            Device::new(headless, config),
            Err(Error::NoGraphicsQueue)
        ));
    }

    #[test]
    fn test_queue_masks_include_aliases() {
        let headless = Arc::new(HeadlessDriver::new());
        let device = device(&headless);
        let mask = device.queue_mask(QueueType::Graphics, 3);
        // Two graphics queues: index 3 is queue 1, aliased by 1, 3, 5 and 7.
        assert_eq!(mask, 0b1010_1010);
        assert_eq!(
            device.queue_mask(QueueType::Compute, 0),
            0xff << MAX_QUEUES_PER_TYPE
        );
        assert_eq!(device.queue_mask(QueueType::Upload, 0), 0);
    }

    #[test]
    fn test_missing_queue_type_falls_back_to_graphics() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let cb = device.create_command_buffer(QueueType::Upload, 5).unwrap();
        assert_eq!(cb.queue_type(), QueueType::Graphics);
        assert_eq!(cb.queue_idx(), 1);
        assert_eq!(cb.queue_family(), 0);
    }

    #[test]
    fn test_same_queue_submissions_wait_on_each_other() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        cb.submit(&mut device, 0).unwrap();
        cb.submit(&mut device, 0).unwrap();

        let submits = batches(&headless);
        assert_eq!(submits.len(), 2);
        let first = &submits[0].1[0];
        let second = &submits[1].1[0];
        assert!(first.wait_semaphores.is_empty());
        assert_eq!(first.signal_semaphores.len(), 3);
        assert_eq!(second.wait_semaphores, vec![first.signal_semaphores[0]]);
    }

    #[test]
    fn test_present_consumes_intra_queue_semaphore() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let swap_chain = SwapChain::new(headless.clone(), &SwapChainDesc::default()).unwrap();

        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        cb.set_render_target(
            Some(crate::command::RenderTarget::Window(swap_chain.clone())),
            crate::framebuffer::FramebufferBuffers::empty(),
            crate::framebuffer::RenderSurfaceMask::empty(),
        )
        .unwrap();
        let acquire = swap_chain.back_buffer().semaphore.handle();
        cb.submit(&mut device, 0).unwrap();
        let outcome = device
            .present(QueueType::Graphics, 0, &swap_chain, 0)
            .unwrap();
        assert_eq!(outcome, PresentOutcome::Presented);
        cb.submit(&mut device, 0).unwrap();

        let submits = batches(&headless);
        let first = &submits[0].1[0];
        assert_eq!(first.wait_semaphores, vec![acquire]);
        let present = headless
            .log()
            .into_iter()
            .find_map(|c| match c {
                Recorded::Present {
                    wait_semaphores, ..
                } => Some(wait_semaphores),
                _ => None,
            })
            .unwrap();
        assert_eq!(present, vec![first.signal_semaphores[0]]);
        // The present took the implicit dependency.
        assert!(submits[1].1[0].wait_semaphores.is_empty());
        // Nothing is acquired anymore, so another present does nothing.
        assert_eq!(
            device.present(QueueType::Graphics, 0, &swap_chain, 0).unwrap(),
            PresentOutcome::Skipped
        );
    }

    #[test]
    fn test_sync_mask_waits_on_other_queue() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        headless.set_manual_fences(true);
        let mut graphics = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        let mut compute = device.create_command_buffer(QueueType::Compute, 0).unwrap();
        graphics.submit(&mut device, 0).unwrap();
        let graphics_mask = device.queue_mask(QueueType::Graphics, 0);
        compute
            .submit(&mut device, graphics_mask | compute.id_mask())
            .unwrap();

        let submits = batches(&headless);
        let graphics_signals = &submits[0].1[0].signal_semaphores;
        assert_eq!(
            submits[1].1[0].wait_semaphores,
            vec![graphics_signals[1]]
        );

        // Only two inter-queue semaphores exist per submission.
        assert_eq!(device.sync_semaphores(graphics_mask).len(), 1);
        assert!(device.sync_semaphores(graphics_mask).is_empty());
    }

    #[test]
    fn test_refresh_stops_at_first_pending_submission() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        headless.set_manual_fences(true);
        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        cb.submit(&mut device, 0).unwrap();
        cb.submit(&mut device, 0).unwrap();
        let fences: Vec<_> = batches(&headless).into_iter().map(|s| s.2).collect();
        assert_eq!(device.queue(QueueType::Graphics, 0).active_submissions(), 2);

        headless.signal_fence(fences[1]);
        device.refresh_states().unwrap();
        assert_eq!(device.queue(QueueType::Graphics, 0).active_submissions(), 2);

        headless.signal_fence(fences[0]);
        device.refresh_states().unwrap();
        assert_eq!(device.queue(QueueType::Graphics, 0).active_submissions(), 0);
    }

    #[test]
    fn test_exclusive_buffer_changes_queue_family() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let shared = Arc::new(Buffer::from_raw(vk::Buffer::from_raw(0xe1), 64, true));
        let other = Arc::new(Buffer::from_raw(vk::Buffer::from_raw(0xe2), 64, false));

        let mut graphics = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        graphics.copy_buffer_whole(&shared, &other);
        graphics.submit(&mut device, 0).unwrap();
        assert_eq!(shared.usage().queue_family(), Some(0));

        let mut compute = device.create_command_buffer(QueueType::Compute, 0).unwrap();
        compute.copy_buffer_whole(&other, &shared);
        compute.submit(&mut device, 0).unwrap();
        assert_eq!(shared.usage().queue_family(), Some(1));

        let transfers: Vec<_> = headless
            .log()
            .into_iter()
            .filter_map(|c| match c {
                Recorded::PipelineBarrier { buffers, .. } => buffers
                    .into_iter()
                    .find(|b| b.src_queue_family_index != b.dst_queue_family_index),
                _ => None,
            })
            .collect();
        // The release on the graphics family and the acquire on the compute family.
        assert_eq!(transfers.len(), 2);
        for barrier in transfers {
            assert_eq!(barrier.buffer, shared.handle());
            assert_eq!(
                (barrier.src_queue_family_index, barrier.dst_queue_family_index),
                (0, 1)
            );
        }
        // Release, then the compute batch of acquire helper and recorded buffer.
        let submits = batches(&headless);
        assert_eq!(submits.len(), 3);
        assert_eq!(submits[2].1.len(), 2);
    }

    #[test]
    fn test_query_resets_in_pass_run_in_helper_first() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        cb.set_render_target(
            Some(RenderTarget::Framebuffer(Arc::new(color_and_depth(
                headless.clone(),
                1,
            )))),
            FramebufferBuffers::empty(),
            RenderSurfaceMask::empty(),
        )
        .unwrap();
        cb.set_graphics_pipeline(Some(Arc::new(GraphicsPipeline::from_raw(
            headless.clone(),
            vk::Pipeline::from_raw(0x77),
            vk::PipelineLayout::from_raw(0x78),
            GraphicsPipelineInfo::default(),
        ))));
        cb.draw(0, 3, 1);
        assert!(cb.is_in_render_pass());

        let query = Query::new(QueryKind::Timer, device.query_pool());
        query.begin(&mut cb, device.query_pool_mut()).unwrap();
        cb.draw(0, 3, 1);
        query.end(&mut cb);
        let main = cb.handle();
        cb.submit(&mut device, 0).unwrap();

        let is_reset = |c: &Recorded| matches!(c, Recorded::ResetQueryPool { .. });
        let submits = batches(&headless);
        assert_eq!(submits.len(), 1);
        let batches = &submits[0].1;
        assert!(batches.len() >= 2);
        assert!(headless.commands(batches[0].command_buffer).iter().any(is_reset));
        let last = batches.last().unwrap();
        assert_eq!(last.command_buffer, main);
        assert!(!headless.commands(main).iter().any(is_reset));
        // Each buffer of the batch waits on the one before it.
        for pair in batches.windows(2) {
            assert_eq!(pair[1].wait_semaphores, vec![pair[0].signal_semaphores[0]]);
        }
    }

    #[test]
    fn test_initial_layout_mismatch_is_transitioned_by_helper() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let image = sampled_image(0xd1, vk::ImageLayout::TRANSFER_DST_OPTIMAL, false);

        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        sample(&mut cb, &image);
        let main = cb.handle();
        cb.submit(&mut device, 0).unwrap();

        let submits = batches(&headless);
        assert_eq!(submits.len(), 1);
        let batches = &submits[0].1;
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].command_buffer, main);
        assert_eq!(batches[1].wait_semaphores, vec![batches[0].signal_semaphores[0]]);

        let transitions = image_barriers(&headless, batches[0].command_buffer);
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].image, image.handle());
        assert_eq!(transitions[0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(transitions[0].new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(image.layout(0, 0), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

        // Already in the right layout: no helper the second time.
        sample(&mut cb, &image);
        cb.submit(&mut device, 0).unwrap();
        assert_eq!(headless.submissions().len(), 2);
        assert_eq!(batches_of_last(&headless), 1);
    }

    fn batches_of_last(headless: &HeadlessDriver) -> usize {
        batches(headless).last().map_or(0, |s| s.1.len())
    }

    #[test]
    fn test_failed_submit_keeps_tracked_layouts() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let image = sampled_image(0xd2, vk::ImageLayout::TRANSFER_DST_OPTIMAL, false);

        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        sample(&mut cb, &image);
        headless.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        assert_eq!(cb.submit(&mut device, 0), Err(vk::Result::ERROR_DEVICE_LOST));
        assert_eq!(image.layout(0, 0), vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert!(headless.submissions().is_empty());
    }

    #[test]
    fn test_failed_submit_resumes_queries() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        let query = Query::new(QueryKind::Timer, device.query_pool());
        query.begin(&mut cb, device.query_pool_mut()).unwrap();

        headless.fail_next_submit(vk::Result::ERROR_DEVICE_LOST);
        assert!(cb.submit(&mut device, 0).is_err());
        assert!(query.is_in_progress());
        assert_eq!(cb.in_progress_queries().len(), 1);

        cb.submit(&mut device, 0).unwrap();
        assert!(query.is_in_progress());
        query.end(&mut cb);
        assert!(!query.is_in_progress());
    }

    #[test]
    fn test_exclusive_image_changes_queue_family() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let image = sampled_image(0xd3, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, true);

        let mut graphics = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        sample(&mut graphics, &image);
        graphics.submit(&mut device, 0).unwrap();
        assert_eq!(image.usage().queue_family(), Some(0));

        let mut compute = device.create_command_buffer(QueueType::Compute, 0).unwrap();
        let main = compute.handle();
        sample(&mut compute, &image);
        compute.submit(&mut device, 0).unwrap();
        assert_eq!(image.usage().queue_family(), Some(1));

        // Release on a graphics queue, then the compute batch of acquire helper and
        // recorded buffer.
        let submits = batches(&headless);
        assert_eq!(submits.len(), 3);
        let release = &submits[1].1[0];
        let compute_batch = &submits[2].1;
        assert_eq!(compute_batch.len(), 2);
        assert_eq!(compute_batch[1].command_buffer, main);

        for helper in [release.command_buffer, compute_batch[0].command_buffer] {
            let transfers: Vec<_> = image_barriers(&headless, helper)
                .into_iter()
                .filter(|b| b.src_queue_family_index != b.dst_queue_family_index)
                .collect();
            assert_eq!(transfers.len(), 1);
            let barrier = transfers[0];
            assert_eq!(barrier.image, image.handle());
            assert_eq!(
                (barrier.src_queue_family_index, barrier.dst_queue_family_index),
                (0, 1)
            );
            assert_eq!(barrier.old_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
            assert_eq!(barrier.new_layout, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        }
        // The acquire waits for the release.
        assert!(
            compute_batch[0]
                .wait_semaphores
                .iter()
                .any(|s| release.signal_semaphores[1..].contains(s))
        );
    }

    #[test]
    fn test_back_buffer_acquire_is_waited_on_once() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        let swap_chain = SwapChain::new(headless.clone(), &SwapChainDesc::default()).unwrap();
        let window = || Some(RenderTarget::Window(swap_chain.clone()));

        let mut cb = device.create_command_buffer(QueueType::Graphics, 0).unwrap();
        cb.set_render_target(window(), FramebufferBuffers::empty(), RenderSurfaceMask::empty())
            .unwrap();
        let acquire = swap_chain.back_buffer().semaphore.handle();
        assert!(swap_chain.back_buffer().needs_wait);
        cb.submit(&mut device, 0).unwrap();
        assert!(!swap_chain.back_buffer().needs_wait);
        assert!(swap_chain.back_buffer().acquired);

        // Rendering to the same back buffer again before presenting.
        cb.set_render_target(window(), FramebufferBuffers::empty(), RenderSurfaceMask::empty())
            .unwrap();
        cb.submit(&mut device, 0).unwrap();

        let submits = batches(&headless);
        assert_eq!(submits.len(), 2);
        assert_eq!(submits[0].1[0].wait_semaphores, vec![acquire]);
        let last = submits[0].1.last().unwrap();
        assert_eq!(
            submits[1].1[0].wait_semaphores,
            vec![last.signal_semaphores[0]]
        );
        assert!(
            submits[1]
                .1
                .iter()
                .all(|batch| !batch.wait_semaphores.contains(&acquire))
        );
    }

    #[test]
    fn test_wait_idle_reclaims_everything() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut device = device(&headless);
        headless.set_manual_fences(true);
        let mut cb = device.create_command_buffer(QueueType::Compute, 0).unwrap();
        cb.submit(&mut device, 0).unwrap();
        assert!(device.queue(QueueType::Compute, 0).is_executing());
        device.wait_idle().unwrap();
        assert!(!device.queue(QueueType::Compute, 0).is_executing());
    }
}
