//! Queue submission.
//!
//! A [`Queue`] chains its submissions through binary semaphores. Every command buffer
//! signals one intra-queue semaphore, and the next submission on the same queue waits
//! on it unless a present already consumed it. Calling code never has to order work
//! on a single queue by hand.
//!
//! Submissions stay in an active ring until their fence signals. [`Queue::refresh_states`]
//! walks the ring oldest first, and stops at the first submission that has not
//! completed, since a queue completes its work in issue order. Completed command
//! buffers are reset and handed back to their pool.

use std::{collections::VecDeque, sync::Arc};

use ash::{prelude::VkResult, vk};
use crossbeam_channel::Sender;
use smallvec::SmallVec;

use crate::{
    MAX_CB_DEPENDENCIES, MAX_QUEUES_PER_TYPE,
    command::CmdBuffer,
    driver::{Driver, SubmitBatch},
    resource::{Resource, UseFlags},
    swapchain::SwapChain,
    sync::{Semaphore, SemaphorePool},
    utils::AsVkHandle,
};

pub const QUEUE_TYPE_COUNT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueType {
    Graphics,
    Compute,
    /// Transfer-only queues.
    Upload,
}

impl QueueType {
    pub const ALL: [QueueType; QUEUE_TYPE_COUNT] =
        [QueueType::Graphics, QueueType::Compute, QueueType::Upload];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Index of a queue among the queues of every type.
pub fn global_queue_idx(ty: QueueType, index: u32) -> u32 {
    ty.index() as u32 * MAX_QUEUES_PER_TYPE + index
}

pub fn global_queue_mask(ty: QueueType, index: u32) -> u32 {
    1 << global_queue_idx(ty, index)
}

/// Inverse of [`global_queue_idx`].
pub fn queue_idx_and_type(global_idx: u32) -> (QueueType, u32) {
    let ty = QueueType::ALL[(global_idx / MAX_QUEUES_PER_TYPE) as usize];
    (ty, global_idx % MAX_QUEUES_PER_TYPE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// No back buffer was acquired, so nothing was presented.
    Skipped,
    Presented,
    /// Presented, but the swap chain no longer matches the surface exactly.
    Suboptimal,
    /// The swap chain has to be recreated.
    OutOfDate,
}

struct Submission {
    submit_idx: u64,
    /// `None` for presents, which carry no command buffers.
    fence: Option<vk::Fence>,
    command_buffers: Vec<Box<CmdBuffer>>,
    waits: Vec<Arc<Semaphore>>,
}

pub struct Queue {
    driver: Arc<dyn Driver>,
    handle: vk::Queue,
    ty: QueueType,
    index: u32,
    family_index: u32,
    semaphores: SemaphorePool,
    /// Signaled by the last command buffer submitted here and not yet waited on.
    last_intra_semaphore: Option<Arc<Semaphore>>,
    active: VecDeque<Submission>,
    queued: Vec<(Box<CmdBuffer>, Vec<Arc<Semaphore>>)>,
    next_submit_idx: u64,
    recycler: Sender<Box<CmdBuffer>>,
}

impl AsVkHandle for Queue {
    type Handle = vk::Queue;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Queue {
    pub(crate) fn new(
        driver: Arc<dyn Driver>,
        ty: QueueType,
        index: u32,
        family_index: u32,
        recycler: Sender<Box<CmdBuffer>>,
    ) -> Self {
        let handle = driver.get_queue(family_index, index);
        Self {
            semaphores: SemaphorePool::new(driver.clone()),
            driver,
            handle,
            ty,
            index,
            family_index,
            last_intra_semaphore: None,
            active: VecDeque::new(),
            queued: Vec::new(),
            next_submit_idx: 0,
            recycler,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.ty
    }
    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn family_index(&self) -> u32 {
        self.family_index
    }
    pub fn global_idx(&self) -> u32 {
        global_queue_idx(self.ty, self.index)
    }
    /// Whether any submission has not been reclaimed yet.
    pub fn is_executing(&self) -> bool {
        !self.active.is_empty()
    }
    pub fn active_submissions(&self) -> usize {
        self.active.len()
    }
    /// Submit index the next call to [`Queue::submit_queued`] will use.
    pub fn next_submit_idx(&self) -> u64 {
        self.next_submit_idx
    }
    /// Submit indices of the submissions still in flight, oldest first.
    pub fn active_submit_indices(&self) -> Vec<u64> {
        self.active.iter().map(|s| s.submit_idx).collect()
    }

    /// The most recently submitted command buffer still in flight.
    pub(crate) fn last_command_buffer_mut(&mut self) -> Option<&mut CmdBuffer> {
        self.active
            .iter_mut()
            .rev()
            .find_map(|submission| submission.command_buffers.last_mut())
            .map(|cb| &mut **cb)
    }

    pub fn submit(&mut self, cb: Box<CmdBuffer>, waits: &[Arc<Semaphore>]) -> VkResult<()> {
        self.queue_submit(cb, waits);
        self.submit_queued()
    }

    /// Adds a command buffer to the next batch sent by [`Queue::submit_queued`].
    pub fn queue_submit(&mut self, cb: Box<CmdBuffer>, waits: &[Arc<Semaphore>]) {
        assert!(
            cb.is_ready_for_submit(),
            "Command buffer must finish recording before it is submitted"
        );
        self.queued.push((cb, waits.to_vec()));
    }

    /// Submits every queued command buffer in one native call.
    ///
    /// Each command buffer waits on the previous one's intra-queue semaphore. The batch
    /// becomes one ring entry, fenced by its last command buffer.
    pub fn submit_queued(&mut self) -> VkResult<()> {
        if self.queued.is_empty() {
            return Ok(());
        }
        let mut entries = std::mem::take(&mut self.queued);
        let global_idx = self.global_idx();

        let mut all_waits = Vec::new();
        let mut wait_handles: Vec<SmallVec<[vk::Semaphore; 8]>> = Vec::with_capacity(entries.len());
        let mut signal_handles: Vec<[vk::Semaphore; MAX_CB_DEPENDENCIES + 1]> =
            Vec::with_capacity(entries.len());
        for i in 0..entries.len() {
            let mut waits = std::mem::take(&mut entries[i].1);
            if let Some(previous) = self.last_intra_semaphore.take() {
                waits.push(previous);
            }
            for wait in &waits {
                wait.notify_bound();
                wait.notify_used(global_idx, self.family_index, UseFlags::READ | UseFlags::WRITE);
            }
            wait_handles.push(waits.iter().map(|s| s.handle()).collect());
            all_waits.extend(waits);

            let signals = self
                .allocate_signals()
                .and_then(|signals| entries[i].0.reset_fence().map(|()| signals));
            let (intra, inter) = match signals {
                Ok(signals) => signals,
                Err(err) => {
                    self.abort_batch(entries, &all_waits);
                    return Err(err);
                }
            };
            let mut handles = [intra.handle(); MAX_CB_DEPENDENCIES + 1];
            for (slot, semaphore) in handles[1..].iter_mut().zip(inter.iter()) {
                *slot = semaphore.handle();
            }
            signal_handles.push(handles);
            entries[i].0.set_signal_semaphores(intra.clone(), inter);
            self.last_intra_semaphore = Some(intra);
        }

        let fence = entries.last().map(|(cb, _)| cb.fence());
        let result = {
            let batches: Vec<SubmitBatch> = entries
                .iter()
                .zip(wait_handles.iter().zip(signal_handles.iter()))
                .map(|((cb, _), (waits, signals))| SubmitBatch {
                    command_buffer: cb.handle(),
                    wait_semaphores: waits,
                    signal_semaphores: signals,
                })
                .collect();
            self.driver
                .queue_submit(self.handle, &batches, fence.unwrap_or(vk::Fence::null()))
        };
        if let Err(err) = result {
            tracing::error!(?err, queue = global_idx, "queue submission failed");
            self.abort_batch(entries, &all_waits);
            return Err(err);
        }

        let last = entries.len() - 1;
        let command_buffers = entries
            .into_iter()
            .enumerate()
            .map(|(i, (mut cb, _))| {
                cb.mark_submitted(i == last);
                cb
            })
            .collect::<Vec<_>>();
        tracing::trace!(
            queue = global_idx,
            submit_idx = self.next_submit_idx,
            count = command_buffers.len(),
            "submitted command buffers"
        );
        self.active.push_back(Submission {
            submit_idx: self.next_submit_idx,
            fence,
            command_buffers,
            waits: all_waits,
        });
        self.next_submit_idx += 1;
        Ok(())
    }

    fn allocate_signals(
        &mut self,
    ) -> VkResult<(Arc<Semaphore>, SmallVec<[Arc<Semaphore>; MAX_CB_DEPENDENCIES]>)> {
        let intra = self.semaphores.allocate()?;
        let mut inter = SmallVec::new();
        for _ in 0..MAX_CB_DEPENDENCIES {
            inter.push(self.semaphores.allocate()?);
        }
        Ok((intra, inter))
    }

    /// Returns the buffers of a batch that never reached the queue to their pool.
    fn abort_batch(
        &mut self,
        entries: Vec<(Box<CmdBuffer>, Vec<Arc<Semaphore>>)>,
        waits: &[Arc<Semaphore>],
    ) {
        let global_idx = self.global_idx();
        for wait in waits {
            wait.notify_done(global_idx, UseFlags::READ | UseFlags::WRITE);
        }
        // Nothing signals the semaphore of the failed batch.
        self.last_intra_semaphore = None;
        for (mut cb, _) in entries {
            // The resources were already reported as used.
            cb.mark_submitted(false);
            cb.reset();
            self.recycle(cb);
        }
    }

    /// Presents the swap chain's current back buffer once the given semaphores and the
    /// last submission on this queue have signaled.
    pub fn present(
        &mut self,
        swap_chain: &SwapChain,
        waits: &[Arc<Semaphore>],
    ) -> VkResult<PresentOutcome> {
        let Some(image_index) = swap_chain.prepare_for_present() else {
            return Ok(PresentOutcome::Skipped);
        };
        let mut waits = waits.to_vec();
        if let Some(previous) = self.last_intra_semaphore.take() {
            waits.push(previous);
        }
        let global_idx = self.global_idx();
        for wait in &waits {
            wait.notify_bound();
            wait.notify_used(global_idx, self.family_index, UseFlags::READ | UseFlags::WRITE);
        }
        let handles: SmallVec<[vk::Semaphore; 8]> = waits.iter().map(|s| s.handle()).collect();
        let result =
            self.driver
                .queue_present(self.handle, swap_chain.handle(), image_index, &handles);

        self.active.push_back(Submission {
            submit_idx: self.next_submit_idx,
            fence: None,
            command_buffers: Vec::new(),
            waits,
        });
        self.next_submit_idx += 1;

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(err) => Err(err),
        }
    }

    /// Reclaims completed submissions, oldest first.
    ///
    /// Stops at the first submission whose fence has not signaled. With `force_wait`
    /// that fence is waited on instead. With `queue_empty` every submission is treated
    /// as complete. Presents have no fence and are reclaimed together with the next
    /// command buffer submission that completes.
    pub fn refresh_states(&mut self, force_wait: bool, queue_empty: bool) -> VkResult<()> {
        loop {
            let Some(fenced) = self.active.iter().position(|s| s.fence.is_some()) else {
                if queue_empty {
                    while let Some(submission) = self.active.pop_front() {
                        self.release(submission);
                    }
                }
                return Ok(());
            };
            let complete = if queue_empty {
                true
            } else {
                let fence = self.active[fenced].fence.unwrap_or(vk::Fence::null());
                let timeout = if force_wait { u64::MAX } else { 0 };
                self.driver.wait_for_fence(fence, timeout)?
            };
            if !complete {
                return Ok(());
            }
            for submission in self.active.drain(..=fenced).collect::<Vec<_>>() {
                self.release(submission);
            }
        }
    }

    /// Blocks until the queue is idle, then reclaims everything.
    pub fn wait_idle(&mut self) -> VkResult<()> {
        self.driver.queue_wait_idle(self.handle)?;
        self.refresh_states(false, true)
    }

    fn release(&mut self, submission: Submission) {
        let global_idx = self.global_idx();
        for wait in &submission.waits {
            wait.notify_done(global_idx, UseFlags::READ | UseFlags::WRITE);
            wait.mark_consumed();
        }
        tracing::trace!(
            queue = global_idx,
            submit_idx = submission.submit_idx,
            "submission complete"
        );
        for mut cb in submission.command_buffers {
            cb.reset();
            self.recycle(cb);
        }
    }

    fn recycle(&self, cb: Box<CmdBuffer>) {
        // The pool is gone during shutdown; the buffer then frees itself.
        let _ = self.recycler.send(cb);
    }
}

impl Drop for Queue {
    fn drop(&mut self) {
        if let Err(err) = self.driver.queue_wait_idle(self.handle) {
            tracing::warn!(?err, "failed to wait for queue idle during shutdown");
        }
        for (mut cb, _) in std::mem::take(&mut self.queued) {
            cb.reset();
            self.recycle(cb);
        }
        let _ = self.refresh_states(false, true);
    }
}
