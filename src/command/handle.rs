use std::ops::{Deref, DerefMut};

use ash::prelude::VkResult;
use crossbeam_channel::Sender;

use super::CmdBuffer;
use crate::{device::Device, queue::QueueType};

/// The command buffer the application records into.
///
/// Owns one [`CmdBuffer`] at a time. [`CommandBuffer::submit`] hands the recorded buffer
/// to its queue and continues with a fresh one, so the handle can be recorded into again
/// right away. Queries still running when the buffer is submitted carry over to the
/// next one.
pub struct CommandBuffer {
    buffer: Option<Box<CmdBuffer>>,
    ty: QueueType,
    queue_idx: u32,
    /// Sync mask bits of the queue this handle submits to.
    id_mask: u32,
    recycler: Sender<Box<CmdBuffer>>,
}

impl CommandBuffer {
    pub(crate) fn new(
        buffer: Box<CmdBuffer>,
        ty: QueueType,
        queue_idx: u32,
        id_mask: u32,
        recycler: Sender<Box<CmdBuffer>>,
    ) -> Self {
        Self {
            buffer: Some(buffer),
            ty,
            queue_idx,
            id_mask,
            recycler,
        }
    }

    pub fn queue_type(&self) -> QueueType {
        self.ty
    }
    pub fn queue_idx(&self) -> u32 {
        self.queue_idx
    }
    /// Sync mask bits of every queue this handle may submit to.
    pub fn id_mask(&self) -> u32 {
        self.id_mask
    }

    /// Submits everything recorded so far.
    ///
    /// `sync_mask` selects queues whose last submission has to complete before this one
    /// starts. Bits of this handle's own queue are ignored, since submissions on one queue
    /// are already ordered.
    ///
    /// When no fresh buffer can be allocated the error is returned before anything is
    /// submitted, and queries that were in progress stay interrupted.
    pub fn submit(&mut self, device: &mut Device, sync_mask: u32) -> VkResult<()> {
        let sync_mask = sync_mask & !self.id_mask;
        let cb = self.buffer_mut();
        if cb.is_in_render_pass() {
            cb.end_render_pass();
        }
        cb.execute_layout_transitions();

        let queries = cb.in_progress_queries();
        for query in &queries {
            query.interrupt(cb);
        }
        if cb.is_recording() {
            cb.end()?;
        }

        let fresh = device.command_pool_mut().get_buffer(cb.queue_family())?;
        let Some(recorded) = self.buffer.replace(fresh) else {
            unreachable!("command buffer handle without a buffer");
        };
        let submitted = device
            .submit_command_buffer(recorded, self.ty, self.queue_idx, sync_mask)
            .and_then(|()| device.refresh_states());

        // Queries keep running in the fresh buffer even when the submission failed.
        for query in queries {
            query.resume(self.buffer_mut(), device.query_pool_mut())?;
        }
        submitted
    }

    fn buffer_mut(&mut self) -> &mut CmdBuffer {
        match self.buffer.as_deref_mut() {
            Some(buffer) => buffer,
            None => unreachable!("command buffer handle without a buffer"),
        }
    }
}

impl Deref for CommandBuffer {
    type Target = CmdBuffer;
    fn deref(&self) -> &CmdBuffer {
        match self.buffer.as_deref() {
            Some(buffer) => buffer,
            None => unreachable!("command buffer handle without a buffer"),
        }
    }
}

impl DerefMut for CommandBuffer {
    fn deref_mut(&mut self) -> &mut CmdBuffer {
        self.buffer_mut()
    }
}

impl Drop for CommandBuffer {
    fn drop(&mut self) {
        if let Some(mut buffer) = self.buffer.take() {
            buffer.reset();
            // Without a pool to return to, the buffer frees itself.
            let _ = self.recycler.send(buffer);
        }
    }
}
