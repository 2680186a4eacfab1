use std::{collections::HashMap, sync::Arc};

use ash::{prelude::VkResult, vk};
use crossbeam_channel::{Receiver, Sender};

use super::{CmdBuffer, CmdBufferState};
use crate::driver::Driver;

/// A native command pool of one queue family.
pub struct NativePool {
    driver: Arc<dyn Driver>,
    handle: vk::CommandPool,
    queue_family: u32,
}

impl NativePool {
    fn new(driver: Arc<dyn Driver>, queue_family: u32) -> VkResult<Self> {
        let handle = driver.create_command_pool(queue_family)?;
        Ok(Self {
            driver,
            handle,
            queue_family,
        })
    }
    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }
}

impl Drop for NativePool {
    fn drop(&mut self) {
        self.driver.destroy_command_pool(self.handle);
    }
}

struct FamilyPool {
    pool: Arc<NativePool>,
    free: Vec<Box<CmdBuffer>>,
    created: usize,
}

/// Reusable command buffers, per queue family.
///
/// Buffers handed out by [`CommandBufferPool::get_buffer`] come back through the channel
/// returned by [`CommandBufferPool::recycler`] once their submission completed, or when
/// they are dropped without being submitted.
pub struct CommandBufferPool {
    driver: Arc<dyn Driver>,
    pools: HashMap<u32, FamilyPool>,
    capacity: usize,
    fence_timeout: u64,
    sender: Sender<Box<CmdBuffer>>,
    receiver: Receiver<Box<CmdBuffer>>,
}

impl CommandBufferPool {
    pub fn new(
        driver: Arc<dyn Driver>,
        queue_families: impl IntoIterator<Item = u32>,
        capacity: usize,
        fence_timeout: u64,
    ) -> VkResult<Self> {
        let mut pools = HashMap::new();
        for family in queue_families {
            if pools.contains_key(&family) {
                continue;
            }
            tracing::info!(family, capacity, "creating command pool");
            pools.insert(
                family,
                FamilyPool {
                    pool: Arc::new(NativePool::new(driver.clone(), family)?),
                    free: Vec::new(),
                    created: 0,
                },
            );
        }
        let (sender, receiver) = crossbeam_channel::unbounded();
        Ok(Self {
            driver,
            pools,
            capacity,
            fence_timeout,
            sender,
            receiver,
        })
    }

    /// Channel through which finished command buffers return to the pool.
    pub fn recycler(&self) -> Sender<Box<CmdBuffer>> {
        self.sender.clone()
    }

    fn reclaim(&mut self) {
        while let Ok(mut buffer) = self.receiver.try_recv() {
            if buffer.state() != CmdBufferState::Ready {
                buffer.reset();
            }
            match self.pools.get_mut(&buffer.queue_family()) {
                Some(family) => family.free.push(buffer),
                None => tracing::warn!(
                    family = buffer.queue_family(),
                    "Dropping a command buffer of an unknown queue family"
                ),
            }
        }
    }

    /// Returns a command buffer of `queue_family` in the recording state.
    ///
    /// # Panics
    /// When the family has no pool, or all of its buffers are in use.
    pub fn get_buffer(&mut self, queue_family: u32) -> VkResult<Box<CmdBuffer>> {
        self.reclaim();
        let family = self
            .pools
            .get_mut(&queue_family)
            .unwrap_or_else(|| panic!("No command pool for queue family {queue_family}"));
        let mut buffer = match family.free.pop() {
            Some(buffer) => buffer,
            None => {
                assert!(
                    family.created < self.capacity,
                    "Too many command buffers allocated. Limit is {}.",
                    self.capacity
                );
                let buffer = CmdBuffer::new(
                    self.driver.clone(),
                    family.pool.clone(),
                    family.created as u32,
                    self.fence_timeout,
                )?;
                family.created += 1;
                tracing::trace!(queue_family, id = buffer.id(), "allocated command buffer");
                Box::new(buffer)
            }
        };
        buffer.begin()?;
        Ok(buffer)
    }

    /// Number of native command buffers allocated for `queue_family`.
    pub fn allocated(&self, queue_family: u32) -> usize {
        self.pools
            .get(&queue_family)
            .map_or(0, |family| family.created)
    }

    /// Buffers of `queue_family` waiting to be handed out again.
    pub fn available(&mut self, queue_family: u32) -> usize {
        self.reclaim();
        self.pools
            .get(&queue_family)
            .map_or(0, |family| family.free.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HeadlessDriver;

    #[test]
    fn test_buffers_are_recycled() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless.clone(), [0, 0, 2], 4, 0).unwrap();
        let first = pool.get_buffer(0).unwrap();
        assert!(first.is_recording());
        let id = first.id();
        pool.recycler().send(first).unwrap();
        assert_eq!(pool.available(0), 1);
        let again = pool.get_buffer(0).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.allocated(0), 1);
        assert_eq!(pool.allocated(2), 0);
    }

    #[test]
    fn test_reset_when_ready_notifies_nothing() {
        use crate::{
            driver::Recorded,
            resource::{Resource, UseFlags},
            sync::Event,
        };

        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless.clone(), [0], 4, 0).unwrap();
        let mut buffer = pool.get_buffer(0).unwrap();
        let event = Arc::new(Event::new(headless.clone()).unwrap());
        buffer.register_resource(event.clone(), UseFlags::WRITE);
        assert_eq!(event.usage().bound_handles(), 1);

        buffer.reset();
        assert_eq!(event.usage().bound_handles(), 0);
        assert_eq!(buffer.state(), CmdBufferState::Ready);

        headless.take_log();
        buffer.reset();
        assert_eq!(event.usage().bound_handles(), 0);
        assert!(
            !headless
                .log()
                .iter()
                .any(|c| matches!(c, Recorded::Reset { .. }))
        );
    }

    #[test]
    #[should_panic(expected = "Too many command buffers allocated")]
    fn test_pool_overflow_panics() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = CommandBufferPool::new(headless, [0], 2, 0).unwrap();
        let _a = pool.get_buffer(0).unwrap();
        let _b = pool.get_buffer(0).unwrap();
        let _c = pool.get_buffer(0).unwrap();
    }
}
