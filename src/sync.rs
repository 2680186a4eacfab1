//! Binary semaphores and events.
//!
//! Every command buffer submission signals freshly allocated binary semaphores: one that
//! the next submission on the same queue waits on, and a few that other queues may ask
//! for. A binary semaphore can only be reused once some wait has consumed its signal, so
//! a [`Semaphore`] goes back to its [`SemaphorePool`] only after it was marked consumed.
//! Signaled semaphores that nobody waited on are destroyed instead.
use std::{
    fmt::Debug,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ash::{prelude::VkResult, vk};
use crossbeam_channel::{Receiver, Sender};

use crate::{
    driver::Driver,
    resource::{Resource, ResourceUsage},
    utils::AsVkHandle,
};

pub struct Semaphore {
    driver: Arc<dyn Driver>,
    handle: vk::Semaphore,
    usage: ResourceUsage,
    consumed: AtomicBool,
    recycler: Option<Sender<vk::Semaphore>>,
}
impl Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("handle", &self.handle)
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Semaphore {
    /// A standalone semaphore that is destroyed when dropped.
    pub fn new(driver: Arc<dyn Driver>) -> VkResult<Self> {
        let handle = driver.create_semaphore()?;
        Ok(Self {
            driver,
            handle,
            usage: ResourceUsage::default(),
            consumed: AtomicBool::new(false),
            recycler: None,
        })
    }
    pub fn handle(&self) -> vk::Semaphore {
        self.handle
    }
    /// Records that a completed submission waited on this semaphore, leaving it unsignaled.
    pub(crate) fn mark_consumed(&self) {
        self.consumed.store(true, Ordering::Relaxed);
    }
    pub fn is_consumed(&self) -> bool {
        self.consumed.load(Ordering::Relaxed)
    }
}

impl AsVkHandle for Semaphore {
    type Handle = vk::Semaphore;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for Semaphore {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        if self.is_consumed()
            && let Some(recycler) = self.recycler.take()
            && recycler.send(self.handle).is_ok()
        {
            return;
        }
        self.driver.destroy_semaphore(self.handle);
    }
}

/// Recycles consumed semaphores of one queue.
pub struct SemaphorePool {
    driver: Arc<dyn Driver>,
    free: Vec<vk::Semaphore>,
    sender: Sender<vk::Semaphore>,
    receiver: Receiver<vk::Semaphore>,
}

impl SemaphorePool {
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            driver,
            free: Vec::new(),
            sender,
            receiver,
        }
    }

    pub fn allocate(&mut self) -> VkResult<Arc<Semaphore>> {
        self.free.extend(self.receiver.try_iter());
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => {
                tracing::trace!("creating semaphore");
                self.driver.create_semaphore()?
            }
        };
        Ok(Arc::new(Semaphore {
            driver: self.driver.clone(),
            handle,
            usage: ResourceUsage::default(),
            consumed: AtomicBool::new(false),
            recycler: Some(self.sender.clone()),
        }))
    }

    /// Semaphores waiting for reuse.
    pub fn available(&mut self) -> usize {
        self.free.extend(self.receiver.try_iter());
        self.free.len()
    }
}

impl Drop for SemaphorePool {
    fn drop(&mut self) {
        self.free.extend(self.receiver.try_iter());
        for handle in self.free.drain(..) {
            self.driver.destroy_semaphore(handle);
        }
    }
}

pub struct Event {
    driver: Arc<dyn Driver>,
    handle: vk::Event,
    usage: ResourceUsage,
}

impl Event {
    pub fn new(driver: Arc<dyn Driver>) -> VkResult<Self> {
        let handle = driver.create_event()?;
        Ok(Self {
            driver,
            handle,
            usage: ResourceUsage::default(),
        })
    }
    pub fn handle(&self) -> vk::Event {
        self.handle
    }
}

impl Resource for Event {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        self.driver.destroy_event(self.handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::HeadlessDriver;

    #[test]
    fn test_consumed_semaphores_are_recycled() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = SemaphorePool::new(headless.clone());
        let semaphore = pool.allocate().unwrap();
        let handle = semaphore.handle();
        semaphore.mark_consumed();
        drop(semaphore);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.allocate().unwrap().handle(), handle);
    }

    /// A signal nobody waited on cannot be reused.
    #[test]
    fn test_unconsumed_semaphores_are_destroyed() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = SemaphorePool::new(headless.clone());
        let semaphore = pool.allocate().unwrap();
        assert_eq!(headless.live_semaphores(), 1);
        drop(semaphore);
        assert_eq!(pool.available(), 0);
        assert_eq!(headless.live_semaphores(), 0);
    }

    #[test]
    fn test_pool_drop_destroys_free_semaphores() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = SemaphorePool::new(headless.clone());
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        a.mark_consumed();
        b.mark_consumed();
        drop((a, b));
        drop(pool);
        assert_eq!(headless.live_semaphores(), 0);
    }
}
