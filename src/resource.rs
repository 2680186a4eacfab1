//! Lifetime bookkeeping shared by every GPU object a command buffer can reference.
//!
//! A command buffer reports four events to each resource it references:
//!
//! 1. [`Resource::notify_bound`] when the resource is first registered with a recording,
//! 2. [`Resource::notify_used`] when that recording is submitted,
//! 3. [`Resource::notify_done`] when the submission has completed on the GPU,
//! 4. [`Resource::notify_unbound`] when the recording is reset without having been submitted.
//!
//! [`ResourceUsage`] counts these events so a resource can tell whether it is still
//! referenced by any recording or in-flight submission, and which queues it was last
//! used on.
use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use ash::vk;
use bitflags::bitflags;

use crate::{MAX_QUEUES_PER_TYPE, queue::QUEUE_TYPE_COUNT};

/// Number of distinct global queue indices.
pub const MAX_UNIQUE_QUEUES: usize = QUEUE_TYPE_COUNT * MAX_QUEUES_PER_TYPE as usize;

bitflags! {
    /// Kind of access a command buffer makes to a resource.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UseFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// Process-unique identity of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId(u64);

impl ResourceId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

#[derive(Debug, Default)]
struct UsageCounters {
    bound: u32,
    used: u32,
    read_uses: [u32; MAX_UNIQUE_QUEUES],
    write_uses: [u32; MAX_UNIQUE_QUEUES],
    queue_family: Option<u32>,
}

/// Counters of outstanding command buffer references to one resource.
#[derive(Debug)]
pub struct ResourceUsage {
    id: ResourceId,
    exclusive: bool,
    counters: Mutex<UsageCounters>,
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ResourceUsage {
    /// `exclusive` resources belong to one queue family at a time and need an ownership
    /// transfer when used on another.
    pub fn new(exclusive: bool) -> Self {
        Self {
            id: ResourceId::next(),
            exclusive,
            counters: Mutex::default(),
        }
    }
    pub fn id(&self) -> ResourceId {
        self.id
    }
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
    /// Queue family the resource was last used on, if it was used at all.
    pub fn queue_family(&self) -> Option<u32> {
        self.lock().queue_family
    }
    /// Number of command buffers that have the resource registered but not yet submitted.
    pub fn bound_handles(&self) -> u32 {
        self.lock().bound
    }
    /// Number of submitted command buffers that reference the resource and have not
    /// completed.
    pub fn used_handles(&self) -> u32 {
        self.lock().used
    }
    pub fn is_bound(&self) -> bool {
        let counters = self.lock();
        counters.bound > 0 || counters.used > 0
    }
    pub fn is_used(&self) -> bool {
        self.lock().used > 0
    }
    /// Bit mask of global queue indices with an outstanding use of the given kind.
    pub fn use_mask(&self, flags: UseFlags) -> u32 {
        let counters = self.lock();
        let mut mask = 0;
        for i in 0..MAX_UNIQUE_QUEUES {
            let reading = flags.contains(UseFlags::READ) && counters.read_uses[i] > 0;
            let writing = flags.contains(UseFlags::WRITE) && counters.write_uses[i] > 0;
            if reading || writing {
                mask |= 1 << i;
            }
        }
        mask
    }

    pub fn notify_bound(&self) {
        self.lock().bound += 1;
    }
    pub fn notify_used(&self, global_queue_idx: u32, queue_family: u32, flags: UseFlags) {
        let mut counters = self.lock();
        assert!(counters.bound > 0, "Resource used without being bound");
        counters.bound -= 1;
        counters.used += 1;
        let idx = global_queue_idx as usize;
        if flags.contains(UseFlags::READ) {
            counters.read_uses[idx] += 1;
        }
        if flags.contains(UseFlags::WRITE) {
            counters.write_uses[idx] += 1;
        }
        counters.queue_family = Some(queue_family);
    }
    pub fn notify_unbound(&self) {
        let mut counters = self.lock();
        assert!(counters.bound > 0, "Resource unbound more times than it was bound");
        counters.bound -= 1;
    }
    pub fn notify_done(&self, global_queue_idx: u32, flags: UseFlags) {
        let mut counters = self.lock();
        assert!(counters.used > 0, "Resource completed more times than it was used");
        counters.used -= 1;
        let idx = global_queue_idx as usize;
        if flags.contains(UseFlags::READ) {
            counters.read_uses[idx] = counters.read_uses[idx].saturating_sub(1);
        }
        if flags.contains(UseFlags::WRITE) {
            counters.write_uses[idx] = counters.write_uses[idx].saturating_sub(1);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, UsageCounters> {
        // The counters stay consistent even if a holder panicked.
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Anything a command buffer keeps alive and reports its use to.
pub trait Resource: Send + Sync {
    fn usage(&self) -> &ResourceUsage;

    fn id(&self) -> ResourceId {
        self.usage().id()
    }
    fn notify_bound(&self) {
        self.usage().notify_bound();
    }
    fn notify_used(&self, global_queue_idx: u32, queue_family: u32, flags: UseFlags) {
        self.usage()
            .notify_used(global_queue_idx, queue_family, flags);
    }
    fn notify_unbound(&self) {
        self.usage().notify_unbound();
    }
    fn notify_done(&self, global_queue_idx: u32, flags: UseFlags) {
        self.usage().notify_done(global_queue_idx, flags);
    }
}

/// Queue family a resource has to be transferred from before it can be used on
/// `target_family`, if any.
pub(crate) fn ownership_source(usage: &ResourceUsage, target_family: u32) -> Option<u32> {
    if !usage.is_exclusive() {
        return None;
    }
    match usage.queue_family() {
        Some(family) if family != target_family && family != vk::QUEUE_FAMILY_IGNORED => {
            Some(family)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_counters() {
        let usage = ResourceUsage::new(true);
        usage.notify_bound();
        assert!(usage.is_bound());
        assert!(!usage.is_used());
        usage.notify_used(9, 1, UseFlags::WRITE);
        assert_eq!(usage.bound_handles(), 0);
        assert_eq!(usage.used_handles(), 1);
        assert_eq!(usage.queue_family(), Some(1));
        assert_eq!(usage.use_mask(UseFlags::WRITE), 1 << 9);
        assert_eq!(usage.use_mask(UseFlags::READ), 0);
        usage.notify_done(9, UseFlags::WRITE);
        assert!(!usage.is_bound());
        assert_eq!(usage.use_mask(UseFlags::WRITE), 0);
    }

    #[test]
    fn test_ownership_source() {
        let usage = ResourceUsage::new(true);
        assert_eq!(ownership_source(&usage, 0), None);
        usage.notify_bound();
        usage.notify_used(0, 2, UseFlags::READ);
        assert_eq!(ownership_source(&usage, 0), Some(2));
        assert_eq!(ownership_source(&usage, 2), None);

        let shared = ResourceUsage::new(false);
        shared.notify_bound();
        shared.notify_used(0, 2, UseFlags::READ);
        assert_eq!(ownership_source(&shared, 0), None);
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ResourceUsage::default();
        let b = ResourceUsage::default();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    #[should_panic(expected = "Resource used without being bound")]
    fn test_use_without_bind() {
        ResourceUsage::default().notify_used(0, 0, UseFlags::READ);
    }
}
