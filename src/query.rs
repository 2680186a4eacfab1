//! Timer and occlusion queries.
//!
//! Query slots come from a [`QueryPool`], which groups them into native pools of a fixed
//! block size and creates another block once every slot is taken.
//!
//! A [`Query`] may span more than one command buffer. When a command buffer is submitted
//! while a query is still running, the query is interrupted: the open (begin, end) pair is
//! closed on the outgoing buffer and a new pair is opened on the buffer that replaces it.
//! The result is the sum over every pair, available once all of them have been written.
use std::sync::{Arc, Mutex, MutexGuard};

use ash::{prelude::VkResult, vk};
use crossbeam_channel::{Receiver, Sender};

use crate::{
    command::CmdBuffer,
    driver::Driver,
    resource::{Resource, ResourceUsage},
    utils::IdAlloc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    /// Elapsed GPU time, in timestamp ticks.
    Timer,
    /// Number of samples passing the depth and stencil tests.
    Occlusion,
}

impl QueryKind {
    fn vk_type(self) -> vk::QueryType {
        match self {
            QueryKind::Timer => vk::QueryType::TIMESTAMP,
            QueryKind::Occlusion => vk::QueryType::OCCLUSION,
        }
    }
    fn index(self) -> usize {
        self as usize
    }
}

/// One slot of a native query pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QuerySlot {
    pub(crate) pool: vk::QueryPool,
    block: u32,
    pub(crate) index: u32,
    kind: QueryKind,
}

impl QuerySlot {
    pub fn pool(&self) -> vk::QueryPool {
        self.pool
    }
    pub fn index(&self) -> u32 {
        self.index
    }
    pub fn kind(&self) -> QueryKind {
        self.kind
    }
}

struct QueryBlock {
    handle: vk::QueryPool,
    ids: IdAlloc,
}

pub struct QueryPool {
    driver: Arc<dyn Driver>,
    block_size: u32,
    timestamp_period: f32,
    blocks: [Vec<QueryBlock>; 2],
    sender: Sender<QuerySlot>,
    receiver: Receiver<QuerySlot>,
}

impl QueryPool {
    pub fn new(driver: Arc<dyn Driver>, block_size: u32, timestamp_period: f32) -> Self {
        assert!(block_size > 0, "Query block size must not be zero");
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            driver,
            block_size,
            timestamp_period,
            blocks: [Vec::new(), Vec::new()],
            sender,
            receiver,
        }
    }

    /// Takes a free slot of `kind`, creating a new native block when all are in use.
    pub fn allocate(&mut self, kind: QueryKind) -> VkResult<QuerySlot> {
        self.reclaim();
        let blocks = &mut self.blocks[kind.index()];
        for (block, entry) in blocks.iter_mut().enumerate() {
            if let Some(index) = entry.ids.alloc_one() {
                return Ok(QuerySlot {
                    pool: entry.handle,
                    block: block as u32,
                    index,
                    kind,
                });
            }
        }
        let handle = self
            .driver
            .create_query_pool(kind.vk_type(), self.block_size)?;
        tracing::debug!(?kind, block = blocks.len(), size = self.block_size, "creating query block");
        let mut ids = IdAlloc::new(self.block_size);
        let index = match ids.alloc_one() {
            Some(index) => index,
            None => unreachable!("fresh query block has no free slot"),
        };
        blocks.push(QueryBlock { handle, ids });
        Ok(QuerySlot {
            pool: handle,
            block: blocks.len() as u32 - 1,
            index,
            kind,
        })
    }

    pub fn release(&mut self, slot: QuerySlot) {
        match self.blocks[slot.kind.index()].get_mut(slot.block as usize) {
            Some(block) => block.ids.free(slot.index),
            None => tracing::warn!(?slot, "Releasing a query slot of an unknown block"),
        }
    }

    /// Non-blocking read of a slot's result.
    pub fn result(&self, slot: QuerySlot) -> VkResult<Option<u64>> {
        self.driver.query_result(slot.pool, slot.index)
    }

    pub fn ticks_to_ns(&self, ticks: u64) -> u64 {
        (ticks as f64 * self.timestamp_period as f64) as u64
    }

    /// Slots of `kind` currently handed out.
    pub fn allocated(&mut self, kind: QueryKind) -> u32 {
        self.reclaim();
        self.blocks[kind.index()]
            .iter()
            .map(|block| block.ids.allocated())
            .sum()
    }
    pub fn block_count(&self, kind: QueryKind) -> usize {
        self.blocks[kind.index()].len()
    }

    /// Channel through which dropped queries return their slots.
    pub(crate) fn recycler(&self) -> Sender<QuerySlot> {
        self.sender.clone()
    }

    fn reclaim(&mut self) {
        while let Ok(slot) = self.receiver.try_recv() {
            self.release(slot);
        }
    }
}

impl Drop for QueryPool {
    fn drop(&mut self) {
        for block in self.blocks.iter().flatten() {
            self.driver.destroy_query_pool(block.handle);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    NotStarted,
    InProgress,
    /// Paused across a command buffer submission.
    Interrupted,
    Ended,
    /// Every result was read back; holds their sum.
    Finalized(u64),
}

/// One (begin, end) pair. Occlusion queries begin and end on the same slot.
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: QuerySlot,
    end: Option<QuerySlot>,
}

struct QueryInner {
    state: QueryState,
    segments: Vec<Segment>,
}

pub struct Query {
    usage: ResourceUsage,
    kind: QueryKind,
    inner: Mutex<QueryInner>,
    recycler: Sender<QuerySlot>,
}

impl Resource for Query {
    fn usage(&self) -> &ResourceUsage {
        &self.usage
    }
}

impl Query {
    pub fn new(kind: QueryKind, pool: &QueryPool) -> Arc<Self> {
        Arc::new(Self {
            usage: ResourceUsage::default(),
            kind,
            inner: Mutex::new(QueryInner {
                state: QueryState::NotStarted,
                segments: Vec::new(),
            }),
            recycler: pool.recycler(),
        })
    }

    pub fn kind(&self) -> QueryKind {
        self.kind
    }
    pub fn state(&self) -> QueryState {
        self.lock().state
    }
    pub fn is_in_progress(&self) -> bool {
        self.state() == QueryState::InProgress
    }

    /// Starts the query in `cb`. A query that already ended starts over.
    pub fn begin(self: &Arc<Self>, cb: &mut CmdBuffer, pool: &mut QueryPool) -> VkResult<()> {
        {
            let mut inner = self.lock();
            assert!(
                !matches!(inner.state, QueryState::InProgress | QueryState::Interrupted),
                "Query is already in progress"
            );
            for segment in inner.segments.drain(..) {
                Self::release_segment(segment, pool);
            }
        }
        self.open_segment(cb, pool)
    }

    pub fn end(self: &Arc<Self>, cb: &mut CmdBuffer) {
        let mut inner = self.lock();
        assert_eq!(
            inner.state,
            QueryState::InProgress,
            "Query must be in progress to end"
        );
        Self::close_segment(&inner, self.kind, cb);
        inner.state = QueryState::Ended;
        drop(inner);
        cb.register_query(self.clone());
    }

    /// Closes the running pair on `cb`, which is about to be submitted.
    pub fn interrupt(&self, cb: &mut CmdBuffer) {
        let mut inner = self.lock();
        if inner.state != QueryState::InProgress {
            return;
        }
        Self::close_segment(&inner, self.kind, cb);
        inner.state = QueryState::Interrupted;
    }

    /// Opens a new pair on `cb` after an interruption.
    pub fn resume(self: &Arc<Self>, cb: &mut CmdBuffer, pool: &mut QueryPool) -> VkResult<()> {
        assert_eq!(
            self.state(),
            QueryState::Interrupted,
            "Only interrupted queries can be resumed"
        );
        self.open_segment(cb, pool)
    }

    pub fn is_ready(&self, pool: &mut QueryPool) -> VkResult<bool> {
        Ok(self.result(pool)?.is_some())
    }

    /// Sum of all pairs, once the GPU wrote every one of them. Never blocks.
    ///
    /// The first successful read caches the value and returns the slots to the pool.
    pub fn result(&self, pool: &mut QueryPool) -> VkResult<Option<u64>> {
        let mut inner = self.lock();
        match inner.state {
            QueryState::Finalized(value) => return Ok(Some(value)),
            QueryState::Ended => {}
            _ => return Ok(None),
        }
        let mut total = 0u64;
        for segment in &inner.segments {
            let Some(start) = pool.result(segment.start)? else {
                return Ok(None);
            };
            match segment.end {
                Some(end) => {
                    let Some(end) = pool.result(end)? else {
                        return Ok(None);
                    };
                    total += end.saturating_sub(start);
                }
                None => total += start,
            }
        }
        for segment in inner.segments.drain(..) {
            Self::release_segment(segment, pool);
        }
        inner.state = QueryState::Finalized(total);
        Ok(Some(total))
    }

    fn open_segment(self: &Arc<Self>, cb: &mut CmdBuffer, pool: &mut QueryPool) -> VkResult<()> {
        let start = pool.allocate(self.kind)?;
        let end = match self.kind {
            QueryKind::Timer => match pool.allocate(self.kind) {
                Ok(end) => Some(end),
                Err(err) => {
                    pool.release(start);
                    return Err(err);
                }
            },
            QueryKind::Occlusion => None,
        };
        cb.reset_query(start);
        if let Some(end) = end {
            cb.reset_query(end);
        }
        match self.kind {
            QueryKind::Timer => cb.write_timestamp(vk::PipelineStageFlags2::TOP_OF_PIPE, start),
            QueryKind::Occlusion => cb.begin_query(start, vk::QueryControlFlags::empty()),
        }
        {
            let mut inner = self.lock();
            inner.segments.push(Segment { start, end });
            inner.state = QueryState::InProgress;
        }
        cb.register_query(self.clone());
        Ok(())
    }

    fn close_segment(inner: &QueryInner, kind: QueryKind, cb: &mut CmdBuffer) {
        let Some(segment) = inner.segments.last() else {
            return;
        };
        match (kind, segment.end) {
            (QueryKind::Timer, Some(end)) => {
                cb.write_timestamp(vk::PipelineStageFlags2::BOTTOM_OF_PIPE, end)
            }
            _ => cb.end_query(segment.start),
        }
    }

    fn release_segment(segment: Segment, pool: &mut QueryPool) {
        pool.release(segment.start);
        if let Some(end) = segment.end {
            pool.release(end);
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueryInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Query {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for segment in inner.segments.drain(..) {
            let _ = self.recycler.send(segment.start);
            if let Some(end) = segment.end {
                let _ = self.recycler.send(end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        command::CommandBufferPool,
        driver::{HeadlessDriver, Recorded},
    };

    fn timestamps(headless: &HeadlessDriver, cb: vk::CommandBuffer) -> Vec<(vk::QueryPool, u32)> {
        headless
            .commands(cb)
            .into_iter()
            .filter_map(|c| match c {
                Recorded::WriteTimestamp { pool, index, .. } => Some((pool, index)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_blocks_grow_and_slots_recycle() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut pool = QueryPool::new(headless, 2, 1.0);
        let a = pool.allocate(QueryKind::Timer).unwrap();
        let b = pool.allocate(QueryKind::Timer).unwrap();
        let c = pool.allocate(QueryKind::Timer).unwrap();
        assert_eq!(a.pool(), b.pool());
        assert_ne!(a.pool(), c.pool());
        assert_eq!(pool.block_count(QueryKind::Timer), 2);
        assert_eq!(pool.block_count(QueryKind::Occlusion), 0);

        pool.release(b);
        assert_eq!(pool.allocated(QueryKind::Timer), 2);
        assert_eq!(pool.allocate(QueryKind::Timer).unwrap(), b);
    }

    #[test]
    fn test_interrupted_timer_sums_segments() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut cbs = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut pool = QueryPool::new(headless.clone(), 16, 1.0);
        let mut first = cbs.get_buffer(0).unwrap();
        let mut second = cbs.get_buffer(0).unwrap();

        let query = Query::new(QueryKind::Timer, &pool);
        query.begin(&mut first, &mut pool).unwrap();
        assert!(query.is_in_progress());
        assert_eq!(first.in_progress_queries().len(), 1);

        query.interrupt(&mut first);
        assert_eq!(query.state(), QueryState::Interrupted);
        assert!(first.in_progress_queries().is_empty());
        query.resume(&mut second, &mut pool).unwrap();
        query.end(&mut second);
        assert_eq!(query.state(), QueryState::Ended);

        let mut writes = timestamps(&headless, first.handle());
        writes.extend(timestamps(&headless, second.handle()));
        assert_eq!(writes.len(), 4);
        assert!(!query.is_ready(&mut pool).unwrap());

        for ((pool_handle, index), value) in writes.iter().zip([100, 150, 200, 260]) {
            headless.set_query_result(*pool_handle, *index, value);
        }
        assert_eq!(query.result(&mut pool).unwrap(), Some(110));
        assert_eq!(query.state(), QueryState::Finalized(110));
        assert_eq!(pool.allocated(QueryKind::Timer), 0);
    }

    #[test]
    fn test_partial_results_are_not_ready() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut cbs = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut pool = QueryPool::new(headless.clone(), 16, 1.0);
        let mut cb = cbs.get_buffer(0).unwrap();
        let query = Query::new(QueryKind::Timer, &pool);
        query.begin(&mut cb, &mut pool).unwrap();
        query.end(&mut cb);
        let writes = timestamps(&headless, cb.handle());
        headless.set_query_result(writes[0].0, writes[0].1, 5);
        assert_eq!(query.result(&mut pool).unwrap(), None);
        headless.set_query_result(writes[1].0, writes[1].1, 9);
        assert_eq!(query.result(&mut pool).unwrap(), Some(4));
    }

    #[test]
    fn test_occlusion_begins_and_ends_one_slot() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut cbs = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut pool = QueryPool::new(headless.clone(), 16, 1.0);
        let mut cb = cbs.get_buffer(0).unwrap();
        let query = Query::new(QueryKind::Occlusion, &pool);
        query.begin(&mut cb, &mut pool).unwrap();
        query.end(&mut cb);

        let commands = headless.commands(cb.handle());
        assert!(matches!(commands[1], Recorded::ResetQueryPool { count: 1, .. }));
        let begin = commands.iter().find_map(|c| match c {
            Recorded::BeginQuery { pool, index, .. } => Some((*pool, *index)),
            _ => None,
        });
        let end = commands.iter().find_map(|c| match c {
            Recorded::EndQuery { pool, index, .. } => Some((*pool, *index)),
            _ => None,
        });
        assert_eq!(begin, end);
    }

    #[test]
    #[should_panic(expected = "Query is already in progress")]
    fn test_double_begin_panics() {
        let headless = Arc::new(HeadlessDriver::new());
        let mut cbs = CommandBufferPool::new(headless.clone(), [0], 4, 1_000_000).unwrap();
        let mut pool = QueryPool::new(headless, 16, 1.0);
        let mut cb = cbs.get_buffer(0).unwrap();
        let query = Query::new(QueryKind::Occlusion, &pool);
        query.begin(&mut cb, &mut pool).unwrap();
        query.begin(&mut cb, &mut pool).unwrap();
    }
}
