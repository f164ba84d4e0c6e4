//! Clock Buffer Pool Block
//!
//! A fixed-size page cache using the **CLOCK** (second-chance) eviction algorithm.
//! The clock hand sweeps through frames: if the reference bit is set, it clears it
//! and moves on; if the reference bit is unset, that page is evicted.
//!
//! ## Why CLOCK over LRU?
//!
//! CLOCK approximates LRU with O(1) work on a hit (set one bit, no reordering).
//! PostgreSQL uses a clock-sweep algorithm for its shared buffer pool because it
//! performs well under concurrent access without the overhead of maintaining a
//! strict LRU order.

use std::collections::BTreeMap;

use super::{BufferPoolBlock, ReplacementPolicy};
use crate::categories::{BlockKind, PageId};
use crate::core::block::{
    BlockCategory, BlockDocumentation, BlockMetadata, Complexity, Reference, ReferenceType,
};

#[derive(Debug, Clone, Copy)]
struct Frame {
    page: PageId,
    referenced: bool,
}

/// Second-chance replacement over a fixed ring of frames
#[derive(Debug, Clone, Default)]
pub struct ClockPolicy {
    frames: Vec<Option<Frame>>,
    /// page → frame index
    slots: BTreeMap<PageId, usize>,
    free: Vec<usize>,
    hand: usize,
    /// Full rotations of the hand
    sweeps: u64,
}

impl ClockPolicy {
    fn advance(&mut self) {
        self.hand += 1;
        if self.hand >= self.frames.len() {
            self.hand = 0;
            self.sweeps += 1;
        }
    }

    pub fn hand(&self) -> usize {
        self.hand
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }
}

impl ReplacementPolicy for ClockPolicy {
    const KIND: BlockKind = BlockKind::ClockBuffer;

    fn with_capacity(capacity: usize) -> Self {
        Self {
            frames: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    fn build_metadata() -> BlockMetadata {
        BlockMetadata {
            id: "clock_buffer".into(),
            name: "Clock Buffer Pool".into(),
            category: BlockCategory::Buffer,
            description: "Page cache with CLOCK (second-chance) eviction".into(),
            version: "1.0.0".into(),
            documentation: BlockDocumentation {
                overview: "CLOCK arranges frames in a ring with one reference bit each. A hit \
                           only sets the bit; eviction sweeps the hand, giving referenced \
                           pages a second chance."
                    .into(),
                algorithm: "Hit: set the reference bit. Miss: advance the hand, clearing set \
                            bits, until a frame with a clear bit is found; evict it."
                    .into(),
                complexity: Complexity {
                    time: "O(1) hit, O(n) worst-case eviction".into(),
                    space: "O(capacity) frames plus one bit each".into(),
                },
                use_cases: vec![
                    "Shared buffer pools under concurrent access".into(),
                    "Approximating LRU cheaply".into(),
                ],
                tradeoffs: vec![
                    "Coarser recency information than LRU".into(),
                    "Eviction cost depends on how many bits are set".into(),
                ],
            },
            references: vec![Reference {
                ref_type: ReferenceType::Implementation,
                title: "PostgreSQL buffer manager (src/backend/storage/buffer/freelist.c)".into(),
                citation: None,
            }],
        }
    }

    fn contains(&self, page: PageId) -> bool {
        self.slots.contains_key(&page)
    }

    fn touch(&mut self, page: PageId) {
        if let Some(&slot) = self.slots.get(&page) {
            if let Some(frame) = self.frames[slot].as_mut() {
                frame.referenced = true;
            }
        }
    }

    fn admit(&mut self, page: PageId) {
        let frame = Some(Frame {
            page,
            referenced: true,
        });
        let slot = match self.free.pop() {
            Some(slot) => {
                self.frames[slot] = frame;
                slot
            }
            None => {
                self.frames.push(frame);
                self.frames.len() - 1
            }
        };
        self.slots.insert(page, slot);
    }

    fn victim(&mut self) -> Option<PageId> {
        if self.slots.is_empty() {
            return None;
        }
        // Two rotations always suffice: the first clears every bit.
        for _ in 0..2 * self.frames.len() {
            let hand = self.hand;
            match self.frames[hand].as_mut() {
                Some(frame) if frame.referenced => {
                    frame.referenced = false;
                }
                Some(frame) => {
                    let page = frame.page;
                    self.frames[hand] = None;
                    self.slots.remove(&page);
                    self.free.push(hand);
                    self.advance();
                    return Some(page);
                }
                None => {}
            }
            self.advance();
        }
        None
    }

    fn len(&self) -> usize {
        self.slots.len()
    }

    fn gauges(&self) -> Vec<(&'static str, f64)> {
        vec![("clock_hand_sweeps", self.sweeps as f64)]
    }
}

/// CLOCK buffer pool block.
pub type ClockBufferBlock = BufferPoolBlock<ClockPolicy>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::categories::buffer::test_pages;
    use crate::categories::test_support::{build, request};
    use crate::core::block::{Block, ExecutionContext, OperationType};
    use crate::core::metrics::MetricsSink;
    use crate::core::port::{PageRef, PortValue};

    #[test]
    fn test_second_chance() {
        let mut clock = ClockPolicy::with_capacity(3);
        for p in 0..3 {
            clock.admit(PageId(p));
        }
        // Every bit is set: the first sweep clears them, then page 0 goes.
        assert_eq!(clock.victim(), Some(PageId(0)));
        clock.admit(PageId(3));
        clock.touch(PageId(1));
        // Page 1 was referenced again, page 2 was not.
        assert_eq!(clock.victim(), Some(PageId(2)));
        assert!(clock.contains(PageId(1)));
        assert_eq!(clock.len(), 2);
    }

    #[test]
    fn test_empty_pool_has_no_victim() {
        let mut clock = ClockPolicy::with_capacity(2);
        assert_eq!(clock.victim(), None);
    }

    #[tokio::test]
    async fn test_block_differs_from_lru_on_same_trace() {
        let sink = MetricsSink::new(false);
        let storage = test_pages::handle(8, &sink);
        let mut block = build(
            BlockKind::ClockBuffer,
            "clock",
            &[("capacity_pages", 2i64.into())],
            &sink,
            Some(storage),
        )
        .await;

        let trace = [0u64, 1, 0, 2, 1];
        let ctx = ExecutionContext::new(request(1, OperationType::Select, 0)).with_input(
            "pages",
            PortValue::Pages(trace.iter().map(|&i| PageRef::new(PageId(i))).collect()),
        );
        block.execute(ctx).await.unwrap();

        // LRU evicts page 1 for page 2; CLOCK sweeps to page 0 instead.
        let id = "clock".into();
        assert_eq!(sink.counter(&id, "cache_hits"), 2.0);
        assert_eq!(sink.counter(&id, "cache_misses"), 3.0);
        assert_eq!(sink.counter(&id, "evictions"), 1.0);
        assert!(block.snapshot_metrics()["clock_hand_sweeps"] >= 1.0);
    }
}
