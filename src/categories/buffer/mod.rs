//! Buffer management block implementations
//!
//! Buffer blocks cache pages in memory to reduce storage I/O. Both pools share
//! the same block: pages arrive on `pages`, and on a select each one is
//! served from the pool or read through the upstream storage handle, then
//! leaves on `pages` with its image attached. Only the replacement policy
//! differs between LRU and CLOCK.
//!
//! ## Metrics tracked
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `cache_hits` | Counter | Page requests served from the pool |
//! | `cache_misses` | Counter | Page requests that read through storage |
//! | `evictions` | Counter | Pages evicted to make room |
//! | `page_evicted` | Event | One per eviction |
//! | `hit_ratio` | Gauge | hits / (hits + misses) |
//! | `resident_pages` | Gauge | Pages currently in the pool |

pub mod clock_buffer;
pub mod lru_buffer;

pub use clock_buffer::{ClockBufferBlock, ClockPolicy};
pub use lru_buffer::{LRUBufferBlock, LruPolicy};

use async_trait::async_trait;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

use crate::categories::storage::StorageHandle;
use crate::categories::{BlockKind, PageId};
use crate::core::block::{
    Block, BlockCategory, BlockError, BlockMetadata, BlockState, ExecutionContext,
    ExecutionResult, InitContext,
};
use crate::core::constraint::DependencyConstraint;
use crate::core::metrics::{MetricDefinition, MetricsHandle};
use crate::core::parameter::Parameter;
use crate::core::port::{DataType, PageRef, Port, PortType, PortValue, Record};
use crate::core::registry::BlockDefinition;
use crate::runtime::config::LatencyModel;

/// Page replacement policy of a buffer pool
pub trait ReplacementPolicy: Send + Sync + Sized {
    const KIND: BlockKind;

    fn with_capacity(capacity: usize) -> Self;

    fn build_metadata() -> BlockMetadata;

    fn contains(&self, page: PageId) -> bool;

    /// Record a hit on a resident page
    fn touch(&mut self, page: PageId);

    /// Make a page resident; the caller has made room
    fn admit(&mut self, page: PageId);

    /// Choose a victim and forget it
    fn victim(&mut self) -> Option<PageId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Policy-specific gauges
    fn gauges(&self) -> Vec<(&'static str, f64)> {
        Vec::new()
    }
}

/// A fixed-capacity page cache in front of one storage block
pub struct BufferPool<P: ReplacementPolicy> {
    policy: P,
    capacity: usize,
    storage: Option<StorageHandle>,
    metrics: MetricsHandle,
    latency: LatencyModel,
    hits: u64,
    misses: u64,
}

impl<P: ReplacementPolicy> BufferPool<P> {
    pub fn new(capacity: usize, storage: Option<StorageHandle>, metrics: MetricsHandle, latency: LatencyModel) -> Self {
        let capacity = capacity.max(1);
        Self {
            policy: P::with_capacity(capacity),
            capacity,
            storage,
            metrics,
            latency,
            hits: 0,
            misses: 0,
        }
    }

    /// Serve a page, reading through storage on a miss.
    pub fn get_page(&mut self, page: PageId) -> Vec<Record> {
        if self.policy.contains(page) {
            self.hits += 1;
            self.policy.touch(page);
            self.metrics.increment("cache_hits");
            self.metrics.charge(self.latency.memory_access_us);
            return self.storage.as_ref().map(|s| s.peek_page(page)).unwrap_or_default();
        }

        self.misses += 1;
        self.metrics.increment("cache_misses");
        self.make_room();
        self.policy.admit(page);
        self.storage.as_ref().map(|s| s.read_page(page)).unwrap_or_default()
    }

    /// Make a freshly written page resident without reading it.
    pub fn install(&mut self, page: PageId) {
        if self.policy.contains(page) {
            self.policy.touch(page);
        } else {
            self.make_room();
            self.policy.admit(page);
        }
    }

    fn make_room(&mut self) {
        while self.policy.len() >= self.capacity {
            let Some(victim) = self.policy.victim() else {
                break;
            };
            self.metrics.increment("evictions");
            self.metrics.event("page_evicted", json!({ "page": victim.0 }));
        }
    }

    pub fn contains(&self, page: PageId) -> bool {
        self.policy.contains(page)
    }

    pub fn resident(&self) -> usize {
        self.policy.len()
    }

    /// hits / (hits + misses), 0 before any request
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

// ---------------------------------------------------------------------------
// Shared block
// ---------------------------------------------------------------------------

/// Buffer pool block, generic over its replacement policy
pub struct BufferPoolBlock<P: ReplacementPolicy> {
    pool: BufferPool<P>,
}

impl<P: ReplacementPolicy> BufferPoolBlock<P> {
    pub fn new() -> Self {
        Self {
            pool: BufferPool::new(
                64,
                None,
                MetricsHandle::detached(P::KIND.definition_id()),
                LatencyModel::default(),
            ),
        }
    }

    pub fn definition() -> BlockDefinition {
        BlockDefinition {
            kind: P::KIND,
            metadata: P::build_metadata(),
            inputs: vec![Port::input("pages", "Pages", PortType::PageStream, DataType::PageRef)
                .required()
                .with_description("Pages requested from or written by storage")],
            outputs: vec![Port::output("pages", "Pages", PortType::PageStream, DataType::PageRef)
                .with_description("Requested pages with their images attached")],
            parameters: vec![Parameter::integer("capacity_pages", "Capacity", 64, 1, 1_000_000)
                .with_description("Pages the pool can hold")],
            constraints: vec![DependencyConstraint::upstream_category(
                BlockCategory::Storage,
                "A buffer pool caches the pages of a storage block",
            )],
            capabilities: BTreeSet::new(),
            capability_requirements: Vec::new(),
            metrics: vec![
                MetricDefinition::counter("cache_hits", "pages", "Requests served from the pool"),
                MetricDefinition::counter("cache_misses", "pages", "Requests read through storage"),
                MetricDefinition::counter("evictions", "pages", "Pages evicted"),
                MetricDefinition::event("page_evicted", "A page left the pool"),
                MetricDefinition::gauge("hit_ratio", "ratio", "hits / (hits + misses)"),
                MetricDefinition::gauge("resident_pages", "pages", "Pages in the pool"),
            ],
            entry: false,
        }
    }

    pub fn pool(&self) -> &BufferPool<P> {
        &self.pool
    }
}

impl<P: ReplacementPolicy> Default for BufferPoolBlock<P> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<P: ReplacementPolicy + 'static> Block for BufferPoolBlock<P> {
    fn kind(&self) -> BlockKind {
        P::KIND
    }

    async fn initialize(&mut self, ctx: InitContext) -> Result<(), BlockError> {
        let storage = ctx.require_storage()?;
        self.pool = BufferPool::new(ctx.usize("capacity_pages")?, Some(storage), ctx.metrics, ctx.latency);
        Ok(())
    }

    async fn execute(&mut self, mut ctx: ExecutionContext) -> Result<ExecutionResult, BlockError> {
        let pages = ctx.take("pages").into_pages();
        if pages.is_empty() {
            return Ok(ExecutionResult::empty());
        }

        if ctx.request.is_write() {
            for page in pages {
                self.pool.install(page.id);
            }
            return Ok(ExecutionResult::empty());
        }

        let served: Vec<PageRef> = pages
            .into_iter()
            .map(|page| {
                let records = self.pool.get_page(page.id);
                PageRef {
                    id: page.id,
                    records: Some(records),
                }
            })
            .collect();
        Ok(ExecutionResult::empty().with_output("pages", PortValue::Pages(served)))
    }

    fn snapshot_metrics(&self) -> BTreeMap<String, f64> {
        let mut gauges = BTreeMap::new();
        gauges.insert("hit_ratio".into(), self.pool.hit_ratio());
        gauges.insert("resident_pages".into(), self.pool.resident() as f64);
        for (name, value) in self.pool.policy.gauges() {
            gauges.insert(name.into(), value);
        }
        gauges
    }

    fn get_state(&self) -> BlockState {
        let mut state = BlockState::new();
        let _ = state.insert("capacity", self.pool.capacity);
        let _ = state.insert("resident", self.pool.resident());
        let _ = state.insert("hits", self.pool.hits);
        let _ = state.insert("misses", self.pool.misses);
        state
    }
}
