use bitvec::prelude::*;
use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::base::counter::Counter;
use crate::base::error::{ensure_config, SimError, SimResult};
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::config::Config;
use crate::sim::request::{Request, RequestKind};
use crate::tagstore::policy::check_policy;
use crate::tagstore::{Entry, PolicySignal, Table, TagStore};
use crate::timeq::Cycle;

pub const MAX_BLOCKS_PER_ROW: u64 = 128;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DbiConfig {
    /// Capacity in KB.
    pub size: u64,
    pub block_size: u64,
    pub associativity: usize,
    pub policy: String,
    /// Insertion priority for tag-store fills, 0 high, 1 bimodal, 2 low.
    pub policy_value: u32,
    pub dbi_policy: String,
    pub dbi_policy_value: u32,
    /// Rows tracked by the dirty-bit index.
    pub dbi_entries: usize,
    pub blocks_per_row: u64,
    pub tag_store_latency: Cycle,
    pub data_store_latency: Cycle,
}

impl Config for DbiConfig {}

impl Default for DbiConfig {
    fn default() -> Self {
        Self {
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "lru".to_string(),
            policy_value: 0,
            dbi_policy: "lru".to_string(),
            dbi_policy_value: 0,
            dbi_entries: 1024,
            blocks_per_row: MAX_BLOCKS_PER_ROW,
            tag_store_latency: 6,
            data_store_latency: 15,
        }
    }
}

impl DbiConfig {
    pub fn ensure_valid(&self) -> SimResult<()> {
        ensure_config!(self.block_size > 0, "dbi-llc", "block_size must be positive");
        ensure_config!(self.associativity > 0, "dbi-llc", "associativity must be positive");
        ensure_config!(self.dbi_entries > 0, "dbi-llc", "dbi_entries must be positive");
        ensure_config!(
            (1..=MAX_BLOCKS_PER_ROW).contains(&self.blocks_per_row),
            "dbi-llc",
            "blocks_per_row must be in 1..={}, got {}",
            MAX_BLOCKS_PER_ROW,
            self.blocks_per_row
        );
        check_policy(&self.policy)?;
        check_policy(&self.dbi_policy)?;
        ensure_config!(
            PolicySignal::from_value(self.policy_value).is_some()
                && PolicySignal::from_value(self.dbi_policy_value).is_some(),
            "dbi-llc",
            "policy values must be 0, 1 or 2"
        );
        Ok(())
    }

    pub fn num_sets(&self) -> usize {
        (self.size * 1024 / (self.block_size * self.associativity as u64)) as usize
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DbiStats {
    pub accesses: Counter,
    pub reads: Counter,
    pub writebacks: Counter,
    pub misses: Counter,
    pub evictions: Counter,
    pub dirty_evictions: Counter,
    pub row_evictions: Counter,
    pub row_writebacks: Counter,
}

#[derive(Debug, Clone)]
struct Line {
    vaddr: u64,
    paddr: u64,
    core_id: u32,
}

/// Dirty bits of one DRAM row.
#[derive(Debug, Clone, Default)]
pub struct DirtyRow {
    bits: BitArr!(for 128, in u64, Lsb0),
}

impl DirtyRow {
    pub fn is_dirty(&self, offset: usize) -> bool {
        self.bits[offset]
    }

    pub fn count(&self) -> usize {
        self.bits.count_ones()
    }
}

/// Last-level cache whose dirty state lives in a separate dirty-bit index organised by DRAM
/// row rather than in the tag entries. Dropping a row from the index writes back every dirty
/// block of that row together.
pub struct DbiCache {
    base: ModuleBase<DbiStats, DbiConfig>,
    tags: TagStore<Line>,
    dbi: Table<u64, DirtyRow>,
    fill_signal: PolicySignal,
    row_signal: PolicySignal,
}

module!(DbiCache, DbiStats, DbiConfig,);

impl DbiCache {
    pub fn new(name: impl Into<String>, config: DbiConfig) -> SimResult<Self> {
        config.ensure_valid()?;
        let tags = TagStore::new(config.num_sets(), config.associativity, &config.policy)?;
        let dbi = Table::with_policy(config.dbi_entries, &config.dbi_policy)?;
        let fill_signal = PolicySignal::from_value(config.policy_value).unwrap_or(PolicySignal::High);
        let row_signal = PolicySignal::from_value(config.dbi_policy_value).unwrap_or(PolicySignal::High);
        Ok(Self {
            base: ModuleBase::new(name, config),
            tags,
            dbi,
            fill_signal,
            row_signal,
        })
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.tags.lookup(tag)
    }

    pub fn is_dirty(&self, tag: u64) -> bool {
        let (row, offset) = self.row_of(tag);
        self.dbi.get(&row).is_some_and(|r| r.is_dirty(offset))
    }

    pub fn tracked_rows(&self) -> usize {
        self.dbi.len()
    }

    fn row_of(&self, tag: u64) -> (u64, usize) {
        let per_row = self.conf().blocks_per_row;
        (tag / per_row, (tag % per_row) as usize)
    }

    fn send_writeback(&self, ctx: &mut StageContext, line: &Line, cause: &Request) {
        let mut writeback = Request::spawn(
            ctx.alloc_id(),
            ctx.stage,
            RequestKind::Writeback,
            line.vaddr,
            line.paddr,
            self.conf().block_size as u32,
            cause,
        );
        writeback.core_id = line.core_id;
        ctx.send_next(writeback);
    }

    /// Write back the resident dirty blocks of a row leaving the index. Bits whose block is no
    /// longer in the tag store are dropped.
    fn flush_row(&mut self, ctx: &mut StageContext, evicted: Entry<u64, DirtyRow>, cause: &Request) {
        let Entry { key: row, value } = evicted;
        let per_row = self.conf().blocks_per_row;
        self.stats_mut().row_evictions.inc();
        let mut sent = 0;
        for offset in value.bits.iter_ones() {
            let tag = row * per_row + offset as u64;
            if let Some(line) = self.tags.get(tag) {
                self.send_writeback(ctx, line, cause);
                sent += 1;
            }
        }
        debug!("{}: row {:#x} left the index, {} writebacks", self.base.name, row, sent);
        self.stats_mut().row_writebacks.add(sent);
    }

    fn set_dirty(&mut self, ctx: &mut StageContext, tag: u64, cause: &Request) {
        let (row, offset) = self.row_of(tag);
        if !self.dbi.lookup(&row) {
            if let Some(evicted) = self.dbi.insert(row, DirtyRow::default(), self.row_signal) {
                self.flush_row(ctx, evicted, cause);
            }
        } else {
            self.dbi.read(&row, self.row_signal);
        }
        if let Some(entry) = self.dbi.get_mut(&row) {
            entry.bits.set(offset, true);
        }
    }

    /// Clear the dirty bit of `tag`, reporting whether it was set.
    fn take_dirty(&mut self, tag: u64) -> bool {
        let (row, offset) = self.row_of(tag);
        match self.dbi.get_mut(&row) {
            Some(entry) => entry.bits.replace(offset, false),
            None => false,
        }
    }

    fn insert_block(&mut self, ctx: &mut StageContext, tag: u64, dirty: bool, request: &Request) {
        let block_size = self.conf().block_size;
        let line = Line {
            vaddr: request.vaddr_block_aligned(block_size),
            paddr: request.paddr_block_aligned(block_size),
            core_id: request.core_id,
        };
        if let Some(Entry { key, value: victim }) = self.tags.insert(tag, line, self.fill_signal) {
            self.stats_mut().evictions.inc();
            if self.take_dirty(key) {
                self.stats_mut().dirty_evictions.inc();
                trace!("{}: dirty eviction of {:#x}", self.base.name, key);
                self.send_writeback(ctx, &victim, request);
            }
        }
        if dirty {
            self.set_dirty(ctx, tag, request);
        }
    }
}

impl Component for DbiCache {
    fn process_request(&mut self, ctx: &mut StageContext, mut request: Request) -> SimResult<Handled> {
        self.stats_mut().accesses.inc();
        if request.kind.is_store() {
            return Err(SimError::UnsupportedRequest {
                component: self.base.name.clone(),
                kind: request.kind,
            });
        }
        let tag = request.block(self.conf().block_size);
        let tag_latency = self.conf().tag_store_latency;
        let data_latency = self.conf().data_store_latency;

        if request.kind == RequestKind::Writeback {
            self.stats_mut().writebacks.inc();
            if self.tags.lookup(tag) {
                self.set_dirty(ctx, tag, &request);
            } else {
                self.insert_block(ctx, tag, true, &request);
            }
            request.serviced = true;
            return Ok(Handled::forward(tag_latency, request));
        }

        self.stats_mut().reads.inc();
        if self.tags.read(tag, PolicySignal::High).is_some() {
            let (row, _) = self.row_of(tag);
            self.dbi.read(&row, self.row_signal);
            request.serviced = true;
            request.add_latency(tag_latency + data_latency);
        } else {
            self.stats_mut().misses.inc();
            request.add_latency(tag_latency);
        }
        Ok(Handled::forward(tag_latency, request))
    }

    fn process_return(&mut self, ctx: &mut StageContext, request: &mut Request) -> SimResult<Cycle> {
        if request.is_from(ctx.stage) {
            request.destroy = true;
            return Ok(0);
        }
        let tag = request.block(self.conf().block_size);
        if !self.tags.lookup(tag) {
            self.insert_block(ctx, tag, false, request);
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::request::Initiator;

    // 2 sets x 2 ways, 4 blocks per row
    fn tiny(dbi_entries: usize) -> DbiCache {
        let config = DbiConfig {
            size: 1,
            block_size: 256,
            associativity: 2,
            dbi_entries,
            blocks_per_row: 4,
            ..DbiConfig::default()
        };
        DbiCache::new("llc", config).unwrap()
    }

    fn send(cache: &mut DbiCache, kind: RequestKind, block: u64) -> (Request, Vec<Request>) {
        let mut ids = 1000;
        let mut ctx = StageContext::new(0, 1, &mut ids);
        let req = Request::new(1, Initiator::Cpu, kind, block * 256, block * 256, 256, 0);
        let handled = cache.process_request(&mut ctx, req).unwrap();
        (handled.request.unwrap(), ctx.take_next())
    }

    fn fill(cache: &mut DbiCache, block: u64) -> Vec<Request> {
        let mut ids = 2000;
        let mut ctx = StageContext::new(0, 1, &mut ids);
        let mut req = Request::new(2, Initiator::Cpu, RequestKind::Read, block * 256, block * 256, 256, 0);
        req.serviced = true;
        cache.process_return(&mut ctx, &mut req).unwrap();
        ctx.take_next()
    }

    #[test]
    fn rejects_bad_geometry() {
        let config = DbiConfig {
            blocks_per_row: 256,
            ..DbiConfig::default()
        };
        assert!(DbiCache::new("llc", config).is_err());
        let config = DbiConfig {
            size: 0,
            ..DbiConfig::default()
        };
        assert!(DbiCache::new("llc", config).is_err());
    }

    #[test]
    fn dirty_state_lives_in_the_index() {
        let mut cache = tiny(4);
        assert!(fill(&mut cache, 0).is_empty());
        assert!(!cache.is_dirty(0));
        let (wb, out) = send(&mut cache, RequestKind::Writeback, 0);
        assert!(wb.serviced);
        assert!(out.is_empty());
        assert!(cache.is_dirty(0));
        assert_eq!(1, cache.tracked_rows());
    }

    #[test]
    fn dirty_eviction_writes_back_once() {
        let mut cache = tiny(4);
        send(&mut cache, RequestKind::Writeback, 0);
        fill(&mut cache, 2);
        // blocks 0, 2 and 4 share set 0
        let out = fill(&mut cache, 4);
        assert_eq!(1, out.len());
        assert_eq!(RequestKind::Writeback, out[0].kind);
        assert_eq!(0, out[0].paddr);
        assert!(out[0].is_from(1));
        assert!(!cache.is_dirty(0));
        assert_eq!(1, cache.stats().dirty_evictions.get());
    }

    #[test]
    fn dropped_row_flushes_resident_dirty_blocks() {
        let mut cache = tiny(1);
        // blocks 0 and 1 live in row 0, block 5 in row 1
        send(&mut cache, RequestKind::Writeback, 0);
        send(&mut cache, RequestKind::Writeback, 1);
        let (_, out) = send(&mut cache, RequestKind::Writeback, 5);
        let mut flushed: Vec<u64> = out.iter().map(|r| r.paddr / 256).collect();
        flushed.sort_unstable();
        assert_eq!(vec![0, 1], flushed);
        assert!(cache.contains(0) && cache.contains(1));
        assert!(!cache.is_dirty(0));
        assert!(cache.is_dirty(5));
        assert_eq!(2, cache.stats().row_writebacks.get());
    }

    #[test]
    fn hit_and_miss_latency() {
        let mut cache = tiny(4);
        let (miss, _) = send(&mut cache, RequestKind::Read, 3);
        assert!(!miss.serviced);
        assert_eq!(6, miss.current_cycle);
        fill(&mut cache, 3);
        let (hit, _) = send(&mut cache, RequestKind::Read, 3);
        assert!(hit.serviced);
        assert_eq!(21, hit.current_cycle);
    }

    #[test]
    fn direct_writes_are_fatal() {
        let mut cache = tiny(4);
        let mut ids = 0;
        let mut ctx = StageContext::new(0, 1, &mut ids);
        let req = Request::new(1, Initiator::Cpu, RequestKind::Write, 0, 0, 8, 0);
        assert!(matches!(
            cache.process_request(&mut ctx, req),
            Err(SimError::UnsupportedRequest { .. })
        ));
    }
}
