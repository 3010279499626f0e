use std::collections::HashMap;

use log::trace;
use serde::{Deserialize, Serialize};

use crate::base::counter::{Counter, SaturatingCounter};
use crate::base::error::{ensure_config, SimError, SimResult};
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::config::Config;
use crate::sim::request::{Initiator, Request, RequestKind, StageId};
use crate::tagstore::eaf::EvictedAddressFilter;
use crate::tagstore::policy::check_policy;
use crate::tagstore::{Entry, PolicySignal, TagStore};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DcpConfig {
    /// Capacity in KB.
    pub size: u64,
    pub block_size: u64,
    pub associativity: usize,
    pub policy: String,
    pub tag_store_latency: Cycle,
    pub data_store_latency: Cycle,
    /// A prefetch that hits promotes the line.
    pub prefetch_request_promote: bool,
    /// Keep a prefetched line at high priority after its first use only if the evicted-address
    /// filter has seen it.
    pub reuse_prediction: bool,
    /// Insert demand fills bimodally unless the evicted-address filter has seen them.
    pub demand_reuse_prediction: bool,
    pub accuracy_prediction: bool,
    pub accuracy_max: u32,
    pub set_dueling: bool,
    pub leader_sets: usize,
    pub psel_max: u32,
}

impl Config for DcpConfig {}

impl Default for DcpConfig {
    fn default() -> Self {
        Self {
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "lru".to_string(),
            tag_store_latency: 6,
            data_store_latency: 15,
            prefetch_request_promote: true,
            reuse_prediction: false,
            demand_reuse_prediction: false,
            accuracy_prediction: false,
            accuracy_max: 15,
            set_dueling: false,
            leader_sets: 32,
            psel_max: 1023,
        }
    }
}

impl DcpConfig {
    pub fn ensure_valid(&self) -> SimResult<()> {
        ensure_config!(self.block_size > 0, "dcp-llc", "block_size must be positive");
        ensure_config!(self.associativity > 0, "dcp-llc", "associativity must be positive");
        ensure_config!(
            self.size * 1024 >= self.block_size * self.associativity as u64,
            "dcp-llc",
            "{} KB holds less than one set",
            self.size
        );
        check_policy(&self.policy)?;
        ensure_config!(
            !self.set_dueling || self.leader_sets > 0,
            "dcp-llc",
            "set dueling needs at least one leader set"
        );
        Ok(())
    }

    pub fn num_sets(&self) -> usize {
        (self.size * 1024 / (self.block_size * self.associativity as u64)) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PrefetchState {
    NotPrefetched,
    Unused,
    Used,
    Reused,
}

#[derive(Debug, Clone)]
struct Line {
    dirty: bool,
    vaddr: u64,
    paddr: u64,
    core_id: u32,
    prefetch: PrefetchState,
    /// Prefetcher stage that brought the line in.
    source: Option<StageId>,
    inserted_high: bool,
    prefetch_miss: u64,
    use_miss: u64,
    prefetch_cycle: Cycle,
    use_cycle: Cycle,
}

/// Per-prefetcher usefulness counters. Every source starts out trusted.
#[derive(Debug, Clone)]
pub struct AccuracyPredictor {
    max: u32,
    counters: HashMap<StageId, SaturatingCounter>,
}

impl AccuracyPredictor {
    pub fn new(max: u32) -> Self {
        Self {
            max,
            counters: HashMap::new(),
        }
    }

    fn counter(&mut self, source: StageId) -> &mut SaturatingCounter {
        let max = self.max;
        self.counters
            .entry(source)
            .or_insert_with(|| SaturatingCounter::new(max, max))
    }

    pub fn useful(&mut self, source: StageId) {
        self.counter(source).increment();
    }

    pub fn wasted(&mut self, source: StageId) {
        self.counter(source).decrement();
    }

    pub fn is_accurate(&self, source: StageId) -> bool {
        self.counters
            .get(&source)
            .map_or(true, SaturatingCounter::above_half)
    }

    pub fn value(&self, source: StageId) -> u32 {
        self.counters.get(&source).map_or(self.max, |c| c.value())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionVariant {
    /// Priority after first use and on demand fill follows the evicted-address filter.
    ReuseGated,
    AlwaysHigh,
}

/// Leader-set selection and the preference counter for the two insertion variants.
#[derive(Debug, Clone)]
pub struct SetDuel {
    enabled: bool,
    stride: usize,
    psel: SaturatingCounter,
}

impl SetDuel {
    pub fn new(enabled: bool, num_sets: usize, leader_sets: usize, psel_max: u32) -> Self {
        Self {
            enabled,
            stride: (num_sets / leader_sets.max(1)).max(2),
            psel: SaturatingCounter::new(psel_max, psel_max / 2),
        }
    }

    pub fn leader(&self, set: usize) -> Option<InsertionVariant> {
        if !self.enabled {
            return None;
        }
        match set % self.stride {
            0 => Some(InsertionVariant::ReuseGated),
            r if r == self.stride - 1 => Some(InsertionVariant::AlwaysHigh),
            _ => None,
        }
    }

    pub fn variant(&self, set: usize) -> InsertionVariant {
        if !self.enabled {
            return InsertionVariant::ReuseGated;
        }
        self.leader(set).unwrap_or(if self.psel.above_half() {
            InsertionVariant::AlwaysHigh
        } else {
            InsertionVariant::ReuseGated
        })
    }

    /// A demand miss in a leader set counts against that leader's variant.
    pub fn record_miss(&mut self, set: usize) {
        match self.leader(set) {
            Some(InsertionVariant::ReuseGated) => self.psel.increment(),
            Some(InsertionVariant::AlwaysHigh) => self.psel.decrement(),
            None => {}
        }
    }

    pub fn psel(&self) -> u32 {
        self.psel.value()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DcpStats {
    pub accesses: Counter,
    pub reads: Counter,
    pub writebacks: Counter,
    pub misses: Counter,
    pub evictions: Counter,
    pub dirty_evictions: Counter,
    pub prefetches: Counter,
    pub prefetch_misses: Counter,
    pub unused_prefetches: Counter,
    pub used_prefetches: Counter,
    pub unreused_prefetches: Counter,
    pub reused_prefetches: Counter,
    pub prefetch_use_cycle: Counter,
    pub prefetch_use_miss: Counter,
    pub prefetch_lifetime_cycle: Counter,
    pub prefetch_lifetime_miss: Counter,
}

/// Last-level cache that tracks whether prefetched lines turn out useful and lowers the
/// retention priority of prefetches that are unlikely to be reused.
pub struct DcpCache {
    base: ModuleBase<DcpStats, DcpConfig>,
    tags: TagStore<Line>,
    eaf: EvictedAddressFilter,
    accuracy: AccuracyPredictor,
    duel: SetDuel,
    miss_counter: Vec<u64>,
}

module!(DcpCache, DcpStats, DcpConfig,);

impl DcpCache {
    pub fn new(name: impl Into<String>, config: DcpConfig) -> SimResult<Self> {
        config.ensure_valid()?;
        let sets = config.num_sets();
        let tags = TagStore::new(sets, config.associativity, &config.policy)?;
        Ok(Self {
            eaf: EvictedAddressFilter::new(sets * config.associativity),
            accuracy: AccuracyPredictor::new(config.accuracy_max),
            duel: SetDuel::new(config.set_dueling, sets, config.leader_sets, config.psel_max),
            miss_counter: vec![0; sets],
            tags,
            base: ModuleBase::new(name, config),
        })
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.tags.lookup(tag)
    }

    pub fn prefetch_state(&self, tag: u64) -> Option<PrefetchState> {
        self.tags.get(tag).map(|line| line.prefetch)
    }

    pub fn is_dirty(&self, tag: u64) -> bool {
        self.tags.get(tag).is_some_and(|line| line.dirty)
    }

    pub fn eaf(&self) -> &EvictedAddressFilter {
        &self.eaf
    }

    pub fn accuracy(&self) -> &AccuracyPredictor {
        &self.accuracy
    }

    pub fn duel(&self) -> &SetDuel {
        &self.duel
    }

    fn tag_of(&self, request: &Request) -> u64 {
        request.block(self.conf().block_size)
    }

    fn demand_read(&mut self, request: &mut Request, tag: u64, set: usize) {
        let Some(line) = self.tags.get_mut(tag) else {
            return;
        };
        match line.prefetch {
            PrefetchState::Unused => {
                line.prefetch = PrefetchState::Used;
                line.use_miss = self.miss_counter[set];
                line.use_cycle = request.current_cycle;
                let use_cycles = line.use_cycle.saturating_sub(line.prefetch_cycle);
                let use_misses = line.use_miss.saturating_sub(line.prefetch_miss);
                let source = line.source;

                let stats = &mut self.base.stats;
                stats.used_prefetches.inc();
                stats.prefetch_use_cycle.add(use_cycles);
                stats.prefetch_use_miss.add(use_misses);
                if self.base.config.accuracy_prediction {
                    if let Some(source) = source {
                        self.accuracy.useful(source);
                    }
                }

                let keep_high = match self.duel.variant(set) {
                    InsertionVariant::AlwaysHigh => true,
                    InsertionVariant::ReuseGated => {
                        self.base.config.reuse_prediction && self.eaf.test(tag)
                    }
                };
                if keep_high {
                    self.tags.read(tag, PolicySignal::High);
                } else {
                    self.tags.reinsert(tag, PolicySignal::Low);
                }
            }
            PrefetchState::Used => {
                line.prefetch = PrefetchState::Reused;
                self.base.stats.reused_prefetches.inc();
                self.tags.read(tag, PolicySignal::High);
            }
            PrefetchState::NotPrefetched | PrefetchState::Reused => {
                self.tags.read(tag, PolicySignal::High);
            }
        }
    }

    fn insertion_signal(&self, request: &Request, tag: u64, set: usize) -> PolicySignal {
        let config = &self.base.config;
        if request.kind == RequestKind::Prefetch {
            return match request.initiator {
                Initiator::Component(source)
                    if config.accuracy_prediction && !self.accuracy.is_accurate(source) =>
                {
                    PolicySignal::Low
                }
                _ => PolicySignal::High,
            };
        }
        match self.duel.variant(set) {
            InsertionVariant::AlwaysHigh => PolicySignal::High,
            InsertionVariant::ReuseGated
                if config.demand_reuse_prediction && !self.eaf.test(tag) =>
            {
                PolicySignal::Bimodal
            }
            InsertionVariant::ReuseGated => PolicySignal::High,
        }
    }

    fn insert_block(&mut self, ctx: &mut StageContext, tag: u64, dirty: bool, request: &Request) {
        let set = self.tags.index(tag);
        let block_size = self.conf().block_size;
        let signal = self.insertion_signal(request, tag, set);
        let prefetched = request.kind == RequestKind::Prefetch;
        let line = Line {
            dirty,
            vaddr: request.vaddr_block_aligned(block_size),
            paddr: request.paddr_block_aligned(block_size),
            core_id: request.core_id,
            prefetch: if prefetched {
                PrefetchState::Unused
            } else {
                PrefetchState::NotPrefetched
            },
            source: match request.initiator {
                Initiator::Component(stage) if prefetched => Some(stage),
                _ => None,
            },
            inserted_high: signal == PolicySignal::High,
            prefetch_miss: self.miss_counter[set],
            use_miss: 0,
            prefetch_cycle: request.current_cycle,
            use_cycle: 0,
        };
        if prefetched {
            self.base.stats.prefetches.inc();
        }
        trace!("{}: insert {:#x} at {:?}", self.base.name, tag, signal);
        if let Some(evicted) = self.tags.insert(tag, line, signal) {
            self.evict(ctx, evicted, set, request);
        }
    }

    fn evict(&mut self, ctx: &mut StageContext, evicted: Entry<u64, Line>, set: usize, cause: &Request) {
        let Entry { key, value: line } = evicted;
        let now = cause.current_cycle;
        let stats = &mut self.base.stats;
        stats.evictions.inc();

        if line.prefetch != PrefetchState::Unused {
            self.eaf.insert(key);
        }
        match line.prefetch {
            PrefetchState::Unused | PrefetchState::Used => {
                if line.prefetch == PrefetchState::Unused {
                    stats.unused_prefetches.inc();
                } else {
                    stats.unreused_prefetches.inc();
                }
                stats
                    .prefetch_lifetime_cycle
                    .add(now.saturating_sub(line.prefetch_cycle));
                stats
                    .prefetch_lifetime_miss
                    .add(self.miss_counter[set].saturating_sub(line.prefetch_miss));
            }
            PrefetchState::Reused => {
                stats
                    .prefetch_lifetime_cycle
                    .add(line.use_cycle.saturating_sub(line.prefetch_cycle));
                stats
                    .prefetch_lifetime_miss
                    .add(line.use_miss.saturating_sub(line.prefetch_miss));
            }
            PrefetchState::NotPrefetched => {}
        }

        if self.base.config.accuracy_prediction
            && line.prefetch == PrefetchState::Unused
            && line.inserted_high
        {
            if let Some(source) = line.source {
                self.accuracy.wasted(source);
            }
        }

        if line.dirty {
            stats.dirty_evictions.inc();
            let mut writeback = Request::spawn(
                ctx.alloc_id(),
                ctx.stage,
                RequestKind::Writeback,
                line.vaddr,
                line.paddr,
                self.base.config.block_size as u32,
                cause,
            );
            writeback.core_id = line.core_id;
            trace!("{}: dirty eviction of {:#x}, writeback #{}", self.base.name, key, writeback.id);
            ctx.send_next(writeback);
        }
    }
}

impl Component for DcpCache {
    fn process_request(&mut self, ctx: &mut StageContext, mut request: Request) -> SimResult<Handled> {
        self.stats_mut().accesses.inc();
        if request.kind.is_store() {
            return Err(SimError::UnsupportedRequest {
                component: self.base.name.clone(),
                kind: request.kind,
            });
        }

        let tag = self.tag_of(&request);
        let set = self.tags.index(tag);
        let tag_latency = self.conf().tag_store_latency;
        let data_latency = self.conf().data_store_latency;

        match request.kind {
            RequestKind::Read | RequestKind::ReadForWrite => {
                self.stats_mut().reads.inc();
                if self.tags.lookup(tag) {
                    request.serviced = true;
                    request.add_latency(tag_latency + data_latency);
                    self.demand_read(&mut request, tag, set);
                } else {
                    self.stats_mut().misses.inc();
                    request.add_latency(tag_latency);
                    self.miss_counter[set] += 1;
                    self.duel.record_miss(set);
                }
            }
            RequestKind::Prefetch => {
                self.stats_mut().reads.inc();
                if self.tags.lookup(tag) {
                    request.serviced = true;
                    request.add_latency(tag_latency + data_latency);
                    if self.conf().prefetch_request_promote {
                        self.tags.read(tag, PolicySignal::High);
                    }
                } else {
                    self.stats_mut().prefetch_misses.inc();
                    request.add_latency(tag_latency);
                    self.miss_counter[set] += 1;
                }
            }
            RequestKind::Writeback => {
                self.stats_mut().writebacks.inc();
                match self.tags.get_mut(tag) {
                    Some(line) => line.dirty = true,
                    None => self.insert_block(ctx, tag, true, &request),
                }
                request.serviced = true;
            }
            RequestKind::Write | RequestKind::PartialWrite => {}
        }
        Ok(Handled::forward(tag_latency, request))
    }

    fn process_return(&mut self, ctx: &mut StageContext, request: &mut Request) -> SimResult<Cycle> {
        if request.is_from(ctx.stage) {
            request.destroy = true;
            return Ok(0);
        }
        let tag = self.tag_of(request);
        if !self.tags.lookup(tag) {
            self.insert_block(ctx, tag, false, request);
        }
        Ok(0)
    }
}
