use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::base::counter::{Counter, CyclicPointer, SaturatingCounter};
use crate::base::error::{ensure_config, SimError, SimResult};
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::config::Config;
use crate::sim::request::{Request, RequestKind};
use crate::tagstore::policy::{check_policy, BIMODAL_PERIOD};
use crate::tagstore::victim::VictimTagStore;
use crate::tagstore::{Entry, PolicySignal, TagStore};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VtsConfig {
    /// Capacity in KB.
    pub size: u64,
    pub block_size: u64,
    pub associativity: usize,
    pub policy: String,
    pub tag_store_latency: Cycle,
    pub data_store_latency: Cycle,
    pub num_history_sets: usize,
    pub max_set_length: usize,
    /// Misses found in a history list below this index are filled at high priority.
    pub high_set: usize,
    /// Drop low-priority clean fills into a full set instead of evicting.
    pub allow_bypass: bool,
    pub allow_always_high: bool,
    pub allow_always_low: bool,
    pub high_threshold: u32,
    pub high_threshold2: u32,
    /// Percent of accesses below which a core switches to always-low.
    pub low_cap: u64,
    /// Decay applied to the per-core rates at every heartbeat.
    pub moving_average: f64,
    pub alpha: f64,
}

impl Config for VtsConfig {}

impl Default for VtsConfig {
    fn default() -> Self {
        Self {
            size: 1024,
            block_size: 64,
            associativity: 16,
            policy: "drrip".to_string(),
            tag_store_latency: 6,
            data_store_latency: 15,
            num_history_sets: 4,
            max_set_length: 4096,
            high_set: 1,
            allow_bypass: false,
            allow_always_high: false,
            allow_always_low: false,
            high_threshold: 2,
            high_threshold2: 2,
            low_cap: 1,
            moving_average: 0.0,
            alpha: 0.0,
        }
    }
}

impl VtsConfig {
    pub fn ensure_valid(&self) -> SimResult<()> {
        ensure_config!(self.block_size > 0, "vts-llc", "block_size must be positive");
        ensure_config!(self.associativity > 0, "vts-llc", "associativity must be positive");
        ensure_config!(self.num_history_sets > 0, "vts-llc", "num_history_sets must be positive");
        ensure_config!(
            (0.0..=1.0).contains(&self.moving_average),
            "vts-llc",
            "moving_average must be within [0, 1], got {}",
            self.moving_average
        );
        check_policy(&self.policy)?;
        Ok(())
    }

    pub fn num_sets(&self) -> usize {
        (self.size * 1024 / (self.block_size * self.associativity as u64)) as usize
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VtsStats {
    pub accesses: Counter,
    pub reads: Counter,
    pub writebacks: Counter,
    pub misses: Counter,
    pub victim_hits: Counter,
    pub evictions: Counter,
    pub dirty_evictions: Counter,
    pub bypassed_fills: Counter,
}

#[derive(Debug, Clone)]
struct Line {
    dirty: bool,
    reused: bool,
    vaddr: u64,
    paddr: u64,
    core_id: u32,
}

/// Per-core history and insertion mode.
#[derive(Debug, Clone)]
struct CoreState {
    victims: VictimTagStore,
    always_high: bool,
    always_low: bool,
    high_count: SaturatingCounter,
    high_count2: SaturatingCounter,
    occupancy: u64,
    hits: u64,
    misses: u64,
    victim_hits: Vec<u64>,
    victim_misses: u64,
    reused_blocks: u64,
    useless_blocks: u64,
}

impl CoreState {
    fn new(config: &VtsConfig) -> Self {
        Self {
            victims: VictimTagStore::new(config.num_history_sets, config.max_set_length),
            always_high: false,
            always_low: false,
            high_count: SaturatingCounter::new(config.high_threshold, config.high_threshold),
            high_count2: SaturatingCounter::new(config.high_threshold2, config.high_threshold2),
            occupancy: 0,
            hits: 0,
            misses: 0,
            victim_hits: vec![0; config.num_history_sets],
            victim_misses: 0,
            reused_blocks: 0,
            useless_blocks: 0,
        }
    }

    /// Misses that found their tag in one of the two youngest history lists.
    fn recent_victim_hits(&self) -> u64 {
        self.victim_hits.iter().take(2).sum()
    }

    fn decay(&mut self, factor: f64) {
        let scale = |v: &mut u64| *v = (*v as f64 * factor) as u64;
        scale(&mut self.hits);
        scale(&mut self.misses);
        scale(&mut self.victim_misses);
        self.victim_hits.iter_mut().for_each(scale);
        self.reused_blocks = 0;
        self.useless_blocks = 0;
    }
}

fn percent(value: u64, total: u64) -> f64 {
    (value * 100) as f64 / (total + 1) as f64
}

/// Last-level cache that remembers each core's recently evicted tags. A miss that finds its
/// tag among the youngest victims is filled at high priority; other fills are bimodal unless
/// the heartbeat has moved the core into always-high or always-low mode.
pub struct VtsCache {
    base: ModuleBase<VtsStats, VtsConfig>,
    tags: TagStore<Line>,
    set_pointers: Vec<CyclicPointer>,
    cores: Vec<CoreState>,
}

module!(VtsCache, VtsStats, VtsConfig,);

impl VtsCache {
    pub fn new(name: impl Into<String>, config: VtsConfig) -> SimResult<Self> {
        config.ensure_valid()?;
        let sets = config.num_sets();
        let tags = TagStore::new(sets, config.associativity, &config.policy)?;
        Ok(Self {
            set_pointers: vec![CyclicPointer::new(BIMODAL_PERIOD); sets],
            cores: Vec::new(),
            tags,
            base: ModuleBase::new(name, config),
        })
    }

    pub fn contains(&self, tag: u64) -> bool {
        self.tags.lookup(tag)
    }

    pub fn is_dirty(&self, tag: u64) -> bool {
        self.tags.get(tag).is_some_and(|line| line.dirty)
    }

    pub fn is_always_high(&self, core: u32) -> bool {
        self.cores.get(core as usize).is_some_and(|c| c.always_high)
    }

    pub fn is_always_low(&self, core: u32) -> bool {
        self.cores.get(core as usize).is_some_and(|c| c.always_low)
    }

    pub fn occupancy(&self, core: u32) -> u64 {
        self.cores.get(core as usize).map_or(0, |c| c.occupancy)
    }

    fn core(&mut self, core: u32) -> &mut CoreState {
        let index = core as usize;
        if index >= self.cores.len() {
            let fresh = CoreState::new(&self.base.config);
            self.cores.resize(index + 1, fresh);
        }
        &mut self.cores[index]
    }

    fn fill_priority(&mut self, request: &Request, set: usize) -> PolicySignal {
        let high_set = self.conf().high_set;
        let core = self.core(request.core_id);
        if core.always_high {
            return PolicySignal::High;
        }
        if request.victim_set.is_some_and(|band| band < high_set) {
            return PolicySignal::High;
        }
        if core.always_low {
            return PolicySignal::Low;
        }
        let pointer = &mut self.set_pointers[set];
        let signal = if pointer.is_zero() {
            PolicySignal::High
        } else {
            PolicySignal::Low
        };
        pointer.increment();
        signal
    }

    fn read_block(&mut self, tag: u64) -> bool {
        let Some(line) = self.tags.read(tag, PolicySignal::High) else {
            return false;
        };
        let first_use = !line.reused;
        line.reused = true;
        let owner = line.core_id;
        let core = self.core(owner);
        core.hits += 1;
        if first_use {
            core.reused_blocks += 1;
        }
        true
    }

    fn insert_block(&mut self, ctx: &mut StageContext, tag: u64, dirty: bool, request: &Request) {
        let set = self.tags.index(tag);
        let signal = self.fill_priority(request, set);
        let core_id = request.core_id;

        if self.conf().allow_bypass
            && !dirty
            && signal == PolicySignal::Low
            && self.tags.set(set).is_full()
        {
            trace!("{}: bypassing fill of {:#x}", self.base.name, tag);
            self.core(core_id).victims.insert(tag);
            let stats = self.stats_mut();
            stats.bypassed_fills.inc();
            stats.evictions.inc();
            return;
        }

        let block_size = self.conf().block_size;
        let line = Line {
            dirty,
            reused: false,
            vaddr: request.vaddr_block_aligned(block_size),
            paddr: request.paddr_block_aligned(block_size),
            core_id,
        };
        self.core(core_id).occupancy += 1;
        let Some(Entry { key, value: victim }) = self.tags.insert(tag, line, signal) else {
            return;
        };

        self.stats_mut().evictions.inc();
        let owner = self.core(victim.core_id);
        owner.occupancy = owner.occupancy.saturating_sub(1);
        owner.victims.insert(key);
        if victim.reused {
            owner.reused_blocks = owner.reused_blocks.saturating_sub(1);
        } else {
            owner.useless_blocks += 1;
        }
        if victim.dirty {
            self.stats_mut().dirty_evictions.inc();
            let mut writeback = Request::spawn(
                ctx.alloc_id(),
                ctx.stage,
                RequestKind::Writeback,
                victim.vaddr,
                victim.paddr,
                block_size as u32,
                request,
            );
            writeback.core_id = victim.core_id;
            ctx.send_next(writeback);
        }
    }

    fn update_modes(&mut self) {
        let config = &self.base.config;
        let blocks = (self.tags.num_sets() * self.tags.ways()) as f64;
        for (id, core) in self.cores.iter_mut().enumerate() {
            let total = core.hits + core.misses;
            let recent = core.recent_victim_hits();
            let history_hits = core.misses.saturating_sub(core.victim_misses);
            let hits_starved = percent(core.hits, total) < 5.0 || history_hits > core.hits;

            if config.allow_always_high {
                if percent(recent, history_hits) > 98.0 && percent(core.victim_misses, total) > 5.0 {
                    core.high_count.decrement();
                } else if hits_starved {
                    core.high_count.increment();
                }
                if (recent * core.occupancy) as f64 > (1.0 + config.alpha) * core.hits as f64 * blocks {
                    core.high_count2.decrement();
                } else if hits_starved {
                    core.high_count2.increment();
                }
                if core.high_count.value() == 0 || core.high_count2.value() == 0 {
                    core.always_high = true;
                    core.always_low = false;
                } else if core.high_count.value() == core.high_count.max()
                    || core.high_count2.value() == core.high_count2.max()
                {
                    core.always_high = false;
                }
            }

            if config.allow_always_low {
                if core.always_low {
                    if recent * 100 > total * config.low_cap {
                        core.always_low = false;
                    }
                } else if (recent + core.hits) * 100 < total * config.low_cap {
                    core.always_low = true;
                    core.always_high = false;
                }
            }

            debug!(
                "{}: core {} always_high {} always_low {} counts {}/{} hits {} misses {} victim hits {:?}",
                self.base.name,
                id,
                core.always_high,
                core.always_low,
                core.high_count.value(),
                core.high_count2.value(),
                core.hits,
                core.misses,
                core.victim_hits
            );
            core.decay(config.moving_average);
        }
    }
}

impl Component for VtsCache {
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
            request.victim_set = None;
            match self.tags.get_mut(tag) {
                Some(line) => line.dirty = true,
                None => self.insert_block(ctx, tag, true, &request),
            }
            request.serviced = true;
            return Ok(Handled::forward(tag_latency, request));
        }

        self.stats_mut().reads.inc();
        if self.read_block(tag) {
            request.serviced = true;
            request.add_latency(tag_latency + data_latency);
        } else {
            request.add_latency(tag_latency);
            let core = self.core(request.core_id);
            core.misses += 1;
            let band = core.victims.lookup(tag);
            match band {
                Some(band) => core.victim_hits[band] += 1,
                None => core.victim_misses += 1,
            }
            request.victim_set = band;
            let stats = self.stats_mut();
            stats.misses.inc();
            if band.is_some() {
                stats.victim_hits.inc();
            }
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

    fn heartbeat(&mut self, _ctx: &mut StageContext, _count: Cycle) {
        self.update_modes();
        for line in self.tags.values_mut() {
            line.reused = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::request::Initiator;

    // one set of two ways
    fn tiny(config: VtsConfig) -> VtsCache {
        VtsCache::new(
            "llc",
            VtsConfig {
                size: 1,
                block_size: 512,
                associativity: 2,
                policy: "lru".into(),
                num_history_sets: 2,
                max_set_length: 8,
                ..config
            },
        )
        .unwrap()
    }

    fn read(cache: &mut VtsCache, block: u64) -> Request {
        let mut ids = 1000;
        let mut ctx = StageContext::new(0, 1, &mut ids);
        let req = Request::new(1, Initiator::Cpu, RequestKind::Read, block * 512, block * 512, 8, 0);
        cache.process_request(&mut ctx, req).unwrap().request.unwrap()
    }

    fn fill(cache: &mut VtsCache, mut req: Request) -> Vec<Request> {
        let mut ids = 2000;
        let mut ctx = StageContext::new(0, 1, &mut ids);
        req.serviced = true;
        cache.process_return(&mut ctx, &mut req).unwrap();
        ctx.take_next()
    }

    fn heartbeat(cache: &mut VtsCache) {
        let mut ids = 0;
        let mut ctx = StageContext::new(0, 1, &mut ids);
        cache.heartbeat(&mut ctx, 100);
    }

    #[test]
    fn evicted_tags_are_found_in_history() {
        let mut cache = tiny(VtsConfig::default());
        for block in 0..3 {
            let miss = read(&mut cache, block);
            assert_eq!(None, miss.victim_set);
            fill(&mut cache, miss);
        }
        // block 1 went in at low priority and was the first victim
        assert!(cache.contains(0));
        assert!(!cache.contains(1));
        let miss = read(&mut cache, 1);
        assert!(!miss.serviced);
        assert_eq!(Some(0), miss.victim_set);
        assert_eq!(1, cache.stats().victim_hits.get());
    }

    #[test]
    fn victim_hit_fills_high_and_others_are_bimodal() {
        let mut cache = tiny(VtsConfig::default());
        let mut req = Request::new(1, Initiator::Cpu, RequestKind::Read, 0, 0, 8, 0);
        assert_eq!(PolicySignal::High, cache.fill_priority(&req, 0));
        assert_eq!(PolicySignal::Low, cache.fill_priority(&req, 0));
        req.victim_set = Some(0);
        assert_eq!(PolicySignal::High, cache.fill_priority(&req, 0));
        req.victim_set = Some(1);
        assert_eq!(PolicySignal::Low, cache.fill_priority(&req, 0));
    }

    #[test]
    fn hits_take_data_latency() {
        let mut cache = tiny(VtsConfig::default());
        let miss = read(&mut cache, 7);
        assert_eq!(6, miss.current_cycle);
        fill(&mut cache, miss);
        let hit = read(&mut cache, 7);
        assert!(hit.serviced);
        assert_eq!(21, hit.current_cycle);
    }

    #[test]
    fn dirty_victim_is_written_back() {
        let mut cache = tiny(VtsConfig::default());
        for block in [1, 2] {
            let miss = read(&mut cache, block);
            fill(&mut cache, miss);
        }
        let mut ids = 0;
        let mut ctx = StageContext::new(0, 1, &mut ids);
        let wb = Request::new(1, Initiator::Cpu, RequestKind::Writeback, 0, 0, 512, 0).with_core(3);
        let handled = cache.process_request(&mut ctx, wb).unwrap();
        assert!(handled.request.unwrap().serviced);
        assert!(ctx.take_next().is_empty());
        assert!(cache.is_dirty(0));
        assert_eq!(1, cache.occupancy(3));

        let miss = read(&mut cache, 3);
        let out = fill(&mut cache, miss);
        assert_eq!(1, out.len());
        assert_eq!(RequestKind::Writeback, out[0].kind);
        assert_eq!(0, out[0].paddr);
        assert_eq!(3, out[0].core_id);
        assert_eq!(0, cache.occupancy(3));
        assert_eq!(1, cache.stats().dirty_evictions.get());
    }

    #[test]
    fn starving_core_turns_always_low() {
        let mut cache = tiny(VtsConfig {
            allow_always_low: true,
            low_cap: 50,
            ..VtsConfig::default()
        });
        for block in 0..20 {
            read(&mut cache, block * 100);
        }
        heartbeat(&mut cache);
        assert!(cache.is_always_low(0));
        let req = Request::new(1, Initiator::Cpu, RequestKind::Read, 0, 0, 8, 0);
        assert_eq!(PolicySignal::Low, cache.fill_priority(&req, 0));
    }

    #[test]
    fn thrashing_core_turns_always_high() {
        let mut cache = tiny(VtsConfig {
            allow_always_high: true,
            high_threshold: 1,
            ..VtsConfig::default()
        });
        let core = cache.core(0);
        core.misses = 200;
        core.victim_misses = 50;
        core.victim_hits[0] = 150;
        heartbeat(&mut cache);
        assert!(cache.is_always_high(0));
        // moving_average 0 clears the rates
        assert_eq!(0, cache.cores[0].misses);
    }

    #[test]
    fn bypass_skips_low_priority_clean_fills() {
        let mut cache = tiny(VtsConfig {
            allow_bypass: true,
            ..VtsConfig::default()
        });
        let miss = read(&mut cache, 0);
        fill(&mut cache, miss);
        let miss = read(&mut cache, 1);
        fill(&mut cache, miss);
        let miss = read(&mut cache, 2);
        fill(&mut cache, miss);
        assert!(!cache.contains(2));
        assert_eq!(1, cache.stats().bypassed_fills.get());
        assert_eq!(Some(0), read(&mut cache, 2).victim_set);
    }
}
