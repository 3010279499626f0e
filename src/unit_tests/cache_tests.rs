use std::cell::RefCell;
use std::rc::Rc;

use super::{FixedMemory, Seen};
use crate::cmp::dbi::{DbiCache, DbiConfig};
use crate::cmp::dcp::{DcpCache, DcpConfig, InsertionVariant};
use crate::cmp::vts::{VtsCache, VtsConfig};
use crate::sim::component::{Component, StageContext};
use crate::sim::config::SimConfig;
use crate::sim::hierarchy::Hierarchy;
use crate::sim::request::{Initiator, Request, RequestKind};
use crate::sim::trace::TraceRecord;
use crate::tagstore::eaf::EvictedAddressFilter;

/// Two sets of two 256-byte ways; even block numbers share set 0.
fn two_by_two() -> DcpConfig {
    DcpConfig {
        size: 1,
        block_size: 256,
        associativity: 2,
        policy: "lru".into(),
        ..DcpConfig::default()
    }
}

fn over_memory(llc: Box<dyn Component>) -> (Hierarchy, Rc<RefCell<Vec<Seen>>>) {
    let (memory, seen) = FixedMemory::new(20);
    let stages: Vec<Box<dyn Component>> = vec![llc, Box::new(memory)];
    (Hierarchy::new(SimConfig::default(), stages).unwrap(), seen)
}

fn kinds_and_addrs(seen: &[Seen]) -> Vec<(RequestKind, u64)> {
    seen.iter().map(|s| (s.kind, s.paddr)).collect()
}

#[test]
fn dirty_victim_is_written_back_and_clean_victim_is_not() {
    let llc = DcpCache::new("llc", two_by_two()).unwrap();
    let (mut hierarchy, seen) = over_memory(Box::new(llc));
    let (a, b, c) = (0x000, 0x200, 0x400);
    let records = vec![
        TraceRecord::read(0, a).with_kind(RequestKind::Writeback),
        TraceRecord::read(10, b),
        // evicts A, the older of the two and never read
        TraceRecord::read(100, c),
        TraceRecord::read(200, b),
        // brings A back and evicts the clean C
        TraceRecord::read(300, a),
    ];
    let summary = hierarchy.run(records, Some(10_000)).unwrap();
    assert_eq!(5, summary.completed);
    assert_eq!(0, hierarchy.outstanding());

    assert_eq!(
        vec![
            (RequestKind::Read, b),
            (RequestKind::Read, c),
            (RequestKind::Writeback, a),
            (RequestKind::Read, a),
        ],
        kinds_and_addrs(&seen.borrow())
    );
}

#[test]
fn recently_read_line_survives_eviction() {
    let llc = DcpCache::new("llc", two_by_two()).unwrap();
    let (mut hierarchy, seen) = over_memory(Box::new(llc));
    let records = vec![
        TraceRecord::read(0, 0x000),
        TraceRecord::read(100, 0x200),
        TraceRecord::read(200, 0x000),
        TraceRecord::read(300, 0x400),
        // 0x200 was the victim, 0x000 still hits
        TraceRecord::read(400, 0x000),
        TraceRecord::read(500, 0x200),
    ];
    hierarchy.run(records, Some(10_000)).unwrap();
    let addrs: Vec<u64> = seen.borrow().iter().map(|s| s.paddr).collect();
    assert_eq!(vec![0x000, 0x200, 0x400, 0x200], addrs);
}

#[test]
fn other_set_is_untouched() {
    let llc = DcpCache::new("llc", two_by_two()).unwrap();
    let (mut hierarchy, seen) = over_memory(Box::new(llc));
    let records = vec![
        TraceRecord::read(0, 0x100),
        TraceRecord::read(100, 0x000),
        TraceRecord::read(200, 0x200),
        TraceRecord::read(300, 0x400),
        TraceRecord::read(400, 0x100),
    ];
    hierarchy.run(records, Some(10_000)).unwrap();
    // block 1 lives in set 1 and is never displaced
    assert_eq!(4, seen.borrow().len());
}

#[test]
fn dbi_llc_writes_back_dirty_victims() {
    let config = DbiConfig {
        size: 1,
        block_size: 256,
        associativity: 2,
        blocks_per_row: 4,
        ..DbiConfig::default()
    };
    let llc = DbiCache::new("llc", config).unwrap();
    let (mut hierarchy, seen) = over_memory(Box::new(llc));
    let records = vec![
        TraceRecord::read(0, 0x000).with_kind(RequestKind::Writeback),
        TraceRecord::read(10, 0x200),
        TraceRecord::read(100, 0x400),
    ];
    let summary = hierarchy.run(records, Some(10_000)).unwrap();
    assert_eq!(3, summary.completed);
    assert_eq!(
        vec![
            (RequestKind::Read, 0x200),
            (RequestKind::Read, 0x400),
            (RequestKind::Writeback, 0x000),
        ],
        kinds_and_addrs(&seen.borrow())
    );
}

#[test]
fn vts_llc_serves_hits_without_memory() {
    let config = VtsConfig {
        size: 1,
        block_size: 256,
        associativity: 2,
        ..VtsConfig::default()
    };
    let llc = VtsCache::new("llc", config).unwrap();
    let (mut hierarchy, seen) = over_memory(Box::new(llc));
    let records = vec![
        TraceRecord::read(0, 0x000),
        TraceRecord::read(100, 0x000),
        TraceRecord::read(200, 0x100),
    ];
    let summary = hierarchy.run(records, Some(10_000)).unwrap();
    assert_eq!(3, summary.completed);
    assert_eq!(2, seen.borrow().len());
}

#[test]
fn evicted_address_is_predicted_reused() {
    let mut eaf = EvictedAddressFilter::new(16);
    let tag = 0x1234;
    assert!(!eaf.test(tag));
    eaf.insert(tag);
    assert!(eaf.test(tag));
    // the filter restarts once it has seen its capacity of evictions
    for other in 0..16 {
        eaf.insert(0x10_0000 + other);
    }
    assert_eq!(1, eaf.len());
    assert!(eaf.test(0x10_0000 + 15));
}

/// One set of two 512-byte ways, so the tag is `paddr / 512`.
fn one_set(config: DcpConfig) -> DcpCache {
    DcpCache::new(
        "llc",
        DcpConfig {
            size: 1,
            block_size: 512,
            associativity: 2,
            policy: "lru".into(),
            ..config
        },
    )
    .unwrap()
}

const PREFETCHER: Initiator = Initiator::Component(0);

fn fill(cache: &mut DcpCache, kind: RequestKind, initiator: Initiator, paddr: u64) {
    let mut ids = 1000;
    let mut ctx = StageContext::new(0, 1, &mut ids);
    let mut request = Request::new(1, initiator, kind, paddr, paddr, 64, 0);
    request.serviced = true;
    cache.process_return(&mut ctx, &mut request).unwrap();
}

fn demand(cache: &mut DcpCache, paddr: u64) -> bool {
    let mut ids = 1000;
    let mut ctx = StageContext::new(0, 1, &mut ids);
    let request = Request::new(1, Initiator::Cpu, RequestKind::Read, paddr, paddr, 64, 0);
    let handled = cache.process_request(&mut ctx, request).unwrap();
    handled.request.map_or(false, |r| r.serviced)
}

/// Demand-fills tags 0, 1, 2 so tag 0 is evicted into the filter, then prefetches tag 0 back,
/// uses it once and demand-fills tag 3. Returns whether the prefetched line survived.
fn first_use_keeps_recently_evicted_line(reuse_prediction: bool) -> bool {
    let mut cache = one_set(DcpConfig {
        reuse_prediction,
        ..DcpConfig::default()
    });
    for tag in 0..3 {
        fill(&mut cache, RequestKind::Read, Initiator::Cpu, tag * 512);
    }
    assert!(!cache.contains(0));
    assert!(cache.eaf().test(0));

    fill(&mut cache, RequestKind::Prefetch, PREFETCHER, 0);
    assert!(demand(&mut cache, 0));
    fill(&mut cache, RequestKind::Read, Initiator::Cpu, 3 * 512);
    cache.contains(0)
}

#[test]
fn first_use_of_reused_prefetch_stays_high_priority() {
    assert!(first_use_keeps_recently_evicted_line(true));
}

#[test]
fn first_use_without_reuse_prediction_drops_to_low_priority() {
    assert!(!first_use_keeps_recently_evicted_line(false));
}

#[test]
fn wasted_prefetches_lower_accuracy_and_later_prefetches_insert_low() {
    let mut cache = one_set(DcpConfig {
        accuracy_prediction: true,
        accuracy_max: 3,
        ..DcpConfig::default()
    });
    fill(&mut cache, RequestKind::Prefetch, PREFETCHER, 0);
    fill(&mut cache, RequestKind::Prefetch, PREFETCHER, 512);
    assert!(cache.accuracy().is_accurate(0));

    // both prefetches leave unused
    fill(&mut cache, RequestKind::Read, Initiator::Cpu, 2 * 512);
    fill(&mut cache, RequestKind::Read, Initiator::Cpu, 3 * 512);
    assert_eq!(1, cache.accuracy().value(0));
    assert!(!cache.accuracy().is_accurate(0));

    // a low-priority prefetch is the next victim, ahead of the older demand line
    fill(&mut cache, RequestKind::Prefetch, PREFETCHER, 4 * 512);
    assert!(cache.contains(4));
    fill(&mut cache, RequestKind::Read, Initiator::Cpu, 5 * 512);
    assert!(!cache.contains(4));
    assert!(cache.contains(3));
    assert!(cache.contains(5));
    // evicting a low-inserted prefetch does not count against its source again
    assert_eq!(1, cache.accuracy().value(0));
}

#[test]
fn leader_set_misses_move_the_policy_selector() {
    // eight sets of two 64-byte ways; sets 0 and 4 lead for the reuse-gated variant, sets 3 and
    // 7 for always-high
    let mut cache = DcpCache::new(
        "llc",
        DcpConfig {
            size: 1,
            block_size: 64,
            associativity: 2,
            policy: "lru".into(),
            set_dueling: true,
            leader_sets: 2,
            psel_max: 15,
            ..DcpConfig::default()
        },
    )
    .unwrap();
    assert_eq!(7, cache.duel().psel());
    assert_eq!(Some(InsertionVariant::ReuseGated), cache.duel().leader(0));
    assert_eq!(Some(InsertionVariant::AlwaysHigh), cache.duel().leader(3));
    assert_eq!(None, cache.duel().leader(1));
    assert_eq!(InsertionVariant::ReuseGated, cache.duel().variant(1));

    assert!(!demand(&mut cache, 0));
    assert_eq!(8, cache.duel().psel());
    assert_eq!(InsertionVariant::AlwaysHigh, cache.duel().variant(1));

    // followers never vote
    assert!(!demand(&mut cache, 64));
    assert_eq!(8, cache.duel().psel());

    // set 1 now follows always-high: a used prefetch keeps its place without any reuse history
    fill(&mut cache, RequestKind::Prefetch, PREFETCHER, 64);
    fill(&mut cache, RequestKind::Read, Initiator::Cpu, 9 * 64);
    assert!(demand(&mut cache, 64));
    fill(&mut cache, RequestKind::Read, Initiator::Cpu, 17 * 64);
    assert!(cache.contains(1));
    assert!(!cache.contains(9));

    assert!(!demand(&mut cache, 3 * 64));
    assert!(!demand(&mut cache, 3 * 64));
    assert_eq!(6, cache.duel().psel());
    assert_eq!(InsertionVariant::ReuseGated, cache.duel().variant(1));
}
