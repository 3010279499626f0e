use log::trace;

use crate::base::error::SimResult;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::cmp::prefetch::{send_prefetch, PrefetcherConfig, PrefetcherStats};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::request::Request;
use crate::tagstore::{PolicySignal, Table};
use crate::timeq::Cycle;

/// Per-instruction stride history, in physical block numbers.
#[derive(Debug, Clone)]
struct StrideEntry {
    last_block: i64,
    /// Furthest block already prefetched along the stride.
    prefetched: i64,
    stride: i64,
    train_hits: u32,
    trained: bool,
}

impl StrideEntry {
    fn new(block: i64) -> Self {
        Self {
            last_block: block,
            prefetched: block,
            stride: 0,
            train_hits: 0,
            trained: false,
        }
    }
}

/// Instruction-pointer indexed stride prefetcher. Once an instruction has produced the same
/// block stride `num_trains` times in a row, each access sends up to `degree` prefetches one
/// stride apart, never more than `distance` blocks past the access.
pub struct StridePrefetcher {
    base: ModuleBase<PrefetcherStats, PrefetcherConfig>,
    table: Table<u64, StrideEntry>,
}

module!(StridePrefetcher, PrefetcherStats, PrefetcherConfig,);

impl StridePrefetcher {
    pub fn new(name: impl Into<String>, config: PrefetcherConfig) -> SimResult<Self> {
        let base = ModuleBase::new(name, config);
        base.config.ensure_valid(&base.name)?;
        let table = Table::with_policy(base.config.table_size, &base.config.table_policy)?;
        Ok(Self { base, table })
    }

    pub fn is_trained(&self, ip: u64) -> bool {
        self.table.get(&ip).is_some_and(|e| e.trained)
    }

    pub fn stride_of(&self, ip: u64) -> Option<i64> {
        self.table.get(&ip).map(|e| e.stride)
    }

    fn train(&mut self, ctx: &mut StageContext, request: &Request) {
        let block_size = self.conf().block_size;
        let num_trains = self.conf().num_trains;
        let degree = self.conf().degree;
        let distance = self.conf().distance as i64;
        let block = request.block(block_size) as i64;

        let Some(entry) = self.table.read(&request.ip, PolicySignal::High) else {
            self.table.insert(request.ip, StrideEntry::new(block), PolicySignal::High);
            self.stats_mut().table_misses.inc();
            return;
        };

        let delta = block - entry.last_block;
        let mut newly_trained = false;
        if !entry.trained || delta != entry.stride {
            if delta == entry.stride {
                entry.train_hits += 1;
            } else {
                entry.stride = delta;
                entry.train_hits = 0;
                entry.trained = false;
            }
            entry.last_block = block;
            entry.prefetched = block;
            if entry.train_hits >= num_trains && entry.stride != 0 {
                entry.trained = true;
                newly_trained = true;
            }
        }
        if !entry.trained || delta == 0 {
            if newly_trained {
                self.stats_mut().trained.inc();
            }
            return;
        }

        entry.last_block = block;
        let stride = entry.stride;
        // restart from the access if it overtook the prefetches
        if (entry.prefetched - block) * stride.signum() < 0 {
            entry.prefetched = block;
        }
        let mut issued = 0u64;
        for _ in 0..degree {
            let next = entry.prefetched + stride;
            if (next - block).abs() > distance {
                break;
            }
            if !send_prefetch(ctx, request, block_size, next - block) {
                break;
            }
            entry.prefetched = next;
            issued += 1;
        }
        trace!(
            "{}: ip {:#x} stride {} sent {} prefetches",
            self.base.name,
            request.ip,
            stride,
            issued
        );
        let stats = self.stats_mut();
        if newly_trained {
            stats.trained.inc();
        }
        stats.prefetches.add(issued);
    }
}

impl Component for StridePrefetcher {
    fn process_request(&mut self, ctx: &mut StageContext, request: Request) -> SimResult<Handled> {
        if self.conf().trains_on(request.kind) {
            self.stats_mut().accesses.inc();
            self.train(ctx, &request);
        }
        Ok(Handled::forward(0, request))
    }

    fn process_return(&mut self, ctx: &mut StageContext, request: &mut Request) -> SimResult<Cycle> {
        if request.is_from(ctx.stage) {
            request.destroy = true;
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::request::{Initiator, RequestKind};

    fn access(id: u64, ip: u64, block: u64) -> Request {
        Request::new(id, Initiator::Cpu, RequestKind::Read, block * 64, block * 64, 8, 0).with_ip(ip)
    }

    fn run(pf: &mut StridePrefetcher, requests: impl IntoIterator<Item = Request>) -> Vec<Request> {
        let mut ids = 1000;
        let mut sent = Vec::new();
        for request in requests {
            let mut ctx = StageContext::new(0, 1, &mut ids);
            let handled = pf.process_request(&mut ctx, request).unwrap();
            assert!(handled.request.is_some());
            sent.extend(ctx.take_next());
        }
        sent
    }

    #[test]
    fn trains_then_prefetches_along_the_stride() {
        let mut pf = StridePrefetcher::new("stride", PrefetcherConfig::default()).unwrap();
        let sent = run(&mut pf, (0..4).map(|i| access(i, 0x400, i * 2)));
        assert!(pf.is_trained(0x400));
        assert_eq!(Some(2), pf.stride_of(0x400));
        let blocks: Vec<u64> = sent.iter().map(|r| r.paddr / 64).collect();
        assert_eq!(vec![8, 10, 12, 14], blocks);
        assert!(sent.iter().all(|r| r.kind == RequestKind::Prefetch && r.is_from(1)));
        assert_eq!(0x400, sent[0].ip);
    }

    #[test]
    fn prefetching_stays_within_distance() {
        let config = PrefetcherConfig {
            degree: 8,
            distance: 4,
            ..PrefetcherConfig::default()
        };
        let mut pf = StridePrefetcher::new("stride", config).unwrap();
        let sent = run(&mut pf, (0..5).map(|i| access(i, 0x10, i)));
        let blocks: Vec<u64> = sent.iter().map(|r| r.paddr / 64).collect();
        // trained at block 3: 4..=7, then block 4 only adds 8
        assert_eq!(vec![4, 5, 6, 7, 8], blocks);
    }

    #[test]
    fn stride_change_retrains() {
        let mut pf = StridePrefetcher::new("stride", PrefetcherConfig::default()).unwrap();
        run(&mut pf, (0..4).map(|i| access(i, 1, i)));
        assert!(pf.is_trained(1));
        let sent = run(&mut pf, [access(9, 1, 100)]);
        assert!(sent.is_empty());
        assert!(!pf.is_trained(1));
    }

    #[test]
    fn writes_and_prefetches_do_not_train() {
        let mut pf = StridePrefetcher::new("stride", PrefetcherConfig::default()).unwrap();
        let writes = (0..6).map(|i| {
            let mut r = access(i, 7, i);
            r.kind = RequestKind::Write;
            r
        });
        assert!(run(&mut pf, writes).is_empty());
        assert_eq!(None, pf.stride_of(7));
    }

    #[test]
    fn own_prefetches_are_destroyed_on_return() {
        let mut pf = StridePrefetcher::new("stride", PrefetcherConfig::default()).unwrap();
        let mut ids = 0;
        let mut ctx = StageContext::new(0, 3, &mut ids);
        let mut own = Request::new(1, Initiator::Component(3), RequestKind::Prefetch, 0, 0, 64, 0);
        let mut demand = access(2, 0, 0);
        pf.process_return(&mut ctx, &mut own).unwrap();
        pf.process_return(&mut ctx, &mut demand).unwrap();
        assert!(own.destroy);
        assert!(!demand.destroy);
    }

    #[test]
    fn unknown_table_policy_is_rejected() {
        let config = PrefetcherConfig {
            table_policy: "fifo".into(),
            ..PrefetcherConfig::default()
        };
        assert!(StridePrefetcher::new("stride", config).is_err());
    }
}
