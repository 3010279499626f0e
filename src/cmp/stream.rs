use log::{debug, trace};

use crate::base::error::SimResult;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::cmp::prefetch::{send_prefetch, PrefetcherConfig, PrefetcherStats};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::request::Request;
use crate::tagstore::{PolicySignal, Table};
use crate::timeq::Cycle;

#[derive(Debug, Clone)]
struct Stream {
    alloc_block: i64,
    /// -1, 0 (unknown) or +1.
    direction: i64,
    train_hits: u32,
    trained: bool,
    start: i64,
    end: i64,
}

impl Stream {
    fn new(block: i64) -> Self {
        Self {
            alloc_block: block,
            direction: 0,
            train_hits: 0,
            trained: false,
            start: block,
            end: block,
        }
    }

    fn covers(&self, block: i64, train_distance: i64) -> bool {
        if self.trained {
            self.start.min(self.end) <= block && block <= self.start.max(self.end)
        } else {
            (block - self.alloc_block).abs() <= train_distance
        }
    }
}

/// Stream prefetcher. A miss that lands near an untrained stream votes for a direction; after
/// `num_trains` agreeing votes the stream is trained and every access inside its window pushes
/// the window forward by up to `degree` blocks, at most `distance` blocks ahead of the access.
pub struct StreamPrefetcher {
    base: ModuleBase<PrefetcherStats, PrefetcherConfig>,
    streams: Table<u64, Stream>,
    next_stream: u64,
}

module!(StreamPrefetcher, PrefetcherStats, PrefetcherConfig,);

impl StreamPrefetcher {
    pub fn new(name: impl Into<String>, config: PrefetcherConfig) -> SimResult<Self> {
        let base = ModuleBase::new(name, config);
        base.config.ensure_valid(&base.name)?;
        let streams = Table::with_policy(base.config.table_size, &base.config.table_policy)?;
        Ok(Self {
            base,
            streams,
            next_stream: 0,
        })
    }

    pub fn num_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn trained_streams(&self) -> usize {
        self.streams.iter().filter(|e| e.value.trained).count()
    }

    /// Trained streams take precedence over ones still training.
    fn find_stream(&self, block: i64) -> Option<u64> {
        let train_distance = self.conf().train_distance as i64;
        let mut candidate = None;
        for entry in self.streams.iter() {
            if !entry.value.covers(block, train_distance) {
                continue;
            }
            if entry.value.trained {
                return Some(entry.key);
            }
            candidate.get_or_insert(entry.key);
        }
        candidate
    }

    fn access(&mut self, ctx: &mut StageContext, request: &Request) {
        let block_size = self.conf().block_size;
        let num_trains = self.conf().num_trains;
        let degree = self.conf().degree;
        let distance = self.conf().distance as i64;
        let block = request.block(block_size) as i64;

        let Some(key) = self.find_stream(block) else {
            let key = self.next_stream;
            self.next_stream += 1;
            self.streams.insert(key, Stream::new(block), PolicySignal::High);
            self.stats_mut().table_misses.inc();
            trace!("{}: new stream {} at block {:#x}", self.base.name, key, block);
            return;
        };
        let Some(stream) = self.streams.read(&key, PolicySignal::High) else {
            return;
        };

        let mut newly_trained = false;
        if !stream.trained {
            let direction = (block - stream.alloc_block).signum();
            if direction == 0 {
                return;
            }
            if direction == stream.direction {
                stream.train_hits += 1;
            } else {
                stream.direction = direction;
                stream.train_hits = 1;
            }
            if stream.train_hits < num_trains {
                return;
            }
            stream.trained = true;
            stream.start = stream.alloc_block;
            stream.end = block;
            newly_trained = true;
        }

        let direction = stream.direction;
        if (stream.end - block) * direction < 0 {
            stream.end = block;
        }
        let mut issued = 0u64;
        for _ in 0..degree {
            let next = stream.end + direction;
            if (next - block) * direction > distance {
                break;
            }
            if !send_prefetch(ctx, request, block_size, next - block) {
                break;
            }
            stream.end = next;
            issued += 1;
        }
        if (stream.end - stream.start) * direction > distance {
            stream.start = stream.end - direction * distance;
        }
        let window = (stream.start, stream.end);

        if newly_trained {
            debug!(
                "{}: stream {} trained, direction {}, window {:?}",
                self.base.name, key, direction, window
            );
            self.stats_mut().trained.inc();
        }
        self.stats_mut().prefetches.add(issued);
    }
}

impl Component for StreamPrefetcher {
    fn process_request(&mut self, ctx: &mut StageContext, request: Request) -> SimResult<Handled> {
        if self.conf().trains_on(request.kind) {
            self.stats_mut().accesses.inc();
            self.access(ctx, &request);
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

    fn read(id: u64, block: u64) -> Request {
        Request::new(id, Initiator::Cpu, RequestKind::Read, block * 64, block * 64, 8, 0)
    }

    fn run(pf: &mut StreamPrefetcher, blocks: &[u64]) -> Vec<u64> {
        let mut ids = 1000;
        let mut sent = Vec::new();
        for (i, &block) in blocks.iter().enumerate() {
            let mut ctx = StageContext::new(0, 2, &mut ids);
            pf.process_request(&mut ctx, read(i as u64, block)).unwrap();
            sent.extend(ctx.take_next().into_iter().map(|r| r.paddr / 64));
        }
        sent
    }

    #[test]
    fn ascending_stream_trains_and_prefetches() {
        let mut pf = StreamPrefetcher::new("stream", PrefetcherConfig::default()).unwrap();
        assert!(run(&mut pf, &[100, 101]).is_empty());
        assert_eq!(vec![103, 104, 105, 106], run(&mut pf, &[102]));
        assert_eq!(1, pf.trained_streams());
        // access inside the window continues from the window end
        assert_eq!(vec![107, 108, 109, 110], run(&mut pf, &[103]));
    }

    #[test]
    fn descending_stream() {
        let mut pf = StreamPrefetcher::new("stream", PrefetcherConfig::default()).unwrap();
        let sent = run(&mut pf, &[500, 498, 497]);
        assert_eq!(vec![496, 495, 494, 493], sent);
    }

    #[test]
    fn window_never_runs_past_distance() {
        let config = PrefetcherConfig {
            degree: 16,
            distance: 3,
            ..PrefetcherConfig::default()
        };
        let mut pf = StreamPrefetcher::new("stream", config).unwrap();
        assert_eq!(vec![11, 12, 13], run(&mut pf, &[8, 9, 10]));
        assert!(run(&mut pf, &[10]).is_empty());
    }

    #[test]
    fn distant_misses_open_new_streams() {
        let mut pf = StreamPrefetcher::new("stream", PrefetcherConfig::default()).unwrap();
        run(&mut pf, &[0, 1000, 5000]);
        assert_eq!(3, pf.num_streams());
        assert_eq!(0, pf.trained_streams());
    }

    #[test]
    fn table_is_bounded() {
        let config = PrefetcherConfig {
            table_size: 2,
            ..PrefetcherConfig::default()
        };
        let mut pf = StreamPrefetcher::new("stream", config).unwrap();
        run(&mut pf, &[0, 1000, 5000, 9000]);
        assert_eq!(2, pf.num_streams());
    }

    #[test]
    fn read_for_write_trains_only_when_enabled() {
        let mut pf = StreamPrefetcher::new("stream", PrefetcherConfig::default()).unwrap();
        let mut ids = 0;
        let mut ctx = StageContext::new(0, 0, &mut ids);
        let mut rfw = read(1, 4);
        rfw.kind = RequestKind::ReadForWrite;
        pf.process_request(&mut ctx, rfw).unwrap();
        assert_eq!(0, pf.num_streams());
    }
}
