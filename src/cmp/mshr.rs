use std::collections::{HashMap, VecDeque};

use log::trace;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::base::counter::Counter;
use crate::base::error::{ensure_config, SimResult};
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::config::Config;
use crate::sim::request::{Request, RequestId, RequestKind};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MshrConfig {
    /// Outstanding distinct-block misses; zero means unbounded.
    pub count: usize,
    pub block_size: u64,
}

impl Config for MshrConfig {}

impl Default for MshrConfig {
    fn default() -> Self {
        Self {
            count: 32,
            block_size: 64,
        }
    }
}

impl MshrConfig {
    pub fn ensure_valid(&self) -> SimResult<()> {
        ensure_config!(self.block_size > 0, "mshr", "block_size must be positive");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MshrStats {
    pub accesses: Counter,
    pub fills: Counter,
    pub parked: Counter,
    pub write_completions: Counter,
    pub stalls: Counter,
    pub bypassed_writebacks: Counter,
    pub max_outstanding: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Allocation {
    Allocated,
    /// A fill for the block is already outstanding.
    Pending,
    Full,
}

#[derive(Debug)]
pub(crate) struct MshrEntry {
    pub(crate) fill_id: RequestId,
    pub(crate) merged: SmallVec<[Request; 4]>,
}

/// Block address to outstanding fill. A block is present at most once and leaves only when its
/// fill returns.
#[derive(Debug)]
pub(crate) struct MshrTable {
    capacity: usize,
    entries: HashMap<u64, MshrEntry>,
}

impl MshrTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
        }
    }

    pub(crate) fn has_entry(&self, block: u64) -> bool {
        self.entries.contains_key(&block)
    }

    pub(crate) fn is_full(&self) -> bool {
        self.capacity != 0 && self.entries.len() >= self.capacity
    }

    /// Open an entry for `block` unless it is already tracked or no register is free.
    pub(crate) fn allocate(&mut self, block: u64, fill_id: RequestId) -> Allocation {
        if self.has_entry(block) {
            return Allocation::Pending;
        }
        if self.is_full() {
            return Allocation::Full;
        }
        self.entries.insert(
            block,
            MshrEntry {
                fill_id,
                merged: SmallVec::new(),
            },
        );
        Allocation::Allocated
    }

    /// Park `request` behind the fill for `block`; hands it back if there is no such fill.
    pub(crate) fn merge_request(&mut self, block: u64, request: Request) -> Result<(), Request> {
        match self.entries.get_mut(&block) {
            Some(entry) => {
                entry.merged.push(request);
                Ok(())
            }
            None => Err(request),
        }
    }

    pub(crate) fn remove_entry(&mut self, block: u64) -> Option<MshrEntry> {
        self.entries.remove(&block)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Miss-status holding registers: coalesces concurrent misses to one block into a single fill
/// sent downstream, and holds back new misses once every register is busy.
pub struct Mshr {
    base: ModuleBase<MshrStats, MshrConfig>,
    table: MshrTable,
    wait_queue: VecDeque<Request>,
}

module!(Mshr, MshrStats, MshrConfig,);

impl Mshr {
    pub fn new(name: impl Into<String>, config: MshrConfig) -> SimResult<Self> {
        config.ensure_valid()?;
        let table = MshrTable::new(config.count);
        Ok(Self {
            base: ModuleBase::new(name, config),
            table,
            wait_queue: VecDeque::new(),
        })
    }

    pub fn outstanding(&self) -> usize {
        self.table.len()
    }

    pub fn waiting(&self) -> usize {
        self.wait_queue.len()
    }

    fn block_addr(&self, request: &Request) -> u64 {
        request.paddr_block_aligned(self.conf().block_size)
    }

    /// Merge onto a pending miss or open a new one. Hands the request back when every register
    /// is taken.
    fn admit(&mut self, ctx: &mut StageContext, request: Request) -> Result<Handled, Request> {
        let block = self.block_addr(&request);
        let fill_id = ctx.alloc_id();
        match self.table.allocate(block, fill_id) {
            Allocation::Pending => {
                trace!("{}: #{} merges onto block {:#x}", self.base.name, request.id, block);
                Ok(self.park_or_complete(block, request))
            }
            Allocation::Full => Err(request),
            Allocation::Allocated => {
                let kind = match request.kind {
                    RequestKind::Read | RequestKind::Prefetch => RequestKind::Read,
                    _ => RequestKind::ReadForWrite,
                };
                let size = self.conf().block_size as u32;
                let fill = Request::spawn(fill_id, ctx.stage, kind, request.vaddr, block, size, &request);
                let outstanding = self.table.len() as u64;
                let stats = self.stats_mut();
                stats.fills.inc();
                stats.max_outstanding = stats.max_outstanding.max(outstanding);
                trace!("{}: #{} misses, fill #{} for {:#x}", self.base.name, request.id, fill.id, block);
                ctx.send_next(fill);
                Ok(self.park_or_complete(block, request))
            }
        }
    }

    /// Reads wait for the data; stores complete as soon as the miss is recorded.
    fn park_or_complete(&mut self, block: u64, mut request: Request) -> Handled {
        if request.kind.is_read_like() {
            request.stalling = true;
            self.stats_mut().parked.inc();
            match self.table.merge_request(block, request) {
                Ok(()) => Handled::parked(0),
                Err(request) => Handled::forward(0, request),
            }
        } else {
            self.stats_mut().write_completions.inc();
            request.serviced = true;
            Handled::forward(0, request)
        }
    }
}

impl Component for Mshr {
    fn process_request(&mut self, ctx: &mut StageContext, request: Request) -> SimResult<Handled> {
        if request.kind == RequestKind::Writeback {
            self.stats_mut().bypassed_writebacks.inc();
            return Ok(Handled::forward(0, request));
        }
        self.stats_mut().accesses.inc();

        // A new block may not claim a register ahead of misses already waiting for one.
        let block = self.block_addr(&request);
        let admitted = if self.wait_queue.is_empty() || self.table.has_entry(block) {
            self.admit(ctx, request)
        } else {
            Err(request)
        };
        match admitted {
            Ok(handled) => Ok(handled),
            Err(mut request) => {
                trace!("{}: full, #{} waits", self.base.name, request.id);
                self.stats_mut().stalls.inc();
                request.stalling = true;
                self.wait_queue.push_back(request);
                Ok(Handled::parked(0))
            }
        }
    }

    fn process_return(&mut self, ctx: &mut StageContext, request: &mut Request) -> SimResult<Cycle> {
        if !request.is_from(ctx.stage) {
            return Ok(0);
        }
        let block = request.paddr;
        if let Some(entry) = self.table.remove_entry(block) {
            debug_assert_eq!(entry.fill_id, request.id);
            for mut secondary in entry.merged {
                secondary.stalling = false;
                secondary.serviced = true;
                secondary.current_cycle = request.current_cycle;
                secondary.dirty_reply |= request.dirty_reply;
                ctx.add_request(secondary);
            }
        }
        // Waiters are admitted oldest first until the table fills again.
        while let Some(mut waiting) = self.wait_queue.pop_front() {
            waiting.stalling = false;
            waiting.current_cycle = waiting.current_cycle.max(request.current_cycle);
            match self.admit(ctx, waiting) {
                Ok(handled) => {
                    if let Some(done) = handled.request {
                        ctx.add_request(done);
                    }
                }
                Err(mut waiting) => {
                    waiting.stalling = true;
                    self.wait_queue.push_front(waiting);
                    break;
                }
            }
        }
        request.destroy = true;
        Ok(0)
    }

    fn is_idle(&self) -> bool {
        self.table.len() == 0 && self.wait_queue.is_empty()
    }
}
