//! DRAM controller stage.
//!
//! Requests wait in per-direction FIFOs until the scheduler offers them to the timing model.
//! Accepted requests are parked in an in-flight map keyed by transaction address; the model's
//! completions resolve them, stamp the completion time and send them back up the hierarchy.

pub mod model;
pub mod sched;

use std::collections::{HashMap, VecDeque};

use log::{trace, warn};
use serde::{Deserialize, Serialize};

use crate::base::counter::Counter;
use crate::base::error::{ensure_config, SimError, SimResult};
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::config::Config;
use crate::sim::request::{Request, RequestKind};
use crate::timeq::Cycle;
use model::{align_to_transaction, BankedDram, BankedDramConfig, Completion, TimingModel};
use sched::{build_scheduler, is_known_scheduler, RequestQueues, RowBuffers, Scheduler};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DramConfig {
    pub num_banks: usize,
    /// Bytes per DRAM row.
    pub row_size: u64,
    /// Write FIFO length that triggers drain mode.
    pub write_buffer_entries: usize,
    /// Core cycles per model cycle.
    pub bus_processor_ratio: Cycle,
    pub scheduler: String,
    /// Cap on requests in flight in the model; zero leaves it to the model.
    pub max_pending: usize,
    /// Latencies of the built-in bank model, in model cycles.
    pub row_hit_latency: Cycle,
    pub row_conflict_latency: Cycle,
    pub transaction_queue: usize,
}

impl Config for DramConfig {}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            num_banks: 8,
            row_size: 8192,
            write_buffer_entries: 64,
            bus_processor_ratio: 8,
            scheduler: "fr-fcfs".to_string(),
            max_pending: 0,
            row_hit_latency: 4,
            row_conflict_latency: 12,
            transaction_queue: 32,
        }
    }
}

impl DramConfig {
    pub fn ensure_valid(&self) -> SimResult<()> {
        ensure_config!(self.num_banks > 0, "dram", "num_banks must be positive");
        ensure_config!(self.row_size > 0, "dram", "row_size must be positive");
        ensure_config!(
            self.write_buffer_entries > 0,
            "dram",
            "write_buffer_entries must be positive"
        );
        ensure_config!(
            self.bus_processor_ratio > 0,
            "dram",
            "bus_processor_ratio must be positive"
        );
        if !is_known_scheduler(&self.scheduler) {
            return Err(SimError::UnknownScheduler(self.scheduler.clone()));
        }
        Ok(())
    }

    pub fn banked_model(&self) -> BankedDramConfig {
        BankedDramConfig {
            num_banks: self.num_banks,
            row_size: self.row_size,
            row_hit_latency: self.row_hit_latency,
            row_conflict_latency: self.row_conflict_latency,
            queue_capacity: self.transaction_queue,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DramStats {
    pub accesses: Counter,
    pub reads: Counter,
    pub writes: Counter,
    pub read_row_hits: Counter,
    pub write_row_hits: Counter,
    pub row_conflicts: Counter,
    pub rejections: Counter,
    pub completions: Counter,
    pub drains: Counter,
    pub read_latency: Counter,
    pub write_latency: Counter,
}

pub struct DramController {
    base: ModuleBase<DramStats, DramConfig>,
    model: Box<dyn TimingModel>,
    scheduler: Box<dyn Scheduler>,
    queues: RequestQueues,
    rows: RowBuffers,
    /// Keyed by direction and transaction address; a read and a write to one line may overlap.
    in_flight: HashMap<(bool, u64), VecDeque<Request>>,
    pending: usize,
    completed: Vec<Completion>,
}

module!(DramController, DramStats, DramConfig,);

impl DramController {
    /// Controller driving the built-in fixed-latency bank model.
    pub fn new(name: impl Into<String>, config: DramConfig) -> SimResult<Self> {
        let model = BankedDram::new(config.banked_model());
        Self::with_model(name, config, Box::new(model))
    }

    pub fn with_model(
        name: impl Into<String>,
        config: DramConfig,
        model: Box<dyn TimingModel>,
    ) -> SimResult<Self> {
        config.ensure_valid()?;
        let scheduler = build_scheduler(&config.scheduler, config.write_buffer_entries)?;
        let rows = RowBuffers::new(config.num_banks, config.row_size);
        Ok(Self {
            base: ModuleBase::new(name, config),
            model,
            scheduler,
            queues: RequestQueues::default(),
            rows,
            in_flight: HashMap::new(),
            pending: 0,
            completed: Vec::new(),
        })
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn queued(&self) -> usize {
        self.queues.len()
    }

    pub fn is_draining(&self) -> bool {
        self.scheduler.is_draining()
    }

    fn advance_model(&mut self, now: Cycle) {
        let ratio = self.conf().bus_processor_ratio;
        while self.model.cycle() * ratio < now {
            self.model.update(&mut self.completed);
        }
    }

    fn resolve(&mut self, ctx: &mut StageContext, completion: Completion) -> SimResult<()> {
        let key = (completion.is_write, completion.addr);
        let request = self.in_flight.get_mut(&key).and_then(VecDeque::pop_front);
        let Some(mut request) = request else {
            return Err(SimError::UnmatchedCompletion {
                component: self.base.name.clone(),
                addr: completion.addr,
            });
        };
        if self.in_flight.get(&key).is_some_and(VecDeque::is_empty) {
            self.in_flight.remove(&key);
        }
        self.pending = self.pending.saturating_sub(1);

        let done = completion.cycle * self.conf().bus_processor_ratio;
        let issued = request.current_cycle;
        request.current_cycle = request.current_cycle.max(done);
        request.serviced = true;
        let latency = request.current_cycle - issued;
        let stats = self.stats_mut();
        stats.completions.inc();
        if completion.is_write {
            stats.write_latency.add(latency);
        } else {
            stats.read_latency.add(latency);
        }
        trace!(
            "{}: #{} done at model cycle {} ({} cycles)",
            self.base.name,
            request.id,
            completion.cycle,
            latency
        );
        ctx.send_prev(request);
        Ok(())
    }

    fn has_budget(&self) -> bool {
        let max = self.conf().max_pending;
        max == 0 || self.pending < max
    }

    /// Offer scheduled requests to the model until it refuses one or the budget runs out.
    fn schedule(&mut self, now: Cycle) {
        while self.has_budget() {
            let was_draining = self.scheduler.is_draining();
            let Some(mut request) = self.scheduler.next(&mut self.queues, &self.rows) else {
                break;
            };
            if !was_draining && self.scheduler.is_draining() {
                self.stats_mut().drains.inc();
            }
            let is_write = request.kind == RequestKind::Writeback;
            if self.rows.access(request.paddr) {
                let stats = self.stats_mut();
                if is_write {
                    stats.write_row_hits.inc();
                } else {
                    stats.read_row_hits.inc();
                }
            } else {
                self.stats_mut().row_conflicts.inc();
            }

            let addr = align_to_transaction(request.paddr);
            if !self.model.add_transaction(is_write, addr) {
                warn!(
                    "{}: timing model rejected #{} ({:#x}), retrying later",
                    self.base.name, request.id, addr
                );
                self.stats_mut().rejections.inc();
                self.queues.requeue(request);
                break;
            }
            request.current_cycle = request.current_cycle.max(now);
            request.dram_issue_cycle = Some(request.current_cycle);
            self.pending += 1;
            self.in_flight.entry((is_write, addr)).or_default().push_back(request);
        }
    }
}

impl Component for DramController {
    fn process_request(&mut self, _ctx: &mut StageContext, request: Request) -> SimResult<Handled> {
        self.stats_mut().accesses.inc();
        match request.kind {
            RequestKind::Read | RequestKind::ReadForWrite | RequestKind::Prefetch => {
                self.stats_mut().reads.inc();
                self.queues.reads.push_back(request);
            }
            RequestKind::Writeback => {
                self.stats_mut().writes.inc();
                self.queues.writes.push_back(request);
            }
            RequestKind::Write | RequestKind::PartialWrite => {
                return Err(SimError::UnsupportedRequest {
                    component: self.base.name.clone(),
                    kind: request.kind,
                });
            }
        }
        Ok(Handled::parked(0))
    }

    fn tick(&mut self, ctx: &mut StageContext) -> SimResult<()> {
        self.advance_model(ctx.now);
        for completion in std::mem::take(&mut self.completed) {
            self.resolve(ctx, completion)?;
        }
        self.schedule(ctx.now);
        Ok(())
    }

    /// Writes held below the drain threshold do not keep the controller busy; anything the
    /// model turned away or the budget held back implies a request still in flight.
    fn is_idle(&self) -> bool {
        self.queues.reads.is_empty() && self.in_flight.is_empty()
    }
}
