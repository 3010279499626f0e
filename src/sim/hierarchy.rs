use log::{debug, info, trace};
use serde::Serialize;

use crate::base::error::{SimError, SimResult};
use crate::sim::component::{Component, StageContext};
use crate::sim::config::SimConfig;
use crate::sim::request::{Initiator, Request, RequestId, StageId};
use crate::sim::trace::TraceRecord;
use crate::timeq::{Cycle, TimeQueue};

struct Stage {
    component: Box<dyn Component>,
    queue: TimeQueue<Request>,
    busy_until: Cycle,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunSummary {
    pub cycles: Cycle,
    pub issued: u64,
    pub completed: u64,
    pub total_latency: u64,
}

impl RunSummary {
    pub fn average_latency(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_latency as f64 / self.completed as f64
        }
    }
}

/// Ordered chain of components, stage 0 nearest the CPU. Drives every stage's queue forward in
/// simulated time and collects requests that walk back past stage 0.
pub struct Hierarchy {
    config: SimConfig,
    stages: Vec<Stage>,
    now: Cycle,
    next_id: RequestId,
    last_heartbeat: Cycle,
    completions: Vec<Request>,
    summary: RunSummary,
}

impl Hierarchy {
    pub fn new(config: SimConfig, components: Vec<Box<dyn Component>>) -> SimResult<Self> {
        if components.is_empty() {
            return Err(SimError::invalid_config("hierarchy", "at least one stage is required"));
        }
        let stages = components
            .into_iter()
            .map(|component| Stage {
                component,
                queue: TimeQueue::new(),
                busy_until: 0,
            })
            .collect();
        Ok(Self {
            config,
            stages,
            now: 0,
            next_id: 0,
            last_heartbeat: 0,
            completions: Vec::new(),
            summary: RunSummary::default(),
        })
    }

    pub fn now(&self) -> Cycle {
        self.now
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn component(&self, stage: StageId) -> Option<&dyn Component> {
        self.stages.get(stage).map(|s| s.component.as_ref())
    }

    /// Inject a CPU request into stage 0 at its issue cycle.
    pub fn issue(&mut self, record: &TraceRecord) -> RequestId {
        let id = self.next_id;
        self.next_id += 1;
        let request = Request::new(
            id,
            Initiator::Cpu,
            record.kind,
            record.vaddr,
            record.paddr,
            record.size,
            record.cycle,
        )
        .with_core(record.core_id)
        .with_ip(record.ip);
        self.summary.issued += 1;
        trace!("issue #{} {:?} {:#x} at {}", id, record.kind, record.paddr, record.cycle);
        self.enqueue(0, request);
        id
    }

    /// CPU requests that came back since the last call.
    pub fn drain_completions(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.completions)
    }

    pub fn outstanding(&self) -> u64 {
        self.summary.issued - self.summary.completed
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            cycles: self.now,
            ..self.summary
        }
    }

    fn enqueue(&mut self, stage: StageId, mut request: Request) {
        request.stage = stage;
        self.stages[stage].queue.push(request.current_cycle, request);
    }

    fn complete(&mut self, mut request: Request) {
        request.finished = true;
        if request.initiator == Initiator::Cpu {
            self.summary.completed += 1;
            self.summary.total_latency += request.latency();
            trace!("complete #{} latency {}", request.id, request.latency());
            self.completions.push(request);
        } else {
            debug!("component request #{} reached the CPU, dropping", request.id);
        }
    }

    /// Move a serviced request one stage up, or out of the hierarchy past stage 0.
    fn send_up(&mut self, from: StageId, request: Request) {
        if from == 0 {
            self.complete(request);
        } else {
            self.enqueue(from - 1, request);
        }
    }

    fn send_down(&mut self, from: StageId, request: Request) -> SimResult<()> {
        if from + 1 >= self.stages.len() {
            return Err(SimError::Unserviced {
                id: request.id,
                stage: from,
            });
        }
        self.enqueue(from + 1, request);
        Ok(())
    }

    fn route(&mut self, stage: StageId, request: Request) -> SimResult<()> {
        if request.destroy {
            trace!("stage {} destroyed #{}", stage, request.id);
            Ok(())
        } else if request.serviced {
            self.send_up(stage, request);
            Ok(())
        } else {
            self.send_down(stage, request)
        }
    }

    fn drain_outboxes(&mut self, stage: StageId, ctx: &mut StageContext) -> SimResult<()> {
        for request in ctx.take_next() {
            self.send_down(stage, request)?;
        }
        for request in ctx.take_prev() {
            self.send_up(stage, request);
        }
        for request in ctx.take_self() {
            self.enqueue(stage, request);
        }
        Ok(())
    }

    /// Tick the stage, then process every queued request due by `now`. Returns whether anything
    /// happened.
    fn step_stage(&mut self, stage: StageId) -> SimResult<bool> {
        let now = self.now;
        let mut next_id = self.next_id;
        let mut ctx = StageContext::new(now, stage, &mut next_id);
        self.stages[stage].component.tick(&mut ctx)?;
        let mut progress = ctx.has_output();
        self.drain_outboxes(stage, &mut ctx)?;

        loop {
            let slot = &mut self.stages[stage];
            if slot.busy_until > now {
                break;
            }
            let Some((_, mut request)) = slot.queue.pop_due(now) else {
                break;
            };
            progress = true;
            let start = request.current_cycle.max(slot.busy_until);
            request.current_cycle = start;
            ctx.now = start;

            if request.serviced {
                let busy = slot.component.process_return(&mut ctx, &mut request)?;
                slot.busy_until = start + busy;
                self.drain_outboxes(stage, &mut ctx)?;
                if request.destroy {
                    trace!("stage {} retired #{}", stage, request.id);
                } else {
                    self.send_up(stage, request);
                }
            } else {
                let handled = slot.component.process_request(&mut ctx, request)?;
                slot.busy_until = start + handled.busy;
                self.drain_outboxes(stage, &mut ctx)?;
                if let Some(request) = handled.request {
                    self.route(stage, request)?;
                }
            }
        }

        drop(ctx);
        self.next_id = next_id;
        Ok(progress)
    }

    /// Process everything whose time has come, up to and including `now`.
    pub fn advance_to(&mut self, now: Cycle) -> SimResult<()> {
        self.now = now.max(self.now);
        loop {
            let mut progress = false;
            for stage in 0..self.stages.len() {
                progress |= self.step_stage(stage)?;
            }
            if !progress {
                break;
            }
        }

        let interval = self.config.heartbeat_interval;
        if interval > 0 && self.now >= self.last_heartbeat + interval {
            let count = self.now - self.last_heartbeat;
            self.last_heartbeat = self.now;
            let mut next_id = self.next_id;
            for stage in 0..self.stages.len() {
                let mut ctx = StageContext::new(self.now, stage, &mut next_id);
                self.stages[stage].component.heartbeat(&mut ctx, count);
                self.drain_outboxes(stage, &mut ctx)?;
            }
            self.next_id = next_id;
        }
        Ok(())
    }

    /// Feed `records` (sorted by issue cycle) into the hierarchy and run until every request has
    /// completed and the hierarchy has gone quiet, or until `max_cycles`.
    pub fn run<I>(&mut self, records: I, max_cycles: Option<Cycle>) -> SimResult<RunSummary>
    where
        I: IntoIterator<Item = TraceRecord>,
    {
        let max_cycles = max_cycles.unwrap_or(self.config.max_cycles);
        let mut records = records.into_iter().peekable();
        info!("simulating {} stages for at most {} cycles", self.stages.len(), max_cycles);

        while self.now < max_cycles {
            while let Some(record) = records.next_if(|r| r.cycle <= self.now) {
                self.issue(&record);
            }
            self.advance_to(self.now)?;

            let idle = self.stages.iter().all(|s| s.component.is_idle());
            if idle && records.peek().is_none() && self.stages.iter().all(|s| s.queue.is_empty()) {
                break;
            }
            // skip stretches where nothing can happen instead of stepping one cycle at a time
            let next = if idle {
                self.stages
                    .iter()
                    .filter_map(|s| s.queue.next_cycle().map(|c| c.max(s.busy_until)))
                    .chain(records.peek().map(|r| r.cycle))
                    .min()
                    .unwrap_or(self.now + 1)
                    .max(self.now + 1)
            } else {
                self.now + 1
            };
            self.now = next.min(max_cycles);
        }

        let summary = self.summary();
        info!(
            "finished at cycle {}: {} of {} requests completed, average latency {:.2}",
            summary.cycles,
            summary.completed,
            summary.issued,
            summary.average_latency()
        );
        Ok(summary)
    }

    /// Per-stage statistics keyed by stage name.
    pub fn stats(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for stage in &self.stages {
            map.insert(
                stage.component.name().to_string(),
                stage.component.stats_json(),
            );
        }
        serde_json::Value::Object(map)
    }
}
