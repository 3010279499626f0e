//! Scenarios that drive several components together through the hierarchy.

mod cache_tests;

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;

use crate::base::counter::Counter;
use crate::base::error::SimResult;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::request::{Request, RequestKind};
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Seen {
    pub kind: RequestKind,
    pub paddr: u64,
    pub cycle: Cycle,
}

#[derive(Debug, Clone, Default, Serialize)]
pub(crate) struct MemoryStats {
    pub accesses: Counter,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct MemoryConfig {
    pub latency: Cycle,
}

/// Last-level stand-in that services everything after a fixed latency and records what it saw.
pub(crate) struct FixedMemory {
    base: ModuleBase<MemoryStats, MemoryConfig>,
    seen: Rc<RefCell<Vec<Seen>>>,
}

module!(FixedMemory, MemoryStats, MemoryConfig,);

impl FixedMemory {
    pub fn new(latency: Cycle) -> (Self, Rc<RefCell<Vec<Seen>>>) {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let memory = Self {
            base: ModuleBase::new("memory", MemoryConfig { latency }),
            seen: seen.clone(),
        };
        (memory, seen)
    }
}

impl Component for FixedMemory {
    fn process_request(&mut self, _ctx: &mut StageContext, mut request: Request) -> SimResult<Handled> {
        self.stats_mut().accesses.inc();
        self.seen.borrow_mut().push(Seen {
            kind: request.kind,
            paddr: request.paddr,
            cycle: request.current_cycle,
        });
        request.serviced = true;
        request.add_latency(self.conf().latency);
        Ok(Handled::forward(0, request))
    }
}
