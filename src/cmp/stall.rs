use serde::{Deserialize, Serialize};

use crate::base::counter::Counter;
use crate::base::error::SimResult;
use crate::base::module::{module, IsModule, ModuleBase};
use crate::sim::component::{Component, Handled, StageContext};
use crate::sim::config::Config;
use crate::sim::request::Request;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StallConfig {
    /// Cycles added to every request passing through.
    pub stall_count: Cycle,
}

impl Config for StallConfig {}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StallStats {
    pub requests: Counter,
}

/// Fixed-latency pass-through stage, e.g. an interconnect hop.
pub struct Stall {
    base: ModuleBase<StallStats, StallConfig>,
}

module!(Stall, StallStats, StallConfig,);

impl Stall {
    pub fn new(name: impl Into<String>, config: StallConfig) -> Self {
        Self {
            base: ModuleBase::new(name, config),
        }
    }
}

impl Component for Stall {
    fn process_request(&mut self, _ctx: &mut StageContext, mut request: Request) -> SimResult<Handled> {
        self.stats_mut().requests.inc();
        request.add_latency(self.conf().stall_count);
        Ok(Handled::forward(0, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::module::Describe;
    use crate::sim::request::{Initiator, RequestKind};

    #[test]
    fn adds_latency_and_forwards() {
        let mut stall = Stall::new("hop", StallConfig { stall_count: 5 });
        let mut ids = 0;
        let mut ctx = StageContext::new(0, 0, &mut ids);
        let req = Request::new(1, Initiator::Cpu, RequestKind::Read, 0, 0, 8, 10);
        let handled = stall.process_request(&mut ctx, req).unwrap();
        let req = handled.request.unwrap();
        assert_eq!(15, req.current_cycle);
        assert!(!req.serviced);
        assert_eq!("hop", stall.name());
        assert_eq!(1, stall.stats().requests.get());
    }
}
