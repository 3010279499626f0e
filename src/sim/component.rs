use crate::base::error::SimResult;
use crate::base::module::Describe;
use crate::sim::request::{Request, RequestId, StageId};
use crate::timeq::Cycle;

/// Outcome of `Component::process_request`.
///
/// `request` is `None` when the component kept the request (parked on an MSHR entry, queued in
/// a DRAM FIFO, ...). A returned request is routed by its flags: `destroy` drops it, `serviced`
/// sends it back up the hierarchy and anything else moves it one stage down.
#[derive(Debug)]
pub struct Handled {
    pub busy: Cycle,
    pub request: Option<Request>,
}

impl Handled {
    pub fn forward(busy: Cycle, request: Request) -> Self {
        Self {
            busy,
            request: Some(request),
        }
    }

    pub fn parked(busy: Cycle) -> Self {
        Self {
            busy,
            request: None,
        }
    }
}

/// Everything a component may touch while handling one event: the current cycle, its own
/// position in the hierarchy, the request-id allocator, and outboxes toward its neighbours and
/// its own queue. The hierarchy drains the outboxes after every call.
#[derive(Debug)]
pub struct StageContext<'a> {
    pub now: Cycle,
    pub stage: StageId,
    next_id: &'a mut RequestId,
    to_next: Vec<Request>,
    to_prev: Vec<Request>,
    to_self: Vec<Request>,
}

impl<'a> StageContext<'a> {
    pub fn new(now: Cycle, stage: StageId, next_id: &'a mut RequestId) -> Self {
        Self {
            now,
            stage,
            next_id,
            to_next: Vec::new(),
            to_prev: Vec::new(),
            to_self: Vec::new(),
        }
    }

    pub fn alloc_id(&mut self) -> RequestId {
        let id = *self.next_id;
        *self.next_id += 1;
        id
    }

    /// Forward a request (usually one this stage created) to the stage below.
    pub fn send_next(&mut self, request: Request) {
        self.to_next.push(request);
    }

    /// Hand a serviced request back to the stage above.
    pub fn send_prev(&mut self, request: Request) {
        self.to_prev.push(request);
    }

    /// Re-inject a request into this stage's own queue.
    pub fn add_request(&mut self, request: Request) {
        self.to_self.push(request);
    }

    pub fn take_next(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.to_next)
    }

    pub fn take_prev(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.to_prev)
    }

    pub fn take_self(&mut self) -> Vec<Request> {
        std::mem::take(&mut self.to_self)
    }

    pub fn has_output(&self) -> bool {
        !(self.to_next.is_empty() && self.to_prev.is_empty() && self.to_self.is_empty())
    }
}

/// Contract shared by every stage of the memory hierarchy.
pub trait Component: Describe {
    /// Called once when a request first reaches the stage. The returned busy cycles keep the
    /// stage from starting its next request.
    fn process_request(&mut self, ctx: &mut StageContext, request: Request) -> SimResult<Handled>;

    /// Called for every serviced request walking back through this stage. Setting `destroy`
    /// stops the walk here.
    fn process_return(&mut self, _ctx: &mut StageContext, _request: &mut Request) -> SimResult<Cycle> {
        Ok(0)
    }

    /// Called on every driver pass, before the stage drains its queue.
    fn tick(&mut self, _ctx: &mut StageContext) -> SimResult<()> {
        Ok(())
    }

    /// Periodic epoch callback; `count` is the number of cycles since the previous heartbeat.
    fn heartbeat(&mut self, _ctx: &mut StageContext, _count: Cycle) {}

    /// True when the component holds no parked work that needs time to pass.
    fn is_idle(&self) -> bool {
        true
    }
}
