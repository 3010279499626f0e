use crate::timeq::Cycle;

pub type RequestId = u64;
pub type StageId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    ReadForWrite,
    Write,
    PartialWrite,
    Writeback,
    Prefetch,
}

impl RequestKind {
    /// Requests that expect data back: demand reads and prefetches.
    pub fn is_read_like(self) -> bool {
        matches!(
            self,
            RequestKind::Read | RequestKind::ReadForWrite | RequestKind::Prefetch
        )
    }

    pub fn is_store(self) -> bool {
        matches!(self, RequestKind::Write | RequestKind::PartialWrite)
    }

    /// Demand read or store that is allowed to miss in an MSHR.
    pub fn is_demand(self) -> bool {
        !matches!(self, RequestKind::Writeback | RequestKind::Prefetch)
    }
}

/// Who created a request. Components recognise their own traffic on the return path by
/// comparing against their stage id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Initiator {
    Cpu,
    Component(StageId),
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub initiator: Initiator,
    pub core_id: u32,
    pub kind: RequestKind,
    pub ip: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub size: u32,
    pub icount: u64,

    pub issue_cycle: Cycle,
    pub current_cycle: Cycle,
    /// Index of the stage currently holding the request.
    pub stage: StageId,

    pub stalling: bool,
    pub serviced: bool,
    pub destroy: bool,
    pub finished: bool,
    pub dirty_reply: bool,

    /// History list the request's block was found in by a victim tag store.
    pub victim_set: Option<usize>,
    pub dram_issue_cycle: Option<Cycle>,
}

impl Request {
    pub fn new(
        id: RequestId,
        initiator: Initiator,
        kind: RequestKind,
        vaddr: u64,
        paddr: u64,
        size: u32,
        cycle: Cycle,
    ) -> Self {
        Self {
            id,
            initiator,
            core_id: 0,
            kind,
            ip: 0,
            vaddr,
            paddr,
            size,
            icount: 0,
            issue_cycle: cycle,
            current_cycle: cycle,
            stage: 0,
            stalling: false,
            serviced: false,
            destroy: false,
            finished: false,
            dirty_reply: false,
            victim_set: None,
            dram_issue_cycle: None,
        }
    }

    /// New request created by a component on behalf of `parent`, e.g. a fill, a prefetch or a
    /// writeback. Inherits the parent's core, instruction pointer and current cycle.
    pub fn spawn(
        id: RequestId,
        stage: StageId,
        kind: RequestKind,
        vaddr: u64,
        paddr: u64,
        size: u32,
        parent: &Request,
    ) -> Self {
        let mut req = Request::new(
            id,
            Initiator::Component(stage),
            kind,
            vaddr,
            paddr,
            size,
            parent.current_cycle,
        );
        req.core_id = parent.core_id;
        req.ip = parent.ip;
        req.icount = parent.icount;
        req.stage = stage;
        req
    }

    pub fn with_core(mut self, core_id: u32) -> Self {
        self.core_id = core_id;
        self
    }

    pub fn with_ip(mut self, ip: u64) -> Self {
        self.ip = ip;
        self
    }

    pub fn add_latency(&mut self, cycles: Cycle) {
        self.current_cycle = self.current_cycle.saturating_add(cycles);
    }

    pub fn is_from(&self, stage: StageId) -> bool {
        self.initiator == Initiator::Component(stage)
    }

    /// Physical block number used as a tag-store key.
    pub fn block(&self, block_size: u64) -> u64 {
        self.paddr / block_size
    }

    pub fn paddr_block_aligned(&self, block_size: u64) -> u64 {
        self.paddr / block_size * block_size
    }

    pub fn vaddr_block_aligned(&self, block_size: u64) -> u64 {
        self.vaddr / block_size * block_size
    }

    pub fn latency(&self) -> Cycle {
        self.current_cycle.saturating_sub(self.issue_cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_classification() {
        assert!(RequestKind::Prefetch.is_read_like());
        assert!(!RequestKind::Writeback.is_read_like());
        assert!(RequestKind::PartialWrite.is_store());
        assert!(RequestKind::Write.is_demand());
        assert!(!RequestKind::Prefetch.is_demand());
    }

    #[test]
    fn spawn_inherits_parent_context() {
        let parent = Request::new(1, Initiator::Cpu, RequestKind::Read, 0x1040, 0x9040, 8, 77)
            .with_core(3)
            .with_ip(0x400);
        let child = Request::spawn(2, 4, RequestKind::Writeback, 0x80, 0x180, 64, &parent);
        assert_eq!(Initiator::Component(4), child.initiator);
        assert!(child.is_from(4));
        assert_eq!(3, child.core_id);
        assert_eq!(0x400, child.ip);
        assert_eq!(77, child.current_cycle);
    }

    #[test]
    fn block_helpers_use_physical_address() {
        let req = Request::new(1, Initiator::Cpu, RequestKind::Read, 0x10, 0x1234, 8, 0);
        assert_eq!(0x1234 / 64, req.block(64));
        assert_eq!(0x1200, req.paddr_block_aligned(64));
        assert_eq!(0, req.vaddr_block_aligned(64));
    }
}
