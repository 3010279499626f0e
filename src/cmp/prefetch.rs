//! Pieces shared by the prefetcher stages.

use serde::{Deserialize, Serialize};

use crate::base::counter::Counter;
use crate::base::error::{ensure_config, SimResult};
use crate::sim::component::StageContext;
use crate::sim::config::Config;
use crate::sim::request::{Request, RequestKind};
use crate::tagstore::policy::check_policy;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrefetcherConfig {
    /// Prefetches issued per triggering access.
    pub degree: u32,
    pub block_size: u64,
    /// Train on READ_FOR_WRITE accesses as well.
    pub prefetch_on_write: bool,
    pub table_size: usize,
    pub table_policy: String,
    pub num_trains: u32,
    /// Blocks within which a miss trains an unconfirmed stream.
    pub train_distance: u64,
    /// How many blocks ahead of the access prefetching may run.
    pub distance: u64,
}

impl Config for PrefetcherConfig {}

impl Default for PrefetcherConfig {
    fn default() -> Self {
        Self {
            degree: 4,
            block_size: 64,
            prefetch_on_write: false,
            table_size: 16,
            table_policy: "lru".to_string(),
            num_trains: 2,
            train_distance: 16,
            distance: 24,
        }
    }
}

impl PrefetcherConfig {
    pub fn ensure_valid(&self, component: &str) -> SimResult<()> {
        ensure_config!(self.block_size > 0, component, "block_size must be positive");
        ensure_config!(self.table_size > 0, component, "table_size must be positive");
        check_policy(&self.table_policy)?;
        Ok(())
    }

    /// Whether an access of this kind trains the prefetcher.
    pub fn trains_on(&self, kind: RequestKind) -> bool {
        match kind {
            RequestKind::Read => true,
            RequestKind::ReadForWrite => self.prefetch_on_write,
            RequestKind::Write
            | RequestKind::PartialWrite
            | RequestKind::Writeback
            | RequestKind::Prefetch => false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PrefetcherStats {
    pub accesses: Counter,
    pub table_misses: Counter,
    pub trained: Counter,
    pub prefetches: Counter,
}

/// Send a prefetch for the block `offset` blocks away from `trigger`. Offsets that would wrap
/// below address zero are dropped.
pub(crate) fn send_prefetch(
    ctx: &mut StageContext,
    trigger: &Request,
    block_size: u64,
    offset: i64,
) -> bool {
    let shift = |addr: u64| {
        let base = (addr / block_size) as i64;
        let block = base.checked_add(offset)?;
        (block >= 0).then(|| block as u64 * block_size)
    };
    let (Some(vaddr), Some(paddr)) = (shift(trigger.vaddr), shift(trigger.paddr)) else {
        return false;
    };
    let prefetch = Request::spawn(
        ctx.alloc_id(),
        ctx.stage,
        RequestKind::Prefetch,
        vaddr,
        paddr,
        block_size as u32,
        trigger,
    );
    ctx.send_next(prefetch);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::request::Initiator;

    #[test]
    fn training_filter() {
        let config = PrefetcherConfig::default();
        assert!(config.trains_on(RequestKind::Read));
        assert!(!config.trains_on(RequestKind::ReadForWrite));
        assert!(!config.trains_on(RequestKind::Prefetch));
        let on_write = PrefetcherConfig {
            prefetch_on_write: true,
            ..PrefetcherConfig::default()
        };
        assert!(on_write.trains_on(RequestKind::ReadForWrite));
    }

    #[test]
    fn prefetch_addresses_are_block_aligned_and_never_negative() {
        let mut ids = 0;
        let mut ctx = StageContext::new(0, 2, &mut ids);
        let trigger = Request::new(1, Initiator::Cpu, RequestKind::Read, 0x1010, 0x8010, 8, 5);
        assert!(send_prefetch(&mut ctx, &trigger, 64, 2));
        assert!(!send_prefetch(&mut ctx, &trigger, 64, -1000));
        let sent = ctx.take_next();
        assert_eq!(1, sent.len());
        assert_eq!(0x1080, sent[0].vaddr);
        assert_eq!(0x8080, sent[0].paddr);
        assert_eq!(RequestKind::Prefetch, sent[0].kind);
        assert!(sent[0].is_from(2));
    }
}
