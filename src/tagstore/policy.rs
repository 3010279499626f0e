use std::fmt::Debug;

use phf::phf_map;

use crate::base::counter::CyclicPointer;
use crate::base::error::{SimError, SimResult};
use crate::tagstore::{PolicySignal, TableOp};

/// Pluggable replacement strategy for one associative set.
///
/// `update` is invoked for every table event on `way`; `victim` picks the way to evict from a
/// full set. A policy that cannot pick (the template) returns `None` and the table falls back to
/// way 0.
pub trait ReplacementPolicy: Debug {
    fn update(&mut self, way: usize, op: TableOp, signal: PolicySignal);

    fn victim(&mut self) -> Option<usize>;
}

/// Bimodal resolution period shared by the policies: one in this many BIMODAL events is
/// treated as HIGH.
pub const BIMODAL_PERIOD: u32 = 64;

/// Recency stack. Index 0 of `order` is the most recently used way.
#[derive(Debug)]
pub struct Lru {
    order: Vec<usize>,
    bimodal: CyclicPointer,
}

impl Lru {
    pub fn new(ways: usize) -> Self {
        Self {
            order: (0..ways).collect(),
            bimodal: CyclicPointer::new(BIMODAL_PERIOD),
        }
    }

    fn move_to(&mut self, way: usize, mru: bool) {
        if let Some(pos) = self.order.iter().position(|&w| w == way) {
            self.order.remove(pos);
        }
        if mru {
            self.order.insert(0, way);
        } else {
            self.order.push(way);
        }
    }

    /// Ways from most to least recently used.
    pub fn order(&self) -> &[usize] {
        &self.order
    }
}

impl ReplacementPolicy for Lru {
    fn update(&mut self, way: usize, op: TableOp, signal: PolicySignal) {
        let mru = match op {
            TableOp::Insert | TableOp::Replace => match signal {
                PolicySignal::High => true,
                PolicySignal::Low => false,
                PolicySignal::Bimodal => {
                    let high = self.bimodal.is_zero();
                    self.bimodal.increment();
                    high
                }
            },
            TableOp::Read | TableOp::Update => true,
            TableOp::Invalidate => false,
        };
        self.move_to(way, mru);
    }

    fn victim(&mut self) -> Option<usize> {
        self.order.last().copied()
    }
}

/// Re-reference interval prediction with dynamic insertion. Lines with a value of zero are
/// eviction candidates; reads promote to `RRPV_MAX`.
#[derive(Debug)]
pub struct Drrip {
    rrpv: Vec<u32>,
    bimodal: CyclicPointer,
}

impl Drrip {
    pub const RRPV_MAX: u32 = 7;

    pub fn new(ways: usize) -> Self {
        Self {
            rrpv: vec![0; ways],
            bimodal: CyclicPointer::new(BIMODAL_PERIOD),
        }
    }

    pub fn rrpv(&self, way: usize) -> u32 {
        self.rrpv[way]
    }

    fn insertion_value(&self, signal: PolicySignal) -> u32 {
        match signal {
            PolicySignal::High => 1,
            PolicySignal::Bimodal if self.bimodal.is_zero() => 1,
            PolicySignal::Bimodal | PolicySignal::Low => 0,
        }
    }
}

impl ReplacementPolicy for Drrip {
    fn update(&mut self, way: usize, op: TableOp, signal: PolicySignal) {
        self.rrpv[way] = match op {
            TableOp::Insert | TableOp::Replace => self.insertion_value(signal),
            TableOp::Read | TableOp::Update => Self::RRPV_MAX,
            TableOp::Invalidate => 0,
        };
    }

    fn victim(&mut self) -> Option<usize> {
        if self.rrpv.is_empty() {
            return None;
        }
        self.bimodal.increment();
        // each pass lowers the largest value by one, so at most RRPV_MAX + 1 passes
        loop {
            if let Some(way) = self.rrpv.iter().position(|&v| v == 0) {
                return Some(way);
            }
            for v in self.rrpv.iter_mut() {
                *v -= 1;
            }
        }
    }
}

/// Minimal policy skeleton: every hook is a no-op and no victim is ever chosen. Starting point
/// for new policies; refused by `build_policy`.
#[derive(Debug, Default)]
pub struct Xample;

impl ReplacementPolicy for Xample {
    fn update(&mut self, _way: usize, _op: TableOp, _signal: PolicySignal) {}

    fn victim(&mut self) -> Option<usize> {
        None
    }
}

type PolicyCtor = fn(usize) -> Box<dyn ReplacementPolicy>;

fn lru(ways: usize) -> Box<dyn ReplacementPolicy> {
    Box::new(Lru::new(ways))
}

fn drrip(ways: usize) -> Box<dyn ReplacementPolicy> {
    Box::new(Drrip::new(ways))
}

static POLICIES: phf::Map<&'static str, PolicyCtor> = phf_map! {
    "lru" => lru,
    "drrip" => drrip,
};

/// Construct the policy registered under `name` for a set of `ways` ways.
pub fn build_policy(name: &str, ways: usize) -> SimResult<Box<dyn ReplacementPolicy>> {
    check_policy(name)?;
    POLICIES
        .get(name)
        .map(|ctor| ctor(ways))
        .ok_or_else(|| SimError::UnknownPolicy(name.to_string()))
}

pub fn is_known_policy(name: &str) -> bool {
    POLICIES.contains_key(name)
}

/// Fails unless `name` can be used in a configuration.
pub fn check_policy(name: &str) -> SimResult<()> {
    if name == "xample" {
        return Err(SimError::invalid_config(
            "tagstore",
            "'xample' is a template policy and cannot be used in a configuration",
        ));
    }
    if !is_known_policy(name) {
        return Err(SimError::UnknownPolicy(name.to_string()));
    }
    Ok(())
}
