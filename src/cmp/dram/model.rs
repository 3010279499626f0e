//! Boundary between the DRAM controller and a cycle-level DRAM timing model.
//!
//! The controller offers transactions with `add_transaction` and advances the model one model
//! cycle at a time with `update`; finished transactions are reported through a
//! `CompletionSink` carrying the transaction address and the model cycle it finished in.

use std::fmt::Debug;

use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

/// Burst size of one DRAM transaction in bytes. Addresses handed to the model are aligned to it.
pub const TRANS_SIZE: u64 = 32;

pub fn align_to_transaction(addr: u64) -> u64 {
    addr & !(TRANS_SIZE - 1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    pub is_write: bool,
    pub addr: u64,
    /// Model cycle in which the transaction finished.
    pub cycle: Cycle,
}

pub trait CompletionSink {
    fn complete(&mut self, completion: Completion);
}

impl CompletionSink for Vec<Completion> {
    fn complete(&mut self, completion: Completion) {
        self.push(completion);
    }
}

pub trait TimingModel: Debug {
    /// Offer a transaction. `false` means the model's transaction queue is full and the caller
    /// has to retry later.
    fn add_transaction(&mut self, is_write: bool, addr: u64) -> bool;

    /// Advance the model by one of its own cycles.
    fn update(&mut self, sink: &mut dyn CompletionSink);

    /// Current model cycle.
    fn cycle(&self) -> Cycle;

    /// Accepted transactions that have not completed yet.
    fn pending(&self) -> usize;
}

#[derive(Debug, Clone, Copy)]
struct Transaction {
    is_write: bool,
    addr: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct BankedDramConfig {
    pub num_banks: usize,
    pub row_size: u64,
    pub row_hit_latency: Cycle,
    pub row_conflict_latency: Cycle,
    pub queue_capacity: usize,
}

/// Fixed-latency bank model: every bank serves its transactions in order, charging the row-hit
/// latency when the transaction targets the row left open by the previous one and the
/// row-conflict latency otherwise.
#[derive(Debug)]
pub struct BankedDram {
    config: BankedDramConfig,
    banks: Vec<TimedServer<Transaction>>,
    open_rows: Vec<Option<u64>>,
    cycle: Cycle,
}

impl BankedDram {
    pub fn new(config: BankedDramConfig) -> Self {
        let num_banks = config.num_banks.max(1);
        let server = ServerConfig {
            base_latency: 0,
            queue_capacity: config.queue_capacity.max(1),
        };
        Self {
            banks: (0..num_banks).map(|_| TimedServer::new(server)).collect(),
            open_rows: vec![None; num_banks],
            cycle: 0,
            config,
        }
    }

    fn locate(&self, addr: u64) -> (usize, u64) {
        let logical_row = addr / self.config.row_size.max(1);
        let banks = self.banks.len() as u64;
        ((logical_row % banks) as usize, logical_row / banks)
    }
}

impl TimingModel for BankedDram {
    fn add_transaction(&mut self, is_write: bool, addr: u64) -> bool {
        if self.pending() >= self.config.queue_capacity.max(1) {
            return false;
        }
        let (bank, row) = self.locate(addr);
        let latency = if self.open_rows[bank] == Some(row) {
            self.config.row_hit_latency
        } else {
            self.config.row_conflict_latency
        };
        let request = ServiceRequest::new(Transaction { is_write, addr }, latency);
        match self.banks[bank].try_enqueue(self.cycle, request) {
            Ok(_) => {
                self.open_rows[bank] = Some(row);
                true
            }
            Err(_) => false,
        }
    }

    fn update(&mut self, sink: &mut dyn CompletionSink) {
        self.cycle += 1;
        let now = self.cycle;
        for bank in self.banks.iter_mut() {
            bank.service_ready(now, |done| {
                sink.complete(Completion {
                    is_write: done.payload.is_write,
                    addr: done.payload.addr,
                    cycle: done.ticket.ready_at(),
                })
            });
        }
    }

    fn cycle(&self) -> Cycle {
        self.cycle
    }

    fn pending(&self) -> usize {
        self.banks.iter().map(TimedServer::outstanding).sum()
    }
}
