//! Request schedulers for the DRAM controller.
//!
//! A scheduler picks the next request to offer to the timing model out of the controller's read
//! and write FIFOs. `RowBuffers` is the controller's view of the open row in every bank; the
//! row-hit-first schedulers consult it but never change it.

use std::collections::VecDeque;
use std::fmt::Debug;

use phf::phf_map;

use crate::base::error::{SimError, SimResult};
use crate::sim::request::Request;

/// Bank and row of an address under a row-interleaved mapping.
#[derive(Debug, Clone)]
pub struct RowBuffers {
    row_size: u64,
    open: Vec<Option<u64>>,
}

impl RowBuffers {
    pub fn new(num_banks: usize, row_size: u64) -> Self {
        Self {
            row_size: row_size.max(1),
            open: vec![None; num_banks.max(1)],
        }
    }

    pub fn num_banks(&self) -> usize {
        self.open.len()
    }

    /// `(bank, row within bank)` of `addr`.
    pub fn locate(&self, addr: u64) -> (usize, u64) {
        let logical_row = addr / self.row_size;
        let banks = self.open.len() as u64;
        ((logical_row % banks) as usize, logical_row / banks)
    }

    pub fn is_hit(&self, addr: u64) -> bool {
        let (bank, row) = self.locate(addr);
        self.open[bank] == Some(row)
    }

    /// Record an access, opening its row. Returns whether the row was already open.
    pub fn access(&mut self, addr: u64) -> bool {
        let (bank, row) = self.locate(addr);
        let hit = self.open[bank] == Some(row);
        self.open[bank] = Some(row);
        hit
    }

    pub fn open_row(&self, bank: usize) -> Option<u64> {
        self.open.get(bank).copied().flatten()
    }
}

/// Read and write FIFOs, in arrival order.
#[derive(Debug, Default)]
pub struct RequestQueues {
    pub reads: VecDeque<Request>,
    pub writes: VecDeque<Request>,
}

impl RequestQueues {
    pub fn is_empty(&self) -> bool {
        self.reads.is_empty() && self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.reads.len() + self.writes.len()
    }

    /// Put a request the timing model turned away back at the head of its queue.
    pub fn requeue(&mut self, request: Request) {
        if request.kind.is_read_like() {
            self.reads.push_front(request);
        } else {
            self.writes.push_front(request);
        }
    }
}

pub trait Scheduler: Debug {
    fn next(&mut self, queues: &mut RequestQueues, rows: &RowBuffers) -> Option<Request>;

    fn is_draining(&self) -> bool {
        false
    }
}

/// First request of `queue` that hits an open row, else the head.
fn take_row_hit_first(queue: &mut VecDeque<Request>, rows: &RowBuffers) -> Option<Request> {
    match queue.iter().position(|r| rows.is_hit(r.paddr)) {
        Some(pos) => queue.remove(pos),
        None => queue.pop_front(),
    }
}

fn take_head(queue: &mut VecDeque<Request>, _rows: &RowBuffers) -> Option<Request> {
    queue.pop_front()
}

/// Reads first until the write FIFO fills up, then every queued write before any read.
#[derive(Debug)]
pub struct DrainWhenFull {
    write_capacity: usize,
    draining: bool,
    row_hit_first: bool,
}

impl DrainWhenFull {
    pub fn new(write_capacity: usize, row_hit_first: bool) -> Self {
        Self {
            write_capacity: write_capacity.max(1),
            draining: false,
            row_hit_first,
        }
    }
}

impl Scheduler for DrainWhenFull {
    fn next(&mut self, queues: &mut RequestQueues, rows: &RowBuffers) -> Option<Request> {
        let take = if self.row_hit_first {
            take_row_hit_first
        } else {
            take_head
        };
        if queues.writes.len() >= self.write_capacity {
            self.draining = true;
        }
        if self.draining {
            if !queues.writes.is_empty() {
                return take(&mut queues.writes, rows);
            }
            self.draining = false;
        }
        take(&mut queues.reads, rows)
    }

    fn is_draining(&self) -> bool {
        self.draining
    }
}

/// Oldest of the two queue heads, reads winning ties.
#[derive(Debug, Default)]
pub struct Fcfs;

impl Scheduler for Fcfs {
    fn next(&mut self, queues: &mut RequestQueues, _rows: &RowBuffers) -> Option<Request> {
        let read_first = match (queues.reads.front(), queues.writes.front()) {
            (None, None) => return None,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(r), Some(w)) => r.current_cycle <= w.current_cycle,
        };
        if read_first {
            queues.reads.pop_front()
        } else {
            queues.writes.pop_front()
        }
    }
}

type SchedulerBuilder = fn(usize) -> Box<dyn Scheduler>;

fn fr_fcfs(write_capacity: usize) -> Box<dyn Scheduler> {
    Box::new(DrainWhenFull::new(write_capacity, true))
}

fn fcfs_drain(write_capacity: usize) -> Box<dyn Scheduler> {
    Box::new(DrainWhenFull::new(write_capacity, false))
}

fn fcfs(_write_capacity: usize) -> Box<dyn Scheduler> {
    Box::new(Fcfs)
}

static SCHEDULERS: phf::Map<&'static str, SchedulerBuilder> = phf_map! {
    "fr-fcfs" => fr_fcfs,
    "fcfs-drain" => fcfs_drain,
    "fcfs" => fcfs,
};

pub fn build_scheduler(name: &str, write_capacity: usize) -> SimResult<Box<dyn Scheduler>> {
    SCHEDULERS
        .get(name)
        .map(|build| build(write_capacity))
        .ok_or_else(|| SimError::UnknownScheduler(name.to_string()))
}

pub fn is_known_scheduler(name: &str) -> bool {
    SCHEDULERS.contains_key(name)
}
