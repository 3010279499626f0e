/*
Time-queues for the memory-hierarchy model.

Every stage of the hierarchy owns a `TimeQueue`: requests are keyed by the cycle at which they
become visible to the stage, and are popped in increasing cycle order regardless of the order in
which they were pushed.  Requests that share a cycle keep their push order, so two requests issued
in the same cycle are never reordered by the queue itself.

Shared resources with a fixed service law (a DRAM bank, an array port) are wrapped by a
`TimedServer`, which charges a base latency plus a per-request service time and bounds the number
of outstanding requests.  When the server cannot accept more work it hands the request back inside
a `Backpressure`, so the caller can retry it later without losing it.
*/

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};

pub type Cycle = u64;

#[derive(Debug)]
struct QueueEntry<T> {
    cycle: Cycle,
    seq: u64,
    item: T,
}

impl<T> PartialEq for QueueEntry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.cycle == other.cycle && self.seq == other.seq
    }
}

impl<T> Eq for QueueEntry<T> {}

impl<T> PartialOrd for QueueEntry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueEntry<T> {
    // BinaryHeap is a max-heap, so the comparison is reversed to pop the earliest cycle first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cycle
            .cmp(&self.cycle)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Cycle-ordered queue: a min-heap on the cycle, FIFO among entries with the same cycle.
#[derive(Debug)]
pub struct TimeQueue<T> {
    heap: BinaryHeap<QueueEntry<T>>,
    next_seq: u64,
}

impl<T> Default for TimeQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimeQueue<T> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    pub fn push(&mut self, cycle: Cycle, item: T) {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.heap.push(QueueEntry { cycle, seq, item });
    }

    /// Cycle of the earliest entry, if any.
    pub fn next_cycle(&self) -> Option<Cycle> {
        self.heap.peek().map(|entry| entry.cycle)
    }

    pub fn peek(&self) -> Option<&T> {
        self.heap.peek().map(|entry| &entry.item)
    }

    /// Pop the earliest entry if it is due at `now`.
    pub fn pop_due(&mut self, now: Cycle) -> Option<(Cycle, T)> {
        if self.next_cycle()? > now {
            return None;
        }
        self.heap.pop().map(|entry| (entry.cycle, entry.item))
    }

    pub fn pop(&mut self) -> Option<(Cycle, T)> {
        self.heap.pop().map(|entry| (entry.cycle, entry.item))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Unordered view of the queued items.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.heap.iter().map(|entry| &entry.item)
    }
}

// Result of queueing a request with a timed server
#[derive(Debug, Clone, Copy)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
}

impl Ticket {
    fn new(issued_at: Cycle, ready_at: Cycle) -> Self {
        Self { issued_at, ready_at }
    }

    // Cycle at which the request entered the server.
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    // Cycle at which the server will make the result available.
    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }
}

// The payload plus the request-specific part of its service time
#[derive(Debug)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub service_cycles: Cycle,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, service_cycles: Cycle) -> Self {
        Self {
            payload,
            service_cycles,
        }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

// The bounded FIFO is full; the request is handed back untouched.
#[derive(Debug)]
pub struct Backpressure<T> {
    pub request: ServiceRequest<T>,
    pub capacity: usize,
}

impl<T> Backpressure<T> {
    // Recover the underlying request so it can be retried later.
    pub fn into_request(self) -> ServiceRequest<T> {
        self.request
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    // Fixed latency added to every request
    pub base_latency: Cycle,
    // Maximum number of outstanding requests the server will accept
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_latency: 0,
            queue_capacity: 1,
        }
    }
}

#[derive(Debug)]
struct Inflight<T> {
    payload: T,
    ticket: Ticket,
}

// Single-lane server: requests are serviced back to back in arrival order, each occupying the
// server for its full latency.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    inflight: VecDeque<Inflight<T>>,
    busy_until: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        Self {
            config: ServerConfig {
                queue_capacity: capacity,
                ..config
            },
            inflight: VecDeque::with_capacity(capacity),
            busy_until: 0,
        }
    }

    // Attempt to enqueue a request at the provided cycle.
    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.inflight.len() >= self.config.queue_capacity {
            return Err(Backpressure {
                request,
                capacity: self.config.queue_capacity,
            });
        }

        let start = self.busy_until.max(now);
        let ready_at = start
            .saturating_add(self.config.base_latency)
            .saturating_add(request.service_cycles);
        let ticket = Ticket::new(now, ready_at);

        self.busy_until = ready_at;
        self.inflight.push_back(Inflight {
            payload: request.payload,
            ticket,
        });

        Ok(ticket)
    }

    // Drain any requests that have completed by "now" and invoke the supplied callback with the
    // results.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F)
    where
        F: FnMut(ServiceResult<T>),
    {
        while self
            .inflight
            .front()
            .is_some_and(|front| front.ticket.is_ready(now))
        {
            if let Some(inflight) = self.inflight.pop_front() {
                callback(ServiceResult {
                    payload: inflight.payload,
                    ticket: inflight.ticket,
                });
            }
        }

        if self.inflight.is_empty() && now > self.busy_until {
            self.busy_until = now;
        }
    }

    pub fn outstanding(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_queue_pops_in_cycle_order() {
        let mut q = TimeQueue::new();
        q.push(5, "c");
        q.push(1, "a");
        q.push(3, "b");
        assert_eq!(Some((1, "a")), q.pop());
        assert_eq!(Some((3, "b")), q.pop());
        assert_eq!(Some((5, "c")), q.pop());
        assert!(q.pop().is_none());
    }

    #[test]
    fn time_queue_keeps_fifo_order_within_a_cycle() {
        let mut q = TimeQueue::new();
        for i in 0..8 {
            q.push(2, i);
        }
        let order: Vec<_> = std::iter::from_fn(|| q.pop().map(|(_, i)| i)).collect();
        assert_eq!((0..8).collect::<Vec<_>>(), order);
    }

    #[test]
    fn pop_due_respects_now() {
        let mut q = TimeQueue::new();
        q.push(10, 1u32);
        assert!(q.pop_due(9).is_none());
        assert_eq!(Some((10, 1)), q.pop_due(10));
    }

    #[test]
    fn server_charges_latency_back_to_back() {
        let mut server = TimedServer::new(ServerConfig {
            base_latency: 2,
            queue_capacity: 4,
        });
        let a = server.try_enqueue(0, ServiceRequest::new(1u32, 3)).unwrap();
        let b = server.try_enqueue(0, ServiceRequest::new(2u32, 1)).unwrap();
        assert_eq!(5, a.ready_at());
        assert_eq!(8, b.ready_at());
    }

    #[test]
    fn server_rejects_when_full_and_returns_payload() {
        let mut server = TimedServer::new(ServerConfig {
            base_latency: 1,
            queue_capacity: 1,
        });
        server.try_enqueue(0, ServiceRequest::new(7u32, 0)).unwrap();
        let err = server
            .try_enqueue(0, ServiceRequest::new(9u32, 0))
            .unwrap_err();
        assert_eq!(1, err.capacity);
        assert_eq!(9, err.into_request().payload);
    }

    #[test]
    fn service_ready_drains_completed_in_order() {
        let mut server = TimedServer::new(ServerConfig {
            base_latency: 1,
            queue_capacity: 2,
        });
        server.try_enqueue(0, ServiceRequest::new(1u32, 0)).unwrap();
        server.try_enqueue(0, ServiceRequest::new(2u32, 0)).unwrap();
        let mut done = Vec::new();
        server.service_ready(1, |r| done.push(r.payload));
        assert_eq!(vec![1], done);
        server.service_ready(2, |r| done.push(r.payload));
        assert_eq!(vec![1, 2], done);
        assert_eq!(0, server.outstanding());
    }
}
