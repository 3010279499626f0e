use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::base::error::{SimError, SimResult};
use crate::sim::config::TrafficConfig;
use crate::sim::request::RequestKind;
use crate::timeq::Cycle;

/// One CPU memory access as issued by the front end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRecord {
    pub cycle: Cycle,
    pub core_id: u32,
    pub kind: RequestKind,
    pub vaddr: u64,
    pub paddr: u64,
    pub size: u32,
    pub ip: u64,
}

impl TraceRecord {
    pub fn read(cycle: Cycle, addr: u64) -> Self {
        Self {
            cycle,
            core_id: 0,
            kind: RequestKind::Read,
            vaddr: addr,
            paddr: addr,
            size: 8,
            ip: 0,
        }
    }

    pub fn with_kind(mut self, kind: RequestKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_ip(mut self, ip: u64) -> Self {
        self.ip = ip;
        self
    }
}

fn parse_kind(token: &str) -> Option<RequestKind> {
    match token.to_ascii_uppercase().as_str() {
        "R" | "READ" => Some(RequestKind::Read),
        "RFW" | "READ_FOR_WRITE" => Some(RequestKind::ReadForWrite),
        "W" | "WRITE" => Some(RequestKind::Write),
        "PW" | "PARTIALWRITE" => Some(RequestKind::PartialWrite),
        "WB" | "WRITEBACK" => Some(RequestKind::Writeback),
        "P" | "PREFETCH" => Some(RequestKind::Prefetch),
        _ => None,
    }
}

fn parse_num(token: &str) -> Option<u64> {
    match token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => token.parse().ok(),
    }
}

/// Parse one trace line: `cycle core kind vaddr paddr [size [ip]]`. Blank lines and `#`
/// comments yield `None`.
pub fn parse_line(line_no: usize, line: &str) -> SimResult<Option<TraceRecord>> {
    let line = line.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
        return Ok(None);
    }
    let err = |reason: String| SimError::Trace {
        line: line_no,
        reason,
    };
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 5 {
        return Err(err(format!("expected at least 5 fields, found {}", fields.len())));
    }
    let num = |idx: usize| {
        parse_num(fields[idx]).ok_or_else(|| err(format!("bad number '{}'", fields[idx])))
    };
    let kind = parse_kind(fields[2]).ok_or_else(|| err(format!("bad kind '{}'", fields[2])))?;
    Ok(Some(TraceRecord {
        cycle: num(0)?,
        core_id: num(1)? as u32,
        kind,
        vaddr: num(3)?,
        paddr: num(4)?,
        size: if fields.len() > 5 { num(5)? as u32 } else { 8 },
        ip: if fields.len() > 6 { num(6)? } else { 0 },
    }))
}

pub fn read_trace<R: BufRead>(reader: R) -> SimResult<Vec<TraceRecord>> {
    let mut records = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        if let Some(record) = parse_line(i + 1, &line?)? {
            records.push(record);
        }
    }
    // the hierarchy consumes records in issue order
    records.sort_by_key(|r| r.cycle);
    Ok(records)
}

pub fn load_trace(path: &Path) -> SimResult<Vec<TraceRecord>> {
    read_trace(BufReader::new(File::open(path)?))
}

/// Seeded mix of sequential and random accesses, one stream per core.
pub struct SyntheticTraffic {
    config: TrafficConfig,
    rng: StdRng,
    emitted: u64,
    cursors: Vec<u64>,
    clock: Cycle,
}

impl SyntheticTraffic {
    const LINE: u64 = 64;

    pub fn new(config: TrafficConfig) -> Self {
        let cores = config.cores.max(1) as usize;
        let mut rng = StdRng::seed_from_u64(config.seed);
        let footprint = (config.footprint_kb.max(1) << 10) / Self::LINE;
        let cursors = (0..cores).map(|_| rng.gen_range(0..footprint)).collect();
        Self {
            config,
            rng,
            emitted: 0,
            cursors,
            clock: 0,
        }
    }
}

impl Iterator for SyntheticTraffic {
    type Item = TraceRecord;

    fn next(&mut self) -> Option<TraceRecord> {
        if self.emitted >= self.config.requests {
            return None;
        }
        let core = (self.emitted % self.cursors.len() as u64) as usize;
        self.emitted += 1;

        let footprint = (self.config.footprint_kb.max(1) << 10) / Self::LINE;
        let line = if self.rng.gen_bool(self.config.sequential_rate.clamp(0.0, 1.0)) {
            (self.cursors[core] + 1) % footprint
        } else {
            self.rng.gen_range(0..footprint)
        };
        self.cursors[core] = line;
        let kind = if self.rng.gen_bool(self.config.write_rate.clamp(0.0, 1.0)) {
            RequestKind::Write
        } else {
            RequestKind::Read
        };
        let gap = self.rng.gen_range(1..=self.config.issue_gap.max(1) * 2);
        self.clock += gap;

        // keep per-core address spaces disjoint
        let base = (core as u64) << 40;
        let addr = base + line * Self::LINE;
        Some(TraceRecord {
            cycle: self.clock,
            core_id: core as u32,
            kind,
            vaddr: addr,
            paddr: addr,
            size: 8,
            ip: 0x400000 + (line % 16) * 4,
        })
    }
}
