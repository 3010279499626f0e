//! Concrete hierarchy stages.

pub mod dbi;
pub mod dcp;
pub mod dram;
pub mod mshr;
pub mod prefetch;
pub mod stall;
pub mod stream;
pub mod stride;
pub mod vts;
