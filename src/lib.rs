pub mod base;
pub mod cmp;
pub mod sim;
pub mod tagstore;
pub mod timeq;

#[cfg(test)]
mod unit_tests;
