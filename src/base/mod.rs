pub mod counter;
pub mod error;
pub mod hash;
pub mod module;
