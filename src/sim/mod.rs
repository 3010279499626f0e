pub mod component;
pub mod config;
pub mod factory;
pub mod hierarchy;
pub mod request;
pub mod trace;
