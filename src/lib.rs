pub mod config;
pub mod constants;
pub mod core;
pub mod error;
pub mod fixtures;
pub mod memory;
pub mod native;
