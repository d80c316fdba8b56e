//! CLI command implementations.

pub mod common;
pub mod devices;
pub mod energy;
pub mod generate;
pub mod segment;
pub mod validate;
