//! Builders to construct governor components from configuration.

pub mod governor;

pub use governor::{build_governor, Governor};
