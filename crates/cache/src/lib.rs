//! imagekeep cache library
//!
//! Budget bookkeeping and configuration for the image cache: one
//! [`MemoryAccountant`] per memory class (RAM and video) and the
//! [`CacheConfig`] that sizes them.

pub mod config;
pub mod memory_budget;

pub use config::{CacheConfig, ConfigError};
pub use memory_budget::{Charge, MemoryAccountant, MemoryPressure, Units};
