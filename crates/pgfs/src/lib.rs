#![forbid(unsafe_code)]
//! PageFS public API facade.
//!
//! Re-exports the engine from `pgfs-core`. Downstream consumers (the CLI)
//! depend on this crate.

pub use pgfs_core::*;
