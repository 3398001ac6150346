//! Persistence Layer
//!
//! Crash recovery for the engine: an opaque named-blob snapshot of
//! {open positions, closed-trade history, consumed close-id set}, enough to
//! resume without reprocessing settled closes or reopening open positions.
//!
//! Snapshots are written atomically (temp file, then rename) so a crash
//! mid-write cannot leave torn state on disk.

pub mod models;
pub mod store;
