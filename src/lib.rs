//! KONTRA Liquidation Counter-Trading Engine
//!
//! Reacts to streamed liquidation events by opening counter-positions on a
//! derivatives venue, pyramiding them under a fixed split schedule, attaching
//! protective exits, and reconciling local state against the venue's
//! eventually-consistent settlement records.

pub mod application;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod secrets;
pub mod task_runner;
