pub mod engine_actor;
pub mod liquidation_feed;
