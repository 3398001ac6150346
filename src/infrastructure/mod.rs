pub mod bybit_client;
pub mod indicator_service;
pub mod instrument_registry;
pub mod rate_limit;
