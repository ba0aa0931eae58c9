pub mod config;
pub mod http;
pub mod storage;
pub mod telemetry;
