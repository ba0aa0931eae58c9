//! Storage drivers behind the core engine traits: MySQL for segment rows,
//! Redis for machine-id coordination.

mod mysql;
mod redis;

pub use mysql::MySqlSegmentRepository;
pub use redis::RedisMachineStorage;
