//! Server-side assembly of the gleafd ID service: configuration, the HTTP
//! façade, and the MySQL/Redis storage drivers behind the core engine
//! traits. The `gleafd` binary in this crate wires them together.

pub mod server;
