use async_trait::async_trait;

use crate::Result;

/// Coordination record for one `(service name, listen address)` identity:
/// the leased machine id and the last liveness timestamp written for it.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub name: String,
    pub addr: String,
    pub machine_id: i32,
    pub timestamp: i64,
}

/// Contract the machine-id coordination store must honor.
///
/// Machine ids are assigned once per `(name, addr)` and never change
/// afterwards; `get_or_new` must allocate ids that are unique among all
/// live records, and repeated calls with the same identity must return the
/// same id.
#[async_trait]
pub trait MachineStorage: Send + Sync {
    /// Returns the existing record for this identity, or atomically
    /// allocates the next machine id and creates one with timestamp 0.
    async fn get_or_new(&self, name: &str, addr: &str) -> Result<Metadata>;

    /// All known records.
    async fn list(&self) -> Result<Vec<Metadata>>;

    /// Writes the record's machine id and timestamp.
    async fn update(&self, md: &Metadata) -> Result<()>;
}
