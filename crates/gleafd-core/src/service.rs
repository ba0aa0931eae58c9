use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::segment::{SegmentEngine, SegmentRepository};
use crate::snowflake::{MachineStorage, SnowflakeEngine};
use crate::{Error, Result};

/// The service façade: both allocators behind one "get N IDs" interface.
///
/// Either engine may be absent when its storage was not configured;
/// requests for a missing engine fail with [`Error::ServiceDisabled`].
pub struct IdService {
    name: String,
    segments: Option<Arc<SegmentEngine>>,
    snowflakes: Option<SnowflakeEngine>,
    closed: AtomicBool,
}

impl IdService {
    pub fn builder() -> IdServiceBuilder {
        IdServiceBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `count` segment IDs for `biz_tag`.
    pub async fn segment_ids(
        &self,
        ct: &CancellationToken,
        biz_tag: &str,
        count: i64,
    ) -> Result<Vec<i64>> {
        match &self.segments {
            Some(engine) => engine.get(ct, biz_tag, count).await,
            None => Err(Error::ServiceDisabled),
        }
    }

    /// `count` snowflake IDs. The biztag is accepted for API symmetry but
    /// plays no part in snowflake generation.
    pub async fn snowflake_ids(
        &self,
        ct: &CancellationToken,
        _biz_tag: &str,
        count: i64,
    ) -> Result<Vec<i64>> {
        match &self.snowflakes {
            Some(engine) => engine.get(ct, count).await,
            None => Err(Error::ServiceDisabled),
        }
    }

    pub async fn health_check(&self, _name: &str) -> Result<i64> {
        Ok(1)
    }

    /// Shuts both engines down. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(engine) = &self.snowflakes {
            engine.close().await;
        }
        if let Some(engine) = &self.segments {
            engine.close().await;
        }
    }
}

/// Assembles an [`IdService`] from whichever storage backends the caller
/// provides. The name and address identify this instance in the
/// coordination store.
pub struct IdServiceBuilder {
    name: String,
    addr: String,
    repository: Option<Arc<dyn SegmentRepository>>,
    machine_storage: Option<Arc<dyn MachineStorage>>,
}

impl Default for IdServiceBuilder {
    fn default() -> Self {
        Self {
            name: "gleafd".to_string(),
            addr: "127.0.0.1:8090".to_string(),
            repository: None,
            machine_storage: None,
        }
    }
}

impl IdServiceBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Enables the segment allocator on this repository.
    pub fn segment_repository(mut self, repo: Arc<dyn SegmentRepository>) -> Self {
        self.repository = Some(repo);
        self
    }

    /// Enables the snowflake allocator on this coordination store.
    pub fn machine_storage(mut self, storage: Arc<dyn MachineStorage>) -> Self {
        self.machine_storage = Some(storage);
        self
    }

    /// Starts the configured engines. Storage that cannot be reached, an
    /// out-of-range machine id, or a stale stored clock fail construction.
    pub async fn build(self) -> Result<IdService> {
        let segments = match self.repository {
            Some(repo) => Some(SegmentEngine::new(repo).await?),
            None => None,
        };
        let snowflakes = match self.machine_storage {
            Some(storage) => {
                Some(SnowflakeEngine::new(&self.name, &self.addr, storage).await?)
            }
            None => None,
        };
        Ok(IdService {
            name: self.name,
            segments,
            snowflakes,
            closed: AtomicBool::new(false),
        })
    }
}
