use async_trait::async_trait;

use super::Segment;
use crate::Result;

/// Contract the persistent segment store must honor.
///
/// The store is the source of truth for allocation ranges: `update_max_id`
/// and `update_max_id_with_step` must apply their increment atomically, so
/// that no two concurrent advances on the same biztag observe the same old
/// mark. Both return the row as it stands after the advance and fail with
/// [`Error::NotFound`] for an unknown biztag.
///
/// [`Error::NotFound`]: crate::Error::NotFound
#[async_trait]
pub trait SegmentRepository: Send + Sync {
    /// All allocation rows.
    async fn list(&self) -> Result<Vec<Segment>>;

    /// A single row by biztag.
    async fn get(&self, biz_tag: &str) -> Result<Segment>;

    /// Just the biztag names, for discovery.
    async fn list_biz_tags(&self) -> Result<Vec<String>>;

    /// Atomically advances `max_id` by the row's own configured step.
    async fn update_max_id(&self, biz_tag: &str) -> Result<Segment>;

    /// Atomically advances `max_id` by a caller-supplied step.
    async fn update_max_id_with_step(&self, biz_tag: &str, step: i32) -> Result<Segment>;
}
