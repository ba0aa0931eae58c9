//! Database-backed segment allocation.
//!
//! Each biztag owns an independent monotonic sequence. The persistent store
//! holds one row per biztag with a high-water mark (`max_id`) and a
//! configured allocation step; advancing the mark by a step reserves the
//! half-open range `[max_id - step, max_id)` for this server, and a
//! per-biztag generator task streams that range to consumers while the next
//! range is fetched in the background.

mod engine;
mod generator;
mod repository;

pub use engine::SegmentEngine;
pub use repository::SegmentRepository;

use chrono::{DateTime, Utc};

/// One allocation row, as persisted: the biztag's high-water mark and the
/// step that advanced it. After a refill the row describes the freshly
/// reserved range `[max_id - step, max_id)`.
#[derive(Debug, Clone)]
pub struct Segment {
    pub biz_tag: String,
    pub max_id: i64,
    pub step: i32,
    pub description: Option<String>,
    pub updated: DateTime<Utc>,
}

impl Segment {
    /// First ID of the range this row describes.
    pub fn start(&self) -> i64 {
        self.max_id - i64::from(self.step)
    }
}
