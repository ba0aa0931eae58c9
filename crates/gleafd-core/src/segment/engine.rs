use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::generator::{Generator, RefillRequest};
use super::repository::SegmentRepository;
use crate::{Error, Result};

/// Capacity of the shared refill-request queue.
const REFILL_QUEUE: usize = 100;
/// How often the biztag set is re-read from the repository.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(60);
/// Attempts per refill before the request is dropped.
const REFILL_ATTEMPTS: u32 = 3;
/// Base backoff between refill attempts, scaled linearly.
const REFILL_BACKOFF: Duration = Duration::from_millis(100);

/// Owner of all per-biztag generators.
///
/// One background task serializes every storage interaction: it drains the
/// shared refill queue, runs the periodic biztag discovery, and exits on
/// shutdown. Consumer lookups only touch the generator map under a short
/// read lock.
pub struct SegmentEngine {
    repo: Arc<dyn SegmentRepository>,
    generators: RwLock<HashMap<String, Arc<Generator>>>,
    refills: mpsc::Sender<RefillRequest>,
    stop: CancellationToken,
    closed: AtomicBool,
    tasks: TaskTracker,
}

impl SegmentEngine {
    /// Builds the engine and performs the initial biztag discovery. A
    /// repository failure here is fatal: without the initial listing there
    /// is nothing to serve.
    pub async fn new(repo: Arc<dyn SegmentRepository>) -> Result<Arc<Self>> {
        let (refill_tx, refill_rx) = mpsc::channel(REFILL_QUEUE);
        let engine = Arc::new(Self {
            repo,
            generators: RwLock::new(HashMap::new()),
            refills: refill_tx,
            stop: CancellationToken::new(),
            closed: AtomicBool::new(false),
            tasks: TaskTracker::new(),
        });
        engine.sync_biz_tags().await?;

        let runner = Arc::clone(&engine);
        engine.tasks.spawn(runner.run(refill_rx));
        Ok(engine)
    }

    /// Pulls `count` IDs for `biz_tag`. The batch is contiguous and
    /// ascending; cancellation mid-batch discards any partial result.
    pub async fn get(
        &self,
        ct: &CancellationToken,
        biz_tag: &str,
        count: i64,
    ) -> Result<Vec<i64>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let generator = self.find(biz_tag)?;
        generator.get(ct, count).await
    }

    /// Stops all generators and the engine loop. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained: Vec<_> = self.generators.write().drain().map(|(_, g)| g).collect();
        for generator in &drained {
            generator.stop();
        }
        self.stop.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn find(&self, biz_tag: &str) -> Result<Arc<Generator>> {
        self.generators
            .read()
            .get(biz_tag)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Engine loop: refill requests win over the discovery tick; the stop
    /// token ends the loop.
    async fn run(self: Arc<Self>, mut refills: mpsc::Receiver<RefillRequest>) {
        let mut discovery = tokio::time::interval_at(
            Instant::now() + DISCOVERY_INTERVAL,
            DISCOVERY_INTERVAL,
        );
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                request = refills.recv() => match request {
                    // Pair the in-flight storage call with the stop token so
                    // shutdown never waits on a stuck driver.
                    Some(request) => tokio::select! {
                        _ = self.stop.cancelled() => return,
                        () = self.refill(request) => {}
                    },
                    None => return,
                },
                _ = discovery.tick() => {
                    if let Err(err) = self.sync_biz_tags().await {
                        tracing::warn!(%err, "biztag discovery failed");
                    }
                }
            }
        }
    }

    /// Advances the biztag's mark in storage and hands the resulting range
    /// to the requesting generator. Transient storage failures are retried
    /// a few times with backoff; a request that still fails is dropped and
    /// the generator re-orders at its next consumption trigger.
    async fn refill(&self, request: RefillRequest) {
        for attempt in 1..=REFILL_ATTEMPTS {
            let advanced = if request.step <= 0 {
                self.repo.update_max_id(&request.biz_tag).await
            } else {
                self.repo
                    .update_max_id_with_step(&request.biz_tag, request.step)
                    .await
            };
            match advanced {
                Ok(segment) => {
                    tokio::select! {
                        _ = self.stop.cancelled() => {}
                        _ = request.reply.send(segment) => {}
                    }
                    return;
                }
                Err(err) if attempt < REFILL_ATTEMPTS => {
                    tracing::warn!(
                        biztag = %request.biz_tag,
                        attempt,
                        %err,
                        "range refill failed, retrying",
                    );
                    tokio::time::sleep(REFILL_BACKOFF * attempt).await;
                }
                Err(err) => {
                    tracing::error!(
                        biztag = %request.biz_tag,
                        %err,
                        "range refill failed, dropping request",
                    );
                }
            }
        }
    }

    /// Reconciles the generator map against the repository listing:
    /// unknown biztags get a generator, vanished ones are stopped.
    async fn sync_biz_tags(&self) -> Result<()> {
        let tags = self.repo.list_biz_tags().await?;

        let mut generators = self.generators.write();
        let added: Vec<String> = tags
            .iter()
            .filter(|tag| !generators.contains_key(*tag))
            .cloned()
            .collect();
        let removed: Vec<String> = generators
            .keys()
            .filter(|known| !tags.contains(known))
            .cloned()
            .collect();

        if !added.is_empty() {
            tracing::info!(tags = ?added, "segment biztags added");
        }
        if !removed.is_empty() {
            tracing::info!(tags = ?removed, "segment biztags removed");
        }

        for tag in removed {
            if let Some(generator) = generators.remove(&tag) {
                generator.stop();
            }
        }
        for tag in added {
            let generator = Generator::spawn(
                tag.clone(),
                self.refills.clone(),
                &self.stop,
                &self.tasks,
            );
            generators.insert(tag, generator);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::Segment;
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU32;

    struct MemoryRepo {
        rows: Mutex<Vec<Segment>>,
        steps_seen: Mutex<Vec<i32>>,
        fail_next: AtomicU32,
    }

    impl MemoryRepo {
        fn with_rows(rows: Vec<Segment>) -> Arc<Self> {
            Arc::new(Self {
                rows: Mutex::new(rows),
                steps_seen: Mutex::new(Vec::new()),
                fail_next: AtomicU32::new(0),
            })
        }

        fn advance(&self, biz_tag: &str, step: Option<i32>) -> Result<Segment> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::storage("injected failure"));
            }
            let mut rows = self.rows.lock();
            let row = rows
                .iter_mut()
                .find(|row| row.biz_tag == biz_tag)
                .ok_or(Error::NotFound)?;
            row.max_id += i64::from(step.unwrap_or(row.step));
            Ok(row.clone())
        }
    }

    #[async_trait]
    impl SegmentRepository for MemoryRepo {
        async fn list(&self) -> Result<Vec<Segment>> {
            Ok(self.rows.lock().clone())
        }

        async fn get(&self, biz_tag: &str) -> Result<Segment> {
            self.rows
                .lock()
                .iter()
                .find(|row| row.biz_tag == biz_tag)
                .cloned()
                .ok_or(Error::NotFound)
        }

        async fn list_biz_tags(&self) -> Result<Vec<String>> {
            Ok(self.rows.lock().iter().map(|row| row.biz_tag.clone()).collect())
        }

        async fn update_max_id(&self, biz_tag: &str) -> Result<Segment> {
            self.advance(biz_tag, None)
        }

        async fn update_max_id_with_step(&self, biz_tag: &str, step: i32) -> Result<Segment> {
            self.steps_seen.lock().push(step);
            self.advance(biz_tag, Some(step))
        }
    }

    fn row(biz_tag: &str, max_id: i64, step: i32) -> Segment {
        Segment {
            biz_tag: biz_tag.to_string(),
            max_id,
            step,
            description: None,
            updated: Utc::now(),
        }
    }

    #[tokio::test]
    async fn serves_the_configured_starting_points() {
        let repo = MemoryRepo::with_rows(vec![
            row("biztag1", 1, 500),
            row("biztag2", 2001, 1000),
            row("biztag3", 4001, 4000),
        ]);
        let engine = SegmentEngine::new(repo).await.unwrap();
        let ct = CancellationToken::new();

        let expectations: [(&str, i64); 3] =
            [("biztag1", 1), ("biztag2", 2001), ("biztag3", 4001)];
        for (tag, first) in expectations {
            let ids = engine.get(&ct, tag, 10).await.unwrap();
            let want: Vec<i64> = (first..first + 10).collect();
            assert_eq!(ids, want, "unexpected batch for {tag}");
        }
        engine.close().await;
    }

    #[tokio::test]
    async fn unknown_biztag_is_not_found() {
        let repo = MemoryRepo::with_rows(vec![row("known", 1, 100)]);
        let engine = SegmentEngine::new(repo).await.unwrap();
        let ct = CancellationToken::new();

        assert!(matches!(
            engine.get(&ct, "unknown", 1).await,
            Err(Error::NotFound)
        ));
        engine.close().await;
    }

    #[tokio::test]
    async fn zero_and_negative_counts_yield_empty_batches() {
        let repo = MemoryRepo::with_rows(vec![row("biztag1", 1, 100)]);
        let engine = SegmentEngine::new(repo).await.unwrap();
        let ct = CancellationToken::new();

        assert!(engine.get(&ct, "biztag1", 0).await.unwrap().is_empty());
        assert!(engine.get(&ct, "biztag1", -3).await.unwrap().is_empty());
        engine.close().await;
    }

    #[tokio::test]
    async fn batches_stay_ascending_across_ranges() {
        let repo = MemoryRepo::with_rows(vec![row("hot", 0, 8)]);
        let engine = SegmentEngine::new(repo).await.unwrap();
        let ct = CancellationToken::new();

        let mut all = Vec::new();
        for _ in 0..6 {
            all.extend(engine.get(&ct, "hot", 4).await.unwrap());
        }
        assert_eq!(all.len(), 24);
        assert!(all.windows(2).all(|w| w[0] < w[1]), "ids not ascending: {all:?}");
        engine.close().await;
    }

    #[tokio::test]
    async fn requested_steps_stay_within_bounds() {
        let baseline = 20;
        let repo = MemoryRepo::with_rows(vec![row("hot", 0, baseline)]);
        let engine = SegmentEngine::new(Arc::clone(&repo) as Arc<dyn SegmentRepository>)
            .await
            .unwrap();
        let ct = CancellationToken::new();

        for _ in 0..8 {
            engine.get(&ct, "hot", 10).await.unwrap();
        }
        engine.close().await;

        let steps = repo.steps_seen.lock();
        assert!(!steps.is_empty(), "expected adaptive refills");
        assert!(
            steps.iter().all(|&s| s >= baseline && s <= 1_000_000),
            "step out of bounds: {steps:?}"
        );
    }

    #[tokio::test]
    async fn refill_survives_a_transient_storage_failure() {
        let repo = MemoryRepo::with_rows(vec![row("flaky", 1, 100)]);
        repo.fail_next.store(1, Ordering::SeqCst);
        let engine = SegmentEngine::new(Arc::clone(&repo) as Arc<dyn SegmentRepository>)
            .await
            .unwrap();
        let ct = CancellationToken::new();

        let ids = engine.get(&ct, "flaky", 5).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        engine.close().await;
    }

    #[tokio::test]
    async fn cancellation_discards_partial_batches() {
        struct StalledRepo;

        #[async_trait]
        impl SegmentRepository for StalledRepo {
            async fn list(&self) -> Result<Vec<Segment>> {
                Ok(vec![row("stuck", 1, 100)])
            }
            async fn get(&self, _biz_tag: &str) -> Result<Segment> {
                Err(Error::NotFound)
            }
            async fn list_biz_tags(&self) -> Result<Vec<String>> {
                Ok(vec!["stuck".to_string()])
            }
            async fn update_max_id(&self, _biz_tag: &str) -> Result<Segment> {
                std::future::pending().await
            }
            async fn update_max_id_with_step(
                &self,
                _biz_tag: &str,
                _step: i32,
            ) -> Result<Segment> {
                std::future::pending().await
            }
        }

        let engine = SegmentEngine::new(Arc::new(StalledRepo)).await.unwrap();
        let ct = CancellationToken::new();
        let pull = engine.get(&ct, "stuck", 1);
        ct.cancel();
        assert!(matches!(pull.await, Err(Error::Cancelled)));
        engine.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn discovery_tracks_repository_changes() {
        let repo = MemoryRepo::with_rows(vec![row("first", 1, 100)]);
        let engine = SegmentEngine::new(Arc::clone(&repo) as Arc<dyn SegmentRepository>)
            .await
            .unwrap();
        let ct = CancellationToken::new();

        repo.rows.lock().push(row("second", 11, 100));
        assert!(matches!(
            engine.get(&ct, "second", 1).await,
            Err(Error::NotFound)
        ));

        // Let the discovery tick fire.
        tokio::time::sleep(DISCOVERY_INTERVAL + Duration::from_secs(1)).await;
        let ids = engine.get(&ct, "second", 3).await.unwrap();
        assert_eq!(ids, vec![11, 12, 13]);

        repo.rows.lock().retain(|row| row.biz_tag != "second");
        tokio::time::sleep(DISCOVERY_INTERVAL + Duration::from_secs(1)).await;
        assert!(matches!(
            engine.get(&ct, "second", 1).await,
            Err(Error::NotFound)
        ));
        engine.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent_and_observable() {
        let repo = MemoryRepo::with_rows(vec![row("biztag1", 1, 100)]);
        let engine = SegmentEngine::new(repo).await.unwrap();
        let ct = CancellationToken::new();

        engine.close().await;
        engine.close().await;
        assert!(matches!(
            engine.get(&ct, "biztag1", 1).await,
            Err(Error::Closed)
        ));
    }
}
