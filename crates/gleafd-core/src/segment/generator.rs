use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::Segment;
use crate::{Error, Result};

/// Capacity of the per-biztag ready-ID channel.
const READY_BUFFER: usize = 100;
/// Upper bound on an adaptively widened step.
const STEP_MAX: i32 = 1_000_000;
/// Fraction of a range consumed before the next refill is requested.
const REFILL_TRIGGER: f64 = 0.75;
/// Ranges draining faster than this get a doubled step.
const WIDEN_WITHIN: Duration = Duration::from_secs(10 * 60);
/// Ranges draining slower than this get a halved step.
const NARROW_AFTER: Duration = Duration::from_secs(20 * 60);

/// A refill order sent to the engine loop. `step <= 0` means "advance by the
/// row's configured step"; the reply channel is the owning generator's
/// range input.
pub(crate) struct RefillRequest {
    pub biz_tag: String,
    pub step: i32,
    pub reply: mpsc::Sender<Segment>,
}

/// Consumer-facing handle for one biztag's ID stream.
///
/// All mutable emission state lives in the [`EmitLoop`] task; the handle
/// only holds the channel ends and lifecycle flags, so consumers never
/// contend with the emitter on anything but the ready channel itself.
pub(crate) struct Generator {
    biz_tag: String,
    ready: Mutex<mpsc::Receiver<i64>>,
    refills: mpsc::Sender<RefillRequest>,
    reply: mpsc::Sender<Segment>,
    initialized: AtomicBool,
    stop: CancellationToken,
}

impl Generator {
    /// Creates the generator for `biz_tag` and spawns its emission task on
    /// `tasks`. The task dies with the returned handle's token, which is a
    /// child of the engine's `parent` token.
    pub(crate) fn spawn(
        biz_tag: String,
        refills: mpsc::Sender<RefillRequest>,
        parent: &CancellationToken,
        tasks: &TaskTracker,
    ) -> Arc<Self> {
        let (reply_tx, reply_rx) = mpsc::channel(1);
        let (ready_tx, ready_rx) = mpsc::channel(READY_BUFFER);
        let stop = parent.child_token();

        let emitter = EmitLoop {
            biz_tag: biz_tag.clone(),
            segments: reply_rx,
            ready: ready_tx,
            refills: refills.clone(),
            reply: reply_tx.clone(),
            stop: stop.clone(),
            cur_step: 0,
            last_request: None,
            emitted: 0,
        };
        tasks.spawn(emitter.run());

        Arc::new(Self {
            biz_tag,
            ready: Mutex::new(ready_rx),
            refills,
            reply: reply_tx,
            initialized: AtomicBool::new(false),
            stop,
        })
    }

    /// Stops the emission task. The ready channel closes once the task
    /// drops its sender, which is what blocked consumers observe.
    pub(crate) fn stop(&self) {
        self.stop.cancel();
    }

    /// Pulls `count` IDs, blocking until the emitter produces them. The
    /// very first call triggers the initial range fetch, so it may wait a
    /// storage round-trip.
    pub(crate) async fn get(&self, ct: &CancellationToken, count: i64) -> Result<Vec<i64>> {
        if self.stop.is_cancelled() {
            return Err(Error::Closed);
        }
        if !self.initialized.swap(true, Ordering::SeqCst) {
            let first = RefillRequest {
                biz_tag: self.biz_tag.clone(),
                step: 0,
                reply: self.reply.clone(),
            };
            // Only close interrupts this send: giving up on caller
            // cancellation here would lose the one-shot init trigger.
            tokio::select! {
                _ = self.stop.cancelled() => return Err(Error::Closed),
                sent = self.refills.send(first) => {
                    if sent.is_err() {
                        return Err(Error::Closed);
                    }
                }
            }
        }

        let mut ids = Vec::new();
        let mut ready = self.ready.lock().await;
        for _ in 0..count {
            tokio::select! {
                _ = ct.cancelled() => return Err(Error::Cancelled),
                next = ready.recv() => match next {
                    Some(id) => ids.push(id),
                    None => return Err(Error::Closed),
                },
            }
        }
        Ok(ids)
    }
}

/// The emission task: receives reserved ranges, streams their IDs into the
/// ready channel, and orders the next range once 75% of the current one has
/// been handed out.
struct EmitLoop {
    biz_tag: String,
    segments: mpsc::Receiver<Segment>,
    ready: mpsc::Sender<i64>,
    refills: mpsc::Sender<RefillRequest>,
    reply: mpsc::Sender<Segment>,
    stop: CancellationToken,
    /// Step carried by the next refill request, adapted per range.
    cur_step: i32,
    /// When the previous refill was requested; drives the step policy.
    last_request: Option<Instant>,
    /// Lifetime total of emitted IDs, for the progress log.
    emitted: u64,
}

impl EmitLoop {
    async fn run(mut self) {
        let stop = self.stop.clone();
        loop {
            let received = tokio::select! {
                _ = stop.cancelled() => return,
                seg = self.segments.recv() => seg,
            };
            match received {
                Some(seg) => {
                    if self.emit(seg).await.is_break() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    /// Streams one reserved range into the ready channel.
    async fn emit(&mut self, seg: Segment) -> ControlFlow<()> {
        if self.last_request.is_none() {
            self.last_request = Some(Instant::now());
        }
        let start = seg.start();
        let end = seg.max_id;
        let trigger = start + (f64::from(seg.step) * REFILL_TRIGGER) as i64;

        for id in start..end {
            if id == trigger {
                self.request_next(&seg).await;
            }
            tokio::select! {
                _ = self.stop.cancelled() => return ControlFlow::Break(()),
                sent = self.ready.send(id) => {
                    if sent.is_err() {
                        return ControlFlow::Break(());
                    }
                }
            }
            self.emitted += 1;
            if self.emitted % 1_000_000 == 0 {
                tracing::info!(
                    biztag = %self.biz_tag,
                    current = id,
                    total = self.emitted,
                    "generated",
                );
            }
        }
        ControlFlow::Continue(())
    }

    /// Orders the range after `seg`, widening or narrowing the step based
    /// on how fast the previous range drained.
    async fn request_next(&mut self, seg: &Segment) {
        let since = self.last_request.map(|t| t.elapsed()).unwrap_or_default();
        self.cur_step = if since <= WIDEN_WITHIN {
            seg.step.saturating_mul(2).min(STEP_MAX)
        } else if since >= NARROW_AFTER {
            (self.cur_step / 2).max(seg.step)
        } else {
            seg.step
        };
        tracing::debug!(
            biztag = %self.biz_tag,
            step = self.cur_step,
            elapsed_s = since.as_secs(),
            "requesting next range",
        );

        let request = RefillRequest {
            biz_tag: self.biz_tag.clone(),
            step: self.cur_step,
            reply: self.reply.clone(),
        };
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.refills.send(request) => {}
        }
        self.last_request = Some(Instant::now());
    }
}
