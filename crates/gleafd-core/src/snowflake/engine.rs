use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::factory::Factory;
use super::storage::{MachineStorage, Metadata};
use super::{MACHINE_ID_MAX, now_ms};
use crate::{Error, Result};

/// How often the liveness timestamp is pushed to the coordination store.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(3);

/// Owner of the one [`Factory`] instance for this process.
///
/// Mutual exclusion over the factory is a single-slot rendezvous channel:
/// taking the factory out of the slot acquires it, putting it back
/// releases it. A heartbeat task refreshes the coordination record every
/// few seconds so other instances can tell this machine id is live.
pub struct SnowflakeEngine {
    machine_id: i32,
    slot: Mutex<mpsc::Receiver<Factory>>,
    slot_return: mpsc::Sender<Factory>,
    stop: CancellationToken,
    closed: AtomicBool,
    tasks: TaskTracker,
}

impl SnowflakeEngine {
    /// Leases a machine id for `(name, addr)` and starts the heartbeat.
    ///
    /// Refuses to start when the stored liveness timestamp is ahead of the
    /// local clock: that means an earlier instance of this identity ran
    /// with a faster clock, and serving now could repeat its IDs.
    pub async fn new(
        name: &str,
        addr: &str,
        storage: Arc<dyn MachineStorage>,
    ) -> Result<Self> {
        let mut md = storage.get_or_new(name, addr).await?;
        if !(0..=MACHINE_ID_MAX).contains(&md.machine_id) {
            return Err(Error::InvalidMachineId { id: md.machine_id });
        }
        let now = now_ms();
        if md.timestamp > now {
            return Err(Error::StaleClock {
                stored_ms: md.timestamp,
                now_ms: now,
            });
        }

        let factory = Factory::new(md.machine_id)?;
        let (slot_return, slot) = mpsc::channel(1);
        slot_return
            .send(factory)
            .await
            .map_err(|_| Error::Closed)?;

        // First beat before serving; a store we cannot write is fatal here.
        beat(storage.as_ref(), &mut md).await?;

        let stop = CancellationToken::new();
        let tasks = TaskTracker::new();
        let machine_id = md.machine_id;
        tasks.spawn(heartbeat(storage, md, stop.clone()));

        Ok(Self {
            machine_id,
            slot: Mutex::new(slot),
            slot_return,
            stop,
            closed: AtomicBool::new(false),
            tasks,
        })
    }

    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }

    /// Builds `count` IDs. Concurrent callers may interleave at ID
    /// granularity; each caller's own batch is strictly increasing.
    pub async fn get(&self, ct: &CancellationToken, count: i64) -> Result<Vec<i64>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut ids = Vec::new();
        for _ in 0..count {
            ids.push(self.next_id(ct).await?);
        }
        Ok(ids)
    }

    async fn next_id(&self, ct: &CancellationToken) -> Result<i64> {
        let mut factory = {
            let mut slot = self.slot.lock().await;
            tokio::select! {
                _ = ct.cancelled() => return Err(Error::Cancelled),
                _ = self.stop.cancelled() => return Err(Error::Closed),
                taken = slot.recv() => taken.ok_or(Error::Closed)?,
            }
        };
        let id = factory.next();
        // The slot is the factory's only home and holds at most one, so
        // this cannot fail; not pairing the release with cancellation
        // keeps a cancelled caller from stranding the factory.
        let _ = self.slot_return.try_send(factory);
        id
    }

    /// Stops the heartbeat and drains the factory slot. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop.cancel();
        self.tasks.close();
        self.tasks.wait().await;

        let mut slot = self.slot.lock().await;
        slot.close();
        let _ = slot.try_recv();
    }
}

/// Periodic liveness loop. Storage failures are logged and retried on the
/// next tick; the loop only exits on shutdown.
async fn heartbeat(
    storage: Arc<dyn MachineStorage>,
    mut md: Metadata,
    stop: CancellationToken,
) {
    let mut tick = tokio::time::interval_at(
        Instant::now() + HEARTBEAT_INTERVAL,
        HEARTBEAT_INTERVAL,
    );
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tick.tick() => {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    beaten = beat(storage.as_ref(), &mut md) => {
                        if let Err(err) = beaten {
                            tracing::warn!(
                                %err,
                                name = %md.name,
                                addr = %md.addr,
                                "liveness update failed",
                            );
                        }
                    }
                }
            }
        }
    }
}

/// Writes the current wall clock into the record, unless the stored value
/// is already ahead of it (the timestamp must never move backwards).
async fn beat(storage: &dyn MachineStorage, md: &mut Metadata) -> Result<()> {
    let now = now_ms();
    if md.timestamp > now {
        return Ok(());
    }
    md.timestamp = now;
    storage.update(md).await
}
