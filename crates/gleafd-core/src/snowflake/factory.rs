use std::thread;
use std::time::Duration;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use super::{EPOCH_MS, MACHINE_ID_MAX, MACHINE_ID_SHIFT, SEQ_MASK, TIME_SHIFT, now_ms};
use crate::{Error, Result};

/// Largest clock regression absorbed by sleeping it out, in milliseconds.
const MAX_BACKWARD_MS: i64 = 5;
/// Poll interval while waiting out an exhausted millisecond.
const SEQ_WAIT: Duration = Duration::from_micros(100);
/// Fresh milliseconds start the sequence at a random value below this,
/// so low-traffic deployments don't emit IDs that all end in zero.
const SEQ_SEED_BOUND: i32 = 10;

/// Single-writer snowflake ID builder.
///
/// The factory carries no synchronization of its own; the enclosing engine
/// guarantees exclusive access. Every returned ID strictly exceeds the
/// previous one from the same factory.
pub struct Factory {
    machine_id: i32,
    last_ts: i64,
    seq: i32,
    rng: SmallRng,
}

impl Factory {
    /// Fails with [`Error::InvalidMachineId`] outside `[0, 1023]`.
    pub fn new(machine_id: i32) -> Result<Self> {
        if !(0..=MACHINE_ID_MAX).contains(&machine_id) {
            return Err(Error::InvalidMachineId { id: machine_id });
        }
        Ok(Self {
            machine_id,
            last_ts: 0,
            seq: 0,
            rng: SmallRng::from_os_rng(),
        })
    }

    pub fn machine_id(&self) -> i32 {
        self.machine_id
    }

    /// Builds the next ID.
    ///
    /// A clock regression of up to 5 ms is absorbed by sleeping twice the
    /// offset and re-reading the clock; anything larger, or a regression
    /// that persists after the sleep, fails with [`Error::ClockRegression`].
    /// Exhausting the 12-bit sequence within one millisecond busy-waits for
    /// the next millisecond.
    pub fn next(&mut self) -> Result<i64> {
        let mut ts = now_ms();
        if ts < self.last_ts {
            let offset = self.last_ts - ts;
            if offset > MAX_BACKWARD_MS {
                return Err(Error::ClockRegression { offset_ms: offset });
            }
            thread::sleep(Duration::from_millis((offset << 1) as u64));
            ts = now_ms();
            if ts < self.last_ts {
                return Err(Error::ClockRegression {
                    offset_ms: self.last_ts - ts,
                });
            }
        }

        if ts == self.last_ts {
            self.seq = (self.seq + 1) & SEQ_MASK;
            if self.seq == 0 {
                ts = self.next_millis();
            }
        } else {
            self.seq = self.rng.random_range(0..SEQ_SEED_BOUND);
        }

        self.last_ts = ts;
        Ok(((ts - EPOCH_MS) << TIME_SHIFT)
            | (i64::from(self.machine_id) << MACHINE_ID_SHIFT)
            | i64::from(self.seq))
    }

    fn next_millis(&self) -> i64 {
        let mut ts = now_ms();
        while ts <= self.last_ts {
            thread::sleep(SEQ_WAIT);
            ts = now_ms();
        }
        ts
    }
}
