pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for both allocation engines and the service façade.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The requested biztag does not exist in storage or in the engine map.
    #[error("biztag not found")]
    NotFound,

    /// The engine serving this request was disabled by configuration.
    #[error("service disabled")]
    ServiceDisabled,

    /// The engine or generator has shut down.
    #[error("service closed")]
    Closed,

    /// A machine id outside the 10-bit `[0, 1023]` range.
    #[error("invalid machine id: {id}")]
    InvalidMachineId { id: i32 },

    /// The system clock moved backwards further than the factory tolerates.
    #[error("system clock moved backwards by {offset_ms}ms")]
    ClockRegression { offset_ms: i64 },

    /// The coordination store holds a liveness timestamp from the future,
    /// meaning an earlier instance of this identity ran with a clock ahead
    /// of ours.
    #[error("stored timestamp {stored_ms}ms is ahead of local clock {now_ms}ms")]
    StaleClock { stored_ms: i64, now_ms: i64 },

    /// The caller cancelled the request.
    #[error("request cancelled")]
    Cancelled,

    /// Any failure reported by a storage driver.
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wraps a driver-level failure into [`Error::Storage`].
    pub fn storage<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Storage(err.into())
    }
}
