use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the measurement engine.
///
/// Fatal measurement errors (`ArmFailed`, `Timeout`, `WrongCpu`,
/// `EventMismatch`, `IrqHandler`) disable the engine and park the armer
/// thread; they are surfaced through
/// [`Engine::take_error`][crate::engine::Engine::take_error].
/// Configuration errors (`Busy`, `InvalidConfig`, `NoDevice`,
/// `AlreadyRegistered`) are returned directly to the caller and leave the
/// engine state unchanged. The remaining kinds are per-datapoint: the
/// datapoint is dropped and the next iteration starts.
#[derive(Debug, Error)]
pub enum Error {
    /// Operation rejected because measurements are enabled.
    #[error("measurements are enabled, disable them first")]
    Busy,

    /// A configuration value is out of range or mis-quantized.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// No delayed event device is registered.
    #[error("no delayed event device registered")]
    NoDevice,

    /// A delayed event device is already registered.
    #[error("a delayed event device is already registered")]
    AlreadyRegistered,

    /// The delayed event device refused to arm an event.
    #[error("failed to arm a delayed event {ldist} nsec away")]
    ArmFailed {
        ldist: u64,
        #[source]
        source: io::Error,
    },

    /// An event fired, or the armer ran, on a CPU other than the target.
    #[error("ran on CPU{got} instead of CPU{want}")]
    WrongCpu { want: u32, got: u32 },

    /// The armed event did not fire within its deadline.
    #[error("delayed event timed out, waited {waited_ms}ms")]
    Timeout { waited_ms: u64 },

    /// A C-state snapshot delta would be negative.
    #[error("cycle counter went backwards between snapshots")]
    CounterMisorder,

    /// The record sink's buffer is full; the record was dropped.
    #[error("record sink is full")]
    SinkBackpressure,

    /// The wake-up was not caused by the event we armed.
    #[error("wake-up was not caused by the armed event")]
    SpuriousWake,

    /// The armed and observed event counts diverged.
    #[error("events count mismatch: armed {armed}, got {happened}")]
    EventMismatch { armed: u32, happened: u32 },

    /// The delayed event device's interrupt handler reported an error.
    #[error("error {0} happened in the IRQ handler")]
    IrqHandler(i32),

    #[error(transparent)]
    Io(#[from] io::Error),
}
