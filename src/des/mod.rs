//! Delayed event sources.
//!
//! A delayed event source (DES) is the hardware back-end able to schedule a
//! wake event with sub-microsecond precision: it arms an event N nanoseconds
//! in the future, reads "time" in its own clock domain at the three
//! instrumentation sites, and decides whether a wake-up was caused by the
//! event it armed.

pub mod hrt;
pub mod nic;
pub mod tdt;

#[cfg(test)]
mod test;

use std::io;

use crate::engine::IrqHandle;

/// A single piece of device-specific data that travels with each datapoint.
#[derive(Clone, Copy, Debug)]
pub struct TraceData {
    pub name: &'static str,
    pub val: u64,
}

/// A time reading in the device's clock domain.
///
/// `adj` is the portion of `t` that is known self-induced overhead: the
/// monotonic nanoseconds spent between the instant the device latched the
/// time and the instant the reading returned. Consumers subtract it to
/// recover the true latency; the engine only transports it.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimeStamp {
    pub t: u64,
    pub adj: u64,
}

/// Operations a delayed event device has to provide.
///
/// The engine calls the time-read and attribution operations only on the
/// measured CPU. Device teardown happens on drop.
pub trait DelayedEventSource: Send {
    fn name(&self) -> &'static str;

    /// Bind the device to the measured CPU. Called once, on the measured
    /// CPU, before any other operation.
    fn init(&mut self, cpu: u32) -> io::Result<()>;

    /// Smallest supported launch distance, nanoseconds.
    fn ldist_min(&self) -> u64;

    /// Largest supported launch distance, nanoseconds.
    fn ldist_max(&self) -> u64;

    /// Launch distance quantization, nanoseconds.
    fn ldist_gran(&self) -> u64;

    /// Attach the device's event delivery path. The device reports every
    /// fired event through `irq`: [`IrqHandle::interrupt_start`] as early as
    /// possible in its handler, then [`IrqHandle::interrupt_finish`].
    fn enable(&mut self, irq: IrqHandle) -> io::Result<()>;

    /// Detach the event delivery path. Idempotent.
    fn disable(&mut self);

    /// Program the next event `ldist` nanoseconds in the future and record
    /// the absolute launch time for [`launch_time`][Self::launch_time].
    fn arm(&mut self, ldist: u64) -> io::Result<()>;

    /// Read the current time just before entering idle.
    fn time_before_idle(&mut self) -> TimeStamp;

    /// Read the current time as soon as possible after leaving idle.
    fn time_after_idle(&mut self) -> TimeStamp;

    /// Read the current time from the event interrupt handler.
    fn intr_time(&mut self) -> TimeStamp;

    /// Whether the most recent wake-up is attributable to the event we
    /// armed, as opposed to some other interrupt.
    fn event_has_happened(&mut self) -> bool;

    /// Absolute target time of the armed event, in the device's clock.
    fn launch_time(&self) -> u64;

    /// Device-specific extra fields for the last measurement.
    fn trace_data(&self) -> &[TraceData] {
        &[]
    }
}
