//! Wake-up latency measurement engine.
//!
//! This crate measures, with sub-microsecond accuracy, how long a CPU takes
//! to emerge from a hardware idle state when woken by a precisely scheduled
//! future event. A single armer thread, pinned to the measured CPU, arms a
//! "delayed event" a random number of nanoseconds in the future, the CPU
//! goes idle, the event fires, and four time-stamps (pre-idle, post-idle,
//! interrupt, launch) plus C-state residency deltas are collected into one
//! datapoint and emitted to a record sink.
//!
//! The delayed event is produced by a pluggable [`DelayedEventSource`]: a
//! high-resolution monotonic timer ([`des::hrt::HrTimer`]), the processor's
//! TSC deadline timer ([`des::tdt::TscDeadline`]), or a network controller
//! with a programmable time-sync alarm ([`des::nic::NicAlarm`]).
//!
//! ## Example
//!
//! ```no_run
//! use wult::des::hrt::HrTimer;
//! use wult::engine::{Config, Engine};
//! use wult::sink::RingSink;
//!
//! let (sink, records) = RingSink::with_capacity(4096);
//!
//! let mut engine = Engine::new(Config { cpu: 0 })?;
//! engine.register(Box::new(HrTimer::new()), Box::new(sink))?;
//!
//! // The embedder feeds the host's idle-entry/idle-exit notifications
//! // through the idle handle; see `IdleHandle` for the contract.
//! let idle = engine.idle_handle()?;
//! # let _ = idle;
//!
//! engine.enable()?;
//! for record in records.iter().take(10) {
//!     println!("{:?}", record.values);
//! }
//! engine.disable();
//! # Ok::<(), wult::Error>(())
//! ```
//!
//! ## Permission
//!
//! Reading C-state residency counters requires access to `/dev/cpu/<cpu>/msr`
//! (the `msr` kernel module and `CAP_SYS_RAWIO`, or root). Counters that
//! cannot be read are excluded from the emitted records, the engine itself
//! works without them.
//!
//! [`DelayedEventSource`]: des::DelayedEventSource

pub mod cstates;
pub mod des;
pub mod engine;
mod error;
mod ffi;
pub mod sink;
pub mod tracer;

pub use error::{Error, Result};
