//! Delayed event source based on a network controller's time-sync alarm.
//!
//! Some NICs (e.g. Intel I210) keep a free-running nanosecond clock and can
//! raise an interrupt when it reaches a programmed target time. The NIC
//! clock and the CPU clock are independent, so every time-stamp of this
//! variant is in NIC nanoseconds and is never converted.
//!
//! Reading the NIC clock is overheadful: the free-running time must first be
//! latched with one register read, then fetched with further reads, each a
//! PCI round-trip. The reported adjustments account for this latch +
//! register-read pipeline: half of the latch read (the latch happens
//! somewhere inside it) plus the full cost of the remaining reads.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::error;

use super::{DelayedEventSource, TimeStamp, TraceData};
use crate::engine::IrqHandle;
use crate::ffi;

/// Maximum supported launch distance in nanoseconds.
const LDIST_MAX: u64 = 10_000_000;

/// The time-sync alarm capability of a network controller.
///
/// Device bring-up (PCI enumeration, reset, IRQ routing) is the
/// implementer's concern; the engine only needs the alarm surface. All
/// methods except [`wait_irq`][Self::wait_irq] must be non-blocking register
/// accesses.
pub trait AlarmHw: Send + Sync {
    /// A throw-away read that flushes posted PCI writes and "warms up" the
    /// PCI link before a timed access.
    fn warm_up(&self);

    /// Latch the free-running clock. The latched value stays stable until
    /// the next latch.
    fn latch(&self);

    /// Read the latched clock value, in NIC nanoseconds.
    fn time(&self) -> u64;

    /// Program the alarm to fire at absolute NIC time `ns` and enable it.
    fn program(&self, ns: u64);

    /// Whether the alarm interrupt is pending, without clearing it.
    fn irq_pending(&self) -> bool;

    /// Acknowledge the interrupt and sanity-check that it was the alarm.
    fn ack_irq(&self) -> io::Result<()>;

    /// Block until the device raises an interrupt (`true`) or
    /// [`wake`][Self::wake] is called (`false`).
    fn wait_irq(&self) -> io::Result<bool>;

    /// Unblock a pending [`wait_irq`][Self::wait_irq].
    fn wake(&self);
}

/// Delayed event source backed by a NIC time-sync alarm.
pub struct NicAlarm {
    hw: Arc<dyn AlarmHw>,
    cpu: u32,
    ltime: u64,
    irq_pending: bool,
    tdata: [TraceData; 2],
    worker: Option<JoinHandle<()>>,
}

impl NicAlarm {
    pub fn new(hw: Arc<dyn AlarmHw>) -> Self {
        Self {
            hw,
            cpu: 0,
            ltime: 0,
            irq_pending: false,
            tdata: [
                TraceData {
                    name: "WarmupDelay",
                    val: 0,
                },
                TraceData {
                    name: "LatchDelay",
                    val: 0,
                },
            ],
            worker: None,
        }
    }

    /// Latch and read the NIC clock, reporting how much of the reading is
    /// read-pipeline overhead.
    fn latched_read(&self) -> TimeStamp {
        let ts1 = ffi::monotonic_ns();
        self.hw.latch();
        let ts2 = ffi::monotonic_ns();
        let ns = self.hw.time();
        let ts3 = ffi::monotonic_ns();

        // The clock latched somewhere inside the first read, assume half of
        // its delay; everything after it is overhead in full.
        TimeStamp {
            t: ns,
            adj: (ts2 - ts1) / 2 + (ts3 - ts2),
        }
    }
}

fn irq_loop(cpu: u32, hw: Arc<dyn AlarmHw>, irq: IrqHandle) {
    if let Err(e) = ffi::pin_to_cpu(cpu) {
        error!("failed to pin the NIC interrupt thread to CPU{cpu}: {e}");
    }
    loop {
        match hw.wait_irq() {
            Ok(true) => {
                irq.interrupt_start();
                let err = match hw.ack_irq() {
                    Ok(()) => 0,
                    Err(e) => e.raw_os_error().unwrap_or(libc::EINVAL),
                };
                irq.interrupt_finish(err);
            }
            Ok(false) => return,
            Err(e) => {
                error!("waiting for the NIC interrupt failed: {e}");
                return;
            }
        }
    }
}

impl DelayedEventSource for NicAlarm {
    fn name(&self) -> &'static str {
        "wult_nic"
    }

    fn init(&mut self, cpu: u32) -> io::Result<()> {
        self.cpu = cpu;
        Ok(())
    }

    fn ldist_min(&self) -> u64 {
        1
    }

    fn ldist_max(&self) -> u64 {
        LDIST_MAX
    }

    fn ldist_gran(&self) -> u64 {
        1
    }

    fn enable(&mut self, irq: IrqHandle) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let hw = Arc::clone(&self.hw);
        let cpu = self.cpu;
        let handle = std::thread::Builder::new()
            .name("wult_nic".into())
            .spawn(move || irq_loop(cpu, hw, irq))?;
        self.worker = Some(handle);
        Ok(())
    }

    fn disable(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.hw.wake();
            let _ = worker.join();
        }
    }

    fn arm(&mut self, ldist: u64) -> io::Result<()> {
        self.tdata[0].val = 0;
        self.tdata[1].val = 0;
        self.irq_pending = false;

        self.hw.latch();
        let now = self.hw.time();
        self.ltime = now + ldist;
        self.hw.program(self.ltime);
        Ok(())
    }

    fn time_before_idle(&mut self) -> TimeStamp {
        self.hw.warm_up();
        self.latched_read()
    }

    fn time_after_idle(&mut self) -> TimeStamp {
        let ts1 = ffi::monotonic_ns();
        // This read also flushes posted PCI writes and warms up the link.
        self.irq_pending = self.hw.irq_pending();
        let ts2 = ffi::monotonic_ns();
        self.hw.latch();
        let ts3 = ffi::monotonic_ns();
        let ns = self.hw.time();

        if self.tdata[0].val == 0 {
            // Keep the warmup and latch delays of the first post-idle read
            // so they travel with the datapoint.
            self.tdata[0].val = ts2 - ts1;
            self.tdata[1].val = ts3 - ts2;
        }

        // Time after idle is ideally the instant this function was entered:
        // the pending-IRQ read plus half of the latch are overhead.
        TimeStamp {
            t: ns,
            adj: (ts2 - ts1) + (ts3 - ts2) / 2,
        }
    }

    fn intr_time(&mut self) -> TimeStamp {
        self.latched_read()
    }

    fn event_has_happened(&mut self) -> bool {
        self.irq_pending
    }

    fn launch_time(&self) -> u64 {
        self.ltime
    }

    fn trace_data(&self) -> &[TraceData] {
        &self.tdata
    }
}

impl Drop for NicAlarm {
    fn drop(&mut self) {
        self.disable();
    }
}
