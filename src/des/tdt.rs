//! Delayed event source based on the x86 TSC deadline timer.
//!
//! The kernel multiplexes the deadline-timer MSR among many clients, so an
//! event is armed at the timer layer, but the deadline that is actually
//! loaded in the hardware is read back from the MSR just before idle. That
//! deadline, whoever armed it, is the one we measure. Time reads are raw TSC
//! cycles, so every time-stamp of this variant is in the TSC clock domain.

use std::fs::File;
use std::io;
use std::mem::zeroed;
use std::sync::Arc;

use libc::itimerspec;

use super::hrt::Worker;
use super::{DelayedEventSource, TimeStamp};
use crate::cstates::{Msr, MsrRead};
use crate::engine::IrqHandle;
use crate::ffi;

pub const MSR_IA32_TSC_DEADLINE: u32 = 0x6e0;

/// Maximum supported launch distance in nanoseconds.
const LDIST_MAX: u64 = 10_000_000;

/// Delayed event source backed by the processor-local TSC deadline timer.
pub struct TscDeadline {
    cpu: u32,
    timer: Option<Arc<File>>,
    msr: Option<Box<dyn MsrRead>>,
    deadline_before: u64,
    gran: u64,
    worker: Option<Worker>,
}

impl TscDeadline {
    pub fn new() -> Self {
        Self {
            cpu: 0,
            timer: None,
            msr: None,
            deadline_before: 0,
            gran: 1,
            worker: None,
        }
    }

    /// Use `msr` for the deadline register instead of `/dev/cpu/<cpu>/msr`.
    pub fn with_msr(msr: Box<dyn MsrRead>) -> Self {
        let mut s = Self::new();
        s.msr = Some(msr);
        s
    }

    fn timer(&self) -> io::Result<&Arc<File>> {
        self.timer
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }

    fn read_deadline(&self) -> u64 {
        match &self.msr {
            Some(msr) => msr.read(MSR_IA32_TSC_DEADLINE).unwrap_or(0),
            None => 0,
        }
    }
}

impl Default for TscDeadline {
    fn default() -> Self {
        Self::new()
    }
}

impl DelayedEventSource for TscDeadline {
    fn name(&self) -> &'static str {
        "wult_tdt"
    }

    fn init(&mut self, cpu: u32) -> io::Result<()> {
        self.cpu = cpu;
        if self.msr.is_none() {
            self.msr = Some(Box::new(Msr::open(cpu)?));
        }
        self.gran = ffi::clock_resolution_ns(libc::CLOCK_MONOTONIC)?;
        let timer = ffi::timerfd_create(
            libc::CLOCK_MONOTONIC,
            libc::TFD_CLOEXEC | libc::TFD_NONBLOCK,
        )?;
        self.timer = Some(Arc::new(timer));
        Ok(())
    }

    fn ldist_min(&self) -> u64 {
        1
    }

    fn ldist_max(&self) -> u64 {
        LDIST_MAX
    }

    fn ldist_gran(&self) -> u64 {
        self.gran
    }

    fn enable(&mut self, irq: IrqHandle) -> io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let timer = Arc::clone(self.timer()?);
        self.worker = Some(Worker::spawn("wult_tdt", self.cpu, timer, irq)?);
        Ok(())
    }

    fn disable(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }

    fn arm(&mut self, ldist: u64) -> io::Result<()> {
        // The deadline timer hardware is controlled by the kernel, so we
        // cannot program it directly. Arming a timer here makes sure there
        // is at least one deadline loaded and we will not sleep forever;
        // whichever deadline actually reaches the MSR is read back in
        // `time_before_idle()` and becomes the launch time.
        let mut new: itimerspec = unsafe { zeroed() };
        new.it_value.tv_sec = (ldist / ffi::NSEC_PER_SEC) as _;
        new.it_value.tv_nsec = (ldist % ffi::NSEC_PER_SEC) as _;
        ffi::timerfd_settime(self.timer()?, 0, &new)
    }

    fn time_before_idle(&mut self) -> TimeStamp {
        self.deadline_before = self.read_deadline();
        TimeStamp {
            t: ffi::rdtsc_ordered(),
            adj: 0,
        }
    }

    fn time_after_idle(&mut self) -> TimeStamp {
        TimeStamp {
            t: ffi::rdtsc_ordered(),
            adj: 0,
        }
    }

    fn intr_time(&mut self) -> TimeStamp {
        TimeStamp {
            t: ffi::rdtsc_ordered(),
            adj: 0,
        }
    }

    fn event_has_happened(&mut self) -> bool {
        // The hardware zeroes the deadline MSR when the deadline is
        // reached, so a non-zero value means this was not a deadline-timer
        // wake-up.
        if self.read_deadline() != 0 {
            return false;
        }

        // There must have been a deadline armed in the first place, and the
        // reference counter must have passed it.
        if self.deadline_before == 0 || ffi::rdtsc_ordered() <= self.deadline_before {
            return false;
        }

        let Ok(timer) = self.timer() else {
            return false;
        };
        match ffi::timerfd_gettime(timer) {
            Ok(cur) => cur.it_value.tv_sec == 0 && cur.it_value.tv_nsec == 0,
            Err(_) => false,
        }
    }

    fn launch_time(&self) -> u64 {
        // We piggybacked on the nearest loaded deadline, so it is our
        // launch time.
        self.deadline_before
    }
}

impl Drop for TscDeadline {
    fn drop(&mut self) {
        self.disable();
    }
}
