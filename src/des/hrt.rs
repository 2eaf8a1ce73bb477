//! Delayed event source based on a high-resolution monotonic timer.
//!
//! Events are armed at an absolute `CLOCK_MONOTONIC` nanosecond through a
//! timerfd pinned to the measured CPU by its reader thread. Attribution is
//! trivial: only our own timer wakes the reader, so every dispatched event
//! is ours.

use std::fs::File;
use std::io;
use std::mem::zeroed;
use std::sync::Arc;
use std::thread::JoinHandle;

use libc::{epoll_event, itimerspec};
use log::error;

use super::{DelayedEventSource, TimeStamp};
use crate::engine::IrqHandle;
use crate::ffi;

/// Maximum supported launch distance in nanoseconds.
const LDIST_MAX: u64 = 50_000_000;

/// Delayed event source backed by `CLOCK_MONOTONIC` timerfd events.
pub struct HrTimer {
    cpu: u32,
    timer: Option<Arc<File>>,
    ltime: u64,
    gran: u64,
    worker: Option<Worker>,
}

/// A timer reader thread, shared with the TSC-deadline variant: both arm
/// their events through a timerfd, whose expiry is the event interrupt.
pub(super) struct Worker {
    stop: Arc<File>,
    handle: JoinHandle<()>,
}

impl Worker {
    pub(super) fn spawn(
        name: &'static str,
        cpu: u32,
        timer: Arc<File>,
        irq: IrqHandle,
    ) -> io::Result<Self> {
        let stop = Arc::new(ffi::eventfd(0, libc::EFD_CLOEXEC)?);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || event_loop(cpu, timer, thread_stop, irq))?;
        Ok(Self { stop, handle })
    }

    pub(super) fn stop(self) {
        let _ = ffi::write_u64(&self.stop, 1);
        let _ = self.handle.join();
    }
}

impl HrTimer {
    pub fn new() -> Self {
        Self {
            cpu: 0,
            timer: None,
            ltime: 0,
            gran: 1,
            worker: None,
        }
    }

    fn timer(&self) -> io::Result<&Arc<File>> {
        self.timer
            .as_ref()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected))
    }
}

impl Default for HrTimer {
    fn default() -> Self {
        Self::new()
    }
}

fn event_loop(cpu: u32, timer: Arc<File>, stop: Arc<File>, irq: IrqHandle) {
    if let Err(e) = ffi::pin_to_cpu(cpu) {
        error!("failed to pin the timer thread to CPU{cpu}: {e}");
    }

    let epoll = match ffi::epoll_create1(libc::EPOLL_CLOEXEC) {
        Ok(epoll) => epoll,
        Err(e) => {
            error!("failed to create the timer epoll instance: {e}");
            return;
        }
    };

    let mut timer_ev = epoll_event {
        events: libc::EPOLLIN as u32,
        u64: 0,
    };
    let mut stop_ev = epoll_event {
        events: libc::EPOLLIN as u32,
        u64: 1,
    };
    if ffi::epoll_ctl(&epoll, libc::EPOLL_CTL_ADD, &timer, &mut timer_ev).is_err()
        || ffi::epoll_ctl(&epoll, libc::EPOLL_CTL_ADD, &stop, &mut stop_ev).is_err()
    {
        error!("failed to register the timer with epoll");
        return;
    }

    let mut events: [epoll_event; 2] = unsafe { zeroed() };
    loop {
        let ready = match ffi::epoll_wait(&epoll, &mut events, -1) {
            Ok(ready) => ready,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("timer epoll wait failed: {e}");
                return;
            }
        };
        for ev in ready {
            if ev.u64 == 1 {
                return;
            }
            // Consume the expiration count before dispatching, so a timer
            // re-armed from the armer is never coalesced with this event.
            let _ = ffi::read_u64(&timer);
            irq.interrupt_start();
            irq.interrupt_finish(0);
        }
    }
}

impl DelayedEventSource for HrTimer {
    fn name(&self) -> &'static str {
        "wult_hrt"
    }

    fn init(&mut self, cpu: u32) -> io::Result<()> {
        self.cpu = cpu;
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
        self.worker = Some(Worker::spawn("wult_hrt", self.cpu, timer, irq)?);
        Ok(())
    }

    fn disable(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.stop();
        }
    }

    fn arm(&mut self, ldist: u64) -> io::Result<()> {
        self.ltime = ffi::monotonic_ns() + ldist;
        let mut new: itimerspec = unsafe { zeroed() };
        new.it_value.tv_sec = (self.ltime / ffi::NSEC_PER_SEC) as _;
        new.it_value.tv_nsec = (self.ltime % ffi::NSEC_PER_SEC) as _;
        ffi::timerfd_settime(self.timer()?, libc::TFD_TIMER_ABSTIME, &new)
    }

    fn time_before_idle(&mut self) -> TimeStamp {
        TimeStamp {
            t: ffi::monotonic_ns(),
            adj: 0,
        }
    }

    fn time_after_idle(&mut self) -> TimeStamp {
        TimeStamp {
            t: ffi::monotonic_ns(),
            adj: 0,
        }
    }

    fn intr_time(&mut self) -> TimeStamp {
        TimeStamp {
            t: ffi::monotonic_ns(),
            adj: 0,
        }
    }

    fn event_has_happened(&mut self) -> bool {
        let Ok(timer) = self.timer() else {
            return false;
        };
        match ffi::timerfd_gettime(timer) {
            // A one-shot timerfd reads back zero once it has expired.
            Ok(cur) => cur.it_value.tv_sec == 0 && cur.it_value.tv_nsec == 0,
            Err(_) => false,
        }
    }

    fn launch_time(&self) -> u64 {
        self.ltime
    }
}

impl Drop for HrTimer {
    fn drop(&mut self) {
        self.disable();
    }
}
