//! The armer thread: drives the measurement schedule on the measured CPU.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error};
use rand::Rng;

use super::{disable_shared, quantize_up, Shared};
use crate::error::{Error, Result};
use crate::ffi;

enum Wait {
    Fired,
    Disabled,
    Stopped,
    TimedOut,
}

pub(super) fn run(shared: Arc<Shared>) {
    let _ = shared.armer_thread.set(thread::current());
    debug!("armer started on CPU{}", ffi::sched_getcpu());

    if let Err(e) = init(&shared) {
        error!("armer initialization failed: {e}");
        let mut st = shared.lock_state();
        st.init_err = Some(e);
        st.init_done = true;
        drop(st);
        shared.wq.notify_all();
        return;
    }

    {
        let mut st = shared.lock_state();
        st.init_done = true;
    }
    shared.wq.notify_all();

    if let Err(e) = main_loop(&shared) {
        disable_shared(&shared);
        let mut st = shared.lock_state();
        st.last_err = Some(e);
        // Park until unregistration.
        while !shared.stop.load(Ordering::Relaxed) {
            st = shared.wq.wait(st).unwrap_or_else(|e| e.into_inner());
        }
    }

    debug!("armer exiting");
}

fn init(shared: &Shared) -> Result<()> {
    ffi::pin_to_cpu(shared.cpu)?;
    check_armer_cpu(shared)?;
    shared.tracer.init_device(shared.cpu)?;
    let _ = shared.dev.set(shared.tracer.dev_info());
    Ok(())
}

/// The armer must only ever run on the measured CPU.
fn check_armer_cpu(shared: &Shared) -> Result<()> {
    let got = ffi::sched_getcpu();
    if got != shared.cpu {
        error!("armer thread runs on CPU{got} instead of CPU{}", shared.cpu);
        return Err(Error::WrongCpu {
            want: shared.cpu,
            got,
        });
    }
    Ok(())
}

fn main_loop(shared: &Shared) -> Result<()> {
    let mut rng = rand::thread_rng();

    loop {
        // Sleep until we are enabled or asked to exit.
        {
            let mut st = shared.lock_state();
            while !st.enabled && !shared.stop.load(Ordering::Relaxed) {
                st = shared.wq.wait(st).unwrap_or_else(|e| e.into_inner());
            }
        }
        if shared.stop.load(Ordering::Relaxed) {
            return Ok(());
        }

        check_armer_cpu(shared)?;

        let happened = shared.events_happened.load(Ordering::Acquire);

        let ldist = pick_ldist(shared, &mut rng);
        shared.tracer.arm_event(ldist)?;
        shared.events_armed.fetch_add(1, Ordering::SeqCst);

        let timeout_ms = ldist / ffi::NSEC_PER_MSEC + 1000;
        match wait_event(shared, happened, Duration::from_millis(timeout_ms)) {
            Wait::Fired => {}
            // Disabled mid-flight: the event may never fire, abandon the
            // iteration and go back to sleep.
            Wait::Disabled => continue,
            Wait::Stopped => return Ok(()),
            Wait::TimedOut => {
                if !shared.lock_state().enabled {
                    continue;
                }
                error!("delayed event timed out, waited {timeout_ms}ms");
                return Err(Error::Timeout {
                    waited_ms: timeout_ms,
                });
            }
        }

        check_event(shared)?;

        // Send the last measurement data out.
        {
            let st = shared.lock_state();
            if st.enabled {
                if let Err(e) = shared.tracer.send_data() {
                    drop(st);
                    error!("failed to send data out: {e}");
                    return Err(e);
                }
            }
        }
    }
}

/// Pick a random launch distance from the configured range, quantized up to
/// the device granularity.
///
/// The range cannot change while measurements are enabled, so the lock is
/// only held for the read.
fn pick_ldist(shared: &Shared, rng: &mut impl Rng) -> u64 {
    let (from, to) = {
        let st = shared.lock_state();
        (st.ldist_from, st.ldist_to)
    };
    let from = from.min(to);
    let gran = match shared.dev.get() {
        Some(dev) => dev.ldist_gran,
        None => 1,
    };
    quantize_up(rng.gen_range(from..=to), gran)
}

/// Wait for `events_happened` to advance past `prev`, with a deadline.
///
/// The interrupt path unparks us after incrementing; `park_timeout`'s
/// wake-up permit makes the unpark-before-park race benign.
fn wait_event(shared: &Shared, prev: u32, timeout: Duration) -> Wait {
    let deadline = Instant::now() + timeout;
    loop {
        if shared.events_happened.load(Ordering::Acquire) != prev {
            return Wait::Fired;
        }
        if shared.stop.load(Ordering::Relaxed) {
            return Wait::Stopped;
        }
        if !shared.lock_state().enabled {
            return Wait::Disabled;
        }
        let now = Instant::now();
        if now >= deadline {
            return Wait::TimedOut;
        }
        thread::park_timeout(deadline - now);
    }
}

/// Sanity checks after the delayed event has happened.
fn check_event(shared: &Shared) -> Result<()> {
    let event_cpu = shared.event_cpu.load(Ordering::Relaxed);
    if event_cpu != shared.cpu {
        error!(
            "delayed event happened on CPU{event_cpu} instead of CPU{}, \
             stop measuring",
            shared.cpu
        );
        return Err(Error::WrongCpu {
            want: shared.cpu,
            got: event_cpu,
        });
    }

    let happened = shared.events_happened.load(Ordering::SeqCst);
    let armed = shared.events_armed.load(Ordering::SeqCst);
    if armed != happened {
        error!("events count mismatch: armed {armed}, got {happened}");
        return Err(Error::EventMismatch { armed, happened });
    }

    let irq_err = shared.irq_err.load(Ordering::Relaxed);
    if irq_err != 0 {
        error!("error {irq_err} happened in the IRQ handler");
        return Err(Error::IrqHandler(irq_err));
    }

    Ok(())
}
