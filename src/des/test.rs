use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use super::hrt::HrTimer;
use super::nic::{AlarmHw, NicAlarm};
use super::tdt::{TscDeadline, MSR_IA32_TSC_DEADLINE};
use super::DelayedEventSource;
use crate::cstates::MsrRead;
use crate::ffi;

/// MSR fake returning a scripted value sequence; the last value repeats.
struct ScriptedMsr {
    seq: Mutex<Vec<u64>>,
}

impl ScriptedMsr {
    fn new(vals: &[u64]) -> Self {
        let mut seq: Vec<u64> = vals.to_vec();
        seq.reverse();
        Self {
            seq: Mutex::new(seq),
        }
    }
}

impl MsrRead for ScriptedMsr {
    fn read(&self, reg: u32) -> io::Result<u64> {
        assert_eq!(reg, MSR_IA32_TSC_DEADLINE);
        let mut seq = self.seq.lock().unwrap();
        if seq.len() > 1 {
            Ok(seq.pop().unwrap())
        } else {
            Ok(seq[0])
        }
    }
}

#[test]
fn test_hrt_event_expiry() {
    let mut hrt = HrTimer::new();
    hrt.init(ffi::sched_getcpu()).unwrap();

    hrt.arm(50_000_000).unwrap();
    assert!(!hrt.event_has_happened());
    assert!(hrt.launch_time() > 0);

    sleep(Duration::from_millis(100));
    assert!(hrt.event_has_happened());
}

#[test]
fn test_tdt_attribution() {
    // The deadline read back before idle is 5 TSC cycles (any wake-up will
    // be past it); after the wake-up the MSR reads zero.
    let msr = ScriptedMsr::new(&[5, 0]);
    let mut tdt = TscDeadline::with_msr(Box::new(msr));
    tdt.init(ffi::sched_getcpu()).unwrap();

    tdt.arm(1_000_000).unwrap();
    let _ = tdt.time_before_idle();
    sleep(Duration::from_millis(10));

    assert!(tdt.event_has_happened());
    assert_eq!(tdt.launch_time(), 5);
}

#[test]
fn test_tdt_loaded_deadline_is_not_our_event() {
    // The MSR still holds a deadline after the wake-up, so somebody else's
    // timer is pending and the wake-up was not the deadline firing.
    let msr = ScriptedMsr::new(&[5, 7]);
    let mut tdt = TscDeadline::with_msr(Box::new(msr));
    tdt.init(ffi::sched_getcpu()).unwrap();

    tdt.arm(1_000_000).unwrap();
    let _ = tdt.time_before_idle();
    sleep(Duration::from_millis(10));

    assert!(!tdt.event_has_happened());
}

#[test]
fn test_tdt_no_deadline_armed() {
    // No deadline was loaded at the before-idle point.
    let msr = ScriptedMsr::new(&[0]);
    let mut tdt = TscDeadline::with_msr(Box::new(msr));
    tdt.init(ffi::sched_getcpu()).unwrap();

    tdt.arm(1_000_000).unwrap();
    let _ = tdt.time_before_idle();
    sleep(Duration::from_millis(10));

    assert!(!tdt.event_has_happened());
}

#[derive(Default)]
struct FakeHw {
    now: AtomicU64,
    latched: AtomicU64,
    target: AtomicU64,
    pending: AtomicBool,
}

impl AlarmHw for FakeHw {
    fn warm_up(&self) {}

    fn latch(&self) {
        self.latched
            .store(self.now.load(Ordering::SeqCst), Ordering::SeqCst);
    }

    fn time(&self) -> u64 {
        self.latched.load(Ordering::SeqCst)
    }

    fn program(&self, ns: u64) {
        self.target.store(ns, Ordering::SeqCst);
    }

    fn irq_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    fn ack_irq(&self) -> io::Result<()> {
        Ok(())
    }

    fn wait_irq(&self) -> io::Result<bool> {
        Ok(false)
    }

    fn wake(&self) {}
}

#[test]
fn test_nic_arm_programs_absolute_nic_time() {
    let hw = Arc::new(FakeHw::default());
    hw.now.store(5000, Ordering::SeqCst);
    let mut nic = NicAlarm::new(Arc::clone(&hw) as Arc<dyn AlarmHw>);
    nic.init(0).unwrap();

    nic.arm(1000).unwrap();
    assert_eq!(hw.target.load(Ordering::SeqCst), 6000);
    assert_eq!(nic.launch_time(), 6000);
}

#[test]
fn test_nic_attribution_follows_pending_alarm() {
    let hw = Arc::new(FakeHw::default());
    let mut nic = NicAlarm::new(Arc::clone(&hw) as Arc<dyn AlarmHw>);
    nic.init(0).unwrap();
    nic.arm(1000).unwrap();

    // The pending flag is sampled on the after-idle path, not live.
    hw.pending.store(true, Ordering::SeqCst);
    assert!(!nic.event_has_happened());
    let _ = nic.time_after_idle();
    assert!(nic.event_has_happened());
}

#[test]
fn test_nic_time_reads_are_nic_clock_domain() {
    let hw = Arc::new(FakeHw::default());
    hw.now.store(7000, Ordering::SeqCst);
    let mut nic = NicAlarm::new(Arc::clone(&hw) as Arc<dyn AlarmHw>);
    nic.init(0).unwrap();

    assert_eq!(nic.time_before_idle().t, 7000);
    hw.now.store(8000, Ordering::SeqCst);
    assert_eq!(nic.intr_time().t, 8000);

    let names: Vec<_> = nic.trace_data().iter().map(|td| td.name).collect();
    assert_eq!(names, ["WarmupDelay", "LatchDelay"]);
}
