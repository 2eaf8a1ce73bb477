//! End-to-end measurement scenarios with a scriptable delayed event source.
//!
//! The stub device keeps a virtual clock the tests advance by hand, so the
//! launch-time window checks are deterministic. The host idle path is
//! played back through the engine's idle handle, and the device "interrupt"
//! is raised from the test thread, pinned to the measured CPU.

use std::collections::HashMap;
use std::io;
use std::mem::{size_of, zeroed};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use wult::cstates::{MsrRead, MSR_IA32_MPERF, MSR_IA32_TSC, MSR_SMI_COUNT};
use wult::des::{DelayedEventSource, TimeStamp};
use wult::engine::{Config, Engine, IrqHandle};
use wult::sink::{Record, RingSink};
use wult::tracer::IdleTransition;
use wult::Error;

const MSR_CORE_C3_RESIDENCY: u32 = 0x3fc;

// Field indices in the emitted record.
const LDIST: usize = 0;
const LTIME: usize = 1;
const TBI: usize = 2;
const TAI: usize = 4;
const TINTR: usize = 6;
const REQ_CSTATE: usize = 8;
const TOT_CYC: usize = 13;
const CC0_CYC: usize = 14;

fn current_cpu() -> u32 {
    unsafe { libc::sched_getcpu() as u32 }
}

fn pin_to(cpu: u32) {
    let mut set: libc::cpu_set_t = unsafe { zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
        libc::sched_setaffinity(0, size_of::<libc::cpu_set_t>(), &set);
    }
}

/// Another CPU this process may run on, if there is one.
fn other_allowed_cpu(not: u32) -> Option<u32> {
    let mut set: libc::cpu_set_t = unsafe { zeroed() };
    let ret = unsafe { libc::sched_getaffinity(0, size_of::<libc::cpu_set_t>(), &mut set) };
    if ret != 0 {
        return None;
    }
    let nr_cpus = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) } as u32;
    (0..nr_cpus).find(|&cpu| cpu != not && unsafe { libc::CPU_ISSET(cpu as usize, &set) })
}

#[derive(Default)]
struct StubState {
    now: AtomicU64,
    ltime: AtomicU64,
    fired: AtomicBool,
    arms: AtomicU32,
    irq: Mutex<Option<IrqHandle>>,
}

impl StubState {
    fn tick(&self, step: u64) -> u64 {
        self.now.fetch_add(step, Ordering::SeqCst) + step
    }

    /// Virtual sleep: jump the device clock to the launch time and decide
    /// whether the wake-up will be attributed to our event.
    fn fire(&self, ours: bool) {
        self.now
            .store(self.ltime.load(Ordering::SeqCst), Ordering::SeqCst);
        self.fired.store(ours, Ordering::SeqCst);
    }

    fn irq(&self) -> IrqHandle {
        self.irq.lock().unwrap().clone().expect("device not enabled")
    }

    /// Wait until the armer has armed `n` events in total.
    fn wait_armed(&self, n: u32) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.arms.load(Ordering::SeqCst) < n {
            assert!(Instant::now() < deadline, "armer never armed event #{n}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

struct StubDes {
    st: Arc<StubState>,
}

impl DelayedEventSource for StubDes {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn init(&mut self, _cpu: u32) -> io::Result<()> {
        Ok(())
    }

    fn ldist_min(&self) -> u64 {
        1
    }

    fn ldist_max(&self) -> u64 {
        50_000_000
    }

    fn ldist_gran(&self) -> u64 {
        1
    }

    fn enable(&mut self, irq: IrqHandle) -> io::Result<()> {
        *self.st.irq.lock().unwrap() = Some(irq);
        Ok(())
    }

    fn disable(&mut self) {}

    fn arm(&mut self, ldist: u64) -> io::Result<()> {
        let now = self.st.now.load(Ordering::SeqCst);
        self.st.ltime.store(now + ldist, Ordering::SeqCst);
        self.st.fired.store(false, Ordering::SeqCst);
        self.st.arms.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn time_before_idle(&mut self) -> TimeStamp {
        TimeStamp {
            t: self.st.tick(10),
            adj: 0,
        }
    }

    fn time_after_idle(&mut self) -> TimeStamp {
        TimeStamp {
            t: self.st.tick(10),
            adj: 0,
        }
    }

    fn intr_time(&mut self) -> TimeStamp {
        TimeStamp {
            t: self.st.tick(10),
            adj: 0,
        }
    }

    fn event_has_happened(&mut self) -> bool {
        self.st.fired.load(Ordering::SeqCst)
    }

    fn launch_time(&self) -> u64 {
        self.st.ltime.load(Ordering::SeqCst)
    }
}

/// Scripted MSR fake; the last value of a sequence repeats forever.
#[derive(Clone, Default)]
struct FakeMsr {
    vals: Arc<Mutex<HashMap<u32, Vec<u64>>>>,
}

impl FakeMsr {
    fn script(&self, reg: u32, vals: &[u64]) {
        let mut seq: Vec<u64> = vals.to_vec();
        seq.reverse();
        self.vals.lock().unwrap().insert(reg, seq);
    }
}

impl MsrRead for FakeMsr {
    fn read(&self, reg: u32) -> io::Result<u64> {
        let mut vals = self.vals.lock().unwrap();
        let seq = vals
            .get_mut(&reg)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        if seq.len() > 1 {
            Ok(seq.pop().unwrap())
        } else {
            seq.first()
                .copied()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }
    }
}

struct Setup {
    engine: Engine,
    records: Receiver<Record>,
    st: Arc<StubState>,
    cpu: u32,
}

fn setup_with_msr(msr: FakeMsr) -> Setup {
    let _ = env_logger::builder().is_test(true).try_init();

    let cpu = current_cpu();
    pin_to(cpu);

    let st = Arc::new(StubState::default());
    st.now.store(1000, Ordering::SeqCst);

    let (sink, records) = RingSink::with_capacity(1024);
    let mut engine = Engine::new(Config { cpu }).unwrap();
    engine
        .register_with(
            Box::new(StubDes {
                st: Arc::clone(&st),
            }),
            Box::new(sink),
            Box::new(msr),
        )
        .unwrap();

    Setup {
        engine,
        records,
        st,
        cpu,
    }
}

fn setup() -> Setup {
    setup_with_msr(FakeMsr::default())
}

/// Play back one measurement iteration: idle entry, the (virtual) sleep,
/// the wake-up and the event interrupt.
///
/// With `poll` the requested C-state keeps interrupts enabled, so the
/// interrupt handler runs before the idle-exit notification.
fn drive_iteration(setup: &Setup, n: u32, ours: bool, poll: bool) {
    let st = &setup.st;
    let idle = setup.engine.idle_handle().unwrap();

    st.wait_armed(n);
    let req_cstate = if poll { 0 } else { 2 };
    idle.idle_event(IdleTransition::Enter(req_cstate), setup.cpu);
    st.fire(ours);

    let irq = st.irq();
    if poll {
        irq.interrupt_start();
        idle.idle_event(IdleTransition::Exit, setup.cpu);
        irq.interrupt_finish(0);
    } else {
        idle.idle_event(IdleTransition::Exit, setup.cpu);
        irq.interrupt_start();
        irq.interrupt_finish(0);
    }
}

fn check_invariants(setup: &Setup, record: &Record) {
    let v = &record.values;
    assert!(v[TBI] < v[LTIME], "TBI {} >= LTime {}", v[TBI], v[LTIME]);
    assert!(v[LTIME] < v[TAI], "LTime {} >= TAI {}", v[LTIME], v[TAI]);
    assert!(
        v[LTIME] < v[TINTR],
        "LTime {} >= TIntr {}",
        v[LTIME],
        v[TINTR]
    );

    let schema = setup.engine.schema().unwrap();
    assert_eq!(v.len(), schema.fields.len());

    // The reference-cycle delta covers the active cycles.
    assert!(v[TOT_CYC] >= v[CC0_CYC]);
}

fn wait_disabled(engine: &Engine) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while engine.enabled() {
        assert!(Instant::now() < deadline, "engine did not disable itself");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_clean_iteration() {
    let setup = setup();
    let engine = &setup.engine;

    engine.set_ldist_to(1000).unwrap();
    assert_eq!(engine.ldist_from().unwrap(), 1000);
    engine.enable().unwrap();

    drive_iteration(&setup, 1, true, false);

    let record = setup
        .records
        .recv_timeout(Duration::from_secs(5))
        .expect("no record emitted");
    engine.disable();

    assert_eq!(record.values[LDIST], 1000);
    assert!(record.values[TAI] - record.values[TBI] >= 1000);
    let intr_latency = record.values[TINTR] - record.values[LTIME];
    assert!(intr_latency > 0 && intr_latency < 100);
    assert_eq!(record.values[REQ_CSTATE], 2);
    check_invariants(&setup, &record);

    // Exactly one record for one driven iteration.
    std::thread::sleep(Duration::from_millis(50));
    assert!(setup.records.try_recv().is_err());
    assert!(setup.engine.take_error().is_none());
}

#[test]
fn test_spurious_wake_continues_measuring() {
    let setup = setup();
    setup.engine.enable().unwrap();

    // First wake-up is not ours: dropped, no record, still enabled.
    drive_iteration(&setup, 1, false, false);
    // The next one is ours.
    drive_iteration(&setup, 2, true, false);

    let record = setup
        .records
        .recv_timeout(Duration::from_secs(5))
        .expect("no record after a spurious wake");
    assert!(setup.engine.enabled());
    setup.engine.disable();

    check_invariants(&setup, &record);
    assert!(setup.records.try_recv().is_err());
}

#[test]
fn test_wrong_cpu_interrupt_disables() {
    let setup = setup();
    let Some(other) = other_allowed_cpu(setup.cpu) else {
        eprintln!("single-CPU affinity mask, skipping");
        return;
    };

    setup.engine.enable().unwrap();
    setup.st.wait_armed(1);
    setup.st.fire(true);

    let irq = setup.st.irq();
    std::thread::spawn(move || {
        pin_to(other);
        irq.interrupt_start();
        irq.interrupt_finish(0);
    })
    .join()
    .unwrap();

    wait_disabled(&setup.engine);
    assert!(matches!(
        setup.engine.take_error(),
        Some(Error::WrongCpu { .. })
    ));
    assert!(setup.records.try_recv().is_err());
}

#[test]
fn test_timeout_disables() {
    let setup = setup();
    let engine = &setup.engine;

    engine.set_ldist_from(1_000_000).unwrap();
    engine.set_ldist_to(1_000_000).unwrap();
    engine.enable().unwrap();

    setup.st.wait_armed(1);
    // Never fire; the armer gives up after ldist + 1s.
    wait_disabled(engine);
    assert!(matches!(
        engine.take_error(),
        Some(Error::Timeout { waited_ms: 1001 })
    ));
}

#[test]
fn test_poll_style_idle() {
    let setup = setup();
    setup.engine.enable().unwrap();

    drive_iteration(&setup, 1, true, true);

    let record = setup
        .records
        .recv_timeout(Duration::from_secs(5))
        .expect("no record for poll-style idle");
    setup.engine.disable();

    assert_eq!(record.values[REQ_CSTATE], 0);
    check_invariants(&setup, &record);
}

#[test]
fn test_counter_backwards_drops_record() {
    let msr = FakeMsr::default();
    msr.script(MSR_IA32_TSC, &[2000, 1000]);
    msr.script(MSR_IA32_MPERF, &[500]);
    msr.script(MSR_SMI_COUNT, &[5]);
    msr.script(MSR_CORE_C3_RESIDENCY, &[100]);
    let setup = setup_with_msr(msr);

    setup.engine.enable().unwrap();
    drive_iteration(&setup, 1, true, false);

    // The datapoint is dropped but the engine keeps measuring: the armer
    // proceeds to the next iteration.
    setup.st.wait_armed(2);
    assert!(setup.engine.enabled());
    assert!(setup.records.try_recv().is_err());
    assert!(setup.engine.take_error().is_none());
    setup.engine.disable();
}

#[test]
fn test_enable_disable_round_trip_emits_nothing() {
    let setup = setup();

    setup.engine.enable().unwrap();
    setup.engine.disable();
    setup.engine.enable().unwrap();
    setup.engine.disable();

    std::thread::sleep(Duration::from_millis(50));
    assert!(setup.records.try_recv().is_err());
    assert!(setup.engine.take_error().is_none());
}

#[test]
fn test_early_intr_reaches_the_idle_path() {
    let setup = setup();
    let engine = &setup.engine;

    engine.set_early_intr(true).unwrap();
    engine.enable().unwrap();

    let idle = engine.idle_handle().unwrap();
    assert!(idle.early_intr());

    // With interrupts unmasked early the handler runs before idle exit.
    drive_iteration(&setup, 1, true, true);
    let record = setup
        .records
        .recv_timeout(Duration::from_secs(5))
        .expect("no record in early-intr mode");
    engine.disable();
    check_invariants(&setup, &record);
}
