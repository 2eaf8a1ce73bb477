//! The measurement engine and its control surface.
//!
//! [`Engine`] is the single owned instance tying everything together: the
//! registered delayed event device, the tracer, the armer thread and the
//! configuration store. Configuration is mutable only while measurements
//! are disabled.

mod armer;

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock};
use std::thread::{JoinHandle, Thread};

use log::{debug, error, info};

use crate::cstates::{Msr, MsrRead};
use crate::des::DelayedEventSource;
use crate::error::{Error, Result};
use crate::ffi;
use crate::sink::{RecordSink, Schema};
use crate::tracer::{IdleTransition, Tracer};

/// The coarsest supported launch distance granularity, nanoseconds.
pub const MAX_LDIST_GRANULARITY: u64 = 100_000_000;

/// Default launch distance range in nanoseconds.
const DEFAULT_LDIST_FROM: u64 = 1000;
const DEFAULT_LDIST_TO: u64 = 4_000_000;

/// Engine configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct Config {
    /// The CPU to measure wake latency on.
    pub cpu: u32,
}

/// Launch distance constraints reported by the delayed event device.
pub(crate) struct DevInfo {
    pub name: &'static str,
    pub ldist_min: u64,
    pub ldist_max: u64,
    pub ldist_gran: u64,
}

/// State protected by the enable mutex.
pub(crate) struct EnableState {
    pub enabled: bool,
    pub early_intr: bool,
    pub ldist_from: u64,
    pub ldist_to: u64,
    pub init_done: bool,
    pub init_err: Option<Error>,
    pub last_err: Option<Error>,
}

/// State shared between the control surface, the armer thread and the
/// delayed event device's interrupt path.
pub(crate) struct Shared {
    pub cpu: u32,
    /// The enable mutex: serializes enable/disable transitions,
    /// configuration writes and the armer's `send_data()` call.
    pub state: Mutex<EnableState>,
    pub wq: Condvar,
    pub stop: AtomicBool,
    /// How many delayed events have been armed / have happened. The armer
    /// waits on these advancing; the interrupt path increments.
    pub events_armed: AtomicU32,
    pub events_happened: AtomicU32,
    /// ID of the CPU that handled the last delayed event.
    pub event_cpu: AtomicU32,
    /// Error code passed out of the device's interrupt handler.
    pub irq_err: AtomicI32,
    pub tracer: Tracer,
    pub dev: OnceLock<DevInfo>,
    pub armer_thread: OnceLock<Thread>,
}

impl Shared {
    pub fn lock_state(&self) -> MutexGuard<'_, EnableState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn unpark_armer(&self) {
        if let Some(thread) = self.armer_thread.get() {
            thread.unpark();
        }
    }
}

pub(crate) fn disable_shared(shared: &Shared) {
    let mut st = shared.lock_state();
    if st.enabled {
        st.enabled = false;
        shared.tracer.disable();
    }
    drop(st);
    shared.unpark_armer();
}

pub(crate) fn quantize_up(val: u64, gran: u64) -> u64 {
    if gran > 1 {
        val.div_ceil(gran).saturating_mul(gran)
    } else {
        val
    }
}

struct Registered {
    shared: Arc<Shared>,
    armer: Option<JoinHandle<()>>,
}

/// The wake latency measurement engine.
///
/// One engine measures one CPU through one registered delayed event device.
/// Dropping the engine disables measurements and stops the armer thread.
pub struct Engine {
    cpu: u32,
    dev: Option<Registered>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let nr_cpus = ffi::nr_cpus();
        if config.cpu >= nr_cpus {
            return Err(Error::InvalidConfig(format!(
                "bad CPU number '{}', max is {}",
                config.cpu,
                nr_cpus - 1
            )));
        }
        Ok(Self {
            cpu: config.cpu,
            dev: None,
        })
    }

    /// Register the delayed event device which will be used for arming
    /// events in the future, and the sink receiving the records.
    ///
    /// Creates the armer thread on the measured CPU and blocks until the
    /// device finished initializing there. Fails with
    /// [`Error::AlreadyRegistered`] if a device is registered.
    pub fn register(
        &mut self,
        des: Box<dyn DelayedEventSource>,
        sink: Box<dyn RecordSink>,
    ) -> Result<()> {
        let msr: Box<dyn MsrRead> = match Msr::open(self.cpu) {
            Ok(msr) => Box::new(msr),
            Err(e) => {
                debug!(
                    "cannot open /dev/cpu/{}/msr ({e}), residency counters \
                     will be absent",
                    self.cpu
                );
                Box::new(NoMsr)
            }
        };
        self.register_with(des, sink, msr)
    }

    /// Like [`register`][Self::register], with an explicit counter backend
    /// instead of `/dev/cpu/<cpu>/msr`.
    pub fn register_with(
        &mut self,
        des: Box<dyn DelayedEventSource>,
        sink: Box<dyn RecordSink>,
        msr: Box<dyn MsrRead>,
    ) -> Result<()> {
        if self.dev.is_some() {
            error!("already have a device registered");
            return Err(Error::AlreadyRegistered);
        }

        let tracer = Tracer::new(self.cpu, des, sink, msr);
        let shared = Arc::new(Shared {
            cpu: self.cpu,
            state: Mutex::new(EnableState {
                enabled: false,
                early_intr: false,
                ldist_from: 0,
                ldist_to: 0,
                init_done: false,
                init_err: None,
                last_err: None,
            }),
            wq: Condvar::new(),
            stop: AtomicBool::new(false),
            events_armed: AtomicU32::new(0),
            events_happened: AtomicU32::new(0),
            event_cpu: AtomicU32::new(self.cpu),
            irq_err: AtomicI32::new(0),
            tracer,
            dev: OnceLock::new(),
            armer_thread: OnceLock::new(),
        });

        let armer_shared = Arc::clone(&shared);
        let armer = std::thread::Builder::new()
            .name("wult_armer".into())
            .spawn(move || armer::run(armer_shared))?;

        // Wait for the delayed event device to finish initialization on
        // the measured CPU.
        let mut st = shared.lock_state();
        while !st.init_done {
            st = shared.wq.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        if let Some(e) = st.init_err.take() {
            drop(st);
            let _ = armer.join();
            return Err(e);
        }

        let dev = match shared.dev.get() {
            Some(dev) => dev,
            None => return Err(Error::NoDevice),
        };
        st.ldist_from =
            quantize_up(dev.ldist_min.max(DEFAULT_LDIST_FROM), dev.ldist_gran).min(dev.ldist_max);
        st.ldist_to = quantize_up(dev.ldist_max.min(DEFAULT_LDIST_TO), dev.ldist_gran)
            .min(dev.ldist_max)
            .max(st.ldist_from);
        drop(st);

        info!(
            "registered device '{}', resolution: {} ns",
            dev.name, dev.ldist_gran
        );
        self.dev = Some(Registered {
            shared,
            armer: Some(armer),
        });
        Ok(())
    }

    /// Unregister the delayed event device: disable measurements and stop
    /// the armer thread. No-op without a registered device.
    pub fn unregister(&mut self) {
        if let Some(mut reg) = self.dev.take() {
            if let Some(dev) = reg.shared.dev.get() {
                info!("unregistering device '{}'", dev.name);
            }
            disable_shared(&reg.shared);
            reg.shared.stop.store(true, Ordering::SeqCst);
            // Take the enable mutex so the stop flag cannot slip between
            // the armer's predicate check and its condvar wait.
            drop(reg.shared.lock_state());
            reg.shared.wq.notify_all();
            reg.shared.unpark_armer();
            if let Some(armer) = reg.armer.take() {
                let _ = armer.join();
            }
        }
    }

    /// Enable the measurements. Idempotent.
    pub fn enable(&self) -> Result<()> {
        let shared = self.shared()?;
        let mut st = shared.lock_state();
        if st.enabled {
            return Ok(());
        }

        let irq = IrqHandle {
            shared: Arc::clone(shared),
        };
        if let Err(e) = shared.tracer.enable(irq, st.early_intr) {
            error!("failed to enable the tracer: {e}");
            return Err(e);
        }

        shared.events_armed.store(0, Ordering::SeqCst);
        shared.events_happened.store(0, Ordering::SeqCst);
        shared.irq_err.store(0, Ordering::Relaxed);
        shared.event_cpu.store(shared.cpu, Ordering::Relaxed);
        st.enabled = true;
        drop(st);
        shared.wq.notify_all();
        Ok(())
    }

    /// Disable the measurements. Idempotent.
    pub fn disable(&self) {
        if let Some(reg) = &self.dev {
            disable_shared(&reg.shared);
        }
    }

    pub fn enabled(&self) -> bool {
        match &self.dev {
            Some(reg) => reg.shared.lock_state().enabled,
            None => false,
        }
    }

    /// The measured CPU number.
    pub fn cpu(&self) -> u32 {
        self.cpu
    }

    pub fn device_name(&self) -> Result<&'static str> {
        Ok(self.dev_info()?.name)
    }

    /// Smallest launch distance supported by the registered device.
    pub fn ldist_min(&self) -> Result<u64> {
        Ok(self.dev_info()?.ldist_min)
    }

    /// Largest launch distance supported by the registered device.
    pub fn ldist_max(&self) -> Result<u64> {
        Ok(self.dev_info()?.ldist_max)
    }

    /// Launch distance granularity of the registered device.
    pub fn ldist_gran(&self) -> Result<u64> {
        Ok(self.dev_info()?.ldist_gran)
    }

    pub fn ldist_from(&self) -> Result<u64> {
        Ok(self.shared()?.lock_state().ldist_from)
    }

    pub fn ldist_to(&self) -> Result<u64> {
        Ok(self.shared()?.lock_state().ldist_to)
    }

    /// Set the lower end of the launch distance range. Fails with
    /// [`Error::Busy`] while measurements are enabled.
    pub fn set_ldist_from(&self, val: u64) -> Result<()> {
        let shared = self.shared()?;
        let dev = shared.dev.get().ok_or(Error::NoDevice)?;
        let mut st = shared.lock_state();
        if st.enabled {
            return Err(Error::Busy);
        }
        validate_ldist(val, dev)?;
        if val > st.ldist_to {
            return Err(Error::InvalidConfig(format!(
                "ldist_from {val} is above ldist_to {}",
                st.ldist_to
            )));
        }
        st.ldist_from = val;
        Ok(())
    }

    /// Set the upper end of the launch distance range. Fails with
    /// [`Error::Busy`] while measurements are enabled.
    pub fn set_ldist_to(&self, val: u64) -> Result<()> {
        let shared = self.shared()?;
        let dev = shared.dev.get().ok_or(Error::NoDevice)?;
        let mut st = shared.lock_state();
        if st.enabled {
            return Err(Error::Busy);
        }
        validate_ldist(val, dev)?;
        if val < st.ldist_from {
            return Err(Error::InvalidConfig(format!(
                "ldist_to {val} is below ldist_from {}",
                st.ldist_from
            )));
        }
        st.ldist_to = val;
        Ok(())
    }

    pub fn early_intr(&self) -> Result<bool> {
        Ok(self.shared()?.lock_state().early_intr)
    }

    /// Enable or disable the early-interrupts mode: the measured CPU
    /// re-enables interrupts before entering idle, so C-states entered with
    /// interrupts disabled still take the event interrupt on the idle-exit
    /// path. Fails with [`Error::Busy`] while measurements are enabled.
    pub fn set_early_intr(&self, on: bool) -> Result<()> {
        let shared = self.shared()?;
        let mut st = shared.lock_state();
        if st.enabled {
            return Err(Error::Busy);
        }
        st.early_intr = on;
        Ok(())
    }

    /// The fatal error that disabled the engine, if any.
    pub fn take_error(&self) -> Option<Error> {
        self.dev.as_ref()?.shared.lock_state().last_err.take()
    }

    /// How many records were dropped because the sink was full.
    pub fn sink_overflows(&self) -> u64 {
        match &self.dev {
            Some(reg) => reg.shared.tracer.sink_overflows.load(Ordering::Relaxed),
            None => 0,
        }
    }

    /// The emitted-record layout of the registered device.
    pub fn schema(&self) -> Result<Schema> {
        self.shared()?.tracer.schema().cloned().ok_or(Error::NoDevice)
    }

    /// The handle through which the host's idle notifications are fed.
    pub fn idle_handle(&self) -> Result<IdleHandle> {
        Ok(IdleHandle {
            shared: Arc::clone(self.shared()?),
        })
    }

    fn shared(&self) -> Result<&Arc<Shared>> {
        match &self.dev {
            Some(reg) => Ok(&reg.shared),
            None => Err(Error::NoDevice),
        }
    }

    fn dev_info(&self) -> Result<&DevInfo> {
        self.shared()?.dev.get().ok_or(Error::NoDevice)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.unregister();
    }
}

fn validate_ldist(val: u64, dev: &DevInfo) -> Result<()> {
    if val < dev.ldist_min || val > dev.ldist_max {
        return Err(Error::InvalidConfig(format!(
            "launch distance {val} is outside of [{}, {}]",
            dev.ldist_min, dev.ldist_max
        )));
    }
    if dev.ldist_gran > 1 && val % dev.ldist_gran != 0 {
        return Err(Error::InvalidConfig(format!(
            "launch distance {val} is not a multiple of the {} ns resolution",
            dev.ldist_gran
        )));
    }
    Ok(())
}

/// The binding point for the host's idle-entry/idle-exit notification.
///
/// The embedder calls [`idle_event`][Self::idle_event] from the measured
/// CPU's idle path. The engine ignores events while disabled and events for
/// other CPUs, so the stream may be fed unfiltered.
#[derive(Clone)]
pub struct IdleHandle {
    shared: Arc<Shared>,
}

impl IdleHandle {
    /// Feed one idle transition of CPU `cpu_id`.
    ///
    /// Must be called from the measured CPU's idle path; for any one CPU
    /// the idle path and the delayed event device's interrupt dispatch must
    /// not overlap.
    pub fn idle_event(&self, transition: IdleTransition, cpu_id: u32) {
        self.shared.tracer.idle_hook(transition, cpu_id);
    }

    /// Whether the idle path should unmask interrupts before entering an
    /// IRQs-off idle state.
    pub fn early_intr(&self) -> bool {
        self.shared.tracer.early_intr()
    }
}

/// Handle delayed event devices report fired events through.
///
/// The device's interrupt handler calls
/// [`interrupt_start`][Self::interrupt_start] as early as possible, and
/// [`interrupt_finish`][Self::interrupt_finish] once it is done, passing an
/// errno-style error code (0 for success).
#[derive(Clone)]
pub struct IrqHandle {
    pub(crate) shared: Arc<Shared>,
}

impl IrqHandle {
    pub fn interrupt_start(&self) {
        self.shared.tracer.interrupt();
    }

    pub fn interrupt_finish(&self, err: i32) {
        self.shared.irq_err.store(err, Ordering::Relaxed);
        self.shared
            .event_cpu
            .store(ffi::sched_getcpu(), Ordering::Relaxed);
        self.shared.events_happened.fetch_add(1, Ordering::Release);
        self.shared.unpark_armer();
    }
}

struct NoMsr;

impl MsrRead for NoMsr {
    fn read(&self, _reg: u32) -> io::Result<u64> {
        Err(io::ErrorKind::Unsupported.into())
    }
}
