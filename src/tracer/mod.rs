//! The measurement tracer.
//!
//! The tracer owns the per-iteration datapoint and drives the three
//! instrumentation hot-paths: `before_idle` when the measured CPU enters
//! idle, `after_idle` when it leaves, and `interrupt` from the delayed
//! event device's interrupt handler. Completed datapoints are validated and
//! emitted to the record sink by [`send_data`][Tracer::send_data].

mod nmi;

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::OnceLock;

use log::{debug, error};

use self::nmi::NmiReader;

use crate::cstates::{Cstates, MsrRead, MSR_IA32_APERF, MSR_IA32_MPERF, MSR_SMI_COUNT};
use crate::des::DelayedEventSource;
use crate::engine::{DevInfo, IrqHandle, MAX_LDIST_GRANULARITY};
use crate::error::{Error, Result};
use crate::ffi;
use crate::sink::{FieldDesc, FieldType, Record, RecordSink, Schema, MAX_RECORD_FIELDS};

/// One transition of the host's idle-entry/idle-exit notification stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleTransition {
    /// The CPU is entering idle, requesting the given C-state index.
    Enter(u32),
    /// The CPU is leaving idle.
    Exit,
}

/// The common record fields, in emission order. Per-C-state residency
/// deltas and device trace fields follow them.
const COMMON_FIELDS: [(&str, FieldType); 23] = [
    ("LDist", FieldType::U64),
    ("LTime", FieldType::U64),
    ("TBI", FieldType::U64),
    ("TBIAdj", FieldType::U64),
    ("TAI", FieldType::U64),
    ("TAIAdj", FieldType::U64),
    ("TIntr", FieldType::U64),
    ("TIntrAdj", FieldType::U64),
    ("ReqCState", FieldType::U32),
    ("AITS1", FieldType::U64),
    ("AITS2", FieldType::U64),
    ("IntrTS1", FieldType::U64),
    ("IntrTS2", FieldType::U64),
    ("TotCyc", FieldType::U64),
    ("CC0Cyc", FieldType::U64),
    ("SMICnt", FieldType::U64),
    ("NMICnt", FieldType::U64),
    ("AIAperf", FieldType::U64),
    ("IntrAperf", FieldType::U64),
    ("AIMperf", FieldType::U64),
    ("IntrMperf", FieldType::U64),
    ("BICyc", FieldType::U64),
    ("BIMonotonic", FieldType::U64),
];

/// The per-iteration measurement scratchpad.
///
/// Zeroed by `arm_event()`, filled progressively by the three
/// instrumentation points, read by the armer at emission time.
#[derive(Default)]
struct Datapoint {
    /// The C-state index the kernel requested on this idle entry.
    req_cstate: u32,
    /// Time before/after idle and in the interrupt handler, in device
    /// clock units, with the device-reported overhead adjustments.
    tbi: u64,
    tbi_adj: u64,
    tai: u64,
    tai_adj: u64,
    tintr: u64,
    tintr_adj: u64,
    /// The requested launch distance.
    ldist: u64,
    /// Reference cycles and monotonic time taken together before idle.
    bi_tsc: u64,
    bi_monotonic: u64,
    /// Monotonic time at entry/exit of `after_idle()`.
    ai_ts1: u64,
    ai_ts2: u64,
    /// Monotonic time at entry/exit of the interrupt handler.
    intr_ts1: u64,
    intr_ts2: u64,
    /// APERF/MPERF at the after-idle and in-interrupt points.
    ai_aperf: u64,
    ai_mperf: u64,
    intr_aperf: u64,
    intr_mperf: u64,
    /// SMI/NMI counters before idle and at the interrupt.
    smi_bi: u64,
    nmi_bi: u64,
    smi_intr: u64,
    nmi_intr: u64,
    /// An event is armed but has not been observed yet.
    armed: bool,
    /// `before_idle()` ran for the current idle episode.
    bi_finished: bool,
    /// The armed event was confirmed as the wake reason.
    event_happened: bool,
    /// Interrupts were masked on the post-idle path, i.e. `after_idle()`
    /// observed the wake before the interrupt handler ran.
    irqs_disabled: bool,
}

/// The tracer.
///
/// The three hot-paths never block, allocate or take locks; they operate on
/// pre-allocated storage through `UnsafeCell`.
pub(crate) struct Tracer {
    cpu: u32,
    des: UnsafeCell<Box<dyn DelayedEventSource>>,
    cst: UnsafeCell<Cstates>,
    dp: UnsafeCell<Datapoint>,
    nmi: UnsafeCell<NmiReader>,
    sink: UnsafeCell<Box<dyn RecordSink>>,
    schema: OnceLock<Schema>,
    /// Set between `enable()` and `disable()`; the idle hook ignores the
    /// notification stream while clear.
    active: AtomicBool,
    early_intr: AtomicBool,
    smi_ok: bool,
    pub(crate) sink_overflows: AtomicU64,
}

// SAFETY: access to the `UnsafeCell` fields follows the measurement
// protocol. The hot paths (`idle_hook`, `interrupt`) run on the measured
// CPU and are serialized against each other by the host contract (the idle
// path and the device's interrupt dispatch never overlap for one CPU). The
// armer only touches the cells in `arm_event()` (no event in flight, hooks
// dormant because `armed` is false) and `send_data()` (event consumed,
// under the enable mutex). `enable()`/`disable()`/`init_device()` run under
// the enable mutex while no event is armed.
unsafe impl Sync for Tracer {}

impl Tracer {
    pub fn new(
        cpu: u32,
        des: Box<dyn DelayedEventSource>,
        sink: Box<dyn RecordSink>,
        msr: Box<dyn MsrRead>,
    ) -> Self {
        let cst = Cstates::probe(msr);
        let smi_ok = cst.read_msr(MSR_SMI_COUNT).is_ok();
        Self {
            cpu,
            des: UnsafeCell::new(des),
            cst: UnsafeCell::new(cst),
            dp: UnsafeCell::new(Datapoint::default()),
            nmi: UnsafeCell::new(NmiReader::open(cpu)),
            sink: UnsafeCell::new(sink),
            schema: OnceLock::new(),
            active: AtomicBool::new(false),
            early_intr: AtomicBool::new(false),
            smi_ok,
            sink_overflows: AtomicU64::new(0),
        }
    }

    /// Initialize the delayed event device and build the record schema.
    /// Runs once, on the armer thread, pinned to the measured CPU.
    pub fn init_device(&self, cpu: u32) -> Result<()> {
        let des = unsafe { &mut *self.des.get() };
        des.init(cpu)?;

        if des.ldist_gran() > MAX_LDIST_GRANULARITY {
            return Err(Error::InvalidConfig(format!(
                "device '{}' launch distance resolution is {} ns, which is \
                 too coarse, max is {} ns",
                des.name(),
                des.ldist_gran(),
                MAX_LDIST_GRANULARITY
            )));
        }

        let cst = unsafe { &*self.cst.get() };
        let mut fields: Vec<FieldDesc> = COMMON_FIELDS
            .iter()
            .map(|&(name, ty)| FieldDesc {
                name: name.into(),
                ty,
            })
            .collect();
        for csi in cst.iter() {
            fields.push(FieldDesc {
                name: format!("{}Cyc", csi.name),
                ty: FieldType::U64,
            });
        }
        for tdata in des.trace_data() {
            fields.push(FieldDesc {
                name: tdata.name.into(),
                ty: FieldType::U64,
            });
        }
        if fields.len() > MAX_RECORD_FIELDS {
            return Err(Error::InvalidConfig(format!(
                "device '{}' requires {} record fields, max is {}",
                des.name(),
                fields.len(),
                MAX_RECORD_FIELDS
            )));
        }
        let _ = self.schema.set(Schema { fields });
        Ok(())
    }

    pub fn dev_info(&self) -> DevInfo {
        let des = unsafe { &*self.des.get() };
        DevInfo {
            name: des.name(),
            ldist_min: des.ldist_min(),
            ldist_max: des.ldist_max(),
            ldist_gran: des.ldist_gran(),
        }
    }

    pub fn schema(&self) -> Option<&Schema> {
        self.schema.get()
    }

    pub fn early_intr(&self) -> bool {
        self.early_intr.load(Ordering::Relaxed)
    }

    /// Attach the idle-notification hook, the delayed event device and the
    /// record sink. Rolls everything back on failure. Caller holds the
    /// enable mutex.
    pub fn enable(&self, irq: IrqHandle, early_intr: bool) -> Result<()> {
        let schema = match self.schema.get() {
            Some(schema) => schema,
            None => return Err(Error::NoDevice),
        };

        let dp = unsafe { &mut *self.dp.get() };
        dp.armed = false;
        dp.event_happened = false;
        self.early_intr.store(early_intr, Ordering::Relaxed);

        self.active.store(true, Ordering::SeqCst);
        let des = unsafe { &mut *self.des.get() };
        if let Err(e) = des.enable(irq) {
            self.active.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        let sink = unsafe { &mut *self.sink.get() };
        if let Err(e) = sink.activate(schema) {
            des.disable();
            self.active.store(false, Ordering::SeqCst);
            return Err(e);
        }

        Ok(())
    }

    /// Caller holds the enable mutex.
    pub fn disable(&self) {
        self.active.store(false, Ordering::SeqCst);
        let des = unsafe { &mut *self.des.get() };
        des.disable();
        let sink = unsafe { &mut *self.sink.get() };
        sink.deactivate();
    }

    /// Consume one idle-notification event.
    ///
    /// Must be called from the measured CPU, and never concurrently with
    /// the device's interrupt dispatch (the caller is the host's idle path,
    /// which cannot overlap its own interrupt handling for one CPU).
    pub fn idle_hook(&self, transition: IdleTransition, cpu_id: u32) {
        if !self.active.load(Ordering::Relaxed) || cpu_id != self.cpu {
            // Not enabled, or not the CPU we are measuring.
            return;
        }

        let dp = unsafe { &mut *self.dp.get() };
        match transition {
            IdleTransition::Exit => {
                // Hosts have been seen delivering repeated exits without a
                // matching entry; the latch makes those a no-op.
                if dp.bi_finished {
                    self.after_idle(dp);
                }
                dp.bi_finished = false;
            }
            IdleTransition::Enter(req_cstate) => {
                dp.req_cstate = req_cstate;
                if dp.armed {
                    self.before_idle(dp);
                    dp.bi_finished = true;
                }
            }
        }
    }

    /// Get measurement data before idle.
    fn before_idle(&self, dp: &mut Datapoint) {
        dp.smi_bi = self.smi_count();
        let nmi = unsafe { &mut *self.nmi.get() };
        dp.nmi_bi = nmi.count();

        dp.bi_monotonic = ffi::monotonic_ns();
        dp.bi_tsc = ffi::rdtsc_ordered();

        // Snapshot the counters; the reference counter goes last so its
        // delta covers every other delta.
        let cst = unsafe { &mut *self.cst.get() };
        cst.snap_cstates(0);
        cst.snap_active(0);
        cst.snap_reference(0);

        let des = unsafe { &mut *self.des.get() };
        let ts = des.time_before_idle();
        dp.tbi = ts.t;
        dp.tbi_adj = ts.adj;
    }

    /// Get measurement data after idle.
    fn after_idle(&self, dp: &mut Datapoint) {
        dp.ai_ts1 = ffi::monotonic_ns();

        let des = unsafe { &mut *self.des.get() };
        let ts = des.time_after_idle();
        dp.tai = ts.t;
        dp.tai_adj = ts.adj;

        // APERF and MPERF at the after-idle point, for CPU frequency
        // calculations.
        dp.ai_aperf = self.read_msr(MSR_IA32_APERF);
        dp.ai_mperf = self.read_msr(MSR_IA32_MPERF);

        if dp.armed {
            // The interrupt handler did not run yet.
            dp.event_happened = des.event_has_happened();
            if dp.event_happened {
                let cst = unsafe { &mut *self.cst.get() };
                cst.snap_active(1);
                cst.snap_reference(1);
                dp.armed = false;
                dp.irqs_disabled = true;
            }
        }

        dp.ai_ts2 = ffi::monotonic_ns();
    }

    /// Get measurement data in the interrupt handler after idle.
    ///
    /// Called through [`IrqHandle::interrupt_start`] from the delayed event
    /// device's handler, on the measured CPU.
    pub fn interrupt(&self) {
        if !self.active.load(Ordering::Relaxed) {
            return;
        }

        let dp = unsafe { &mut *self.dp.get() };
        dp.intr_ts1 = ffi::monotonic_ns();

        let des = unsafe { &mut *self.des.get() };
        let ts = des.intr_time();
        dp.tintr = ts.t;
        dp.tintr_adj = ts.adj;

        dp.intr_aperf = self.read_msr(MSR_IA32_APERF);
        dp.intr_mperf = self.read_msr(MSR_IA32_MPERF);

        if dp.armed {
            // 'after_idle()' did not run yet.
            let cst = unsafe { &mut *self.cst.get() };
            cst.snap_active(2);
            cst.snap_reference(2);
            dp.event_happened = des.event_has_happened();
            dp.armed = false;
            dp.irqs_disabled = false;
        }

        dp.intr_ts2 = ffi::monotonic_ns();

        // The SMI/NMI counters detect SMIs/NMIs that happened during the
        // measurement, so they have to be read last.
        dp.smi_intr = self.smi_count();
        let nmi = unsafe { &mut *self.nmi.get() };
        dp.nmi_intr = nmi.count();
    }

    /// Arm a delayed event `ldist` nanoseconds from now.
    ///
    /// Called from the armer with no event in flight, which makes the
    /// datapoint exclusively ours: the hooks only write it while `armed`.
    pub fn arm_event(&self, ldist: u64) -> Result<()> {
        let dp = unsafe { &mut *self.dp.get() };
        *dp = Datapoint::default();
        dp.armed = true;

        let des = unsafe { &mut *self.des.get() };
        if let Err(source) = des.arm(ldist) {
            dp.armed = false;
            error!("failed to arm a delayed event {ldist} nsec away: {source}");
            return Err(Error::ArmFailed { ldist, source });
        }

        dp.ldist = ldist;
        Ok(())
    }

    /// Validate the completed datapoint and emit it to the record sink.
    ///
    /// Returns `Ok(true)` if a record was emitted, `Ok(false)` if the
    /// datapoint was dropped (spurious wake-up, out-of-window launch time,
    /// misordered counters, sink backpressure). Caller holds the enable
    /// mutex; the armed event must have been observed.
    pub fn send_data(&self) -> Result<bool> {
        let dp = unsafe { &mut *self.dp.get() };
        if dp.armed {
            // Must be called only after the armed event has happened.
            error!("attempt to send out a datapoint with the event still armed");
            return Err(Error::EventMismatch {
                armed: 1,
                happened: 0,
            });
        }

        if !dp.event_happened {
            // The wake up was not because of the event we armed. It was
            // probably a different, but close event.
            debug!("spurious wake-up, dropping the datapoint");
            return Ok(false);
        }

        let des = unsafe { &mut *self.des.get() };
        let ltime = des.launch_time();

        // The expected event time must be within the sleep time.
        if ltime <= dp.tbi || ltime >= dp.tai || ltime >= dp.tintr {
            debug!("launch time is outside of the idle window, dropping the datapoint");
            return Ok(false);
        }

        // Which post-idle snapshot saw the counters first.
        let snum = if dp.irqs_disabled { 1 } else { 2 };

        let cst = unsafe { &mut *self.cst.get() };
        cst.snap_cstates(snum);
        if let Err(e) = cst.calc(0, snum) {
            error!("{e}, dropping the datapoint");
            return Ok(false);
        }

        let mut record = Record::default();
        let values = [
            dp.ldist,
            ltime,
            dp.tbi,
            dp.tbi_adj,
            dp.tai,
            dp.tai_adj,
            dp.tintr,
            dp.tintr_adj,
            dp.req_cstate as u64,
            dp.ai_ts1,
            dp.ai_ts2,
            dp.intr_ts1,
            dp.intr_ts2,
            cst.dtsc,
            cst.dmperf,
            dp.smi_intr.wrapping_sub(dp.smi_bi),
            dp.nmi_intr.wrapping_sub(dp.nmi_bi),
            dp.ai_aperf,
            dp.intr_aperf,
            dp.ai_mperf,
            dp.intr_mperf,
            dp.bi_tsc,
            dp.bi_monotonic,
        ];
        record.values.extend(values);
        for csi in cst.iter() {
            record.values.push(csi.dcyc);
        }
        for tdata in des.trace_data() {
            record.values.push(tdata.val);
        }

        let sink = unsafe { &mut *self.sink.get() };
        match sink.submit(&record) {
            Ok(()) => Ok(true),
            Err(Error::SinkBackpressure) => {
                self.sink_overflows.fetch_add(1, Ordering::Relaxed);
                debug!("record sink is full, dropping the datapoint");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    #[cfg(test)]
    pub(crate) fn irqs_disabled(&self) -> bool {
        unsafe { &*self.dp.get() }.irqs_disabled
    }

    fn smi_count(&self) -> u64 {
        if !self.smi_ok {
            return 0;
        }
        self.read_msr(MSR_SMI_COUNT)
    }

    fn read_msr(&self, reg: u32) -> u64 {
        let cst = unsafe { &*self.cst.get() };
        cst.read_msr(reg).unwrap_or(0)
    }
}
