//! Application-processor bring-up sequencer.
//!
//! The BSP discovers processors from the platform tables, then for each AP
//! runs INIT, a fixed delay, STARTUP with the trampoline page and a bounded
//! wait on the AP's own started flag. The hardware side (IPIs, delays,
//! trampoline parameters) sits behind [`ApControl`].

use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};

use kestrel_lib::{MAX_CPUS, SpinPolicy, current_apic_id, klog_debug, klog_info, klog_warn};

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessorState {
    Discovered = 0,
    InitSent = 1,
    StartupSent = 2,
    Started = 3,
    /// Never answered; parked with INIT and left out of the system.
    Abandoned = 4,
}

impl ProcessorState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Discovered,
            1 => Self::InitSent,
            2 => Self::StartupSent,
            3 => Self::Started,
            _ => Self::Abandoned,
        }
    }

    /// The AP may still be executing trampoline code.
    pub fn in_flight(self) -> bool {
        matches!(self, Self::InitSent | Self::StartupSent)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SmpError {
    IpiTimeout { apic_id: u32 },
    OutOfMemory,
    TrampolineTooLarge { size: usize },
    PageTablesAbove4G { cr3: u64 },
    /// The trampoline page could not be identity mapped.
    NoIdentityWindow,
    StillStarting { apic_id: u32, state: ProcessorState },
}

pub struct ProcessorDescriptor {
    index: usize,
    apic_id: AtomicU32,
    started: AtomicBool,
    state: AtomicU8,
}

impl ProcessorDescriptor {
    const fn new(index: usize) -> Self {
        Self {
            index,
            apic_id: AtomicU32::new(0),
            started: AtomicBool::new(false),
            state: AtomicU8::new(ProcessorState::Discovered as u8),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn apic_id(&self) -> u32 {
        self.apic_id.load(Ordering::Acquire)
    }

    #[inline]
    pub fn state(&self) -> ProcessorState {
        ProcessorState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Written by the AP itself once it runs kernel code on its own stack.
    pub fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }
}

/// Fixed-capacity, append-only processor list. Index 0 is the BSP.
///
/// Only the BSP appends, before any AP is started; everything else reads.
pub struct ProcessorTable {
    cpus: [ProcessorDescriptor; MAX_CPUS],
    count: AtomicUsize,
}

impl Default for ProcessorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessorTable {
    pub const fn new() -> Self {
        let mut cpus = [const { ProcessorDescriptor::new(0) }; MAX_CPUS];
        let mut i = 0;
        while i < MAX_CPUS {
            cpus[i].index = i;
            i += 1;
        }
        Self {
            cpus,
            count: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, index: usize) -> Option<&ProcessorDescriptor> {
        self.cpus[..self.len()].get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessorDescriptor> {
        self.cpus[..self.len()].iter()
    }

    pub fn index_of(&self, apic_id: u32) -> Option<usize> {
        self.iter()
            .find(|cpu| cpu.apic_id() == apic_id)
            .map(|cpu| cpu.index)
    }

    /// Append `apic_id`, returning its index. Duplicates return the
    /// existing index; a full table returns `None`.
    pub fn register(&self, apic_id: u32) -> Option<usize> {
        if let Some(idx) = self.index_of(apic_id) {
            return Some(idx);
        }
        let idx = self.len();
        let slot = self.cpus.get(idx)?;
        slot.apic_id.store(apic_id, Ordering::Release);
        slot.started.store(false, Ordering::Release);
        slot.set_state(ProcessorState::Discovered);
        self.count.store(idx + 1, Ordering::Release);
        Some(idx)
    }

    /// Record the BSP at index 0 followed by every other usable processor.
    pub fn discover(&self, bsp_apic_id: u32, apic_ids: impl IntoIterator<Item = u32>) -> usize {
        if let Some(bsp) = self.register(bsp_apic_id).and_then(|idx| self.get(idx)) {
            bsp.mark_started();
            bsp.set_state(ProcessorState::Started);
        }
        for apic_id in apic_ids {
            if self.register(apic_id).is_none() {
                klog_warn!(
                    "MP: CPU 0x{:x} ignored, table holds {} processors",
                    apic_id,
                    MAX_CPUS
                );
            }
        }
        self.len()
    }

    pub fn started_count(&self) -> usize {
        self.iter().filter(|cpu| cpu.is_started()).count()
    }

    /// Ok once no AP can still be executing from the identity-mapped
    /// trampoline window.
    pub fn ensure_quiescent(&self) -> Result<(), SmpError> {
        match self.iter().find(|cpu| cpu.state().in_flight()) {
            Some(cpu) => Err(SmpError::StillStarting {
                apic_id: cpu.apic_id(),
                state: cpu.state(),
            }),
            None => Ok(()),
        }
    }
}

/// Hardware half of AP start-up.
pub trait ApControl {
    /// Stack and parameter block for `cpu`, ready before its first IPI.
    fn prepare(&mut self, cpu: &ProcessorDescriptor) -> Result<(), SmpError>;
    fn send_init(&mut self, apic_id: u32) -> Result<(), SmpError>;
    fn send_startup(&mut self, apic_id: u32, start_page: u8) -> Result<(), SmpError>;
    fn delay_us(&mut self, us: u32);

    fn relax(&mut self) {
        core::hint::spin_loop();
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BringUpConfig {
    /// Physical page number of the trampoline (0x08 => 0x8000).
    pub start_page: u8,
    pub init_delay_us: u32,
    pub startup_delay_us: u32,
    pub startup_wait: SpinPolicy,
    /// Follow the MP protocol's second STARTUP when the first goes
    /// unanswered.
    pub second_startup: bool,
}

impl Default for BringUpConfig {
    fn default() -> Self {
        Self {
            start_page: 0x08,
            init_delay_us: 10_000,
            startup_delay_us: 200,
            startup_wait: SpinPolicy::AP_STARTUP,
            second_startup: true,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BringUpSummary {
    pub processors: usize,
    pub started: usize,
    pub abandoned: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BringUp {
    /// Fewer than two usable processors; nothing was sent.
    SingleProcessor,
    Completed(BringUpSummary),
}

/// Start every discovered AP in index order.
pub fn bring_up(table: &ProcessorTable, ctl: &mut dyn ApControl, cfg: &BringUpConfig) -> BringUp {
    let processors = table.len();
    if processors < 2 {
        klog_info!("MP: no secondary CPUs to start");
        return BringUp::SingleProcessor;
    }

    let mut summary = BringUpSummary {
        processors,
        ..BringUpSummary::default()
    };
    for cpu in table.iter().skip(1) {
        if cpu.state() != ProcessorState::Discovered {
            continue;
        }
        if start_ap(cpu, ctl, cfg) {
            summary.started += 1;
        } else {
            summary.abandoned += 1;
        }
    }
    klog_info!(
        "MP: {} of {} application processors online",
        summary.started,
        processors - 1
    );
    BringUp::Completed(summary)
}

fn start_ap(cpu: &ProcessorDescriptor, ctl: &mut dyn ApControl, cfg: &BringUpConfig) -> bool {
    let apic_id = cpu.apic_id();

    if let Err(err) = ctl.prepare(cpu) {
        klog_warn!("MP: CPU 0x{:x} not started: {:?}", apic_id, err);
        cpu.set_state(ProcessorState::Abandoned);
        return false;
    }

    cpu.set_state(ProcessorState::InitSent);
    if let Err(err) = ctl.send_init(apic_id) {
        klog_warn!("MP: INIT to CPU 0x{:x} failed: {:?}", apic_id, err);
        cpu.set_state(ProcessorState::Abandoned);
        return false;
    }
    ctl.delay_us(cfg.init_delay_us);

    let attempts = if cfg.second_startup { 2 } else { 1 };
    let mut started = false;
    for attempt in 1..=attempts {
        cpu.set_state(ProcessorState::StartupSent);
        if let Err(err) = ctl.send_startup(apic_id, cfg.start_page) {
            klog_warn!("MP: STARTUP to CPU 0x{:x} failed: {:?}", apic_id, err);
            break;
        }
        ctl.delay_us(cfg.startup_delay_us);
        let waited = cfg
            .startup_wait
            .wait_until_relax(|| cpu.is_started(), || ctl.relax());
        if waited.is_ok() {
            started = true;
            break;
        }
        klog_debug!("MP: CPU 0x{:x} silent after STARTUP {}", apic_id, attempt);
    }

    if started {
        cpu.set_state(ProcessorState::Started);
        klog_info!("MP: CPU 0x{:x} reported online", apic_id);
        return true;
    }

    klog_info!("MP: CPU 0x{:x} did not respond", apic_id);
    // Park the core so it cannot wake later inside the trampoline.
    if ctl.send_init(apic_id).is_err() {
        klog_warn!("MP: CPU 0x{:x} could not be parked", apic_id);
    }
    cpu.set_state(ProcessorState::Abandoned);
    false
}

// ---------------------------------------------------------------------------
// Kernel-wide processor table
// ---------------------------------------------------------------------------

static PROCESSORS: ProcessorTable = ProcessorTable::new();

#[inline]
pub fn processors() -> &'static ProcessorTable {
    &PROCESSORS
}

/// Index of the calling processor; 0 before discovery.
pub fn current_cpu_index() -> usize {
    PROCESSORS.index_of(current_apic_id()).unwrap_or(0)
}
