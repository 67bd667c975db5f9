//! CPU exception dispatcher for vectors 0-31.
//!
//! One handler slot per vector. A fired exception with nothing registered,
//! a double fault, a machine check or a reserved vector ends in a
//! [`FatalReport`] that the boot glue prints before halting.

use spin::RwLock;

use kestrel_lib::arch::exception::{
    exception_always_fatal, exception_is_reserved, get_exception_name,
};
use kestrel_lib::arch::idt::EXCEPTION_VECTORS;
use kestrel_lib::{InterruptFrame, klog_debug, klog_info};

/// What a handler decided about the fault it was given.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionAction {
    /// Fault resolved; return to the interrupted context.
    Handled,
    /// Handler looked and gave up; treat as fatal.
    Escalate,
}

pub type ExceptionHandler = fn(&mut InterruptFrame) -> ExceptionAction;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Registered(ExceptionHandler),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionError {
    NotAnException(u8),
    /// Double fault, machine check and reserved vectors cannot be overridden.
    Critical(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FatalReason {
    Unhandled,
    AlwaysFatal,
    Reserved,
    Escalated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FatalReport {
    pub vector: u8,
    pub name: &'static str,
    pub cpu: usize,
    pub error_code: u64,
    pub rip: u64,
    pub reason: FatalReason,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionOutcome {
    Handled,
    Fatal(FatalReport),
}

pub struct ExceptionTable {
    slots: RwLock<[Slot; EXCEPTION_VECTORS]>,
}

impl Default for ExceptionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExceptionTable {
    pub const fn new() -> Self {
        Self {
            slots: RwLock::new([Slot::Empty; EXCEPTION_VECTORS]),
        }
    }

    fn check_vector(vector: u8) -> Result<usize, ExceptionError> {
        if vector as usize >= EXCEPTION_VECTORS {
            return Err(ExceptionError::NotAnException(vector));
        }
        if exception_always_fatal(vector) || exception_is_reserved(vector) {
            return Err(ExceptionError::Critical(vector));
        }
        Ok(vector as usize)
    }

    /// Register `handler` for `vector`, replacing any previous one.
    pub fn install(&self, vector: u8, handler: ExceptionHandler) -> Result<(), ExceptionError> {
        let idx = Self::check_vector(vector).inspect_err(|_| {
            klog_info!(
                "EXCEPTION: Refusing handler for vector {} ({})",
                vector,
                get_exception_name(vector)
            );
        })?;
        let previous = core::mem::replace(&mut self.slots.write()[idx], Slot::Registered(handler));
        if matches!(previous, Slot::Registered(_)) {
            klog_debug!("EXCEPTION: Replaced handler for vector {}", vector);
        } else {
            klog_debug!(
                "EXCEPTION: Installed handler for vector {} ({})",
                vector,
                get_exception_name(vector)
            );
        }
        Ok(())
    }

    pub fn remove(&self, vector: u8) -> Result<(), ExceptionError> {
        let idx = Self::check_vector(vector)?;
        self.slots.write()[idx] = Slot::Empty;
        Ok(())
    }

    pub fn is_registered(&self, vector: u8) -> bool {
        self.slots
            .read()
            .get(vector as usize)
            .is_some_and(|slot| matches!(slot, Slot::Registered(_)))
    }

    /// Route one exception. The slot is copied out before the handler runs,
    /// so handlers may install or remove handlers themselves.
    pub fn dispatch(&self, frame: &mut InterruptFrame, cpu: usize) -> ExceptionOutcome {
        let vector = frame.vector();
        let (error_code, rip) = (frame.error_code, frame.rip);
        let fatal = |reason| {
            ExceptionOutcome::Fatal(FatalReport {
                vector,
                name: get_exception_name(vector),
                cpu,
                error_code,
                rip,
                reason,
            })
        };

        if exception_always_fatal(vector) {
            return fatal(FatalReason::AlwaysFatal);
        }
        if exception_is_reserved(vector) {
            return fatal(FatalReason::Reserved);
        }

        let slot = self
            .slots
            .read()
            .get(vector as usize)
            .copied()
            .unwrap_or(Slot::Empty);
        let Slot::Registered(handler) = slot else {
            return fatal(FatalReason::Unhandled);
        };

        match handler(frame) {
            ExceptionAction::Handled => ExceptionOutcome::Handled,
            ExceptionAction::Escalate => fatal(FatalReason::Escalated),
        }
    }
}

/// Run [`ExceptionTable::dispatch`] and feed a fatal outcome to `on_fatal`.
pub fn handle_exception(
    table: &ExceptionTable,
    frame: &mut InterruptFrame,
    cpu: usize,
    on_fatal: impl FnOnce(&FatalReport, &InterruptFrame),
) -> ExceptionOutcome {
    let outcome = table.dispatch(frame, cpu);
    if let ExceptionOutcome::Fatal(report) = &outcome {
        on_fatal(report, frame);
    }
    outcome
}

static EXCEPTIONS: ExceptionTable = ExceptionTable::new();

#[inline]
pub fn exceptions() -> &'static ExceptionTable {
    &EXCEPTIONS
}

pub fn exception_install(vector: u8, handler: ExceptionHandler) -> Result<(), ExceptionError> {
    EXCEPTIONS.install(vector, handler)
}

pub fn exception_remove(vector: u8) -> Result<(), ExceptionError> {
    EXCEPTIONS.remove(vector)
}
