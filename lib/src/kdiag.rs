//! Register snapshot captured by the interrupt entry stubs, plus its
//! diagnostic dump.

use crate::arch::exception::get_exception_name;

/// Saved state as laid out on the stack by `kestrel_isr_common`.
///
/// General registers are pushed rax first and r15 last, so r15 sits at the
/// lowest address. `vector` and `error_code` are pushed by the per-vector
/// stub (a zero error code for vectors where the CPU supplies none); the
/// rest is the hardware frame.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InterruptFrame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub vector: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl InterruptFrame {
    /// Frame with only the dispatch-relevant fields set.
    pub const fn for_vector(vector: u8, error_code: u64) -> Self {
        Self {
            r15: 0,
            r14: 0,
            r13: 0,
            r12: 0,
            r11: 0,
            r10: 0,
            r9: 0,
            r8: 0,
            rbp: 0,
            rdi: 0,
            rsi: 0,
            rdx: 0,
            rcx: 0,
            rbx: 0,
            rax: 0,
            vector: vector as u64,
            error_code,
            rip: 0,
            cs: 0,
            rflags: 0,
            rsp: 0,
            ss: 0,
        }
    }

    #[inline]
    pub fn vector(&self) -> u8 {
        (self.vector & 0xFF) as u8
    }
}

// Offsets relied on by the assembly stubs.
const _: () = {
    assert!(core::mem::size_of::<InterruptFrame>() == 22 * 8);
    assert!(core::mem::offset_of!(InterruptFrame, vector) == 15 * 8);
    assert!(core::mem::offset_of!(InterruptFrame, rip) == 17 * 8);
};

pub fn kdiag_dump_interrupt_frame(f: &InterruptFrame) {
    crate::klog_error!("=== INTERRUPT FRAME DUMP ===");
    crate::klog_error!(
        "Vector: {} ({}) Error Code: 0x{:x}",
        f.vector,
        get_exception_name(f.vector()),
        f.error_code
    );
    crate::klog_error!(
        "RIP: 0x{:x}  CS: 0x{:x}  RFLAGS: 0x{:x}",
        f.rip,
        f.cs,
        f.rflags
    );
    crate::klog_error!("RSP: 0x{:x}  SS: 0x{:x}", f.rsp, f.ss);
    crate::klog_error!("RAX: 0x{:x}  RBX: 0x{:x}  RCX: 0x{:x}", f.rax, f.rbx, f.rcx);
    crate::klog_error!("RDX: 0x{:x}  RSI: 0x{:x}  RDI: 0x{:x}", f.rdx, f.rsi, f.rdi);
    crate::klog_error!("RBP: 0x{:x}  R8: 0x{:x}  R9: 0x{:x}", f.rbp, f.r8, f.r9);
    crate::klog_error!("R10: 0x{:x}  R11: 0x{:x}  R12: 0x{:x}", f.r10, f.r11, f.r12);
    crate::klog_error!("R13: 0x{:x}  R14: 0x{:x}  R15: 0x{:x}", f.r13, f.r14, f.r15);
    crate::klog_error!("=== END INTERRUPT FRAME DUMP ===");
}
