//! Interrupt entry stubs and the common Rust entry point.
//!
//! Every vector gets a 16-byte stub. Stubs for vectors where the CPU pushes
//! no error code push a zero first, so every frame has the same shape; the
//! stub then pushes its vector and jumps to the shared save/restore path,
//! which builds an [`InterruptFrame`] and calls [`isr_common_entry`].

use core::arch::global_asm;

use kestrel_core::exception::{FatalReport, exceptions, handle_exception};
use kestrel_core::irq::irq_dispatch;
use kestrel_core::smp::current_cpu_index;
use kestrel_lib::arch::idt::{EXCEPTION_VECTORS, SPURIOUS_VECTOR};
use kestrel_lib::{InterruptFrame, kdiag_dump_interrupt_frame, kfatal};

/// Distance between consecutive stubs.
pub const ISR_STUB_STRIDE: usize = 16;

global_asm!(
    r#"
    .pushsection .text.kestrel_isr, "ax"
    .balign 16
    .globl kestrel_isr_stubs
kestrel_isr_stubs:
    vector = 0
    .rept 256
    .balign 16
    .if (vector == 8) || ((vector >= 10) && (vector <= 14)) || (vector == 17) || (vector == 21) || (vector == 29) || (vector == 30)
    .else
    pushq $0
    .endif
    pushq $vector
    jmp kestrel_isr_common
    vector = vector + 1
    .endr

    .balign 16
kestrel_isr_common:
    pushq %rax
    pushq %rbx
    pushq %rcx
    pushq %rdx
    pushq %rsi
    pushq %rdi
    pushq %rbp
    pushq %r8
    pushq %r9
    pushq %r10
    pushq %r11
    pushq %r12
    pushq %r13
    pushq %r14
    pushq %r15
    cld
    movq %rsp, %rdi
    movq %rsp, %rbx
    andq $-16, %rsp
    call {entry}
    movq %rbx, %rsp
    popq %r15
    popq %r14
    popq %r13
    popq %r12
    popq %r11
    popq %r10
    popq %r9
    popq %r8
    popq %rbp
    popq %rdi
    popq %rsi
    popq %rdx
    popq %rcx
    popq %rbx
    popq %rax
    addq $16, %rsp
    iretq
    .popsection
    "#,
    entry = sym isr_common_entry,
    options(att_syntax)
);

unsafe extern "C" {
    static kestrel_isr_stubs: u8;
}

/// Address of the entry stub for `vector`.
pub fn stub_address(vector: u8) -> u64 {
    // SAFETY: only the symbol's address is taken.
    let base = unsafe { &raw const kestrel_isr_stubs } as u64;
    base + (vector as usize * ISR_STUB_STRIDE) as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Exception,
    /// Local APIC spurious delivery: no ISR bit, no EOI, nothing to run.
    Spurious,
    Irq,
}

pub fn route(vector: u8) -> Route {
    if (vector as usize) < EXCEPTION_VECTORS {
        Route::Exception
    } else if vector == SPURIOUS_VECTOR {
        Route::Spurious
    } else {
        Route::Irq
    }
}

extern "C" fn isr_common_entry(frame: &mut InterruptFrame) {
    match route(frame.vector()) {
        Route::Exception => {
            handle_exception(exceptions(), frame, current_cpu_index(), report_fatal);
        }
        Route::Spurious => {}
        Route::Irq => {
            irq_dispatch(frame);
        }
    }
}

fn report_fatal(report: &FatalReport, frame: &InterruptFrame) {
    kdiag_dump_interrupt_frame(frame);
    kfatal!(
        "{} (vector {}) on CPU {}, error code 0x{:x}, rip 0x{:x} ({:?})",
        report.name,
        report.vector,
        report.cpu,
        report.error_code,
        report.rip,
        report.reason
    );
}
