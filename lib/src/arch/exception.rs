//! Exception metadata for x86_64.
//!
//! Exception names and classification shared by the dispatcher, the
//! assembly stubs and the fatal reporting path.

use super::idt::{
    EXCEPTION_ALIGNMENT_CHECK, EXCEPTION_CONTROL_PROTECTION, EXCEPTION_DOUBLE_FAULT,
    EXCEPTION_GENERAL_PROTECTION, EXCEPTION_INVALID_TSS, EXCEPTION_MACHINE_CHECK,
    EXCEPTION_PAGE_FAULT, EXCEPTION_RESERVED_15, EXCEPTION_SEGMENT_NOT_PRES,
    EXCEPTION_STACK_FAULT,
};

/// Security exception (#SX) pushes an error code but is only raised on AMD.
const EXCEPTION_SECURITY: u8 = 30;
/// VMM communication exception (#VC), error code, AMD SEV only.
const EXCEPTION_VMM_COMMUNICATION: u8 = 29;

/// Exceptions after which CPU state cannot be trusted. Registration is
/// ignored for these.
pub fn exception_always_fatal(vector: u8) -> bool {
    matches!(vector, EXCEPTION_DOUBLE_FAULT | EXCEPTION_MACHINE_CHECK)
}

/// Vectors that only ever take the fatal path: 15 and 21-29.
///
/// 30 and 31 stay registrable; an empty slot is fatal for them anyway.
pub fn exception_is_reserved(vector: u8) -> bool {
    vector == EXCEPTION_RESERVED_15
        || (EXCEPTION_CONTROL_PROTECTION..=EXCEPTION_VMM_COMMUNICATION).contains(&vector)
}

/// Whether the CPU pushes an error code for this vector.
pub fn exception_has_error_code(vector: u8) -> bool {
    matches!(
        vector,
        EXCEPTION_DOUBLE_FAULT
            | EXCEPTION_INVALID_TSS
            | EXCEPTION_SEGMENT_NOT_PRES
            | EXCEPTION_STACK_FAULT
            | EXCEPTION_GENERAL_PROTECTION
            | EXCEPTION_PAGE_FAULT
            | EXCEPTION_ALIGNMENT_CHECK
            | EXCEPTION_CONTROL_PROTECTION
            | EXCEPTION_VMM_COMMUNICATION
            | EXCEPTION_SECURITY
    )
}

pub fn get_exception_name(vector: u8) -> &'static str {
    match vector {
        0 => "Divide Error",
        1 => "Debug",
        2 => "Non-Maskable Interrupt",
        3 => "Breakpoint",
        4 => "Overflow",
        5 => "Bound Range Exceeded",
        6 => "Invalid Opcode",
        7 => "Device Not Available",
        8 => "Double Fault",
        9 => "Coprocessor Segment Overrun",
        10 => "Invalid TSS",
        11 => "Segment Not Present",
        12 => "Stack Segment Fault",
        13 => "General Protection Fault",
        14 => "Page Fault",
        15 => "Reserved",
        16 => "x87 FPU Error",
        17 => "Alignment Check",
        18 => "Machine Check",
        19 => "SIMD Floating-Point Exception",
        20 => "Virtualization Exception",
        21 => "Control Protection Exception",
        22..=31 => "Reserved",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserved_set_is_15_and_21_through_29() {
        let reserved: std::vec::Vec<u8> = (0..32).filter(|&v| exception_is_reserved(v)).collect();
        assert_eq!(reserved, [15, 21, 22, 23, 24, 25, 26, 27, 28, 29]);

        assert!(!exception_is_reserved(14));
        assert!(exception_is_reserved(15));
        assert!(!exception_is_reserved(16));
        assert!(!exception_is_reserved(20));
        assert!(exception_is_reserved(21));
        assert!(exception_is_reserved(29));
        assert!(!exception_is_reserved(30));
        assert!(!exception_is_reserved(31));
    }

    #[test]
    fn error_code_vectors_match_the_stub_table() {
        let with_code: std::vec::Vec<u8> = (0..32).filter(|&v| exception_has_error_code(v)).collect();
        assert_eq!(with_code, [8, 10, 11, 12, 13, 14, 17, 21, 29, 30]);
    }

    #[test]
    fn double_fault_and_machine_check_are_terminal() {
        assert!(exception_always_fatal(8));
        assert!(exception_always_fatal(18));
        assert!(!exception_always_fatal(2));
        assert_eq!(get_exception_name(18), "Machine Check");
    }
}
