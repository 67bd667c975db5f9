//! Application-processor start-up trampoline.
//!
//! A STARTUP IPI drops the AP into real mode at `page << 12`. The image below
//! is copied to [`TRAMPOLINE_PHYS`] and walks real -> protected -> long mode
//! on a temporary GDT, then loads the kernel's GDT, switches to the stack
//! from the parameter block and calls the Rust entry with the processor
//! index in `rdi`.
//!
//! The 32-bit leg loads CR3 from a 32-bit value, so the kernel's top-level
//! page table must sit below 4 GiB.

use core::arch::global_asm;
use core::mem::{offset_of, size_of};
use core::ptr;

use x86_64::{PhysAddr, VirtAddr};

use kestrel_core::smp::SmpError;
use kestrel_lib::arch::gdt::{FLAT_CODE32, FLAT_CODE64, FLAT_DATA, SegmentSelector};
use kestrel_lib::{klog_debug, klog_warn};
use kestrel_mm::{DevicePaging, PAGE_SIZE_4KB};

pub const TRAMPOLINE_PHYS: u64 = 0x8000;
pub const TRAMPOLINE_START_PAGE: u8 = (TRAMPOLINE_PHYS >> 12) as u8;
pub const TRAMPOLINE_PAGE_SIZE: usize = PAGE_SIZE_4KB as usize;

const CR3_LIMIT: u64 = 1 << 32;

global_asm!(
    r#"
    .pushsection .rodata.kestrel_ap_trampoline, "a"
    .set AP_BASE, {base}
    .balign 16
    .globl kestrel_ap_trampoline_start
    .globl kestrel_ap_trampoline_params
    .globl kestrel_ap_trampoline_end
kestrel_ap_trampoline_start:
    .code16
    cli
    cld
    jmp ap_real_mode

    .balign 8
ap_temp_gdt:
    .quad 0
    .quad {code32}
    .quad {flat_data}
    .quad {code64}
ap_temp_gdt_end:
ap_temp_gdtr:
    .word ap_temp_gdt_end - ap_temp_gdt - 1
    .long AP_BASE + (ap_temp_gdt - kestrel_ap_trampoline_start)

    .balign 8
kestrel_ap_trampoline_params:
    .quad 0
    .quad 0
    .quad 0
    .quad 0
    .word 0
    .quad 0

ap_real_mode:
    xorw %ax, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    lgdtl AP_BASE + (ap_temp_gdtr - kestrel_ap_trampoline_start)
    movl %cr0, %eax
    orl $1, %eax
    movl %eax, %cr0
    ljmpl ${sel32}, $(AP_BASE + (ap_protected_mode - kestrel_ap_trampoline_start))

    .code32
ap_protected_mode:
    movw ${sel_data}, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    movl %cr4, %eax
    orl $0x620, %eax
    movl %eax, %cr4
    movl AP_BASE + (kestrel_ap_trampoline_params - kestrel_ap_trampoline_start), %eax
    movl %eax, %cr3
    movl $0xC0000080, %ecx
    rdmsr
    orl $0x900, %eax
    wrmsr
    movl %cr0, %eax
    andl $0xFFFFFFFB, %eax
    orl $0x80010002, %eax
    movl %eax, %cr0
    ljmpl ${sel64}, $(AP_BASE + (ap_long_mode - kestrel_ap_trampoline_start))

    .code64
ap_long_mode:
    movl $(AP_BASE + (kestrel_ap_trampoline_params - kestrel_ap_trampoline_start)), %esi
    lgdt 32(%rsi)
    pushq ${code}
    leaq 2f(%rip), %rax
    pushq %rax
    lretq
2:
    movw ${data}, %ax
    movw %ax, %ds
    movw %ax, %es
    movw %ax, %ss
    xorw %ax, %ax
    movw %ax, %fs
    movw %ax, %gs
    movq 8(%rsi), %rsp
    movq 24(%rsi), %rdi
    movq 16(%rsi), %rax
    xorl %ebp, %ebp
    callq *%rax
3:
    cli
    hlt
    jmp 3b
kestrel_ap_trampoline_end:
    .popsection
    "#,
    base = const TRAMPOLINE_PHYS,
    code32 = const FLAT_CODE32,
    flat_data = const FLAT_DATA,
    code64 = const FLAT_CODE64,
    sel32 = const SegmentSelector::TRAMPOLINE_CODE32.bits() as usize,
    sel_data = const SegmentSelector::TRAMPOLINE_DATA.bits() as usize,
    sel64 = const SegmentSelector::TRAMPOLINE_CODE64.bits() as usize,
    code = const SegmentSelector::KERNEL_CODE.bits() as usize,
    data = const SegmentSelector::KERNEL_DATA.bits() as usize,
    options(att_syntax)
);

unsafe extern "C" {
    static kestrel_ap_trampoline_start: u8;
    static kestrel_ap_trampoline_params: u8;
    static kestrel_ap_trampoline_end: u8;
}

/// Parameter block inside the copied image, read by the AP before it
/// touches its own stack.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrampolineParams {
    pub cr3: u64,
    pub stack_top: u64,
    pub entry: u64,
    pub cpu_index: u64,
    /// Kernel GDTR, in `lgdt` operand layout.
    pub gdt_limit: u16,
    pub gdt_base: u64,
}

const _: () = {
    assert!(size_of::<TrampolineParams>() == 42);
    assert!(offset_of!(TrampolineParams, stack_top) == 8);
    assert!(offset_of!(TrampolineParams, entry) == 16);
    assert!(offset_of!(TrampolineParams, cpu_index) == 24);
    assert!(offset_of!(TrampolineParams, gdt_limit) == 32);
};

/// The assembled image and the offset of its parameter block.
pub fn image() -> (&'static [u8], usize) {
    // SAFETY: the three symbols bound one contiguous block emitted above.
    unsafe {
        let start = &raw const kestrel_ap_trampoline_start;
        let params = &raw const kestrel_ap_trampoline_params;
        let end = &raw const kestrel_ap_trampoline_end;
        let len = end as usize - start as usize;
        (
            core::slice::from_raw_parts(start, len),
            params as usize - start as usize,
        )
    }
}

pub fn check_image(len: usize) -> Result<(), SmpError> {
    if len > TRAMPOLINE_PAGE_SIZE {
        return Err(SmpError::TrampolineTooLarge { size: len });
    }
    Ok(())
}

pub fn check_cr3(cr3: u64) -> Result<(), SmpError> {
    if cr3 >= CR3_LIMIT {
        return Err(SmpError::PageTablesAbove4G { cr3 });
    }
    Ok(())
}

/// A copied trampoline image.
pub struct TrampolinePage {
    base: *mut u8,
    params_offset: usize,
}

impl TrampolinePage {
    /// Copy `image` to `base`.
    ///
    /// # Safety
    ///
    /// `base` must be valid for writes of [`TRAMPOLINE_PAGE_SIZE`] bytes
    /// for the lifetime of the returned value.
    pub unsafe fn copy_to(
        base: *mut u8,
        image: &[u8],
        params_offset: usize,
    ) -> Result<Self, SmpError> {
        check_image(image.len())?;
        if params_offset + size_of::<TrampolineParams>() > image.len() {
            return Err(SmpError::TrampolineTooLarge { size: image.len() });
        }
        // SAFETY: the caller guarantees a writable page; the image fits.
        unsafe { ptr::copy_nonoverlapping(image.as_ptr(), base, image.len()) };
        Ok(Self {
            base,
            params_offset,
        })
    }

    pub fn write_params(&self, params: &TrampolineParams) {
        // SAFETY: offset and size were checked against the image in
        // `copy_to`; the block is packed, so any address is aligned.
        unsafe {
            ptr::write_volatile(
                self.base.add(self.params_offset) as *mut TrampolineParams,
                *params,
            )
        };
    }

    pub fn read_params(&self) -> TrampolineParams {
        // SAFETY: as in `write_params`.
        unsafe { ptr::read_volatile(self.base.add(self.params_offset) as *const TrampolineParams) }
    }
}

/// Identity map the trampoline page and copy the image into it.
pub fn install(paging: &dyn DevicePaging) -> Result<TrampolinePage, SmpError> {
    let (image, params_offset) = image();
    check_image(image.len())?;
    paging
        .identity_map(PhysAddr::new(TRAMPOLINE_PHYS), TRAMPOLINE_PAGE_SIZE)
        .map_err(|err| {
            klog_warn!("MP: Cannot identity map the trampoline: {:?}", err);
            SmpError::NoIdentityWindow
        })?;
    // SAFETY: the page was just identity mapped and low memory below 1 MiB
    // is reserved for firmware and boot use.
    let page = unsafe { TrampolinePage::copy_to(TRAMPOLINE_PHYS as *mut u8, image, params_offset)? };
    klog_debug!(
        "MP: Trampoline at 0x{:x}, {} bytes",
        TRAMPOLINE_PHYS,
        image.len()
    );
    Ok(page)
}

/// Drop the identity window once no AP can still be executing from it.
pub fn remove(_page: TrampolinePage, paging: &dyn DevicePaging) {
    if let Err(err) = paging.unmap(VirtAddr::new(TRAMPOLINE_PHYS), TRAMPOLINE_PAGE_SIZE) {
        klog_warn!("MP: Cannot unmap the trampoline: {:?}", err);
    }
}
