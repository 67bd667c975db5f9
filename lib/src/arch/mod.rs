pub mod exception;
pub mod gdt;
pub mod idt;
