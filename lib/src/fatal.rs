//! Fatal "panic and halt" entry point.
//!
//! Used for programming errors that leave kernel state untrustworthy:
//! unhandled exceptions, double initialization of a singleton controller,
//! out-of-range configuration. The kernel's panic handler halts the CPU.

use core::fmt;

use crate::klog_error;

#[cold]
#[track_caller]
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    klog_error!("FATAL: {}", args);
    panic!("{}", args);
}

#[macro_export]
macro_rules! kfatal {
    ($($arg:tt)*) => {
        $crate::fatal::fatal(::core::format_args!($($arg)*))
    };
}
