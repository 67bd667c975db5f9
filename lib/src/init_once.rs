//! One-shot initialization guard for singleton controllers.
//!
//! Unlike a lazy cell, [`InitOnce`] treats a second initialization attempt as
//! a caller bug: the first caller claims the slot, every later caller gets
//! [`AlreadyInitialized`] (or [`InitError::AlreadyInitialized`]) back, even if
//! the first attempt failed. Re-running a controller init would remap the same
//! MMIO window a second time.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::sync::atomic::{AtomicU8, Ordering};

const STATE_UNCLAIMED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_READY: u8 = 2;
const STATE_FAILED: u8 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlreadyInitialized;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitError<E> {
    AlreadyInitialized,
    Failed(E),
}

pub struct InitOnce<T> {
    state: AtomicU8,
    data: UnsafeCell<MaybeUninit<T>>,
}

// SAFETY: the value is written once by the claiming caller before the
// Release store of STATE_READY, and only shared references are handed out
// afterwards.
unsafe impl<T: Send + Sync> Send for InitOnce<T> {}
unsafe impl<T: Send + Sync> Sync for InitOnce<T> {}

impl<T> InitOnce<T> {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_UNCLAIMED),
            data: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn claim(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_UNCLAIMED,
                STATE_RUNNING,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn publish(&self, value: T) -> &T {
        // SAFETY: STATE_RUNNING makes us the only writer.
        let stored = unsafe { (*self.data.get()).write(value) };
        self.state.store(STATE_READY, Ordering::Release);
        stored
    }

    pub fn init(&self, f: impl FnOnce() -> T) -> Result<&T, AlreadyInitialized> {
        if !self.claim() {
            return Err(AlreadyInitialized);
        }
        Ok(self.publish(f()))
    }

    /// Run a fallible initializer. A failed attempt still consumes the slot.
    pub fn try_init<E>(&self, f: impl FnOnce() -> Result<T, E>) -> Result<&T, InitError<E>> {
        if !self.claim() {
            return Err(InitError::AlreadyInitialized);
        }
        match f() {
            Ok(value) => Ok(self.publish(value)),
            Err(err) => {
                self.state.store(STATE_FAILED, Ordering::Release);
                Err(InitError::Failed(err))
            }
        }
    }

    #[inline]
    pub fn get(&self) -> Option<&T> {
        if self.state.load(Ordering::Acquire) == STATE_READY {
            // SAFETY: STATE_READY is only stored after the value is written.
            Some(unsafe { (*self.data.get()).assume_init_ref() })
        } else {
            None
        }
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_READY
    }

    /// True once any initialization attempt has started.
    #[inline]
    pub fn is_claimed(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_UNCLAIMED
    }
}

impl<T> Default for InitOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for InitOnce<T> {
    fn drop(&mut self) {
        if *self.state.get_mut() == STATE_READY {
            // SAFETY: READY means the value was written and never moved out.
            unsafe { self.data.get_mut().assume_init_drop() };
        }
    }
}
