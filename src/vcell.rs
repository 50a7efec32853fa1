//! Volatile cell that conforms to the RAL's register API
//!
//! Descriptor words are shared with the host controller, so every
//! access is volatile.

use core::cell::UnsafeCell;

#[repr(transparent)]
pub struct VCell<T>(UnsafeCell<T>);

impl<T> VCell<T> {
    pub const fn new(val: T) -> Self {
        VCell(UnsafeCell::new(val))
    }
}

impl<T: Copy> VCell<T> {
    pub fn read(&self) -> T {
        unsafe { self.0.get().read_volatile() }
    }
    pub fn write(&self, val: T) {
        unsafe { self.0.get().write_volatile(val) }
    }
    pub fn modify(&self, f: impl FnOnce(T) -> T) {
        self.write(f(self.read()))
    }
}
