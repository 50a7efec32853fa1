//! Cache maintenance operations
//!
//! The host controller reads and writes descriptors and transfer buffers
//! behind the CPU's back. On a platform with a data cache, memory must be
//! cleaned before the controller reads it, and invalidated before software
//! reads what the controller wrote. Implement [`Cache`] to describe how
//! your platform does that, or use [`NoCache`] if memory is coherent.
//!
//! The Cortex-M7 routines were adapted from the cortex-m (0.7.1) crate.
//! cortex-m only lets you access these functions when you have
//! the SCB in cortex_m::Peripherals collection. But, we neither want
//! to steal the peripheral(s), nor own them. So, we're duplicating
//! the routines that we need, and making sure that we're using
//! them safely.
//!
//! See <https://github.com/rust-embedded/cortex-m/issues/304>.

/// Data cache maintenance hooks
///
/// Each operation covers every cache line touched by `size` bytes starting
/// at `addr`. All operations default to no-ops.
pub trait Cache {
    /// Write dirty lines back to memory.
    fn clean(&self, addr: usize, size: usize) {
        let _ = (addr, size);
    }
    /// Discard cached lines, so the next read comes from memory.
    fn invalidate(&self, addr: usize, size: usize) {
        let _ = (addr, size);
    }
    /// Write back, then discard.
    fn clean_invalidate(&self, addr: usize, size: usize) {
        let _ = (addr, size);
    }
}

/// Cache maintenance for cache-coherent memory.
///
/// Every operation does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCache;

impl Cache for NoCache {}

/// Data cache maintenance for a Cortex-M7.
///
/// Uses the SCB's by-address cache maintenance registers. Place descriptor
/// state and transfer buffers on 32 byte boundaries; operations on partial
/// lines also affect the neighboring data.
#[derive(Clone, Copy, Debug, Default)]
pub struct CortexM7;

/// Cache lines are fixed to 32 bytes on Cortex-M7 and not present in earlier Cortex-M.
const LINESIZE: usize = 32;

impl CortexM7 {
    fn by_address(addr: usize, size: usize, op: impl Fn(&cortex_m::peripheral::cbp::RegisterBlock, u32)) {
        // No-op zero sized operations
        if size == 0 {
            return;
        }

        // Safety: write-only registers, pointer to static memory
        let cbp = unsafe { &*cortex_m::peripheral::CBP::PTR };

        cortex_m::asm::dsb();

        let num_lines = ((size - 1) / LINESIZE) + 1;
        let mut addr = addr & 0xFFFF_FFE0;

        for _ in 0..num_lines {
            op(cbp, addr as u32);
            addr += LINESIZE;
        }

        cortex_m::asm::dsb();
        cortex_m::asm::isb();
    }
}

impl Cache for CortexM7 {
    fn clean(&self, addr: usize, size: usize) {
        // Safety: write to Cortex-M write-only register
        Self::by_address(addr, size, |cbp, addr| unsafe { cbp.dccmvac.write(addr) });
    }
    fn invalidate(&self, addr: usize, size: usize) {
        // Safety: write to Cortex-M write-only register. Caller guarantees
        // that the lines hold nothing that software still needs.
        Self::by_address(addr, size, |cbp, addr| unsafe { cbp.dcimvac.write(addr) });
    }
    fn clean_invalidate(&self, addr: usize, size: usize) {
        // Safety: write to Cortex-M write-only register
        Self::by_address(addr, size, |cbp, addr| unsafe { cbp.dccimvac.write(addr) });
    }
}

/// Clean a descriptor record.
pub(crate) fn clean<C: Cache, T>(cache: &C, record: &T) {
    cache.clean(record as *const T as usize, core::mem::size_of::<T>());
}

/// Invalidate a descriptor record.
pub(crate) fn invalidate<C: Cache, T>(cache: &C, record: &T) {
    cache.invalidate(record as *const T as usize, core::mem::size_of::<T>());
}
