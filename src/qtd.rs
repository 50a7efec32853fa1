//! Queue element transfer descriptors (qTD)
//!
//! The module implements a RAL-compatible interface for working
//! with transfer descriptors. A qTD describes one DMA operation of
//! up to five 4 KiB pages. The alternate next pointer isn't used by
//! this driver, so it carries software bookkeeping instead.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{
    cache::{self, Cache},
    link::Link,
    ral,
    vcell::VCell,
};

/// Bytes in one buffer page.
pub const PAGE_SIZE: usize = 4096;

/// Number of buffer page pointers in one qTD.
pub const PAGE_COUNT: usize = 5;

#[repr(C)]
pub struct Qtd {
    pub NEXT: VCell<u32>,
    pub ALTERNATE: VCell<u32>,
    pub TOKEN: VCell<u32>,
    pub BUFFERS: [VCell<u32>; PAGE_COUNT],
}

bitflags::bitflags! {
    /// Status bits in the qTD token.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Status : u32 {
        const PING = 1 << 0;
        const SPLIT = 1 << 1;
        const MISSED_MICRO_FRAME = 1 << 2;
        const TRANSACTION_ERROR = 1 << 3;
        const BABBLE = 1 << 4;
        const DATA_BUFFER_ERROR = 1 << 5;
        const HALTED = 1 << 6;
        const ACTIVE = 1 << 7;
    }
}

impl Status {
    /// Sub-error bits that mean the bus, not the device, failed the transfer.
    pub const TRANSPORT_ERRORS: Status = Status::TRANSACTION_ERROR
        .union(Status::BABBLE)
        .union(Status::DATA_BUFFER_ERROR);
}

/// Token PID code
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
}

impl Pid {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            1 => Pid::In,
            2 => Pid::Setup,
            _ => Pid::Out,
        }
    }
}

impl From<usb_device::UsbDirection> for Pid {
    fn from(direction: usb_device::UsbDirection) -> Self {
        match direction {
            usb_device::UsbDirection::In => Pid::In,
            usb_device::UsbDirection::Out => Pid::Out,
        }
    }
}

/// The most bytes a qTD can describe for a buffer starting at `addr`.
pub fn capacity(addr: u32) -> usize {
    PAGE_COUNT * PAGE_SIZE - (addr as usize & (PAGE_SIZE - 1))
}

impl Qtd {
    pub const fn new() -> Self {
        const ZERO: VCell<u32> = VCell::new(0);
        Qtd {
            NEXT: VCell::new(0),
            ALTERNATE: VCell::new(0),
            TOKEN: VCell::new(0),
            BUFFERS: [ZERO; PAGE_COUNT],
        }
    }

    /// Prepare an active qTD that moves `len` bytes at `addr`.
    ///
    /// `len` must not exceed [`capacity(addr)`](capacity). The qTD is
    /// marked used, terminates its chain, and carries toggle zero, no PID
    /// (OUT), and no interrupt on complete.
    pub fn init(&self, addr: u32, len: u16, error_retries: u8) {
        debug_assert!(len as usize <= capacity(addr));
        self.NEXT.write(Link::TERMINATE.bits());
        ral::write_reg!(crate::qtd, self, ALTERNATE, TERMINATE: 1, USED: 1, EXPECTED_BYTES: len as u32);
        ral::write_reg!(
            crate::qtd,
            self,
            TOKEN,
            STATUS: Status::ACTIVE.bits(),
            CERR: error_retries.min(3) as u32,
            TOTAL_BYTES: len as u32
        );

        self.BUFFERS[0].write(addr);
        let mut page = addr & !(PAGE_SIZE as u32 - 1);
        for buffer in &self.BUFFERS[1..] {
            page = page.wrapping_add(PAGE_SIZE as u32);
            buffer.write(if len == 0 { 0 } else { page });
        }
    }

    /// Set the used flag without otherwise touching the qTD.
    pub fn claim(&self) {
        ral::modify_reg!(crate::qtd, self, ALTERNATE, USED: 1);
    }

    /// Returns `true` if this qTD belongs to a chain.
    pub fn is_used(&self) -> bool {
        ral::read_reg!(crate::qtd, self, ALTERNATE, USED == 1)
    }

    /// Retire the qTD, returning it to the pool.
    pub fn release(&self) {
        ral::modify_reg!(crate::qtd, self, ALTERNATE, USED: 0);
    }

    pub fn set_pid(&self, pid: Pid) {
        ral::modify_reg!(crate::qtd, self, TOKEN, PID: pid as u32);
    }

    pub fn pid(&self) -> Pid {
        Pid::from_bits(ral::read_reg!(crate::qtd, self, TOKEN, PID))
    }

    pub fn set_data_toggle(&self, toggle: bool) {
        ral::modify_reg!(crate::qtd, self, TOKEN, DT: toggle as u32);
    }

    #[cfg(test)]
    pub fn data_toggle(&self) -> bool {
        ral::read_reg!(crate::qtd, self, TOKEN, DT == 1)
    }

    pub fn set_interrupt_on_complete(&self, ioc: bool) {
        ral::modify_reg!(crate::qtd, self, TOKEN, IOC: ioc as u32);
    }

    pub fn interrupt_on_complete(&self) -> bool {
        ral::read_reg!(crate::qtd, self, TOKEN, IOC == 1)
    }

    pub fn set_next(&self, next: Link) {
        self.NEXT.write(next.bits());
    }

    pub fn next(&self) -> Link {
        Link::from_bits(self.NEXT.read())
    }

    pub fn status(&self) -> Status {
        Status::from_bits_truncate(ral::read_reg!(crate::qtd, self, TOKEN, STATUS))
    }

    pub fn set_status(&self, status: Status) {
        ral::modify_reg!(crate::qtd, self, TOKEN, STATUS: status.bits());
    }

    /// Error retries remaining before the controller halts the queue.
    pub fn error_count(&self) -> u8 {
        ral::read_reg!(crate::qtd, self, TOKEN, CERR) as u8
    }

    /// Bytes that the controller hasn't yet moved.
    pub fn remaining_bytes(&self) -> usize {
        ral::read_reg!(crate::qtd, self, TOKEN, TOTAL_BYTES) as usize
    }

    /// Bytes that the qTD was prepared to move.
    pub fn expected_bytes(&self) -> usize {
        ral::read_reg!(crate::qtd, self, ALTERNATE, EXPECTED_BYTES) as usize
    }

    /// Bytes moved by the controller.
    pub fn bytes_transferred(&self) -> usize {
        self.expected_bytes().saturating_sub(self.remaining_bytes())
    }

    /// The start of the qTD's buffer.
    #[cfg(test)]
    pub fn buffer(&self) -> u32 {
        self.BUFFERS[0].read()
    }

    pub fn clean<C: Cache>(&self, cache: &C) {
        cache::clean(cache, self);
    }

    pub fn invalidate<C: Cache>(&self, cache: &C) {
        cache::invalidate(cache, self);
    }
}

pub mod NEXT {
    pub mod TERMINATE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

/// Alternate next pointer, repurposed
///
/// The terminate bit stays set so the controller never follows it.
pub mod ALTERNATE {
    pub mod TERMINATE {
        pub const offset: u32 = 0;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod USED {
        pub const offset: u32 = 5;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod EXPECTED_BYTES {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0xFFFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod TOKEN {
    pub mod STATUS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod PID {
        pub const offset: u32 = 8;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod CERR {
        pub const offset: u32 = 10;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod IOC {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod TOTAL_BYTES {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DT {
        pub const offset: u32 = 31;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Qtd>() == 32) as usize];
