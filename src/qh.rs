//! Queue heads (QH)
//!
//! A queue head is one endpoint's presence in a schedule. The first 48
//! bytes belong to the controller. The controller never reads past them,
//! so the remaining 16 bytes of the 64 byte record hold the driver's
//! bookkeeping for the endpoint.

#![allow(non_snake_case, non_upper_case_globals)]

use crate::{
    cache::{self, Cache},
    interrupt::AsyncAdvanced,
    link::Link,
    qtd::{Pid, Qtd, Status},
    ral,
    vcell::VCell,
};

/// Endpoint speed, as encoded in the QH and in PORTSC.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Speed {
    Full = 0,
    Low = 1,
    High = 2,
}

impl Speed {
    pub(crate) fn from_bits(bits: u32) -> Self {
        match bits & 0b11 {
            1 => Speed::Low,
            2 => Speed::High,
            _ => Speed::Full,
        }
    }
}

/// Where a QH is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum QhState {
    /// In the pool, available.
    Free = 0,
    /// Linked into a schedule.
    Active = 1,
    /// Unlinked from the async schedule. The controller might still
    /// hold a reference until the next async advance.
    PendingRemoval = 2,
}

/// Marks an empty qTD chain.
pub const NO_QTD: u8 = u8::MAX;

#[repr(C, align(32))]
pub struct Qh {
    pub HORIZONTAL: VCell<u32>,
    pub CHARACTERISTICS: VCell<u32>,
    pub CAPABILITIES: VCell<u32>,
    pub CURRENT: VCell<u32>,
    overlay: Qtd,
    // Software only from here.
    state: VCell<u8>,
    pid: VCell<u8>,
    class: VCell<u8>,
    interval_ms: VCell<u8>,
    qtd_head: VCell<u8>,
    qtd_tail: VCell<u8>,
    _reserved: u16,
    xferred: VCell<u32>,
    buffer: VCell<u32>,
}

/// Everything that describes an endpoint to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Characteristics {
    pub device_address: u8,
    pub endpoint: u8,
    pub speed: Speed,
    /// `wMaxPacketSize`. Bits 12:11 count the extra transactions of a
    /// high-bandwidth endpoint.
    pub max_packet_len: u16,
    pub control: bool,
    pub nak_reload: u8,
    pub smask: u8,
    pub cmask: u8,
    pub hub_address: u8,
    pub hub_port: u8,
}

impl Qh {
    /// Create a new QH, setting all bits to zero
    pub const fn new() -> Self {
        Qh {
            HORIZONTAL: VCell::new(0),
            CHARACTERISTICS: VCell::new(0),
            CAPABILITIES: VCell::new(0),
            CURRENT: VCell::new(0),
            overlay: Qtd::new(),
            state: VCell::new(QhState::Free as u8),
            pid: VCell::new(0),
            class: VCell::new(0),
            interval_ms: VCell::new(0),
            qtd_head: VCell::new(NO_QTD),
            qtd_tail: VCell::new(NO_QTD),
            _reserved: 0,
            xferred: VCell::new(0),
            buffer: VCell::new(0),
        }
    }

    /// Describe the endpoint, and reset the overlay and bookkeeping.
    ///
    /// The horizontal link is untouched, so this is safe to call on a
    /// QH that's already linked, as long as it isn't executing.
    pub fn configure(&self, chars: &Characteristics) {
        ral::write_reg!(
            crate::qh,
            self,
            CHARACTERISTICS,
            DEVICE_ADDRESS: chars.device_address as u32,
            ENDPOINT: chars.endpoint as u32,
            EPS: chars.speed as u32,
            DTC: chars.control as u32,
            HEAD: 0,
            MAXIMUM_PACKET_LENGTH: (chars.max_packet_len & 0x7FF) as u32,
            CONTROL_ENDPOINT: (chars.control && chars.speed != Speed::High) as u32,
            NAK_RELOAD: chars.nak_reload as u32
        );
        ral::write_reg!(
            crate::qh,
            self,
            CAPABILITIES,
            SMASK: chars.smask as u32,
            CMASK: chars.cmask as u32,
            HUB_ADDRESS: chars.hub_address as u32,
            PORT_NUMBER: chars.hub_port as u32,
            MULT: ((chars.max_packet_len >> 11) & 0b11) as u32 + 1
        );
        self.CURRENT.write(0);
        self.reset_overlay();
        self.class.write(0);
        self.interval_ms.write(0);
        self.clear_chain();
    }

    /// Detach the overlay from any qTDs, and clear its token.
    pub fn reset_overlay(&self) {
        self.overlay.NEXT.write(Link::TERMINATE.bits());
        self.overlay.ALTERNATE.write(Link::TERMINATE.bits());
        self.overlay.TOKEN.write(0);
        for buffer in &self.overlay.BUFFERS {
            buffer.write(0);
        }
    }

    /// Returns the live execution state of the endpoint.
    pub fn overlay(&self) -> &Qtd {
        &self.overlay
    }

    pub fn set_horizontal(&self, link: Link) {
        self.HORIZONTAL.write(link.bits());
    }

    pub fn horizontal(&self) -> Link {
        Link::from_bits(self.HORIZONTAL.read())
    }

    /// Mark this QH as the head of the reclamation list.
    pub fn set_head(&self, head: bool) {
        ral::modify_reg!(crate::qh, self, CHARACTERISTICS, HEAD: head as u32);
    }

    #[cfg(test)]
    pub fn is_head(&self) -> bool {
        ral::read_reg!(crate::qh, self, CHARACTERISTICS, HEAD == 1)
    }

    pub fn device_address(&self) -> u8 {
        ral::read_reg!(crate::qh, self, CHARACTERISTICS, DEVICE_ADDRESS) as u8
    }

    pub fn endpoint(&self) -> u8 {
        ral::read_reg!(crate::qh, self, CHARACTERISTICS, ENDPOINT) as u8
    }

    #[cfg(test)]
    pub fn speed(&self) -> Speed {
        Speed::from_bits(ral::read_reg!(crate::qh, self, CHARACTERISTICS, EPS))
    }

    pub fn max_packet_len(&self) -> usize {
        ral::read_reg!(crate::qh, self, CHARACTERISTICS, MAXIMUM_PACKET_LENGTH) as usize
    }

    pub fn is_control(&self) -> bool {
        ral::read_reg!(crate::qh, self, CHARACTERISTICS, DTC == 1)
    }

    pub fn smask(&self) -> u8 {
        ral::read_reg!(crate::qh, self, CAPABILITIES, SMASK) as u8
    }

    #[cfg(test)]
    pub fn cmask(&self) -> u8 {
        ral::read_reg!(crate::qh, self, CAPABILITIES, CMASK) as u8
    }

    /// Periodic QHs always have a non-zero start mask.
    pub fn is_periodic(&self) -> bool {
        self.smask() != 0
    }

    pub fn is_halted(&self) -> bool {
        self.overlay.status().contains(Status::HALTED)
    }

    /// Halt (true) or resume (false) the endpoint.
    pub fn set_halted(&self, halted: bool) {
        let mut status = self.overlay.status();
        status.set(Status::HALTED, halted);
        if halted {
            status.remove(Status::ACTIVE);
        }
        self.overlay.set_status(status);
    }

    /// Set the ping state, so that a high-speed OUT starts with a PING.
    pub fn set_ping(&self, ping: bool) {
        let mut status = self.overlay.status();
        status.set(Status::PING, ping);
        self.overlay.set_status(status);
    }

    pub fn state(&self) -> QhState {
        match self.state.read() {
            1 => QhState::Active,
            2 => QhState::PendingRemoval,
            _ => QhState::Free,
        }
    }

    /// Take the QH out of the free pool.
    pub fn activate(&self) {
        debug_assert_eq!(self.state(), QhState::Free);
        self.state.write(QhState::Active as u8);
    }

    /// The QH was unlinked from the async schedule.
    pub fn begin_removal(&self) {
        self.state.write(QhState::PendingRemoval as u8);
    }

    /// Return an unlinked periodic QH to the pool.
    ///
    /// The controller only visits the QH once per period, so unlinking
    /// is enough.
    pub fn release_periodic(&self) {
        debug_assert_ne!(self.state(), QhState::PendingRemoval);
        self.state.write(QhState::Free as u8);
    }

    /// Return a QH to the pool once the controller has advanced past it.
    ///
    /// Returns `true` if the QH was waiting for removal.
    pub fn reclaim(&self, _: &AsyncAdvanced) -> bool {
        let pending = self.state() == QhState::PendingRemoval;
        if pending {
            self.state.write(QhState::Free as u8);
        }
        pending
    }

    /// The direction of the last transfer submitted to this QH.
    pub fn pid(&self) -> Pid {
        Pid::from_bits(self.pid.read() as u32)
    }

    pub fn set_pid(&self, pid: Pid) {
        self.pid.write(pid as u8);
    }

    pub fn class(&self) -> u8 {
        self.class.read()
    }

    pub fn set_class(&self, class: u8) {
        self.class.write(class);
    }

    pub fn interval_ms(&self) -> u8 {
        self.interval_ms.read()
    }

    pub fn set_interval_ms(&self, interval_ms: u8) {
        self.interval_ms.write(interval_ms);
    }

    /// Indices of the first and last qTD in the pending chain.
    pub fn chain(&self) -> Option<(u8, u8)> {
        let head = self.qtd_head.read();
        (head != NO_QTD).then(|| (head, self.qtd_tail.read()))
    }

    pub fn set_chain(&self, head: u8, tail: u8) {
        self.qtd_head.write(head);
        self.qtd_tail.write(tail);
    }

    /// Drop the first qTD from the chain, making `next` the new head.
    pub fn pop_chain(&self, next: Option<u8>) {
        match next {
            Some(next) => self.qtd_head.write(next),
            None => self.clear_chain(),
        }
    }

    pub fn clear_chain(&self) {
        self.qtd_head.write(NO_QTD);
        self.qtd_tail.write(NO_QTD);
        self.xferred.write(0);
        self.buffer.write(0);
    }

    /// Bytes moved by retired qTDs of the pending transfer.
    pub fn xferred(&self) -> usize {
        self.xferred.read() as usize
    }

    pub fn add_xferred(&self, bytes: usize) {
        self.xferred.modify(|xferred| xferred.wrapping_add(bytes as u32));
    }

    /// The buffer attached to the pending transfer.
    pub fn buffer(&self) -> u32 {
        self.buffer.read()
    }

    pub fn set_buffer(&self, buffer: u32) {
        self.buffer.write(buffer);
    }

    pub fn clean<C: Cache>(&self, cache: &C) {
        cache::clean(cache, self);
    }

    pub fn invalidate<C: Cache>(&self, cache: &C) {
        cache::invalidate(cache, self);
    }

    /// Clean and invalidate this QH from DCache
    pub fn clean_invalidate<C: Cache>(&self, cache: &C) {
        cache.clean_invalidate(self as *const _ as usize, core::mem::size_of::<Self>());
    }
}

pub mod CHARACTERISTICS {
    pub mod DEVICE_ADDRESS {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0x7F << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod ENDPOINT {
        pub const offset: u32 = 8;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod EPS {
        pub const offset: u32 = 12;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod DTC {
        pub const offset: u32 = 14;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod HEAD {
        pub const offset: u32 = 15;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod MAXIMUM_PACKET_LENGTH {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7FF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod CONTROL_ENDPOINT {
        pub const offset: u32 = 27;
        pub const mask: u32 = 1 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod NAK_RELOAD {
        pub const offset: u32 = 28;
        pub const mask: u32 = 0xF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

pub mod CAPABILITIES {
    pub mod SMASK {
        pub const offset: u32 = 0;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod CMASK {
        pub const offset: u32 = 8;
        pub const mask: u32 = 0xFF << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod HUB_ADDRESS {
        pub const offset: u32 = 16;
        pub const mask: u32 = 0x7F << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod PORT_NUMBER {
        pub const offset: u32 = 23;
        pub const mask: u32 = 0x7F << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
    pub mod MULT {
        pub const offset: u32 = 30;
        pub const mask: u32 = 0b11 << offset;
        pub mod RW {}
        pub mod R {}
        pub mod W {}
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Qh>() == 64) as usize];
