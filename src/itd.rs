//! Isochronous transfer descriptors (iTD and siTD)
//!
//! Layouts only. The driver doesn't schedule isochronous endpoints, and
//! never builds these records. The periodic walkers skip iTD and siTD
//! links by their link type, without reading the record behind them.

#![allow(non_snake_case)]

use crate::vcell::VCell;

/// High-speed isochronous transfer descriptor
#[repr(C, align(32))]
pub struct Itd {
    pub NEXT: VCell<u32>,
    /// One status and control word per micro-frame.
    pub TRANSACTIONS: [VCell<u32>; 8],
    /// Page pointers. The low bits of the first three carry the
    /// endpoint address, the maximum packet size, and the multiplier.
    pub BUFFERS: [VCell<u32>; 7],
}

/// Split-transaction isochronous transfer descriptor
#[repr(C, align(32))]
pub struct Sitd {
    pub NEXT: VCell<u32>,
    pub CHARACTERISTICS: VCell<u32>,
    pub MICRO_FRAME_CONTROL: VCell<u32>,
    pub TRANSFER_STATE: VCell<u32>,
    pub BUFFERS: [VCell<u32>; 2],
    pub BACK: VCell<u32>,
}

impl Itd {
    pub const fn new() -> Self {
        const ZERO: VCell<u32> = VCell::new(0);
        Itd {
            NEXT: VCell::new(1),
            TRANSACTIONS: [ZERO; 8],
            BUFFERS: [ZERO; 7],
        }
    }
}

impl Sitd {
    pub const fn new() -> Self {
        Sitd {
            NEXT: VCell::new(1),
            CHARACTERISTICS: VCell::new(0),
            MICRO_FRAME_CONTROL: VCell::new(0),
            TRANSFER_STATE: VCell::new(0),
            BUFFERS: [VCell::new(0), VCell::new(0)],
            BACK: VCell::new(1),
        }
    }
}

const _: [(); 1] = [(); (core::mem::size_of::<Itd>() == 64) as usize];
// 28 bytes of hardware fields, padded to the 32 byte alignment.
const _: [(); 1] = [(); (core::mem::size_of::<Sitd>() == 32) as usize];
