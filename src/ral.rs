//! EHCI register access layer
//!
//! Register blocks and field definitions for the EHCI capability and
//! operational registers, compatible with the `ral-registers` macros.
//! The NXP extensions (FS2, the async and periodic completion interrupts,
//! and PSPD) are included, since the field offsets don't collide with
//! standard EHCI.

pub use ral_registers::{modify_reg, read_reg, write_reg, RORegister, RWRegister};

#[allow(non_snake_case, non_upper_case_globals)]
pub mod cap {
    use super::RORegister;

    #[repr(C)]
    pub struct RegisterBlock {
        /// CAPLENGTH and HCIVERSION
        pub HCCAPBASE: RORegister<u32>,
        pub HCSPARAMS: RORegister<u32>,
        pub HCCPARAMS: RORegister<u32>,
    }

    pub mod HCCAPBASE {
        pub mod CAPLENGTH {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod HCIVERSION {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFFFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod HCSPARAMS {
        pub mod N_PORTS {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0xF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Port power control
        pub mod PPC {
            pub const offset: u32 = 4;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod HCCPARAMS {
        /// Programmable frame list
        pub mod PFL {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Asynchronous schedule park capability
        pub mod ASP {
            pub const offset: u32 = 2;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }
}

#[allow(non_snake_case, non_upper_case_globals)]
pub mod ehci {
    use super::RWRegister;

    #[repr(C)]
    pub struct RegisterBlock {
        pub USBCMD: RWRegister<u32>,
        pub USBSTS: RWRegister<u32>,
        pub USBINTR: RWRegister<u32>,
        pub FRINDEX: RWRegister<u32>,
        pub CTRLDSSEGMENT: RWRegister<u32>,
        pub PERIODICLISTBASE: RWRegister<u32>,
        pub ASYNCLISTADDR: RWRegister<u32>,
        pub TTCTRL: RWRegister<u32>,
        _reserved0: [u32; 8],
        pub CONFIGFLAG: RWRegister<u32>,
        pub PORTSC: RWRegister<u32>,
    }

    const _: [(); 1] = [(); (core::mem::size_of::<RegisterBlock>() == 0x48) as usize];

    pub mod USBCMD {
        /// Run / stop
        pub mod RS {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod HCRESET {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Frame list size, low bits
        pub mod FS_1 {
            pub const offset: u32 = 2;
            pub const mask: u32 = 0b11 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Periodic schedule enable
        pub mod PSE {
            pub const offset: u32 = 4;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Asynchronous schedule enable
        pub mod ASE {
            pub const offset: u32 = 5;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Interrupt on async advance doorbell
        pub mod IAA {
            pub const offset: u32 = 6;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Frame list size, high bit
        pub mod FS_2 {
            pub const offset: u32 = 15;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Interrupt threshold control, in micro-frames
        pub mod ITC {
            pub const offset: u32 = 16;
            pub const mask: u32 = 0xFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod USBSTS {
        /// Host controller halted. Read only.
        pub mod HCH {
            pub const offset: u32 = 12;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        pub mod ASS {
            pub const offset: u32 = 15;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod FRINDEX {
        pub mod FRINDEX {
            pub const offset: u32 = 0;
            pub const mask: u32 = 0x3FFF << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    pub mod PORTSC {
        /// Current connect status
        pub mod CCS {
            pub const offset: u32 = 0;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Connect status change
        pub mod CSC {
            pub const offset: u32 = 1;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Port enabled
        pub mod PE {
            pub const offset: u32 = 2;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Port enable change
        pub mod PEC {
            pub const offset: u32 = 3;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Over-current change
        pub mod OCC {
            pub const offset: u32 = 5;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Port reset
        pub mod PR {
            pub const offset: u32 = 8;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Port power
        pub mod PP {
            pub const offset: u32 = 12;
            pub const mask: u32 = 1 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
        /// Port speed
        pub mod PSPD {
            pub const offset: u32 = 26;
            pub const mask: u32 = 0b11 << offset;
            pub mod RW {}
            pub mod R {}
            pub mod W {}
        }
    }

    /// PORTSC bits that clear when written with one.
    pub const PORTSC_W1C: u32 = PORTSC::CSC::mask | PORTSC::PEC::mask | PORTSC::OCC::mask;
}

/// Owned handle to an EHCI register block
pub struct Instance<RB> {
    ptr: *const RB,
}

impl<RB> Instance<RB> {
    /// # Safety
    ///
    /// `ptr` points to a register block that lives forever, and
    /// this is the only instance that owns it.
    pub const unsafe fn new(ptr: *const RB) -> Self {
        Instance { ptr }
    }
}

impl<RB> core::ops::Deref for Instance<RB> {
    type Target = RB;
    fn deref(&self) -> &RB {
        // Safety: pointer validity promised by the constructor.
        unsafe { &*self.ptr }
    }
}

unsafe impl<RB> Send for Instance<RB> {}

pub struct Instances {
    pub cap: Instance<cap::RegisterBlock>,
    pub ehci: Instance<ehci::RegisterBlock>,
}

/// Take the register blocks from the user's peripherals.
///
/// The operational registers start CAPLENGTH bytes after the capability
/// registers.
pub fn instances<P: crate::Peripherals>(peripherals: P) -> Instances {
    let base = peripherals.capability();
    // Safety: the implementer of Peripherals promises the pointer's validity.
    let caps: Instance<cap::RegisterBlock> = unsafe { Instance::new(base.cast()) };
    let caplength = read_reg!(crate::ral::cap, caps, HCCAPBASE, CAPLENGTH) as usize;
    // Safety: see above. The operational block follows the capabilities.
    let ehci = unsafe { Instance::new(base.cast::<u8>().add(caplength).cast()) };
    Instances { cap: caps, ehci }
}
