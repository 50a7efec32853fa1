//! EHCI host controller driver
//!
//! The [`Ehci`] driver owns the controller's registers and the descriptor
//! pools. Endpoint, transfer, and interrupt operations are implemented in
//! their own modules.

use crate::{
    cache::{Cache, NoCache},
    interrupt::Interrupts,
    qh::Speed,
    ral,
    schedule,
    state::{EhciState, Pools, ASYNC_HEAD},
    Peripherals,
};

/// Runtime driver configuration
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    /// Bus errors tolerated before a transfer halts. Clamped to 3.
    pub error_retries: u8,
    /// Maximum interrupt rate, in micro-frames. 0 is immediate.
    pub interrupt_threshold: u8,
    /// NAK counter reload for control and bulk endpoints. Clamped to 15.
    pub nak_reload: u8,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            error_retries: 3,
            interrupt_threshold: 0,
            nak_reload: 0,
        }
    }
}

/// An EHCI host controller driver
///
/// After you allocate an `Ehci` with [`new()`](Ehci::new), call
/// [`initialize()`](Ehci::initialize) once. Then, service the controller's
/// interrupt with [`int_handler()`](Ehci::int_handler).
pub struct Ehci<C = NoCache> {
    pub(crate) cap: ral::Instance<ral::cap::RegisterBlock>,
    pub(crate) ehci: ral::Instance<ral::ehci::RegisterBlock>,
    pub(crate) pools: Pools<'static>,
    pub(crate) cache: C,
    pub(crate) config: Config,
    /// Micro-frames counted by the frame list rollovers.
    pub(crate) uframe_extension: u64,
}

impl<C: Cache> Ehci<C> {
    /// Create a new `Ehci` driver
    ///
    /// Creation does nothing except for assign static memory to the driver.
    /// After creating the driver, call [`initialize()`](Ehci::initialize).
    ///
    /// # Panics
    ///
    /// Panics if the state has already been assigned to another driver.
    pub fn new<
        P: Peripherals,
        const DEVICES: usize,
        const QHS: usize,
        const QTDS: usize,
        const FRAMES: usize,
    >(
        peripherals: P,
        state: &'static EhciState<DEVICES, QHS, QTDS, FRAMES>,
        cache: C,
    ) -> Self {
        let ral::Instances { cap, ehci } = ral::instances(peripherals);
        let pools = state.pools().expect("EHCI state already assigned");
        Ehci {
            cap,
            ehci,
            pools,
            cache,
            config: Config::default(),
            uframe_extension: 0,
        }
    }

    /// Build the schedules, and start the controller.
    ///
    /// Assumes that the platform has already reset the controller and put
    /// it in host mode.
    pub fn initialize(&mut self, config: Config) {
        self.config = config;

        ral::write_reg!(ral::ehci, self.ehci, USBINTR, 0);
        ral::write_reg!(
            ral::ehci,
            self.ehci,
            USBSTS,
            Interrupts::all().difference(Interrupts::PORT_CHANGE).bits()
        );

        schedule::init_async(&self.pools, &self.cache);
        schedule::init_periodic(&self.pools, &self.cache);
        ral::write_reg!(ral::ehci, self.ehci, PERIODICLISTBASE, self.pools.framelist_addr());
        ral::write_reg!(ral::ehci, self.ehci, ASYNCLISTADDR, self.pools.qh_link(ASYNC_HEAD).address());

        ral::write_reg!(ral::ehci, self.ehci, USBINTR, Interrupts::ENABLED.bits());
        ral::write_reg!(ral::ehci, self.ehci, TTCTRL, 0);

        let size_bits = (1024 / self.pools.framelist().len()).ilog2();
        ral::modify_reg!(
            ral::ehci,
            self.ehci,
            USBCMD,
            RS: 1,
            ASE: 1,
            PSE: 1,
            FS_1: size_bits & 0b11,
            FS_2: size_bits >> 2,
            ITC: self.config.interrupt_threshold as u32
        );

        if ral::read_reg!(ral::cap, self.cap, HCSPARAMS, PPC == 1) {
            ral::modify_reg!(ral::ehci, self.ehci, PORTSC, |portsc| {
                (portsc & !ral::ehci::PORTSC_W1C) | ral::ehci::PORTSC::PP::mask
            });
        }

        debug!(
            "INITIALIZED FRAMES={} HCIVERSION={:x}",
            self.pools.framelist().len(),
            ral::read_reg!(ral::cap, self.cap, HCCAPBASE, HCIVERSION)
        );
    }

    /// Start resetting the root port.
    ///
    /// The port stays in reset until [`port_reset_end()`](Ehci::port_reset_end).
    pub fn port_reset(&mut self) {
        ral::modify_reg!(ral::ehci, self.ehci, PORTSC, |portsc| {
            (portsc & !(ral::ehci::PORTSC_W1C | ral::ehci::PORTSC::PE::mask)) | ral::ehci::PORTSC::PR::mask
        });
        debug!("PORT RESET");
    }

    /// Finish a root port reset.
    pub fn port_reset_end(&mut self) {
        ral::modify_reg!(ral::ehci, self.ehci, PORTSC, |portsc| {
            portsc & !(ral::ehci::PORTSC_W1C | ral::ehci::PORTSC::PR::mask)
        });
    }

    /// Returns `true` if a device is connected to the root port.
    pub fn port_connect_status(&self) -> bool {
        ral::read_reg!(ral::ehci, self.ehci, PORTSC, CCS == 1)
    }

    /// Returns the speed of the device on the root port.
    pub fn port_speed_get(&self) -> Speed {
        Speed::from_bits(ral::read_reg!(ral::ehci, self.ehci, PORTSC, PSPD))
    }

    /// Returns the current frame number.
    ///
    /// The count keeps going when the frame list index rolls over, as long
    /// as the rollover interrupt is serviced.
    pub fn frame_number(&self) -> u64 {
        let uframes = (self.pools.framelist().len() as u64) << 3;
        let frindex = ral::read_reg!(ral::ehci, self.ehci, FRINDEX, FRINDEX) as u64 & (uframes - 1);
        (self.uframe_extension + frindex) >> 3
    }

    /// Ask the controller to interrupt once it no longer holds any
    /// async QH that was unlinked before this call.
    pub(crate) fn ring_doorbell(&self) {
        ral::modify_reg!(ral::ehci, self.ehci, USBCMD, IAA: 1);
        trace!("DOORBELL");
    }
}

#[cfg(test)]
pub(crate) mod test {
    extern crate std;

    use super::{Config, Ehci};
    use crate::{
        cache::{Cache, NoCache},
        qh::Speed,
        ral,
        state::{EhciState, QhRef, ASYNC_HEAD},
        Peripherals,
    };
    use std::boxed::Box;

    /// Simulated register memory. The operational registers start at 0x40.
    #[repr(C, align(4096))]
    struct Mmio([u32; 64]);

    pub struct Simulated(*mut u32);

    unsafe impl Peripherals for Simulated {
        fn capability(&self) -> *const () {
            self.0 as *const ()
        }
    }

    /// CAPLENGTH = 0x40, HCIVERSION = 1.00
    const HCCAPBASE: u32 = 0x0100_0040;
    /// One port, with port power control
    const HCSPARAMS: u32 = 0x0000_0011;

    pub fn simulated() -> Simulated {
        let mmio = Box::into_raw(Box::new(Mmio([0; 64])));
        let base = mmio as *mut u32;
        // Safety: freshly allocated, and never freed.
        unsafe {
            base.write_volatile(HCCAPBASE);
            base.add(1).write_volatile(HCSPARAMS);
        }
        Simulated(base)
    }

    pub fn with_cache<C: Cache, const FRAMES: usize>(cache: C) -> Ehci<C> {
        let state: &'static EhciState<5, 16, 32, FRAMES> = Box::leak(Box::new(EhciState::new()));
        let mut ehci = Ehci::new(simulated(), state, cache);
        ehci.initialize(Config::default());
        ehci
    }

    /// An initialized driver with the default state sizes.
    pub fn ehci() -> Ehci {
        with_cache::<NoCache, 8>(NoCache)
    }

    #[test]
    #[should_panic]
    fn state_taken_once() {
        let state: &'static EhciState = Box::leak(Box::new(EhciState::new()));
        let _first = Ehci::new(simulated(), state, NoCache);
        let _second = Ehci::new(simulated(), state, NoCache);
    }

    #[test]
    fn initialize() {
        let ehci = ehci();
        let usbcmd = ral::read_reg!(ral::ehci, ehci.ehci, USBCMD);
        // RS, PSE, ASE, and frame list size 8 (FS_1 = 3, FS_2 = 1)
        assert_eq!(usbcmd, 1 | (3 << 2) | (1 << 4) | (1 << 5) | (1 << 15));
        assert_eq!(
            ral::read_reg!(ral::ehci, ehci.ehci, PERIODICLISTBASE),
            ehci.pools.framelist_addr()
        );
        assert_eq!(
            ral::read_reg!(ral::ehci, ehci.ehci, ASYNCLISTADDR),
            ehci.pools.qh_link(ASYNC_HEAD).address()
        );
        assert_eq!(ral::read_reg!(ral::ehci, ehci.ehci, USBINTR), (1 << 19) | (1 << 18) | 0x2F);
        assert!(ral::read_reg!(ral::ehci, ehci.ehci, PORTSC, PP == 1));
        assert!(ehci.pools.qh(ASYNC_HEAD).is_head());
        assert!(ehci.pools.qh(QhRef::Anchor(0)).horizontal().is_terminate());
    }

    #[test]
    fn frame_list_size_bits() {
        let ehci = with_cache::<NoCache, 1024>(NoCache);
        assert_eq!(ral::read_reg!(ral::ehci, ehci.ehci, USBCMD, FS_1, FS_2), (0, 0));
        let ehci = with_cache::<NoCache, 64>(NoCache);
        assert_eq!(ral::read_reg!(ral::ehci, ehci.ehci, USBCMD, FS_1, FS_2), (0, 1));
    }

    #[test]
    fn interrupt_threshold() {
        let state: &'static EhciState = Box::leak(Box::new(EhciState::new()));
        let mut ehci = Ehci::new(simulated(), state, NoCache);
        ehci.initialize(Config {
            interrupt_threshold: 8,
            ..Config::default()
        });
        assert_eq!(ral::read_reg!(ral::ehci, ehci.ehci, USBCMD, ITC), 8);
    }

    #[test]
    fn port_reset() {
        let mut ehci = ehci();
        // Connected, enabled, with a pending connect change.
        ral::write_reg!(ral::ehci, ehci.ehci, PORTSC, CCS: 1, CSC: 1, PE: 1, PP: 1);
        ehci.port_reset();
        let portsc = ral::read_reg!(ral::ehci, ehci.ehci, PORTSC);
        assert_eq!(portsc, 1 | (1 << 8) | (1 << 12));
        ehci.port_reset_end();
        assert!(ral::read_reg!(ral::ehci, ehci.ehci, PORTSC, PR == 0));
        assert!(ehci.port_connect_status());
    }

    #[test]
    fn port_speed() {
        let ehci = ehci();
        ral::write_reg!(ral::ehci, ehci.ehci, PORTSC, PSPD: 2);
        assert_eq!(ehci.port_speed_get(), Speed::High);
        ral::write_reg!(ral::ehci, ehci.ehci, PORTSC, PSPD: 1);
        assert_eq!(ehci.port_speed_get(), Speed::Low);
        ral::write_reg!(ral::ehci, ehci.ehci, PORTSC, 0);
        assert_eq!(ehci.port_speed_get(), Speed::Full);
        assert!(!ehci.port_connect_status());
    }

    #[test]
    fn frame_number() {
        let mut ehci = ehci();
        ral::write_reg!(ral::ehci, ehci.ehci, FRINDEX, 8 * 5 + 3);
        assert_eq!(ehci.frame_number(), 5);
        // Bits above the frame list index are ignored.
        ral::write_reg!(ral::ehci, ehci.ehci, FRINDEX, (8 * 8) | 8);
        assert_eq!(ehci.frame_number(), 1);
        ehci.uframe_extension = 8 << 3;
        assert_eq!(ehci.frame_number(), 9);
    }
}
