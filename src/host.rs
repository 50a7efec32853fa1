//! Interrupt-safe driver access

use crate::{
    cache::{Cache, NoCache},
    driver::Ehci,
    event::Event,
};
use core::cell::RefCell;
use cortex_m::interrupt::{self, Mutex};

/// Shares an [`Ehci`] driver between task code and the interrupt handler.
///
/// Task code opens endpoints and submits transfers through
/// [`with_ehci()`](HostAdapter::with_ehci). The controller's interrupt
/// handler calls [`on_interrupt()`](HostAdapter::on_interrupt). Both run
/// inside a critical section.
///
/// # Example
///
/// This example skips the clock, PHY, and host mode setup that must
/// happen before the driver initializes.
///
/// ```no_run
/// use ehci_hcd::{Config, Ehci, EhciState, HostAdapter, NoCache, Peripherals};
///
/// struct Usb1;
///
/// unsafe impl Peripherals for Usb1 {
///     fn capability(&self) -> *const () {
///         0x402E_0100 as *const ()
///     }
/// }
///
/// static EHCI_STATE: EhciState = EhciState::new();
///
/// let mut ehci = Ehci::new(Usb1, &EHCI_STATE, NoCache);
/// ehci.initialize(Config::default());
/// let host = HostAdapter::new(ehci);
///
/// // In the USB interrupt handler:
/// host.on_interrupt(|event| {
///     // Forward the event to the host stack...
///     let _ = event;
/// });
///
/// // In task code:
/// let connected = host.with_ehci(|ehci| ehci.port_connect_status());
/// ```
pub struct HostAdapter<C = NoCache> {
    ehci: Mutex<RefCell<Ehci<C>>>,
}

impl<C: Cache> HostAdapter<C> {
    /// Wrap an initialized driver.
    pub fn new(ehci: Ehci<C>) -> Self {
        HostAdapter {
            ehci: Mutex::new(RefCell::new(ehci)),
        }
    }

    /// Interrupt-safe, mutable access to the driver
    pub fn with_ehci<R>(&self, func: impl FnOnce(&mut Ehci<C>) -> R) -> R {
        interrupt::free(|cs| {
            let ehci = self.ehci.borrow(cs);
            let mut ehci = ehci.borrow_mut();
            func(&mut *ehci)
        })
    }

    /// Service the controller's interrupt.
    ///
    /// See [`Ehci::int_handler`].
    pub fn on_interrupt(&self, on_event: impl FnMut(Event)) {
        self.with_ehci(|ehci| ehci.int_handler(on_event));
    }
}
