//! An EHCI USB host controller driver
//!
//! `ehci-hcd` turns USB transfer requests into the queue heads and transfer
//! descriptors that an EHCI host controller executes, and turns the
//! controller's interrupts back into transfer completion events. It's the
//! transport layer of a USB host stack. Enumeration and class drivers are
//! left to the stack that sits on top.
//!
//! The driver supports control, bulk, and interrupt endpoints on the
//! controller's root port, including full and low speed devices behind a
//! high speed hub. It assumes the NXP flavor of EHCI found on i.MX RT
//! processors, which integrates a transaction translator and reports async
//! and periodic completions separately.
//!
//! To interface the library, you must define a safe implementation of
//! [`Peripherals`], and allocate an [`EhciState`]. If your system has a
//! data cache, also select or implement a [`Cache`].

#![no_std]

#[macro_use]
mod log;

mod cache;
mod driver;
mod endpoint;
mod event;
mod host;
mod interrupt;
mod itd;
mod link;
mod qh;
mod qtd;
mod ral;
mod schedule;
mod state;
mod transfer;
mod vcell;

pub use cache::{Cache, CortexM7, NoCache};
pub use driver::{Config, Ehci};
pub use endpoint::{Device, EndpointDescriptor, Pipe};
pub use event::{Event, XferResult};
pub use host::HostAdapter;
pub use itd::{Itd, Sitd};
pub use qh::Speed;
pub use state::EhciState;

/// A type that owns the EHCI register blocks
///
/// An implementation of `Peripherals` is expected to own the capability and
/// operational registers of one EHCI host controller. The operational
/// registers are found through the capability registers.
///
/// # Safety
///
/// `Peripherals` should only be implemented on a type that owns the
/// host controller's registers. The pointer returned by `capability` is
/// assumed to be valid, and will be cast to a register definition.
///
/// # Example
///
/// A safe implementation of `Peripherals` that works with the
/// `imxrt-ral` register access layer. Assume that `ral` is
/// shorthand for `imxrt_ral`, like
///
/// ```ignore
/// use imxrt_ral as ral;
/// ```
///
/// ```
/// # mod ral {
/// #   use core::ops::Deref; pub struct Instance; impl Deref for Instance { type Target = u32; fn deref(&self) -> &u32 { unsafe { &*(0x402e0000 as *const u32)} } }
/// #   pub fn take() -> Result<Instance, ()> { Ok(Instance) }
/// #   pub mod usb { pub use super::Instance; pub mod USB2 { pub use super::super::take; } }
/// # }
/// use ral::usb;
/// use ehci_hcd::Peripherals;
///
/// struct Host {
///     usb: usb::Instance,
/// }
///
/// impl Host {
///     /// Panics if the instance is already taken
///     pub fn usb2() -> Host {
///         Self {
///             usb: usb::USB2::take().unwrap(),
///         }
///     }
/// }
///
/// unsafe impl Peripherals for Host {
///     fn capability(&self) -> *const () {
///         // The capability registers start 0x100 bytes into the USB block.
///         (&*self.usb as *const u32 as usize + 0x100) as *const ()
///     }
/// }
///
/// let host = Host::usb2();
/// assert_eq!(host.capability(), 0x402e0100 as *const ());
/// ```
pub unsafe trait Peripherals {
    /// Returns the address of the EHCI capability registers
    /// for this host controller
    fn capability(&self) -> *const ();
}
