//! Events reported by the interrupt handler

use crate::endpoint::Pipe;

/// How a transfer ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferResult {
    /// Every byte moved, or the device ended the transfer with a short packet.
    Success,
    /// The device halted the endpoint. Clear the stall before trying again.
    Stalled,
    /// The bus failed the transfer: timeouts, CRC errors, babble, or
    /// buffer over / underruns.
    Failed,
}

/// Something happened on the bus.
///
/// Every transfer submitted to an open pipe ends with exactly one
/// [`XferComplete`](Event::XferComplete), unless the pipe is closed first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    /// A device connected to the root port. The port has been reset.
    DeviceAttach,
    /// The device on the root port disconnected.
    DeviceRemove,
    /// A transfer finished.
    XferComplete {
        pipe: Pipe,
        /// Bytes moved in the data stage.
        bytes: usize,
        result: XferResult,
    },
}
