//! Static descriptor storage
//!
//! Every record that the host controller touches lives in an
//! [`EhciState`]. The driver borrows the state for the rest of the
//! program, and hands out records by pool index.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    link::{self, Link, LinkType},
    qh::{Qh, QhState},
    qtd::Qtd,
    vcell::VCell,
};

/// Number of periodic interval classes: 1, 2, 4, and 8 ms.
pub const ANCHOR_COUNT: usize = 4;

/// The periodic frame list
///
/// The controller requires a 4 KiB aligned base address.
#[repr(C, align(4096))]
struct FrameList<const FRAMES: usize>([VCell<u32>; FRAMES]);

impl<const FRAMES: usize> FrameList<FRAMES> {
    const fn new() -> Self {
        const TERMINATE: VCell<u32> = VCell::new(Link::TERMINATE.bits());
        Self([TERMINATE; FRAMES])
    }
}

/// A list of transfer descriptors
///
/// Each qTD needs 32 byte alignment. The records are 32 bytes, so aligning
/// the list aligns all of them.
#[repr(C, align(32))]
struct QtdList<const COUNT: usize>([Qtd; COUNT]);

impl<const COUNT: usize> QtdList<COUNT> {
    const fn new() -> Self {
        const QTD: Qtd = Qtd::new();
        Self([QTD; COUNT])
    }
}

/// A list of queue heads
#[repr(C, align(32))]
struct QhList<const COUNT: usize>([Qh; COUNT]);

impl<const COUNT: usize> QhList<COUNT> {
    const fn new() -> Self {
        const QH: Qh = Qh::new();
        Self([QH; COUNT])
    }
}

/// Storage for SETUP packets, one per device address.
#[repr(C, align(32))]
struct SetupList<const COUNT: usize>([VCell<[u8; 8]>; COUNT]);

impl<const COUNT: usize> SetupList<COUNT> {
    const fn new() -> Self {
        const SETUP: VCell<[u8; 8]> = VCell::new([0; 8]);
        Self([SETUP; COUNT])
    }
}

/// Driver state shared with the host controller.
///
/// Each EHCI driver needs an `EhciState`. Allocate a `static` object
/// and supply it to the driver constructor. Make sure that states are not
/// shared across host controllers; otherwise, the driver constructor panics.
///
/// ```
/// use ehci_hcd::EhciState;
///
/// static EHCI_STATE: EhciState = EhciState::new();
/// ```
///
/// The const generics size the state:
///
/// - `DEVICES` is the number of device addresses, including the
///   address 0 used during enumeration. Each address has one control QH.
/// - `QHS` is the number of non-control endpoints that can be open at once.
/// - `QTDS` is the number of transfer descriptors shared by all endpoints.
///   A transfer uses one qTD for every 20 KiB (less when the buffer isn't
///   page aligned), and a control transfer uses at least two more.
/// - `FRAMES` is the length of the periodic frame list: a power of two
///   between 8 and 1024.
///
/// ```
/// use ehci_hcd::EhciState;
///
/// static EHCI_STATE: EhciState<8, 32, 64, 256> = EhciState::new();
/// ```
///
/// Place the state in memory that the controller can reach.
#[repr(C)]
pub struct EhciState<
    const DEVICES: usize = 5,
    const QHS: usize = 16,
    const QTDS: usize = 32,
    const FRAMES: usize = 8,
> {
    framelist: FrameList<FRAMES>,
    anchors: QhList<ANCHOR_COUNT>,
    control: QhList<DEVICES>,
    qhs: QhList<QHS>,
    qtds: QtdList<QTDS>,
    setup: SetupList<DEVICES>,
    taken: AtomicBool,
}

unsafe impl<const DEVICES: usize, const QHS: usize, const QTDS: usize, const FRAMES: usize> Sync
    for EhciState<DEVICES, QHS, QTDS, FRAMES>
{
}

impl<const DEVICES: usize, const QHS: usize, const QTDS: usize, const FRAMES: usize>
    EhciState<DEVICES, QHS, QTDS, FRAMES>
{
    /// Allocate driver state.
    ///
    /// # Panics
    ///
    /// Panics (at compile time, for a `static`) if a size is out of range.
    pub const fn new() -> Self {
        assert!(
            FRAMES.is_power_of_two() && FRAMES >= 8 && FRAMES <= 1024,
            "FRAMES must be a power of two in 8..=1024"
        );
        assert!(DEVICES >= 1 && DEVICES <= 128, "DEVICES must be in 1..=128");
        // Chain and handle indices are stored in a byte, and u8::MAX means 'none.'
        assert!(QHS < u8::MAX as usize, "QHS must be less than 255");
        assert!(QTDS < u8::MAX as usize, "QTDS must be less than 255");
        Self {
            framelist: FrameList::new(),
            anchors: QhList::new(),
            control: QhList::new(),
            qhs: QhList::new(),
            qtds: QtdList::new(),
            setup: SetupList::new(),
            taken: AtomicBool::new(false),
        }
    }

    /// Acquire the descriptor pools.
    ///
    /// Returns `None` if the pools were already taken.
    pub(crate) fn pools(&self) -> Option<Pools<'_>> {
        let taken = self.taken.swap(true, Ordering::SeqCst);
        (!taken).then(|| Pools {
            framelist: &self.framelist.0,
            anchors: &self.anchors.0,
            control: &self.control.0,
            qhs: &self.qhs.0,
            qtds: &self.qtds.0,
            setup: &self.setup.0,
        })
    }
}

/// Identifies a queue head within the pools.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum QhRef {
    /// A periodic interval class anchor
    Anchor(u8),
    /// The control QH for a device address
    Control(u8),
    /// A QH from the endpoint pool
    Pool(u8),
}

/// The async schedule head is the control QH of the device that's
/// being enumerated.
pub(crate) const ASYNC_HEAD: QhRef = QhRef::Control(0);

/// Borrowed view of an [`EhciState`], with the sizes erased.
#[derive(Clone, Copy)]
pub(crate) struct Pools<'a> {
    framelist: &'a [VCell<u32>],
    anchors: &'a [Qh],
    control: &'a [Qh],
    qhs: &'a [Qh],
    qtds: &'a [Qtd],
    setup: &'a [VCell<[u8; 8]>],
}

unsafe impl Send for Pools<'_> {}

/// Returns the index of the record at `addr`, if it's in `slice`.
fn index_of<T>(slice: &[T], addr: u32) -> Option<usize> {
    let size = core::mem::size_of::<T>();
    let offset = addr.wrapping_sub(slice.as_ptr() as usize as u32) as usize;
    (offset < slice.len() * size && offset % size == 0).then(|| offset / size)
}

impl<'a> Pools<'a> {
    pub fn framelist(&self) -> &'a [VCell<u32>] {
        self.framelist
    }

    pub fn framelist_addr(&self) -> u32 {
        self.framelist.as_ptr() as usize as u32
    }

    pub fn devices(&self) -> usize {
        self.control.len()
    }

    pub fn qh(&self, qh: QhRef) -> &'a Qh {
        match qh {
            QhRef::Anchor(idx) => &self.anchors[idx as usize],
            QhRef::Control(idx) => &self.control[idx as usize],
            QhRef::Pool(idx) => &self.qhs[idx as usize],
        }
    }

    /// Returns `true` if `qh` names a record in these pools.
    pub fn contains(&self, qh: QhRef) -> bool {
        match qh {
            QhRef::Anchor(idx) => (idx as usize) < self.anchors.len(),
            QhRef::Control(idx) => (idx as usize) < self.control.len(),
            QhRef::Pool(idx) => (idx as usize) < self.qhs.len(),
        }
    }

    pub fn qh_link(&self, qh: QhRef) -> Link {
        Link::qh(link::addr_of(self.qh(qh)))
    }

    /// Find the QH that a hardware link points to.
    ///
    /// Returns `None` for terminators, and for records that aren't QHs
    /// from these pools.
    pub fn resolve_qh(&self, link: Link) -> Option<QhRef> {
        if link.is_terminate() || link.kind() != LinkType::Qh {
            return None;
        }
        let addr = link.address();
        index_of(self.qhs, addr)
            .map(|idx| QhRef::Pool(idx as u8))
            .or_else(|| index_of(self.control, addr).map(|idx| QhRef::Control(idx as u8)))
            .or_else(|| index_of(self.anchors, addr).map(|idx| QhRef::Anchor(idx as u8)))
    }

    /// The number of QHs that could ever be linked into one list.
    pub fn qh_capacity(&self) -> usize {
        self.anchors.len() + self.control.len() + self.qhs.len()
    }

    /// Every QH that can carry transfers.
    pub fn endpoint_qhs(&self) -> impl Iterator<Item = QhRef> {
        let control = (0..self.control.len()).map(|idx| QhRef::Control(idx as u8));
        let pool = (0..self.qhs.len()).map(|idx| QhRef::Pool(idx as u8));
        control.chain(pool)
    }

    /// Find a free QH in the endpoint pool.
    pub fn find_free_qh(&self) -> Option<QhRef> {
        self.qhs
            .iter()
            .position(|qh| qh.state() == QhState::Free)
            .map(|idx| QhRef::Pool(idx as u8))
    }

    pub fn qtd(&self, idx: u8) -> &'a Qtd {
        &self.qtds[idx as usize]
    }

    pub fn qtd_link(&self, idx: u8) -> Link {
        Link::qtd(link::addr_of(self.qtd(idx)))
    }

    /// Find the pool index of the qTD that a hardware link points to.
    pub fn resolve_qtd(&self, link: Link) -> Option<u8> {
        if link.is_terminate() {
            return None;
        }
        index_of(self.qtds, link.address()).map(|idx| idx as u8)
    }

    /// Claim a free qTD.
    pub fn alloc_qtd(&self) -> Option<u8> {
        let idx = self.qtds.iter().position(|qtd| !qtd.is_used())?;
        self.qtds[idx].claim();
        Some(idx as u8)
    }

    /// Count of qTDs that belong to a chain.
    pub fn qtds_in_use(&self) -> usize {
        self.qtds.iter().filter(|qtd| qtd.is_used()).count()
    }

    pub fn setup(&self, device: u8) -> &'a VCell<[u8; 8]> {
        &self.setup[device as usize]
    }
}
