//! Horizontal link pointers
//!
//! Every hardware list is a chain of these 32-bit words. The low bits
//! tag the pointee's type and mark the end of a chain; the rest is the
//! 32-byte aligned physical address of the next record.

/// The kind of record a link points to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum LinkType {
    /// Isochronous transfer descriptor
    Itd = 0,
    /// Queue head
    Qh = 1,
    /// Split-transaction isochronous transfer descriptor
    Sitd = 2,
    /// Frame span traversal node
    Fstn = 3,
}

const TERMINATE: u32 = 1;
const TYPE_OFFSET: u32 = 1;
const TYPE_MASK: u32 = 0b11 << TYPE_OFFSET;
const ADDRESS_MASK: u32 = !0x1F;

/// A raw link pointer, as the controller sees it.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Link(u32);

impl Link {
    /// The end of a chain.
    pub const TERMINATE: Link = Link(TERMINATE);

    /// A link to the record at `addr`.
    ///
    /// `addr` must be 32-byte aligned; low bits are dropped.
    pub const fn new(addr: u32, kind: LinkType) -> Self {
        Link((addr & ADDRESS_MASK) | ((kind as u32) << TYPE_OFFSET))
    }

    /// A link to a queue head.
    pub const fn qh(addr: u32) -> Self {
        Self::new(addr, LinkType::Qh)
    }

    /// A qTD link. qTD pointers carry no type bits.
    pub const fn qtd(addr: u32) -> Self {
        Link(addr & ADDRESS_MASK)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Link(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_terminate(self) -> bool {
        self.0 & TERMINATE != 0
    }

    pub const fn address(self) -> u32 {
        self.0 & ADDRESS_MASK
    }

    pub fn kind(self) -> LinkType {
        match (self.0 & TYPE_MASK) >> TYPE_OFFSET {
            0 => LinkType::Itd,
            1 => LinkType::Qh,
            2 => LinkType::Sitd,
            _ => LinkType::Fstn,
        }
    }
}

impl core::fmt::Debug for Link {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_terminate() {
            f.write_str("Link(T)")
        } else {
            write!(f, "Link({:#010X}, {:?})", self.address(), self.kind())
        }
    }
}

/// The bus address of a descriptor record.
///
/// Descriptors live in 32-bit addressable memory on every supported target.
pub(crate) fn addr_of<T>(record: &T) -> u32 {
    record as *const T as usize as u32
}
