//! Schedule construction and traversal
//!
//! The periodic schedule is a frame list whose entries lead into four
//! anchor QHs, one per interval class. An endpoint linked behind the
//! 2 ms anchor is visited every second frame, behind the 4 ms anchor
//! every fourth frame, and so on. Every path ends at the 1 ms anchor,
//! so endpoints behind it are visited every frame.
//!
//! The async schedule is a circular list. Its head is the control QH
//! for device address 0, which never leaves the list.

use crate::{
    cache::Cache,
    link::{Link, LinkType},
    qh::Qh,
    state::{Pools, QhRef, ANCHOR_COUNT, ASYNC_HEAD},
};

/// The anchor of the 1 ms interval class. Every periodic path ends here.
pub(crate) const ANCHOR_1MS: QhRef = QhRef::Anchor(0);

/// Select the interval class for an endpoint polled every `interval_ms`.
///
/// Sub-millisecond endpoints (zero) run every frame. Intervals beyond
/// 8 ms fall into the 8 ms class.
pub(crate) fn anchor_index(interval_ms: u8) -> usize {
    interval_ms.clamp(1, 1 << (ANCHOR_COUNT - 1)).ilog2() as usize
}

/// Returns the anchor that heads the list for `interval_ms`.
pub(crate) fn anchor_for(interval_ms: u8) -> QhRef {
    QhRef::Anchor(anchor_index(interval_ms) as u8)
}

/// Build the periodic schedule.
///
/// Each anchor is halted, so the controller never executes it, and has a
/// non-zero start mask, so the controller treats it as periodic.
pub(crate) fn init_periodic<C: Cache>(pools: &Pools, cache: &C) {
    let framelist = pools.framelist();
    let anchor_1ms = pools.qh_link(ANCHOR_1MS);

    for idx in 0..ANCHOR_COUNT {
        let anchor = pools.qh(QhRef::Anchor(idx as u8));
        anchor.reset_overlay();
        anchor.CHARACTERISTICS.write(0);
        anchor.CAPABILITIES.write(0);
        crate::ral::write_reg!(crate::qh, anchor, CAPABILITIES, SMASK: 1);
        anchor.set_halted(true);
        anchor.set_horizontal(if idx == 0 { Link::TERMINATE } else { anchor_1ms });
    }

    for entry in framelist {
        entry.write(anchor_1ms.bits());
    }

    // Splice the 2, 4, and 8 ms anchors in front of the 1 ms anchor.
    for (class, start) in [(1u8, 0usize), (2, 1), (3, 3)] {
        let link = pools.qh_link(QhRef::Anchor(class));
        let period = 1 << class;
        for entry in framelist.iter().skip(start).step_by(period) {
            entry.write(link.bits());
        }
    }

    for idx in 0..ANCHOR_COUNT {
        pools.qh(QhRef::Anchor(idx as u8)).clean(cache);
    }
    cache.clean(pools.framelist_addr() as usize, core::mem::size_of_val(framelist));
}

/// Build the async schedule: a circular list of one halted QH.
pub(crate) fn init_async<C: Cache>(pools: &Pools, cache: &C) {
    let head = pools.qh(ASYNC_HEAD);
    head.CHARACTERISTICS.write(0);
    head.CAPABILITIES.write(0);
    head.reset_overlay();
    head.clear_chain();
    head.set_head(true);
    head.set_halted(true);
    head.set_horizontal(pools.qh_link(ASYNC_HEAD));
    if head.state() == crate::qh::QhState::Free {
        head.activate();
    }
    head.clean(cache);
}

/// Link `qh` right behind `prev`.
///
/// `qh` is fully described before `prev` points to it, so the controller
/// never sees a partial record.
pub(crate) fn insert_after<C: Cache>(pools: &Pools, prev: QhRef, qh: QhRef, cache: &C) {
    let prev = pools.qh(prev);
    let new = pools.qh(qh);
    new.set_horizontal(prev.horizontal());
    new.clean(cache);
    prev.set_horizontal(pools.qh_link(qh));
    prev.clean(cache);
}

/// Unlink every QH behind `head` that satisfies `predicate`.
///
/// For periodic lists, `head` is an anchor, and the walk ends at the
/// 1 ms anchor. Each unlinked QH points back to `head`, so a controller
/// that's still holding it finds its way back into the schedule. Returns
/// the unlinked QHs through `unlinked`.
pub(crate) fn unlink<C: Cache>(
    pools: &Pools,
    head: QhRef,
    cache: &C,
    mut predicate: impl FnMut(QhRef, &Qh) -> bool,
    mut unlinked: impl FnMut(QhRef),
) {
    let stop = (head != ANCHOR_1MS && matches!(head, QhRef::Anchor(_))).then_some(ANCHOR_1MS);
    let mut prev = head;
    for _ in 0..pools.qh_capacity() {
        let prev_qh = pools.qh(prev);
        prev_qh.invalidate(cache);
        let Some(next) = pools.resolve_qh(prev_qh.horizontal()) else {
            break;
        };
        if next == head || Some(next) == stop {
            break;
        }
        let qh = pools.qh(next);
        qh.invalidate(cache);
        if predicate(next, qh) {
            prev_qh.set_horizontal(qh.horizontal());
            prev_qh.clean(cache);
            // EHCI 4.8.2: keep the removed QH pointing into the schedule.
            qh.set_horizontal(pools.qh_link(head));
            qh.clean(cache);
            unlinked(next);
        } else {
            prev = next;
        }
    }
}

/// Walks a schedule list, yielding every endpoint QH once.
///
/// The next link of a yielded QH is read on the following call, so the
/// caller may invalidate the QH before the walk moves on.
pub(crate) struct Walk<'a> {
    pools: Pools<'a>,
    head: QhRef,
    stop: Option<QhRef>,
    state: WalkState,
    budget: usize,
}

#[derive(Clone, Copy)]
enum WalkState {
    Start(Link),
    After(QhRef),
    Done,
}

impl<'a> Walk<'a> {
    /// Walk the async list, starting with its head.
    pub fn async_list(pools: Pools<'a>) -> Self {
        Walk {
            pools,
            head: ASYNC_HEAD,
            stop: None,
            state: WalkState::Start(pools.qh_link(ASYNC_HEAD)),
            budget: pools.qh_capacity(),
        }
    }

    /// Walk the endpoints behind one periodic anchor.
    pub fn periodic(pools: Pools<'a>, anchor: QhRef) -> Self {
        Walk {
            pools,
            head: anchor,
            stop: (anchor != ANCHOR_1MS).then_some(ANCHOR_1MS),
            state: WalkState::Start(pools.qh(anchor).horizontal()),
            budget: pools.qh_capacity(),
        }
    }

    fn resolve(&self, link: Link) -> Option<QhRef> {
        if !link.is_terminate() && link.kind() != LinkType::Qh {
            warn!("Skipping periodic entry of type {}", link.kind() as u32);
        }
        self.pools.resolve_qh(link)
    }
}

impl Iterator for Walk<'_> {
    type Item = QhRef;
    fn next(&mut self) -> Option<QhRef> {
        if self.budget == 0 {
            return None;
        }
        self.budget -= 1;

        let next = match self.state {
            WalkState::Start(link) => self.resolve(link),
            WalkState::After(prev) => self
                .resolve(self.pools.qh(prev).horizontal())
                .filter(|&next| next != self.head),
            WalkState::Done => None,
        }
        .filter(|&next| Some(next) != self.stop);

        self.state = next.map_or(WalkState::Done, WalkState::After);
        next
    }
}
