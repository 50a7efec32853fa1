//! Interrupt decoding
//!
//! [`Ehci::int_handler`] reads the status register once, handles each
//! pending source, and acknowledges it. Transfer completions and errors
//! are found by walking the schedules, since the controller doesn't say
//! which endpoint finished.

use crate::{
    cache::Cache,
    driver::Ehci,
    event::{Event, XferResult},
    link::Link,
    qh::Qh,
    qtd::{Pid, Status},
    ral,
    schedule::Walk,
    state::{QhRef, ANCHOR_COUNT},
};

bitflags::bitflags! {
    /// Interrupt sources, in USBSTS and USBINTR.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Interrupts : u32 {
        /// A transfer with interrupt on complete finished, or a short packet.
        const USB = 1 << 0;
        /// A transfer ended in error.
        const ERROR = 1 << 1;
        const PORT_CHANGE = 1 << 2;
        const FRAME_LIST_ROLLOVER = 1 << 3;
        const HOST_SYSTEM_ERROR = 1 << 4;
        /// The doorbell was answered.
        const ASYNC_ADVANCE = 1 << 5;
        /// NXP: an async transfer completed.
        const ASYNC_COMPLETE = 1 << 18;
        /// NXP: a periodic transfer completed.
        const PERIODIC_COMPLETE = 1 << 19;
    }
}

impl Interrupts {
    /// Every source the driver services. A host system error halts the
    /// controller, and is found through the status register.
    pub const ENABLED: Interrupts = Interrupts::all().difference(Interrupts::HOST_SYSTEM_ERROR);
    const ASYNC_DONE: Interrupts = Interrupts::USB.union(Interrupts::ASYNC_COMPLETE);
    const PERIODIC_DONE: Interrupts = Interrupts::USB.union(Interrupts::PERIODIC_COMPLETE);
}

/// Proof that the controller answered the async advance doorbell.
///
/// Only the interrupt handler can make one, so only the interrupt handler
/// can return unlinked async QHs to the pool.
pub(crate) struct AsyncAdvanced(());

impl<C: Cache> Ehci<C> {
    /// Service the host controller interrupt.
    ///
    /// Call this from the controller's interrupt handler. `on_event` is
    /// called for every device connection, disconnection, and finished
    /// transfer.
    pub fn int_handler(&mut self, mut on_event: impl FnMut(Event)) {
        let status = Interrupts::from_bits_truncate(ral::read_reg!(ral::ehci, self.ehci, USBSTS));
        let pending = status & Interrupts::from_bits_truncate(ral::read_reg!(ral::ehci, self.ehci, USBINTR));

        if status.contains(Interrupts::HOST_SYSTEM_ERROR) || ral::read_reg!(ral::ehci, self.ehci, USBSTS, HCH == 1) {
            error!("Host controller halted. USBSTS={:x}", status.bits());
            self.acknowledge(pending | (status & Interrupts::HOST_SYSTEM_ERROR));
            return;
        }

        if pending.contains(Interrupts::FRAME_LIST_ROLLOVER) {
            self.uframe_extension += (self.pools.framelist().len() as u64) << 3;
            self.acknowledge(Interrupts::FRAME_LIST_ROLLOVER);
        }

        if pending.contains(Interrupts::PORT_CHANGE) {
            self.port_change(&mut on_event);
            self.acknowledge(Interrupts::PORT_CHANGE);
        }

        if pending.contains(Interrupts::ERROR) {
            for qh in self.schedule_walk(true, true) {
                self.transfer_error(qh, &mut on_event);
            }
            self.acknowledge(Interrupts::ERROR);
        }

        let done = pending & (Interrupts::ASYNC_DONE | Interrupts::PERIODIC_DONE);
        if !done.is_empty() {
            let walk = self.schedule_walk(
                done.intersects(Interrupts::ASYNC_DONE),
                done.intersects(Interrupts::PERIODIC_DONE),
            );
            for qh in walk {
                self.transfer_complete(qh, &mut on_event);
            }
            self.acknowledge(done);
        }

        if pending.contains(Interrupts::ASYNC_ADVANCE) {
            self.reclaim(&AsyncAdvanced(()));
            self.acknowledge(Interrupts::ASYNC_ADVANCE);
        }
    }

    fn acknowledge(&self, interrupts: Interrupts) {
        ral::write_reg!(ral::ehci, self.ehci, USBSTS, interrupts.bits());
    }

    /// Every QH in the async list, then every QH in each periodic class.
    fn schedule_walk(&self, include_async: bool, include_periodic: bool) -> impl Iterator<Item = QhRef> + 'static {
        let pools = self.pools;
        let async_list = include_async.then(|| Walk::async_list(pools));
        let periodic = (0..ANCHOR_COUNT)
            .filter(move |_| include_periodic)
            .flat_map(move |idx| Walk::periodic(pools, QhRef::Anchor(idx as u8)));
        async_list.into_iter().flatten().chain(periodic)
    }

    fn port_change(&mut self, on_event: &mut impl FnMut(Event)) {
        let portsc = ral::read_reg!(ral::ehci, self.ehci, PORTSC);
        if portsc & ral::ehci::PORTSC::CSC::mask != 0 {
            if portsc & ral::ehci::PORTSC::CCS::mask != 0 {
                self.port_reset();
                debug!("ATTACH");
                on_event(Event::DeviceAttach);
            } else {
                debug!("DETACH");
                on_event(Event::DeviceRemove);
            }
        }
        // Writing the change bits back clears them.
        ral::modify_reg!(ral::ehci, self.ehci, PORTSC, |current| {
            (current & !ral::ehci::PORTSC_W1C) | (portsc & ral::ehci::PORTSC_W1C)
        });
    }

    /// Retire the chain of a halted QH, and report why it halted.
    fn transfer_error(&self, qh_ref: QhRef, on_event: &mut impl FnMut(Event)) {
        let qh = self.pools.qh(qh_ref);
        qh.invalidate(&self.cache);
        if !qh.is_halted() || qh.chain().is_none() {
            return;
        }

        let overlay = qh.overlay();
        let result = if overlay.status().intersects(Status::TRANSPORT_ERRORS) || overlay.error_count() == 0 {
            XferResult::Failed
        } else {
            XferResult::Stalled
        };
        warn!(
            "XFER ERROR DEV{} EP{} STATUS={:x} CERR={}",
            qh.device_address(),
            qh.endpoint(),
            overlay.status().bits(),
            overlay.error_count()
        );

        let pipe = self.pipe_for(qh_ref);
        let bytes = self.retire_chain(qh);

        qh.overlay().set_next(Link::TERMINATE);
        qh.overlay().ALTERNATE.write(Link::TERMINATE.bits());
        if qh.is_control() {
            // Control endpoints can't stay halted. The next SETUP recovers.
            qh.set_halted(false);
        }
        qh.clean_invalidate(&self.cache);
        if qh.pid() == Pid::In && bytes > 0 {
            self.cache.invalidate(qh.buffer() as usize, bytes);
        }

        on_event(Event::XferComplete { pipe, bytes, result });
    }

    /// Retire the finished qTDs of a running QH, and report the transfer
    /// once its last qTD finishes.
    fn transfer_complete(&self, qh_ref: QhRef, on_event: &mut impl FnMut(Event)) {
        let qh = self.pools.qh(qh_ref);
        qh.invalidate(&self.cache);
        if qh.is_halted() {
            return;
        }

        while let Some((head, tail)) = qh.chain() {
            let qtd = self.pools.qtd(head);
            qtd.invalidate(&self.cache);
            if qtd.status().contains(Status::ACTIVE) {
                break;
            }

            let ioc = qtd.interrupt_on_complete();
            if qtd.pid() != Pid::Setup || ioc {
                qh.add_xferred(qtd.bytes_transferred());
            }
            // A control data stage still needs its status stage.
            let short = !ioc && !qh.is_control() && qtd.remaining_bytes() > 0;
            let next = if head == tail { None } else { self.pools.resolve_qtd(qtd.next()) };
            qtd.release();

            if ioc || short {
                let pipe = self.pipe_for(qh_ref);
                let bytes = qh.xferred();
                if qh.pid() == Pid::In && bytes > 0 {
                    self.cache.invalidate(qh.buffer() as usize, bytes);
                }
                qh.clear_chain();
                match next {
                    Some(next) if short => self.cancel_qtds(qh, next),
                    Some(next) => {
                        // Only the last qTD interrupts, so nothing should follow.
                        warn!("qTD {} follows a completed transfer", next);
                        self.release_qtds(next);
                    }
                    None => {}
                }
                trace!("XFER COMPLETE DEV{} EP{} {}", pipe.device(), qh.endpoint(), bytes);
                on_event(Event::XferComplete {
                    pipe,
                    bytes,
                    result: XferResult::Success,
                });
            } else {
                qh.pop_chain(next);
            }
        }
    }

    /// Stop the controller from running the rest of a chain that ended
    /// with a short packet, then release those qTDs.
    fn cancel_qtds(&self, qh: &Qh, first: u8) {
        let mut next = Some(first);
        while let Some(idx) = next {
            let qtd = self.pools.qtd(idx);
            qtd.set_status(qtd.status().difference(Status::ACTIVE));
            qtd.clean(&self.cache);
            next = self.pools.resolve_qtd(qtd.next());
        }
        let overlay = qh.overlay();
        overlay.set_next(Link::TERMINATE);
        overlay.set_status(overlay.status().difference(Status::ACTIVE));
        qh.clean(&self.cache);
        debug!("SHORT DEV{} EP{}", qh.device_address(), qh.endpoint());
        self.release_qtds(first);
    }

    /// Free every async QH that was unlinked before the doorbell.
    fn reclaim(&self, advanced: &AsyncAdvanced) {
        for qh_ref in self.pools.endpoint_qhs() {
            let qh = self.pools.qh(qh_ref);
            if qh.reclaim(advanced) {
                debug!("RECLAIM DEV{} EP{}", qh.device_address(), qh.endpoint());
                self.retire_chain(qh);
            }
        }
    }
}
