//! Endpoint lifecycle
//!
//! Opening an endpoint describes it in a QH and links the QH into a
//! schedule. Closing unlinks it. Periodic QHs are free as soon as they're
//! unlinked. Async QHs wait for the controller to acknowledge the async
//! advance doorbell.

use usb_device::{
    endpoint::{EndpointAddress, EndpointType},
    UsbDirection, UsbError,
};

use crate::{
    cache::Cache,
    driver::Ehci,
    qh::{Characteristics, Qh, QhState, Speed},
    qtd::Pid,
    schedule,
    state::{QhRef, ANCHOR_COUNT, ASYNC_HEAD},
};

/// A device that's reachable through the root port.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Device {
    /// The address assigned by enumeration, or 0.
    pub address: u8,
    pub speed: Speed,
    /// Address of the high-speed hub in front of a full or low speed
    /// device. 0 for the root port.
    pub hub_address: u8,
    /// The hub port that the device connects to.
    pub hub_port: u8,
}

/// The parts of an endpoint descriptor that the controller needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: EndpointAddress,
    pub kind: EndpointType,
    /// `wMaxPacketSize`. Only the size bits are used.
    pub max_packet_size: u16,
    /// `bInterval`
    pub interval: u8,
}

/// Handle to an open endpoint.
///
/// A pipe stays valid until the endpoint is closed. Operations on a stale
/// pipe are ignored, or return an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Pipe {
    pub(crate) device: u8,
    pub(crate) address: EndpointAddress,
    pub(crate) qh: QhRef,
}

impl Pipe {
    /// The device address.
    pub fn device(&self) -> u8 {
        self.device
    }

    /// The endpoint address.
    pub fn address(&self) -> EndpointAddress {
        self.address
    }
}

/// Start mask, complete mask, and polling period (ms) of an interrupt
/// endpoint.
fn periodic_schedule(speed: Speed, interval: u8) -> usb_device::Result<(u8, u8, u8)> {
    match (speed, interval) {
        // Polled more than once per frame.
        (Speed::High, 1) => Ok((0xFF, 0, 0)),
        (Speed::High, 2) => Ok((0xAA, 0, 0)),
        (Speed::High, 3) => Ok((0x44, 0, 0)),
        (Speed::High, 4..=16) => {
            let interval_ms = (1u32 << (interval - 4)).min(u8::MAX as u32) as u8;
            Ok((1 << (interval % 8), 0, interval_ms))
        }
        (Speed::High, _) | (_, 0) => Err(UsbError::InvalidEndpoint),
        // Start split in micro-frame 0, complete splits in 2, 3, and 4.
        (_, interval) => Ok((0x01, 0x1C, interval)),
    }
}

impl<C: Cache> Ehci<C> {
    /// Open an endpoint.
    ///
    /// Control endpoints use the device's control QH. Opening a control
    /// endpoint again, for instance after the device takes a new address
    /// or reports its packet size, updates the QH in place.
    pub fn edpt_open(&mut self, device: &Device, descriptor: &EndpointDescriptor) -> usb_device::Result<Pipe> {
        if matches!(descriptor.kind, EndpointType::Isochronous { .. }) {
            return Err(UsbError::Unsupported);
        }
        if device.address as usize >= self.pools.devices() {
            return Err(UsbError::InvalidEndpoint);
        }

        let control = matches!(descriptor.kind, EndpointType::Control);
        let (smask, cmask, interval_ms) = match descriptor.kind {
            EndpointType::Interrupt => periodic_schedule(device.speed, descriptor.interval)?,
            _ => (0, 0, 0),
        };
        let periodic = smask != 0;

        let qh_ref = if control {
            QhRef::Control(device.address)
        } else {
            self.pools.find_free_qh().ok_or(UsbError::EndpointOverflow)?
        };
        let qh = self.pools.qh(qh_ref);
        qh.invalidate(&self.cache);
        let state = qh.state();
        if state == QhState::PendingRemoval || qh.chain().is_some() {
            return Err(UsbError::WouldBlock);
        }

        qh.configure(&Characteristics {
            device_address: device.address,
            endpoint: descriptor.address.index() as u8,
            speed: device.speed,
            max_packet_len: descriptor.max_packet_size,
            control,
            nak_reload: if periodic { 0 } else { self.config.nak_reload.min(15) },
            smask,
            cmask,
            hub_address: device.hub_address,
            hub_port: device.hub_port,
        });
        if qh_ref == ASYNC_HEAD {
            qh.set_head(true);
        }
        qh.set_pid(descriptor.address.direction().into());
        qh.set_interval_ms(interval_ms);
        if device.speed == Speed::High
            && matches!(descriptor.kind, EndpointType::Bulk)
            && descriptor.address.direction() == UsbDirection::Out
        {
            qh.set_ping(true);
        }

        if state == QhState::Free {
            qh.activate();
            let prev = if periodic {
                schedule::anchor_for(interval_ms)
            } else {
                ASYNC_HEAD
            };
            schedule::insert_after(&self.pools, prev, qh_ref, &self.cache);
        } else {
            qh.clean(&self.cache);
        }

        debug!(
            "OPEN DEV{} EP{} MPS={} INTERVAL={}",
            device.address,
            descriptor.address.index(),
            descriptor.max_packet_size,
            interval_ms
        );
        Ok(Pipe {
            device: device.address,
            address: descriptor.address,
            qh: qh_ref,
        })
    }

    /// Close an endpoint.
    ///
    /// Any pending transfer is abandoned without an event. Closing a pipe
    /// that's already closed does nothing. Device 0's control endpoint is
    /// never closed.
    pub fn edpt_close(&mut self, pipe: Pipe) {
        let Some(qh) = self.pipe_qh(pipe) else {
            return;
        };
        if pipe.qh == ASYNC_HEAD {
            return;
        }

        debug!("CLOSE DEV{} EP{}", pipe.device, pipe.address.index());
        if qh.is_periodic() {
            let anchor = schedule::anchor_for(qh.interval_ms());
            schedule::unlink(&self.pools, anchor, &self.cache, |qh_ref, _| qh_ref == pipe.qh, |_| {});
            self.retire_chain(qh);
            qh.release_periodic();
        } else {
            schedule::unlink(&self.pools, ASYNC_HEAD, &self.cache, |qh_ref, _| qh_ref == pipe.qh, |_| {});
            qh.begin_removal();
            self.ring_doorbell();
        }
    }

    /// Close every endpoint of a device.
    ///
    /// Use this when a device disconnects. Device 0's control endpoint
    /// stays open.
    pub fn device_close(&mut self, device: u8) {
        debug!("CLOSE DEV{}", device);
        let of_device = move |_: QhRef, qh: &Qh| qh.state() == QhState::Active && qh.device_address() == device;

        let pools = self.pools;
        schedule::unlink(&pools, ASYNC_HEAD, &self.cache, of_device, |qh_ref| {
            pools.qh(qh_ref).begin_removal();
        });
        for idx in 0..ANCHOR_COUNT {
            schedule::unlink(&pools, QhRef::Anchor(idx as u8), &self.cache, of_device, |qh_ref| {
                let qh = pools.qh(qh_ref);
                self.retire_chain(qh);
                qh.release_periodic();
            });
        }
        self.ring_doorbell();
    }

    /// Resume a halted endpoint.
    ///
    /// Call this after the device's endpoint halt has been cleared. The
    /// next transfer starts with DATA0.
    pub fn edpt_clear_stall(&mut self, pipe: Pipe) -> usb_device::Result<()> {
        let qh = self.pipe_qh(pipe).ok_or(UsbError::InvalidEndpoint)?;
        qh.invalidate(&self.cache);
        qh.set_halted(false);
        qh.overlay().set_data_toggle(false);
        qh.clean_invalidate(&self.cache);
        Ok(())
    }

    /// Find the pipe of an open endpoint.
    pub fn pipe(&self, device: u8, address: EndpointAddress) -> Option<Pipe> {
        if address.index() == 0 {
            return self.control_pipe(device, address.direction());
        }
        let pid = Pid::from(address.direction());
        self.pools
            .endpoint_qhs()
            .filter(|qh_ref| matches!(qh_ref, QhRef::Pool(_)))
            .find(|&qh_ref| {
                let qh = self.pools.qh(qh_ref);
                qh.state() == QhState::Active
                    && qh.device_address() == device
                    && qh.endpoint() as usize == address.index()
                    && qh.pid() == pid
            })
            .map(|qh| Pipe { device, address, qh })
    }

    /// Returns the control pipe of a device, if its control endpoint is open.
    ///
    /// Both directions name the same endpoint.
    pub fn control_pipe(&self, device: u8, direction: UsbDirection) -> Option<Pipe> {
        let pipe = Pipe {
            device,
            address: EndpointAddress::from_parts(0, direction),
            qh: QhRef::Control(device),
        };
        self.pipe_qh(pipe).map(|_| pipe)
    }

    /// Returns `true` if a transfer is pending on the pipe.
    pub fn edpt_busy(&self, pipe: Pipe) -> bool {
        self.pipe_qh(pipe).map_or(false, |qh| qh.chain().is_some())
    }

    /// Returns `true` if the endpoint halted, and needs a cleared stall.
    pub fn edpt_stalled(&self, pipe: Pipe) -> bool {
        self.pipe_qh(pipe).map_or(false, |qh| {
            qh.invalidate(&self.cache);
            qh.is_halted()
        })
    }

    /// Returns the class driver code that owns the pipe.
    pub fn edpt_class(&self, pipe: Pipe) -> Option<u8> {
        self.pipe_qh(pipe).map(Qh::class)
    }

    /// Record which class driver owns the pipe.
    pub fn edpt_set_class(&mut self, pipe: Pipe, class: u8) -> usb_device::Result<()> {
        let qh = self.pipe_qh(pipe).ok_or(UsbError::InvalidEndpoint)?;
        qh.set_class(class);
        Ok(())
    }

    /// Returns the QH behind a pipe, if the pipe is still open.
    pub(crate) fn pipe_qh(&self, pipe: Pipe) -> Option<&'static Qh> {
        if matches!(pipe.qh, QhRef::Anchor(_)) || !self.pools.contains(pipe.qh) {
            return None;
        }
        let qh = self.pools.qh(pipe.qh);
        let open = qh.state() == QhState::Active
            && qh.device_address() == pipe.device
            && qh.endpoint() as usize == pipe.address.index()
            && match pipe.qh {
                // Until it's opened, the async head isn't a control endpoint.
                QhRef::Control(_) => qh.is_control(),
                _ => qh.pid() == Pid::from(pipe.address.direction()),
            };
        open.then_some(qh)
    }

    /// Describe the transfer that's pending on a QH.
    pub(crate) fn pipe_for(&self, qh_ref: QhRef) -> Pipe {
        let qh = self.pools.qh(qh_ref);
        let direction = match qh.pid() {
            Pid::In => UsbDirection::In,
            Pid::Out | Pid::Setup => UsbDirection::Out,
        };
        Pipe {
            device: qh.device_address(),
            address: EndpointAddress::from_parts(qh.endpoint() as usize, direction),
            qh: qh_ref,
        }
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::{periodic_schedule, Device, EndpointDescriptor};
    use crate::{
        driver::test::ehci,
        qh::{QhState, Speed},
        schedule::Walk,
        state::{QhRef, ASYNC_HEAD},
        Ehci,
    };
    use usb_device::{
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection, UsbError,
    };
    use std::vec::Vec;

    fn device(address: u8, speed: Speed) -> Device {
        Device {
            address,
            speed,
            hub_address: 0,
            hub_port: 0,
        }
    }

    fn descriptor(index: usize, direction: UsbDirection, kind: EndpointType, interval: u8) -> EndpointDescriptor {
        EndpointDescriptor {
            address: EndpointAddress::from_parts(index, direction),
            kind,
            max_packet_size: 64,
            interval,
        }
    }

    fn async_list(ehci: &Ehci) -> Vec<QhRef> {
        Walk::async_list(ehci.pools).collect()
    }

    #[test]
    fn high_speed_intervals() {
        for (interval, smask) in [(1, 0xFF), (2, 0xAA), (3, 0x44)] {
            let (start, complete, ms) = periodic_schedule(Speed::High, interval).unwrap();
            assert_eq!(start, smask);
            assert_eq!(complete, 0);
            assert_eq!(ms, 0);
        }
        // Polled every 2^(I-1) micro-frames.
        assert_eq!(periodic_schedule(Speed::High, 1).unwrap().0.count_ones(), 8);
        assert_eq!(periodic_schedule(Speed::High, 2).unwrap().0.count_ones(), 4);
        assert_eq!(periodic_schedule(Speed::High, 3).unwrap().0.count_ones(), 2);

        assert_eq!(periodic_schedule(Speed::High, 4), Ok((1 << 4, 0, 1)));
        assert_eq!(periodic_schedule(Speed::High, 7), Ok((1 << 7, 0, 8)));
        assert_eq!(periodic_schedule(Speed::High, 8), Ok((1, 0, 16)));
        assert_eq!(periodic_schedule(Speed::High, 16), Ok((1, 0, 255)));
        assert_eq!(periodic_schedule(Speed::High, 0), Err(UsbError::InvalidEndpoint));
        assert_eq!(periodic_schedule(Speed::High, 17), Err(UsbError::InvalidEndpoint));
    }

    #[test]
    fn split_intervals() {
        assert_eq!(periodic_schedule(Speed::Full, 10), Ok((0x01, 0x1C, 10)));
        assert_eq!(periodic_schedule(Speed::Low, 255), Ok((0x01, 0x1C, 255)));
        assert_eq!(periodic_schedule(Speed::Low, 0), Err(UsbError::InvalidEndpoint));
    }

    #[test]
    fn open_bulk() {
        let mut ehci = ehci();
        let out = ehci
            .edpt_open(
                &device(2, Speed::High),
                &descriptor(1, UsbDirection::Out, EndpointType::Bulk, 0),
            )
            .unwrap();
        let qh = ehci.pools.qh(out.qh);
        assert_eq!(out.qh, QhRef::Pool(0));
        assert_eq!(qh.state(), QhState::Active);
        assert_eq!(qh.device_address(), 2);
        assert_eq!(qh.endpoint(), 1);
        assert_eq!(qh.max_packet_len(), 64);
        assert!(!qh.is_periodic());
        assert!(qh.overlay().status().contains(crate::qtd::Status::PING));
        assert_eq!(async_list(&ehci), [ASYNC_HEAD, out.qh]);

        // Same endpoint number, other direction, is another QH.
        let input = ehci
            .edpt_open(
                &device(2, Speed::High),
                &descriptor(1, UsbDirection::In, EndpointType::Bulk, 0),
            )
            .unwrap();
        assert_ne!(input.qh, out.qh);
        assert!(!ehci.pools.qh(input.qh).overlay().status().contains(crate::qtd::Status::PING));
        assert_eq!(ehci.pipe(2, input.address()), Some(input));
        assert_eq!(ehci.pipe(2, out.address()), Some(out));
        assert_eq!(ehci.pipe(3, out.address()), None);
    }

    #[test]
    fn open_interrupt() {
        let mut ehci = ehci();
        let pipe = ehci
            .edpt_open(
                &Device {
                    hub_address: 1,
                    hub_port: 3,
                    ..device(2, Speed::Low)
                },
                &descriptor(1, UsbDirection::In, EndpointType::Interrupt, 10),
            )
            .unwrap();
        let qh = ehci.pools.qh(pipe.qh);
        assert!(qh.is_periodic());
        assert_eq!(qh.smask(), 0x01);
        assert_eq!(qh.cmask(), 0x1C);
        assert_eq!(qh.interval_ms(), 10);
        assert_eq!(Walk::periodic(ehci.pools, QhRef::Anchor(3)).collect::<Vec<_>>(), [pipe.qh]);
        assert_eq!(async_list(&ehci), [ASYNC_HEAD]);
    }

    #[test]
    fn open_rejects() {
        let mut ehci = ehci();
        let iso = EndpointType::Isochronous {
            synchronization: usb_device::endpoint::IsochronousSynchronizationType::NoSynchronization,
            usage: usb_device::endpoint::IsochronousUsageType::Data,
        };
        assert_eq!(
            ehci.edpt_open(&device(1, Speed::High), &descriptor(1, UsbDirection::In, iso, 1)),
            Err(UsbError::Unsupported)
        );
        assert_eq!(
            ehci.edpt_open(
                &device(5, Speed::High),
                &descriptor(0, UsbDirection::Out, EndpointType::Control, 0)
            ),
            Err(UsbError::InvalidEndpoint)
        );
        assert_eq!(
            ehci.edpt_open(
                &device(1, Speed::Full),
                &descriptor(1, UsbDirection::In, EndpointType::Interrupt, 0)
            ),
            Err(UsbError::InvalidEndpoint)
        );
        // Nothing was allocated.
        assert_eq!(ehci.pools.find_free_qh(), Some(QhRef::Pool(0)));
    }

    #[test]
    fn qh_pool_exhausted() {
        let mut ehci = ehci();
        for idx in 0..16 {
            let direction = if idx % 2 == 0 { UsbDirection::In } else { UsbDirection::Out };
            ehci.edpt_open(
                &device(1 + idx as u8 / 8, Speed::High),
                &descriptor(1 + idx / 2 % 4, direction, EndpointType::Bulk, 0),
            )
            .unwrap();
        }
        assert_eq!(
            ehci.edpt_open(
                &device(3, Speed::High),
                &descriptor(1, UsbDirection::In, EndpointType::Bulk, 0)
            ),
            Err(UsbError::EndpointOverflow)
        );
        assert_eq!(async_list(&ehci).len(), 17);
    }

    #[test]
    fn control_reopen_updates_in_place() {
        let mut ehci = ehci();
        let control = descriptor(0, UsbDirection::Out, EndpointType::Control, 0);
        let pipe = ehci.edpt_open(&device(0, Speed::Full), &control).unwrap();
        assert_eq!(pipe.qh, ASYNC_HEAD);
        let head = ehci.pools.qh(ASYNC_HEAD);
        assert!(head.is_head());
        assert!(!head.is_halted());
        assert_eq!(head.max_packet_len(), 64);

        ehci.edpt_open(
            &device(0, Speed::Full),
            &EndpointDescriptor {
                max_packet_size: 8,
                ..control
            },
        )
        .unwrap();
        assert_eq!(head.max_packet_len(), 8);
        assert!(head.is_head());
        assert_eq!(async_list(&ehci), [ASYNC_HEAD]);

        let pipe = ehci.edpt_open(&device(1, Speed::Full), &control).unwrap();
        assert_eq!(pipe.qh, QhRef::Control(1));
        ehci.edpt_open(&device(1, Speed::Full), &control).unwrap();
        assert_eq!(async_list(&ehci), [ASYNC_HEAD, QhRef::Control(1)]);
        assert_eq!(ehci.control_pipe(1, UsbDirection::In).map(|p| p.qh), Some(QhRef::Control(1)));
        assert_eq!(ehci.control_pipe(2, UsbDirection::In), None);
    }

    #[test]
    fn async_head_never_closes() {
        let mut ehci = ehci();
        let control = descriptor(0, UsbDirection::Out, EndpointType::Control, 0);
        let pipe = ehci.edpt_open(&device(0, Speed::High), &control).unwrap();
        ehci.edpt_close(pipe);
        ehci.device_close(0);
        assert_eq!(ehci.pools.qh(ASYNC_HEAD).state(), QhState::Active);
        assert_eq!(async_list(&ehci), [ASYNC_HEAD]);
    }

    #[test]
    fn periodic_close_is_immediate() {
        let mut ehci = ehci();
        let pipe = ehci
            .edpt_open(
                &device(1, Speed::High),
                &descriptor(1, UsbDirection::In, EndpointType::Interrupt, 4),
            )
            .unwrap();
        ehci.edpt_close(pipe);
        assert_eq!(ehci.pools.qh(pipe.qh).state(), QhState::Free);
        assert_eq!(Walk::periodic(ehci.pools, QhRef::Anchor(0)).count(), 0);
        assert_eq!(ehci.pipe(1, pipe.address()), None);
        assert!(!ehci.edpt_busy(pipe));
    }

    #[test]
    fn reopen_while_pending_removal() {
        let mut ehci = ehci();
        let control = descriptor(0, UsbDirection::Out, EndpointType::Control, 0);
        let pipe = ehci.edpt_open(&device(1, Speed::High), &control).unwrap();
        ehci.device_close(1);
        assert_eq!(ehci.pools.qh(pipe.qh).state(), QhState::PendingRemoval);
        assert_eq!(
            ehci.edpt_open(&device(1, Speed::High), &control),
            Err(UsbError::WouldBlock)
        );
        assert_eq!(ehci.control_pipe(1, UsbDirection::Out), None);
    }

    #[test]
    fn device_close_leaves_other_devices() {
        let mut ehci = ehci();
        let bulk = descriptor(1, UsbDirection::In, EndpointType::Bulk, 0);
        let interrupt = descriptor(2, UsbDirection::In, EndpointType::Interrupt, 1);
        let a = ehci.edpt_open(&device(1, Speed::High), &bulk).unwrap();
        let b = ehci.edpt_open(&device(2, Speed::High), &bulk).unwrap();
        let c = ehci.edpt_open(&device(1, Speed::High), &interrupt).unwrap();
        let d = ehci.edpt_open(&device(2, Speed::High), &interrupt).unwrap();

        ehci.device_close(1);
        assert_eq!(ehci.pools.qh(a.qh).state(), QhState::PendingRemoval);
        assert_eq!(ehci.pools.qh(c.qh).state(), QhState::Free);
        assert_eq!(async_list(&ehci), [ASYNC_HEAD, b.qh]);
        assert_eq!(Walk::periodic(ehci.pools, QhRef::Anchor(0)).collect::<Vec<_>>(), [d.qh]);
        assert!(ehci.pipe(2, b.address()).is_some());
    }

    #[test]
    fn class_ownership() {
        let mut ehci = ehci();
        let pipe = ehci
            .edpt_open(
                &device(1, Speed::High),
                &descriptor(1, UsbDirection::In, EndpointType::Bulk, 0),
            )
            .unwrap();
        assert_eq!(ehci.edpt_class(pipe), Some(0));
        ehci.edpt_set_class(pipe, 3).unwrap();
        assert_eq!(ehci.edpt_class(pipe), Some(3));
        ehci.edpt_close(pipe);
        assert_eq!(ehci.edpt_class(pipe), None);
        assert_eq!(ehci.edpt_set_class(pipe, 3), Err(UsbError::InvalidEndpoint));
        assert_eq!(ehci.edpt_clear_stall(pipe), Err(UsbError::InvalidEndpoint));
    }
}
