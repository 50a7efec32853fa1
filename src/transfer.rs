//! Transfer submission
//!
//! A transfer becomes a chain of qTDs. The chain is fully built, and
//! written back from the cache, before the QH's overlay points to its
//! first qTD. Only the last qTD interrupts on completion.

use usb_device::{UsbDirection, UsbError};

use crate::{
    cache::Cache,
    driver::Ehci,
    endpoint::Pipe,
    link,
    qh::Qh,
    qtd::{self, Pid, Status},
};

/// First and last qTD of a built chain.
#[derive(Clone, Copy)]
struct Chain {
    head: u8,
    tail: u8,
}

impl<C: Cache> Ehci<C> {
    /// Start a transfer on an open pipe.
    ///
    /// The direction comes from the pipe. On a control pipe, this moves a
    /// data or status stage, which start with DATA1. The transfer ends with
    /// an [`XferComplete`](crate::Event::XferComplete) event.
    ///
    /// # Safety
    ///
    /// `buffer` must be valid for `len` bytes of reads (OUT) or writes (IN)
    /// until the transfer's completion event, or until the pipe is closed
    /// and reclaimed. The controller accesses it through DMA.
    pub unsafe fn edpt_xfer(&mut self, pipe: Pipe, buffer: *mut u8, len: usize) -> usb_device::Result<()> {
        let qh = self.pipe_qh(pipe).ok_or(UsbError::InvalidEndpoint)?;
        qh.invalidate(&self.cache);
        if qh.chain().is_some() {
            return Err(UsbError::WouldBlock);
        }
        let control = qh.is_control();
        if control && len > u16::MAX as usize {
            return Err(UsbError::BufferOverflow);
        }

        let pid = Pid::from(pipe.address.direction());
        let addr = buffer as usize as u32;
        let chain = self.build_chain(addr, len, pid, control, qh.max_packet_len(), true)?;
        self.sync_buffer(pid, addr, len);
        self.submit(qh, chain, addr, pid);
        trace!("XFER DEV{} EP{} LEN={}", pipe.device, pipe.address.index(), len);
        Ok(())
    }

    /// Send a SETUP packet to a device's control endpoint.
    ///
    /// The packet is copied, so `setup` needn't outlive the call. The
    /// completion event reports the 8 packet bytes.
    pub fn setup_send(&mut self, device: u8, setup: &[u8; 8]) -> usb_device::Result<()> {
        let qh = self.idle_control_qh(device)?;
        let addr = self.write_setup(device, setup);
        let chain = self.build_chain(addr, 8, Pid::Setup, false, qh.max_packet_len(), true)?;
        self.submit(qh, chain, addr, Pid::Setup);
        trace!("SETUP DEV{}", device);
        Ok(())
    }

    /// Run a complete control transfer: SETUP, an optional data stage of
    /// `wLength` bytes, and the status stage.
    ///
    /// The direction of the data stage comes from `bmRequestType`. The
    /// completion event reports the data stage bytes.
    ///
    /// # Safety
    ///
    /// When `wLength` is non-zero, `buffer` must be valid for `wLength`
    /// bytes until the completion event. See [`edpt_xfer`](Ehci::edpt_xfer).
    pub unsafe fn control_xfer(&mut self, device: u8, setup: &[u8; 8], buffer: *mut u8) -> usb_device::Result<()> {
        let qh = self.idle_control_qh(device)?;
        let max_packet_len = qh.max_packet_len();
        let length = u16::from_le_bytes([setup[6], setup[7]]) as usize;
        let direction = if setup[0] & 0x80 != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        };
        let data_pid = Pid::from(direction);
        let data_addr = buffer as usize as u32;

        let setup_addr = self.write_setup(device, setup);
        let mut chain = self.build_chain(setup_addr, 8, Pid::Setup, false, max_packet_len, false)?;

        if length > 0 {
            match self.build_chain(data_addr, length, data_pid, true, max_packet_len, false) {
                Ok(data_stage) => self.append(&mut chain, data_stage),
                Err(err) => {
                    self.release_qtds(chain.head);
                    return Err(err);
                }
            }
        }

        // The status stage runs opposite to the request, with or without data.
        let status_pid = match direction {
            UsbDirection::In => Pid::Out,
            UsbDirection::Out => Pid::In,
        };
        match self.build_chain(0, 0, status_pid, true, max_packet_len, true) {
            Ok(status_stage) => self.append(&mut chain, status_stage),
            Err(err) => {
                self.release_qtds(chain.head);
                return Err(err);
            }
        }

        if length > 0 {
            self.sync_buffer(data_pid, data_addr, length);
        }
        self.submit(qh, chain, data_addr, data_pid);
        trace!("CONTROL DEV{} LEN={}", device, length);
        Ok(())
    }

    /// Returns the control QH of a device, if it can take a transfer.
    fn idle_control_qh(&self, device: u8) -> usb_device::Result<&'static Qh> {
        let pipe = self
            .control_pipe(device, UsbDirection::Out)
            .ok_or(UsbError::InvalidEndpoint)?;
        let qh = self.pools.qh(pipe.qh);
        qh.invalidate(&self.cache);
        if qh.chain().is_some() {
            return Err(UsbError::WouldBlock);
        }
        Ok(qh)
    }

    /// Copy a SETUP packet into the device's packet buffer, returning
    /// the buffer's address.
    fn write_setup(&self, device: u8, setup: &[u8; 8]) -> u32 {
        let packet = self.pools.setup(device);
        packet.write(*setup);
        let addr = link::addr_of(packet);
        self.cache.clean(addr as usize, setup.len());
        addr
    }

    /// Describe `len` bytes at `addr` with as many qTDs as it takes.
    ///
    /// Non-final qTDs end on a packet boundary. Releases everything it
    /// allocated if the qTD pool runs out.
    fn build_chain(
        &self,
        addr: u32,
        len: usize,
        pid: Pid,
        toggle: bool,
        max_packet_len: usize,
        interrupt_on_complete: bool,
    ) -> usb_device::Result<Chain> {
        let max_packet_len = max_packet_len.max(1);
        let mut chain: Option<Chain> = None;
        let mut toggle = toggle;
        let mut offset = 0;

        loop {
            let chunk_addr = addr.wrapping_add(offset as u32);
            let remaining = len - offset;
            let mut chunk = remaining.min(qtd::capacity(chunk_addr));
            if chunk < remaining {
                chunk -= chunk % max_packet_len;
            }

            let Some(idx) = self.pools.alloc_qtd() else {
                if let Some(chain) = chain {
                    self.release_qtds(chain.head);
                }
                warn!("Out of qTDs");
                return Err(UsbError::EndpointMemoryOverflow);
            };
            let qtd = self.pools.qtd(idx);
            qtd.init(chunk_addr, chunk as u16, self.config.error_retries);
            qtd.set_pid(pid);
            qtd.set_data_toggle(toggle);

            let packets = chunk.div_ceil(max_packet_len).max(1);
            if packets % 2 == 1 {
                toggle = !toggle;
            }
            let next = Chain { head: idx, tail: idx };
            chain = Some(match chain {
                Some(mut chain) => {
                    self.append(&mut chain, next);
                    chain
                }
                None => next,
            });

            offset += chunk;
            if offset >= len {
                break;
            }
        }

        // The loop runs at least once.
        let chain = chain.ok_or(UsbError::EndpointMemoryOverflow)?;
        self.pools.qtd(chain.tail).set_interrupt_on_complete(interrupt_on_complete);
        Ok(chain)
    }

    fn append(&self, chain: &mut Chain, next: Chain) {
        self.pools.qtd(chain.tail).set_next(self.pools.qtd_link(next.head));
        chain.tail = next.tail;
    }

    /// Prepare a transfer buffer for the controller.
    fn sync_buffer(&self, pid: Pid, addr: u32, len: usize) {
        match pid {
            Pid::In => self.cache.invalidate(addr as usize, len),
            Pid::Out | Pid::Setup => self.cache.clean(addr as usize, len),
        }
    }

    /// Hand a built chain to an idle QH.
    fn submit(&self, qh: &Qh, chain: Chain, buffer: u32, pid: Pid) {
        let mut idx = chain.head;
        loop {
            let qtd = self.pools.qtd(idx);
            qtd.clean(&self.cache);
            if idx == chain.tail {
                break;
            }
            match self.pools.resolve_qtd(qtd.next()) {
                Some(next) => idx = next,
                None => break,
            }
        }

        qh.set_chain(chain.head, chain.tail);
        qh.set_buffer(buffer);
        qh.set_pid(pid);
        qh.overlay().set_next(self.pools.qtd_link(chain.head));
        qh.clean(&self.cache);
    }

    /// Release the QH's pending chain, returning the bytes the controller
    /// moved.
    pub(crate) fn retire_chain(&self, qh: &Qh) -> usize {
        let Some((head, tail)) = qh.chain() else {
            return 0;
        };
        let mut bytes = qh.xferred();
        let mut next = Some(head);
        while let Some(idx) = next {
            let qtd = self.pools.qtd(idx);
            qtd.invalidate(&self.cache);
            let counted = qtd.pid() != Pid::Setup || qtd.interrupt_on_complete();
            if counted && !qtd.status().contains(Status::ACTIVE) {
                bytes += qtd.bytes_transferred();
            }
            next = if idx == tail {
                None
            } else {
                self.pools.resolve_qtd(qtd.next())
            };
            qtd.release();
        }
        qh.clear_chain();
        bytes
    }

    /// Release the qTD at `first`, and every qTD that follows it.
    pub(crate) fn release_qtds(&self, first: u8) {
        let mut next = Some(first);
        while let Some(idx) = next {
            let qtd = self.pools.qtd(idx);
            next = self.pools.resolve_qtd(qtd.next());
            qtd.release();
        }
    }
}

#[cfg(test)]
mod test {
    extern crate std;

    use crate::{
        cache::test::CountingCache,
        driver::test::{ehci, with_cache},
        endpoint::{Device, EndpointDescriptor, Pipe},
        event::{Event, XferResult},
        interrupt::Interrupts,
        qh::Speed,
        qtd::{self, Pid, Qtd},
        ral, Ehci,
    };
    use std::{boxed::Box, vec::Vec};
    use usb_device::{
        endpoint::{EndpointAddress, EndpointType},
        UsbDirection, UsbError,
    };

    const GET_DESCRIPTOR: [u8; 8] = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0];
    const SET_ADDRESS: [u8; 8] = [0x00, 0x05, 0x03, 0x00, 0x00, 0x00, 0, 0];

    #[repr(C, align(4096))]
    struct Pages([u8; 3 * 4096]);

    fn open<C: crate::Cache>(ehci: &mut Ehci<C>, index: usize, direction: UsbDirection, kind: EndpointType) -> Pipe {
        let device = Device {
            address: 1,
            speed: Speed::High,
            hub_address: 0,
            hub_port: 0,
        };
        let max_packet_size = if matches!(kind, EndpointType::Control) { 64 } else { 512 };
        ehci.edpt_open(
            &device,
            &EndpointDescriptor {
                address: EndpointAddress::from_parts(index, direction),
                kind,
                max_packet_size,
                interval: 0,
            },
        )
        .unwrap()
    }

    fn chain<C: crate::Cache>(ehci: &Ehci<C>, pipe: Pipe) -> Vec<&'static Qtd> {
        let (mut idx, tail) = ehci.pools.qh(pipe.qh).chain().unwrap();
        let mut qtds = Vec::new();
        loop {
            let qtd = ehci.pools.qtd(idx);
            qtds.push(qtd);
            if idx == tail {
                break;
            }
            idx = ehci.pools.resolve_qtd(qtd.next()).unwrap();
        }
        qtds
    }

    fn complete_all<C: crate::Cache>(ehci: &mut Ehci<C>, pipe: Pipe) -> Vec<Event> {
        for qtd in chain(ehci, pipe) {
            ral::modify_reg!(crate::qtd, qtd, TOKEN, STATUS: 0, TOTAL_BYTES: 0);
        }
        ral::write_reg!(ral::ehci, ehci.ehci, USBSTS, Interrupts::USB.bits());
        let mut events = Vec::new();
        ehci.int_handler(|event| events.push(event));
        events
    }

    #[test]
    fn bulk_chain() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 1, UsbDirection::In, EndpointType::Bulk);
        // Never touched by the simulated controller.
        let buffer = 0x2000_0F00 as *mut u8;
        unsafe { ehci.edpt_xfer(pipe, buffer, 18_000) }.unwrap();
        assert!(ehci.edpt_busy(pipe));

        let qtds = chain(&ehci, pipe);
        assert_eq!(qtds.iter().map(|qtd| qtd.expected_bytes()).sum::<usize>(), 18_000);
        let (last, rest) = qtds.split_last().unwrap();
        assert!(last.interrupt_on_complete());
        for qtd in rest {
            assert!(!qtd.interrupt_on_complete());
            assert_eq!(qtd.expected_bytes() % 512, 0);
            assert!(qtd.expected_bytes() <= qtd::capacity(qtd.buffer()));
        }
        for qtd in &qtds {
            assert_eq!(qtd.pid(), Pid::In);
            assert!(qtd.status().contains(qtd::Status::ACTIVE));
        }
        let qh = ehci.pools.qh(pipe.qh);
        assert_eq!(qh.overlay().next(), ehci.pools.qtd_link(ehci.pools.qh(pipe.qh).chain().unwrap().0));
        assert_eq!(qtds.len(), 2);
        assert_eq!(qh.buffer(), 0x2000_0F00);
    }

    #[test]
    fn page_aligned_chain() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 1, UsbDirection::Out, EndpointType::Bulk);
        let base = 0x2000_0000u32;
        unsafe { ehci.edpt_xfer(pipe, base as *mut u8, 40_000) }.unwrap();
        let qtds = chain(&ehci, pipe);
        let lengths: Vec<usize> = qtds.iter().map(|qtd| qtd.expected_bytes()).collect();
        assert_eq!(lengths, [20_480, 19_520]);
        assert_eq!(qtds[1].buffer(), base + 20_480);
        assert_eq!(qtds[0].BUFFERS[4].read(), base + 4 * 4096);
    }

    #[test]
    fn busy_pipe() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 1, UsbDirection::In, EndpointType::Bulk);
        let mut buffer = [0u8; 8];
        unsafe { ehci.edpt_xfer(pipe, buffer.as_mut_ptr(), buffer.len()) }.unwrap();
        assert_eq!(
            unsafe { ehci.edpt_xfer(pipe, buffer.as_mut_ptr(), buffer.len()) },
            Err(UsbError::WouldBlock)
        );
        assert_eq!(ehci.pools.qtds_in_use(), 1);
    }

    #[test]
    fn qtd_pool_exhausted() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 1, UsbDirection::In, EndpointType::Bulk);
        let buffer = 0x2000_0000 as *mut u8;
        assert_eq!(
            unsafe { ehci.edpt_xfer(pipe, buffer, 40 * 20_480) },
            Err(UsbError::EndpointMemoryOverflow)
        );
        assert_eq!(ehci.pools.qtds_in_use(), 0);
        assert!(!ehci.edpt_busy(pipe));
        // The pipe still works.
        unsafe { ehci.edpt_xfer(pipe, buffer, 64) }.unwrap();
    }

    #[test]
    fn closed_pipe() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 1, UsbDirection::In, EndpointType::Bulk);
        ehci.edpt_close(pipe);
        let mut buffer = [0u8; 8];
        assert_eq!(
            unsafe { ehci.edpt_xfer(pipe, buffer.as_mut_ptr(), buffer.len()) },
            Err(UsbError::InvalidEndpoint)
        );
        assert_eq!(ehci.setup_send(2, &SET_ADDRESS), Err(UsbError::InvalidEndpoint));
    }

    #[test]
    fn get_descriptor() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 0, UsbDirection::Out, EndpointType::Control);
        let mut buffer = [0u8; 18];
        unsafe { ehci.control_xfer(1, &GET_DESCRIPTOR, buffer.as_mut_ptr()) }.unwrap();

        let qtds = chain(&ehci, pipe);
        assert_eq!(qtds.len(), 3);
        let stages: Vec<_> = qtds
            .iter()
            .map(|qtd| (qtd.pid(), qtd.data_toggle(), qtd.expected_bytes(), qtd.interrupt_on_complete()))
            .collect();
        assert_eq!(
            stages,
            [
                (Pid::Setup, false, 8, false),
                (Pid::In, true, 18, false),
                (Pid::Out, true, 0, true),
            ]
        );
        assert_eq!(ehci.pools.setup(1).read(), GET_DESCRIPTOR);
        assert_eq!(qtds[0].buffer(), crate::link::addr_of(ehci.pools.setup(1)));
        assert_eq!(qtds[1].buffer(), buffer.as_ptr() as usize as u32);

        let events = complete_all(&mut ehci, pipe);
        assert_eq!(
            events,
            [Event::XferComplete {
                pipe: ehci.control_pipe(1, UsbDirection::In).unwrap(),
                bytes: 18,
                result: XferResult::Success,
            }]
        );
        assert_eq!(ehci.pools.qtds_in_use(), 0);
    }

    #[test]
    fn no_data_stage() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 0, UsbDirection::Out, EndpointType::Control);
        unsafe { ehci.control_xfer(1, &SET_ADDRESS, core::ptr::null_mut()) }.unwrap();
        let qtds = chain(&ehci, pipe);
        assert_eq!(qtds.len(), 2);
        assert_eq!(qtds[1].pid(), Pid::In);
        assert!(qtds[1].data_toggle());
        assert!(qtds[1].interrupt_on_complete());

        let events = complete_all(&mut ehci, pipe);
        assert!(matches!(
            events[..],
            [Event::XferComplete {
                bytes: 0,
                result: XferResult::Success,
                ..
            }]
        ));
    }

    #[test]
    fn in_request_without_data_stage() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 0, UsbDirection::Out, EndpointType::Control);
        let setup = [0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0, 0];
        unsafe { ehci.control_xfer(1, &setup, core::ptr::null_mut()) }.unwrap();
        let qtds = chain(&ehci, pipe);
        assert_eq!(qtds.len(), 2);
        assert_eq!(qtds[1].pid(), Pid::Out);
        assert!(qtds[1].data_toggle());
        assert!(qtds[1].interrupt_on_complete());
    }

    #[test]
    fn staged_control() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 0, UsbDirection::Out, EndpointType::Control);
        ehci.setup_send(1, &GET_DESCRIPTOR).unwrap();
        let qtds = chain(&ehci, pipe);
        assert_eq!(qtds.len(), 1);
        assert_eq!(qtds[0].pid(), Pid::Setup);
        assert!(!qtds[0].data_toggle());
        assert_eq!(ehci.setup_send(1, &GET_DESCRIPTOR), Err(UsbError::WouldBlock));

        // The SETUP bytes are reported when SETUP is the whole transfer.
        let events = complete_all(&mut ehci, pipe);
        assert!(matches!(events[..], [Event::XferComplete { bytes: 8, .. }]));

        let data = ehci.control_pipe(1, UsbDirection::In).unwrap();
        let mut buffer = [0u8; 18];
        unsafe { ehci.edpt_xfer(data, buffer.as_mut_ptr(), buffer.len()) }.unwrap();
        let qtds = chain(&ehci, data);
        assert_eq!(qtds[0].pid(), Pid::In);
        assert!(qtds[0].data_toggle());
    }

    #[test]
    fn control_toggles_follow_packet_parity() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 0, UsbDirection::Out, EndpointType::Control);
        // Two qTDs: 20480 bytes (320 packets), then 20 bytes.
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x14, 0x50];
        unsafe { ehci.control_xfer(1, &setup, 0x2000_0000 as *mut u8) }.unwrap();
        let toggles: Vec<bool> = chain(&ehci, pipe).iter().map(|qtd| qtd.data_toggle()).collect();
        assert_eq!(toggles, [false, true, true, true]);
    }

    #[test]
    fn control_toggles_after_odd_packet_count() {
        let mut ehci = ehci();
        let pipe = open(&mut ehci, 0, UsbDirection::Out, EndpointType::Control);
        let setup = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x14, 0x50];
        // 20416 bytes (319 packets), then 84 bytes starting with DATA0.
        unsafe { ehci.control_xfer(1, &setup, 0x2000_0040 as *mut u8) }.unwrap();
        let toggles: Vec<bool> = chain(&ehci, pipe).iter().map(|qtd| qtd.data_toggle()).collect();
        assert_eq!(toggles, [false, true, false, true]);
    }

    #[test]
    fn buffer_cache_maintenance() {
        let mut ehci = with_cache::<CountingCache, 8>(CountingCache::default());
        let input = open(&mut ehci, 1, UsbDirection::In, EndpointType::Bulk);
        let output = open(&mut ehci, 2, UsbDirection::Out, EndpointType::Bulk);
        let mut pages = Box::new(Pages([0; 3 * 4096]));
        // Descriptors hold 32-bit addresses.
        let addr = pages.0.as_mut_ptr() as usize as u32 as usize;

        let invalidates = ehci.cache.invalidates.get();
        unsafe { ehci.edpt_xfer(input, pages.0.as_mut_ptr(), 100) }.unwrap();
        // The QH, then the buffer.
        assert_eq!(ehci.cache.invalidates.get(), invalidates + 2);

        let cleans = ehci.cache.cleans.get();
        unsafe { ehci.edpt_xfer(output, pages.0.as_mut_ptr().add(4096), 200) }.unwrap();
        // The buffer, the qTD, and the QH.
        assert_eq!(ehci.cache.cleans.get(), cleans + 3);

        // Completion invalidates the IN buffer over the bytes received.
        let qtd = chain(&ehci, input)[0];
        ral::modify_reg!(crate::qtd, qtd, TOKEN, STATUS: 0, TOTAL_BYTES: 60);
        ral::write_reg!(ral::ehci, ehci.ehci, USBSTS, Interrupts::USB.bits());
        let mut events = Vec::new();
        ehci.int_handler(|event| events.push(event));
        assert!(matches!(events[..], [Event::XferComplete { bytes: 40, .. }]));
        assert_eq!(ehci.cache.last.get(), (addr, 40));
    }
}
