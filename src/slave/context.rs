// Licensed under the Apache-2.0 license

//! Protocol Context and the deferred task loop.
//!
//! [`HpiSlave`] owns the register mirror, the per-section event queues, the
//! bus transport, and the notification line. Interrupt context is limited to
//! [`HpiSlave::on_bus_event`], which advances the bus state machine, buffers
//! bytes, and sets flags. Everything else (dispatch, deferred port stops,
//! queue drain, pulse timing) happens in [`HpiSlave::task`].
//!
//! Flag roles: `write_pending` is set by the interrupt path when a write
//! transfer completes and consumed by the task; `transport_fault` is set on
//! an aborted transfer and consumed by the task. Both are single-word
//! atomics, the only state shared across the two contexts.

use core::sync::atomic::{AtomicBool, Ordering};

use embedded_hal::digital::OutputPin;

use crate::common::{Logger, NoOpLogger};
use crate::slave::bus::{BusEvent, BusNotification, SlaveBus, SlavePhy};
use crate::slave::caps::{FwImage, HpiApplication, PortId};
use crate::slave::dispatch::{dispatch_write, DispatchState, WriteAction};
use crate::slave::queue::EventQueue;
use crate::slave::regs::{PortRegs, RegisterSpace};
use crate::slave::SlaveConfig;
use crate::wire::{
    HpiError, RegAddr, ResponseCode, Section, FLASH_ROW_SIZE, READ_DATA_LEN, SECTION_COUNT,
};

/// Capacity of each section's event queue in bytes.
pub const EVENT_QUEUE_CAPACITY: usize = 128;

/// One protocol context per physical bus interface.
pub struct HpiSlave<'a, P, A, PIN, L = NoOpLogger>
where
    P: SlavePhy,
    A: HpiApplication,
    PIN: OutputPin,
    L: Logger,
{
    bus: SlaveBus<'a, P>,
    regs: RegisterSpace,
    queues: [EventQueue<EVENT_QUEUE_CAPACITY>; SECTION_COUNT],
    dispatch: DispatchState,
    app: A,
    intr_pin: PIN,
    logger: L,
    config: SlaveConfig,
    write_pending: AtomicBool,
    transport_fault: AtomicBool,
    pending_write: Option<(RegAddr, u16)>,
    port_stop_pending: u8,
    intr_asserted_at: Option<u32>,
    intr_released_at: Option<u32>,
    intr_edge_due: bool,
}

impl<'a, P, A, PIN> HpiSlave<'a, P, A, PIN, NoOpLogger>
where
    P: SlavePhy,
    A: HpiApplication,
    PIN: OutputPin,
{
    /// Creates a context without logging.
    pub fn new(
        phy: P,
        app: A,
        intr_pin: PIN,
        scratch: &'a mut [u8],
        config: SlaveConfig,
    ) -> Result<Self, HpiError> {
        Self::with_logger(phy, app, intr_pin, scratch, config, NoOpLogger)
    }
}

impl<'a, P, A, PIN, L> HpiSlave<'a, P, A, PIN, L>
where
    P: SlavePhy,
    A: HpiApplication,
    PIN: OutputPin,
    L: Logger,
{
    pub fn with_logger(
        phy: P,
        app: A,
        intr_pin: PIN,
        scratch: &'a mut [u8],
        config: SlaveConfig,
        logger: L,
    ) -> Result<Self, HpiError> {
        if scratch.is_empty() {
            return Err(HpiError::InvalidArgs);
        }
        let mut regs = RegisterSpace::new(config.port_count);
        let dev = regs.device_mut();
        dev.device_mode = app.device_mode();
        dev.bootloader_last_row = app.bootloader_last_row().into();
        dev.fw1_version = app.firmware_version(FwImage::Image1);
        dev.fw2_version = app.firmware_version(FwImage::Image2);

        Ok(Self {
            bus: SlaveBus::new(phy, scratch, config.timeout),
            regs,
            queues: [EventQueue::new(), EventQueue::new(), EventQueue::new()],
            dispatch: DispatchState::default(),
            app,
            intr_pin,
            logger,
            config,
            write_pending: AtomicBool::new(false),
            transport_fault: AtomicBool::new(false),
            pending_write: None,
            port_stop_pending: 0,
            intr_asserted_at: None,
            intr_released_at: None,
            intr_edge_due: false,
        })
    }

    /// Programs the phy from the stored configuration and starts responding.
    pub fn enable(&mut self) {
        self.bus.configure(
            self.config.address,
            self.config.address_mask,
            self.config.speed,
        );
        self.bus.enable();
    }

    /// Tears the interface down; a later `enable` starts clean.
    pub fn deinit(&mut self) {
        self.bus.disable();
        for q in &mut self.queues {
            q.clear();
        }
        self.pending_write = None;
        self.write_pending.store(false, Ordering::Release);
        self.transport_fault.store(false, Ordering::Release);
    }

    pub fn app(&self) -> &A {
        &self.app
    }

    pub fn app_mut(&mut self) -> &mut A {
        &mut self.app
    }

    /// Status registers of one port, for the PD stack to keep current.
    pub fn port_regs_mut(&mut self, port: PortId) -> Option<&mut PortRegs> {
        self.regs.port_mut(port.index())
    }

    /// Interrupt entry point: advance the bus machine, record what the task
    /// must do. No dispatch, no capability calls, no queue pops here.
    pub fn on_bus_event(&mut self, event: BusEvent, now: u32) {
        match self.bus.on_event(event, now) {
            Some(BusNotification::WriteDone { addr, len }) => {
                self.pending_write = Some((addr, len));
                self.write_pending.store(true, Ordering::Release);
                // Hold off further transfers until the dispatcher has run.
                self.bus.set_ack(false);
            }
            Some(BusNotification::ReadAddressed { addr }) => {
                let mut buf = [0u8; FLASH_ROW_SIZE];
                let n = self.regs.read_bytes(addr, &mut buf);
                if n == 0 {
                    // Nothing mapped there; feed a filler byte so the bus
                    // is not left stretched.
                    self.bus.supply_read(&[0xFF]);
                } else {
                    self.bus.supply_read(buf.get(..n).unwrap_or(&[]));
                }
            }
            Some(BusNotification::Aborted) => {
                self.transport_fault.store(true, Ordering::Release);
            }
            None => {}
        }
    }

    /// Queues an asynchronous event for the host. Callable from producers in
    /// either context: the enqueue touches only queue-tail state.
    pub fn enqueue_event(
        &mut self,
        section: Section,
        code: ResponseCode,
        payload: &[u8],
    ) -> Result<(), HpiError> {
        if payload.len() > READ_DATA_LEN {
            return Err(HpiError::InvalidArgs);
        }
        if !self.regs.has_section(section) {
            return Err(HpiError::InvalidArgs);
        }
        let idx = section.index().ok_or(HpiError::InvalidArgs)?;
        let queue = self.queues.get_mut(idx).ok_or(HpiError::Undefined)?;
        queue.enqueue(code as u8, payload)
    }

    /// True when the device may enter a low-power state: bus idle and acked,
    /// nothing queued, nothing pending.
    pub fn sleep_allowed(&self) -> bool {
        self.bus.sleep_allowed()
            && !self.write_pending.load(Ordering::Acquire)
            && self.port_stop_pending == 0
            && self.regs.intr_status() == 0
            && self.queues.iter().all(|q| q.is_empty())
    }

    /// The foreground task. Call once per application loop iteration with a
    /// monotonic millisecond tick.
    pub fn task(&mut self, now: u32) -> Result<(), HpiError> {
        let mut fault = false;

        if self.bus.poll_timeout(now) {
            self.logger.error("bus transfer timeout, interface reset");
            self.pending_write = None;
            self.write_pending.store(false, Ordering::Release);
            fault = true;
        }
        if self.transport_fault.swap(false, Ordering::AcqRel) {
            self.logger.error("bus transfer aborted");
            fault = true;
        }

        if self.write_pending.swap(false, Ordering::AcqRel) {
            if let Some((addr, _len)) = self.pending_write.take() {
                self.service_write(addr);
            }
            // Release the backpressure applied at write completion.
            self.bus.set_ack(true);
        }

        self.service_port_stops();
        self.drain_queues();
        self.update_intr_line(now)?;

        if fault {
            Err(HpiError::Transport)
        } else {
            Ok(())
        }
    }

    fn service_write(&mut self, addr: RegAddr) {
        let data = self.bus.rx_data();
        let action = dispatch_write(&mut self.regs, &mut self.dispatch, &mut self.app, addr, data);
        match action {
            Ok(WriteAction::Stored) => {}
            Ok(WriteAction::Response(code)) => self.load_response(addr.section, code),
            Ok(WriteAction::IntrClear(bits)) => self.acknowledge_intr(bits),
            Ok(WriteAction::ResetInterface) => {
                self.load_response(addr.section, ResponseCode::Success);
                self.bus.disable();
                self.bus.enable();
            }
            Ok(WriteAction::PortStop(mask)) => {
                self.port_stop_pending |= mask;
                self.load_response(addr.section, ResponseCode::Success);
            }
            Err(e) => {
                self.logger.debug("write rejected");
                self.load_response(addr.section, ResponseCode::from(e));
            }
        }
    }

    /// Single-byte synchronous response: code plus zero payload length.
    fn load_response(&mut self, section: Section, code: ResponseCode) {
        // Responses to an extended-section write land in the device section;
        // the extended section carries no image of its own.
        let section = if self.regs.has_section(section) {
            section
        } else {
            Section::Device
        };
        if self.regs.set_response(section, code as u8, 0).is_ok() {
            self.regs.set_intr(section.intr_mask());
        }
    }

    /// Host wrote the interrupt-status register: clear the named bits and
    /// free the response registers so the next record can load. The consumed
    /// indication owes the host a fresh edge, even if the next record loads
    /// in the same task pass.
    fn acknowledge_intr(&mut self, bits: u8) {
        self.intr_edge_due = true;
        self.regs.clear_intr(bits);
        for section in [Section::Device, Section::Port0, Section::Port1] {
            if bits & section.intr_mask() != 0 && self.regs.has_section(section) {
                let _ = self
                    .regs
                    .set_response(section, ResponseCode::NoResponse as u8, 0);
            }
        }
    }

    fn service_port_stops(&mut self) {
        while self.port_stop_pending != 0 {
            let idx = self.port_stop_pending.trailing_zeros() as usize;
            let bit = 1u8 << idx;
            self.port_stop_pending &= !bit;
            let Some(port) = PortId::from_index(idx) else {
                continue;
            };
            if self.app.port_disable(port).is_err() {
                self.logger.error("deferred port stop failed");
                continue;
            }
            self.dispatch.port_enabled &= !bit;
            let section = match Section::for_port(idx) {
                Some(s) => s,
                None => continue,
            };
            let _ = self.enqueue_event(section, ResponseCode::PortDisabled, &[]);
        }
    }

    /// Moves queued records into the host-visible response registers, one
    /// per section at a time; the next record loads only after the host
    /// acknowledges the current one.
    fn drain_queues(&mut self) {
        for section in [Section::Device, Section::Port0, Section::Port1] {
            if !self.regs.has_section(section) {
                continue;
            }
            if self.regs.intr_status() & section.intr_mask() != 0 {
                continue; // outstanding indication not yet consumed
            }
            let busy = self
                .regs
                .response(section)
                .is_some_and(|(code, _)| code != ResponseCode::NoResponse as u8);
            if busy {
                continue;
            }
            let Some(idx) = section.index() else { continue };
            let Some(queue) = self.queues.get_mut(idx) else {
                continue;
            };
            if queue.is_empty() {
                // Records queued before the overflow drain first; the one
                // overflow notification of the episode goes out last.
                if queue.take_overflow() {
                    let _ = self
                        .regs
                        .set_response(section, ResponseCode::MessageOverflow as u8, 0);
                    self.regs.set_intr(section.intr_mask());
                }
                continue;
            }
            let record = match self.regs.read_data_mut(section) {
                Some(window) => queue.pop_into(window),
                None => None,
            };
            if let Some(rec) = record {
                let _ = self.regs.set_response(section, rec.code, rec.len as u8);
                self.regs.set_intr(section.intr_mask());
            }
        }
    }

    /// Notification-line management. Both the high pulse and the low
    /// interval between pulses honor the minimum width, and an acknowledged
    /// indication always forces the line low before it re-asserts, so an
    /// edge-triggered host sees one distinct edge per record even when the
    /// next record loads immediately.
    fn update_intr_line(&mut self, now: u32) -> Result<(), HpiError> {
        let min = self.config.min_intr_pulse.ticks();
        let wanted = self.regs.intr_status() != 0;
        if let Some(since) = self.intr_asserted_at {
            if (!wanted || self.intr_edge_due) && now.wrapping_sub(since) >= min {
                self.intr_pin.set_low().map_err(|_| HpiError::Undefined)?;
                self.intr_asserted_at = None;
                self.intr_released_at = Some(now);
                self.intr_edge_due = false;
            }
            // else: hold the pulse, retry next iteration
        } else if wanted {
            let rested = match self.intr_released_at {
                Some(since) => now.wrapping_sub(since) >= min,
                None => true,
            };
            if rested {
                self.intr_pin.set_high().map_err(|_| HpiError::Undefined)?;
                self.intr_asserted_at = Some(now);
            }
        } else {
            self.intr_edge_due = false;
        }
        Ok(())
    }
}
