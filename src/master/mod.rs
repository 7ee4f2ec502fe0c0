// Licensed under the Apache-2.0 license

//! Initiator side of the host processor interface.
//!
//! [`HpiMaster`] owns the bus (any `embedded_hal::i2c::I2c`) and a registry
//! of responder devices. The notification-line interrupt handler only records
//! which device signaled; every bus transaction happens in [`HpiMaster::task`]
//! or an explicit helper, because transfers may clock-stretch and must never
//! run with interrupts masked.

pub mod registry;

pub use registry::{IntrLine, SlaveDevice, SlaveRegistry, MAX_SLAVES};

use core::sync::atomic::{AtomicU8, Ordering};

use embedded_hal::i2c::I2c;

use crate::common::{Logger, NoOpLogger};
use crate::wire::{
    HpiError, RegAddr, Region, ResponseCode, Section, FLASH_ROW_SIZE, INTR_STATUS_OFFSET,
    READ_DATA_LEN, RESPONSE_OFFSET,
};

/// Largest write frame: two address bytes plus one flash row.
const FRAME_CAP: usize = 2 + FLASH_ROW_SIZE;

/// Initiator-side errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterError<E> {
    /// The underlying bus reported a failure.
    Bus(E),
    /// The responder answered, but not with what the protocol requires.
    Protocol(HpiError),
    /// The responder had produced no response when the caller gave up
    /// waiting.
    ResponseTimeout,
    /// No device is registered under that index.
    UnknownSlave,
}

/// Application callbacks for routed events and device health.
pub trait MasterEvents {
    /// An event record arrived from `slave`'s `section` queue.
    fn event(&mut self, slave: u8, section: Section, code: u8, payload: &[u8]);

    /// A transaction against `slave` failed; `fail_count` is the consecutive
    /// failure streak.
    fn transaction_failed(&mut self, _slave: u8, _fail_count: u8) {}

    /// The failure streak reached the configured threshold. Deciding what to
    /// do about it (deregister, reset, back off) is the application's call.
    fn slave_unresponsive(&mut self, _slave: u8) {}
}

/// Initiator configuration.
#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    /// Consecutive failures before `slave_unresponsive` fires.
    pub fail_threshold: u8,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self { fail_threshold: 3 }
    }
}

/// Host-side driver: transaction engine, slave registry, event router.
pub struct HpiMaster<B, A, L = NoOpLogger>
where
    B: I2c,
    A: MasterEvents,
    L: Logger,
{
    bus: B,
    events: A,
    logger: L,
    registry: SlaveRegistry,
    pending: AtomicU8,
    fail_threshold: u8,
}

impl<B, A> HpiMaster<B, A, NoOpLogger>
where
    B: I2c,
    A: MasterEvents,
{
    pub fn new(bus: B, events: A, config: MasterConfig) -> Self {
        Self::with_logger(bus, events, config, NoOpLogger)
    }
}

impl<B, A, L> HpiMaster<B, A, L>
where
    B: I2c,
    A: MasterEvents,
    L: Logger,
{
    pub fn with_logger(bus: B, events: A, config: MasterConfig, logger: L) -> Self {
        Self {
            bus,
            events,
            logger,
            registry: SlaveRegistry::new(),
            pending: AtomicU8::new(0),
            fail_threshold: config.fail_threshold,
        }
    }

    pub fn events(&self) -> &A {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut A {
        &mut self.events
    }

    pub fn registry(&self) -> &SlaveRegistry {
        &self.registry
    }

    /// Registers a responder; the returned index names it from here on.
    pub fn register_slave(&mut self, dev: SlaveDevice) -> Result<u8, MasterError<B::Error>> {
        self.registry.register(dev).map_err(MasterError::Protocol)
    }

    /// Removes a responder and forgets any pending indication from it.
    pub fn unregister_slave(&mut self, index: u8) -> Result<(), MasterError<B::Error>> {
        self.registry
            .unregister(index)
            .map_err(MasterError::Protocol)?;
        self.pending.fetch_and(!(1 << index), Ordering::AcqRel);
        Ok(())
    }

    /// Notification-line interrupt entry point. Records which device
    /// signaled and nothing else; no bus I/O happens here.
    pub fn notify(&self, line: IntrLine) {
        if let Some(index) = self.registry.find_by_line(line) {
            self.pending.fetch_or(1 << index, Ordering::AcqRel);
        }
    }

    /// Writes `data` starting at a register address of `slave`.
    pub fn reg_write(
        &mut self,
        slave: u8,
        addr: RegAddr,
        data: &[u8],
    ) -> Result<(), MasterError<B::Error>> {
        let address = self.slave_address(slave)?;
        let mut frame: heapless::Vec<u8, FRAME_CAP> = heapless::Vec::new();
        frame
            .extend_from_slice(&addr.encode())
            .map_err(|()| MasterError::Protocol(HpiError::InvalidArgs))?;
        frame
            .extend_from_slice(data)
            .map_err(|()| MasterError::Protocol(HpiError::InvalidArgs))?;
        match self.bus.write(address, &frame) {
            Ok(()) => {
                self.registry.record_success(slave);
                Ok(())
            }
            Err(e) => {
                self.note_failure(slave);
                Err(MasterError::Bus(e))
            }
        }
    }

    /// Reads `buf.len()` bytes from a register address of `slave` using the
    /// standard index-write/read idiom.
    pub fn reg_read(
        &mut self,
        slave: u8,
        addr: RegAddr,
        buf: &mut [u8],
    ) -> Result<(), MasterError<B::Error>> {
        let address = self.slave_address(slave)?;
        match self.bus.write_read(address, &addr.encode(), buf) {
            Ok(()) => {
                self.registry.record_success(slave);
                Ok(())
            }
            Err(e) => {
                self.note_failure(slave);
                Err(MasterError::Bus(e))
            }
        }
    }

    /// Services every device whose notification line fired since the last
    /// call. Per-device transaction failures are routed through the
    /// [`MasterEvents`] health callbacks instead of aborting the sweep.
    pub fn task(&mut self) {
        let mask = self.pending.swap(0, Ordering::AcqRel);
        for index in 0..MAX_SLAVES as u8 {
            if mask & (1 << index) != 0 {
                self.service_slave(index);
            }
        }
    }

    fn service_slave(&mut self, slave: u8) {
        let Some(dev) = self.registry.get(slave) else {
            return;
        };
        let ports = dev.port_count();

        let mut status = [0u8; 1];
        if self
            .reg_read(slave, RegAddr::reg(Section::Device, INTR_STATUS_OFFSET), &mut status)
            .is_err()
        {
            self.logger.error("interrupt status read failed");
            return;
        }
        let status = status[0];

        for section in [Section::Device, Section::Port0, Section::Port1] {
            let present = match section {
                Section::Device => true,
                Section::Port0 => ports >= 1,
                Section::Port1 => ports >= 2,
                Section::Extended => false,
            };
            if !present || status & section.intr_mask() == 0 {
                continue;
            }
            if self.service_section(slave, section).is_err() {
                self.logger.error("event fetch failed");
                return;
            }
        }
    }

    fn service_section(
        &mut self,
        slave: u8,
        section: Section,
    ) -> Result<(), MasterError<B::Error>> {
        let mut hdr = [0u8; 2];
        self.reg_read(slave, RegAddr::reg(section, RESPONSE_OFFSET), &mut hdr)?;
        let code = hdr[0];
        let len = (hdr[1] as usize).min(READ_DATA_LEN);

        let mut payload = [0u8; READ_DATA_LEN];
        if let Some(buf) = payload.get_mut(..len).filter(|b| !b.is_empty()) {
            self.reg_read(slave, RegAddr::new(section, Region::ReadData, 0), buf)?;
        }
        self.events
            .event(slave, section, code, payload.get(..len).unwrap_or(&[]));

        // Acknowledge: clear this section's status bit so the responder can
        // load its next record.
        self.reg_write(
            slave,
            RegAddr::reg(Section::Device, INTR_STATUS_OFFSET),
            &[section.intr_mask()],
        )
    }

    fn slave_address(&self, slave: u8) -> Result<u8, MasterError<B::Error>> {
        self.registry
            .get(slave)
            .map(SlaveDevice::address)
            .ok_or(MasterError::UnknownSlave)
    }

    fn note_failure(&mut self, slave: u8) {
        let count = self.registry.record_failure(slave);
        self.events.transaction_failed(slave, count);
        if count == self.fail_threshold {
            self.logger.error("slave unresponsive");
            self.events.slave_unresponsive(slave);
        }
    }

    /// Reads a section's response registers once. `Ok(None)` means the
    /// responder has not produced a response yet; a present response is
    /// acknowledged with a status-bit clear before it is returned.
    pub fn poll_response(
        &mut self,
        slave: u8,
        section: Section,
    ) -> Result<Option<(u8, u8)>, MasterError<B::Error>> {
        let mut hdr = [0u8; 2];
        self.reg_read(slave, RegAddr::reg(section, RESPONSE_OFFSET), &mut hdr)?;
        if hdr[0] == ResponseCode::NoResponse as u8 {
            return Ok(None);
        }
        self.reg_write(
            slave,
            RegAddr::reg(Section::Device, INTR_STATUS_OFFSET),
            &[section.intr_mask()],
        )?;
        Ok(Some((hdr[0], hdr[1])))
    }

    /// Issues a device-section command, then polls for the synchronous
    /// response.
    ///
    /// The responder loads its response from its foreground task and NAKs
    /// transfers until that task has run, so `wait` runs between the command
    /// write and every poll. Block there on the notification line, or sleep
    /// one responder task period, to keep a busy responder from being
    /// mistaken for a failed one; return `false` to give up.
    fn command(
        &mut self,
        slave: u8,
        offset: u8,
        data: &[u8],
        expect: ResponseCode,
        mut wait: impl FnMut() -> bool,
    ) -> Result<(), MasterError<B::Error>> {
        self.reg_write(slave, RegAddr::reg(Section::Device, offset), data)?;
        loop {
            if !wait() {
                return Err(MasterError::ResponseTimeout);
            }
            if let Some((code, _len)) = self.poll_response(slave, Section::Device)? {
                return if code == expect as u8 {
                    Ok(())
                } else {
                    Err(MasterError::Protocol(HpiError::CommandFailed))
                };
            }
        }
    }

    /// Full device reset ('R', command 1).
    pub fn device_reset(
        &mut self,
        slave: u8,
        wait: impl FnMut() -> bool,
    ) -> Result<(), MasterError<B::Error>> {
        self.command(slave, 0x05, &[b'R', 1], ResponseCode::Success, wait)
    }

    /// Bus-interface reset only ('R', command 0).
    pub fn interface_reset(
        &mut self,
        slave: u8,
        wait: impl FnMut() -> bool,
    ) -> Result<(), MasterError<B::Error>> {
        self.command(slave, 0x05, &[b'R', 0], ResponseCode::Success, wait)
    }

    /// Jump to the bootloader ('J') or the alternate firmware image ('A').
    pub fn jump_to_boot(
        &mut self,
        slave: u8,
        alt: bool,
        wait: impl FnMut() -> bool,
    ) -> Result<(), MasterError<B::Error>> {
        let sig = if alt { b'A' } else { b'J' };
        self.command(slave, 0x04, &[sig], ResponseCode::Success, wait)
    }

    /// Enters or leaves flashing mode ('P' / 0).
    pub fn flash_mode(
        &mut self,
        slave: u8,
        enter: bool,
        wait: impl FnMut() -> bool,
    ) -> Result<(), MasterError<B::Error>> {
        let sig = if enter { b'P' } else { 0 };
        self.command(slave, 0x07, &[sig], ResponseCode::Success, wait)
    }

    /// Stages one row of data and asks the responder to program it.
    /// Requires flashing mode.
    pub fn flash_row_write(
        &mut self,
        slave: u8,
        row: u16,
        data: &[u8; FLASH_ROW_SIZE],
        wait: impl FnMut() -> bool,
    ) -> Result<(), MasterError<B::Error>> {
        self.reg_write(slave, RegAddr::new(Section::Device, Region::FlashRow, 0), data)?;
        let [lo, hi] = row.to_le_bytes();
        self.command(slave, 0x09, &[b'F', 1, lo, hi], ResponseCode::Success, wait)
    }

    /// Asks the responder to load one flash row and reads it back.
    pub fn flash_row_read(
        &mut self,
        slave: u8,
        row: u16,
        out: &mut [u8; FLASH_ROW_SIZE],
        wait: impl FnMut() -> bool,
    ) -> Result<(), MasterError<B::Error>> {
        let [lo, hi] = row.to_le_bytes();
        self.command(slave, 0x09, &[b'F', 0, lo, hi], ResponseCode::FlashDataAvailable, wait)?;
        self.reg_read(slave, RegAddr::new(Section::Device, Region::FlashRow, 0), out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, ErrorType, Operation};
    use std::cell::RefCell;
    use std::collections::{BTreeMap, HashMap};
    use std::rc::Rc;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct MockBusError;

    impl embedded_hal::i2c::Error for MockBusError {
        fn kind(&self) -> ErrorKind {
            ErrorKind::Other
        }
    }

    /// Behaves like a register-mapped responder: a write sets the pointer
    /// and stores trailing bytes; a read serves bytes from the pointer.
    #[derive(Default)]
    struct BusState {
        mem: HashMap<u8, BTreeMap<u16, u8>>,
        pointer: HashMap<u8, u16>,
        writes: Vec<(u8, Vec<u8>)>,
        touched: Vec<u8>,
        fail_addr: Option<u8>,
    }

    impl BusState {
        fn poke(&mut self, addr: u8, reg: u16, bytes: &[u8]) {
            let mem = self.mem.entry(addr).or_default();
            for (i, &b) in bytes.iter().enumerate() {
                mem.insert(reg + i as u16, b);
            }
        }
    }

    #[derive(Default, Clone)]
    struct MockBus(Rc<RefCell<BusState>>);

    impl ErrorType for MockBus {
        type Error = MockBusError;
    }

    impl I2c for MockBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            let mut state = self.0.borrow_mut();
            if state.fail_addr == Some(address) {
                return Err(MockBusError);
            }
            state.touched.push(address);
            for op in operations {
                match op {
                    Operation::Write(bytes) => {
                        state.writes.push((address, bytes.to_vec()));
                        if bytes.len() >= 2 {
                            let reg = u16::from_be_bytes([bytes[0], bytes[1]]);
                            state.pointer.insert(address, reg);
                            let payload = bytes[2..].to_vec();
                            state.poke(address, reg, &payload);
                        }
                    }
                    Operation::Read(buf) => {
                        let reg = state.pointer.get(&address).copied().unwrap_or(0);
                        for (i, slot) in buf.iter_mut().enumerate() {
                            *slot = state
                                .mem
                                .get(&address)
                                .and_then(|m| m.get(&(reg + i as u16)))
                                .copied()
                                .unwrap_or(0);
                        }
                    }
                }
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        events: Vec<(u8, Section, u8, Vec<u8>)>,
        failures: Vec<(u8, u8)>,
        unresponsive: Vec<u8>,
    }

    impl MasterEvents for RecordingEvents {
        fn event(&mut self, slave: u8, section: Section, code: u8, payload: &[u8]) {
            self.events.push((slave, section, code, payload.to_vec()));
        }
        fn transaction_failed(&mut self, slave: u8, fail_count: u8) {
            self.failures.push((slave, fail_count));
        }
        fn slave_unresponsive(&mut self, slave: u8) {
            self.unresponsive.push(slave);
        }
    }

    fn make_master(
        bus: &MockBus,
    ) -> HpiMaster<MockBus, RecordingEvents> {
        HpiMaster::new(bus.clone(), RecordingEvents::default(), MasterConfig::default())
    }

    #[test]
    fn register_write_then_read_round_trips() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let idx = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();

        let addr = RegAddr::reg(Section::Port0, 0x44);
        master.reg_write(idx, addr, &[0xDE, 0xAD]).unwrap();

        let mut out = [0u8; 2];
        master.reg_read(idx, addr, &mut out).unwrap();
        assert_eq!(out, [0xDE, 0xAD]);

        // Frame on the wire: MSB-first address, then data.
        let state = bus.0.borrow();
        assert_eq!(state.writes[0], (0x40, vec![0x10, 0x44, 0xDE, 0xAD]));
    }

    #[test]
    fn only_the_signaled_device_is_serviced() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let a = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();
        let b = master
            .register_slave(SlaveDevice::new(0x42, IntrLine(1), 2))
            .unwrap();

        {
            let mut state = bus.0.borrow_mut();
            // Device B: port 0 section pending, connect event with 2 bytes.
            state.poke(0x42, 0x0003, &[0x02]);
            state.poke(0x42, 0x107E, &[0x84, 2]);
            state.poke(0x42, 0x1400, &[0xAA, 0xBB]);
        }

        master.notify(IntrLine(1));
        master.task();

        let ev = &master.events().events;
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0], (b, Section::Port0, 0x84, vec![0xAA, 0xBB]));

        // Device A's bus address was never touched.
        assert!(!bus.0.borrow().touched.contains(&0x40));
        let _ = a;

        // The indication was acknowledged with a status-bit clear.
        let acked = bus
            .0
            .borrow()
            .writes
            .iter()
            .any(|(addr, frame)| *addr == 0x42 && frame == &vec![0x00, 0x03, 0x02]);
        assert!(acked);
    }

    #[test]
    fn notify_records_without_bus_io() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();

        master.notify(IntrLine(0));
        assert!(bus.0.borrow().touched.is_empty());

        master.notify(IntrLine(5)); // unknown line: ignored
        master.task();
        assert!(bus.0.borrow().touched.contains(&0x40));
    }

    #[test]
    fn failures_accumulate_and_threshold_fires_once() {
        let bus = MockBus::default();
        bus.0.borrow_mut().fail_addr = Some(0x40);
        let mut master = make_master(&bus);
        let idx = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();

        for _ in 0..5 {
            let err = master
                .reg_write(idx, RegAddr::reg(Section::Device, 0x44), &[0])
                .unwrap_err();
            assert_eq!(err, MasterError::Bus(MockBusError));
        }
        assert_eq!(
            master.events().failures,
            vec![(idx, 1), (idx, 2), (idx, 3), (idx, 4), (idx, 5)]
        );
        assert_eq!(master.events().unresponsive, vec![idx]);
        assert_eq!(master.registry().get(idx).unwrap().fail_count(), 5);

        // A success clears the streak.
        bus.0.borrow_mut().fail_addr = None;
        master
            .reg_write(idx, RegAddr::reg(Section::Device, 0x44), &[0])
            .unwrap();
        assert_eq!(master.registry().get(idx).unwrap().fail_count(), 0);
    }

    #[test]
    fn unknown_slave_is_rejected_without_bus_traffic() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let err = master
            .reg_read(7, RegAddr::reg(Section::Device, 0), &mut [0u8; 1])
            .unwrap_err();
        assert_eq!(err, MasterError::UnknownSlave);
        assert!(bus.0.borrow().touched.is_empty());
    }

    #[test]
    fn flash_row_write_sequence() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let idx = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();
        // Responder will report success for the command readback.
        bus.0.borrow_mut().poke(0x40, 0x007E, &[0x02, 0]);

        let row = [0x5Au8; FLASH_ROW_SIZE];
        master.flash_row_write(idx, 0x0123, &row, || true).unwrap();

        let state = bus.0.borrow();
        // Row buffer frame: flash-row region of the device section.
        assert_eq!(state.writes[0].1[..2], [0x02, 0x00]);
        assert_eq!(state.writes[0].1.len(), 2 + FLASH_ROW_SIZE);
        // Command frame: signature, write opcode, row little-endian.
        assert_eq!(state.writes[1].1, vec![0x00, 0x09, b'F', 1, 0x23, 0x01]);
    }

    #[test]
    fn flash_row_read_checks_response_code() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let idx = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();

        bus.0.borrow_mut().poke(0x40, 0x007E, &[0x07, 0]); // update failed
        let mut out = [0u8; FLASH_ROW_SIZE];
        let err = master.flash_row_read(idx, 1, &mut out, || true).unwrap_err();
        assert_eq!(err, MasterError::Protocol(HpiError::CommandFailed));

        bus.0.borrow_mut().poke(0x40, 0x007E, &[0x03, 0]); // data available
        bus.0.borrow_mut().poke(0x40, 0x0200, &[0xEE; 4]);
        master.flash_row_read(idx, 1, &mut out, || true).unwrap();
        assert_eq!(&out[..4], &[0xEE; 4]);
    }

    #[test]
    fn command_polls_until_the_responder_answers() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let idx = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();

        // The response appears only on the third poll, as with a responder
        // whose foreground task has not run yet.
        let mut polls = 0;
        master
            .flash_mode(idx, true, || {
                polls += 1;
                if polls == 3 {
                    bus.0.borrow_mut().poke(0x40, 0x007E, &[0x02, 0]);
                }
                true
            })
            .unwrap();
        assert_eq!(polls, 3);
        assert_eq!(master.registry().get(idx).unwrap().fail_count(), 0);
    }

    #[test]
    fn command_without_response_times_out_cleanly() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let idx = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();

        let mut polls = 0;
        let err = master
            .flash_mode(idx, true, || {
                polls += 1;
                polls <= 2
            })
            .unwrap_err();
        assert_eq!(err, MasterError::ResponseTimeout);
        assert_eq!(polls, 3);

        // An empty response register is not a transport failure, and nothing
        // was acknowledged.
        assert_eq!(master.registry().get(idx).unwrap().fail_count(), 0);
        assert!(master.events().failures.is_empty());
        let state = bus.0.borrow();
        assert_eq!(state.writes[0].1, vec![0x00, 0x07, b'P']);
        let acked = state
            .writes
            .iter()
            .any(|(_, frame)| frame == &vec![0x00, 0x03, 0x01]);
        assert!(!acked);
    }

    #[test]
    fn unregister_clears_pending_indication() {
        let bus = MockBus::default();
        let mut master = make_master(&bus);
        let idx = master
            .register_slave(SlaveDevice::new(0x40, IntrLine(0), 2))
            .unwrap();
        master.notify(IntrLine(0));
        master.unregister_slave(idx).unwrap();
        master.task();
        assert!(bus.0.borrow().touched.is_empty());
    }
}
