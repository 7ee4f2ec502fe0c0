// Licensed under the Apache-2.0 license

//! Bus Transport, responder role.
//!
//! A hardware-agnostic transfer state machine fed with bus events from the
//! peripheral's interrupt handler. The machine only buffers bytes and tracks
//! transfer phase; interpreting completed writes belongs to the dispatcher,
//! which runs in the foreground task.
//!
//! Recovery is deliberately minimal: a transfer that stalls longer than the
//! configured timeout resets the peripheral and returns to `Idle`. No retries
//! are attempted at this layer.

use fugit::MillisDurationU32;

use crate::wire::{BusSpeed, RegAddr};

/// Low-level bus peripheral operations the transport needs.
///
/// embedded-hal 1.0 has no target-mode I2C trait, so the responder reaches
/// its peripheral through this minimal surface instead.
pub trait SlavePhy {
    /// Program the address match (address plus mask) and the clock class.
    fn configure(&mut self, address: u8, mask: u8, speed: BusSpeed);
    /// Enable or disable automatic address acknowledgement.
    fn set_ack(&mut self, enable: bool);
    /// Push response bytes into the transmit FIFO; returns bytes accepted.
    fn write_tx(&mut self, data: &[u8]) -> usize;
    /// Hard-reset the peripheral block.
    fn reset(&mut self);
}

/// Transfer state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Interface disabled; all events ignored.
    Disabled,
    /// Initialized, waiting to be enabled.
    Init,
    /// Ready and waiting for an address match.
    Idle,
    /// Register-address phase of a write in progress.
    Preamble,
    /// Draining the transmit FIFO toward the initiator.
    Read,
    /// Data phase of a write in progress.
    Write,
    /// Stretching the clock until response bytes are supplied.
    ClockStretch,
    /// Transaction fault; cleared at the next stop or timeout.
    Error,
}

/// Bus-level events delivered from interrupt context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// Our address matched; `read` is the transfer direction bit.
    AddressMatch { read: bool },
    /// One data byte received.
    Byte(u8),
    /// Stop condition seen on the bus.
    Stop,
}

/// What the transport reports up to the protocol layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusNotification {
    /// A write transfer completed with `len` data bytes buffered.
    WriteDone { addr: RegAddr, len: u16 },
    /// The initiator requested a read; the clock is being stretched until
    /// [`SlaveBus::supply_read`] provides bytes.
    ReadAddressed { addr: RegAddr },
    /// A faulted transfer ended.
    Aborted,
}

/// Responder-side transfer state machine over a [`SlavePhy`].
pub struct SlaveBus<'a, P: SlavePhy> {
    phy: P,
    state: BusState,
    scratch: &'a mut [u8],
    rx_len: usize,
    preamble: [u8; 2],
    preamble_len: usize,
    addr: Option<RegAddr>,
    ack_enabled: bool,
    started_at: Option<u32>,
    timeout: MillisDurationU32,
}

impl<'a, P: SlavePhy> SlaveBus<'a, P> {
    /// Creates the transport in `Init` state. `scratch` receives write data
    /// and bounds the largest write the bus will accept.
    pub fn new(phy: P, scratch: &'a mut [u8], timeout: MillisDurationU32) -> Self {
        Self {
            phy,
            state: BusState::Init,
            scratch,
            rx_len: 0,
            preamble: [0; 2],
            preamble_len: 0,
            addr: None,
            ack_enabled: false,
            started_at: None,
            timeout,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    /// Programs the peripheral's address match and clock class. Call before
    /// `enable`; the settings survive transfer resets.
    pub fn configure(&mut self, address: u8, mask: u8, speed: BusSpeed) {
        self.phy.configure(address, mask, speed);
    }

    /// Starts accepting address matches.
    pub fn enable(&mut self) {
        if self.state == BusState::Init || self.state == BusState::Disabled {
            self.state = BusState::Idle;
            self.ack_enabled = true;
            self.phy.set_ack(true);
        }
    }

    /// Stops the interface; only a fresh `enable` leaves this state.
    pub fn disable(&mut self) {
        self.phy.set_ack(false);
        self.phy.reset();
        self.state = BusState::Disabled;
        self.started_at = None;
        self.addr = None;
    }

    /// Backpressure control: with ack disabled the peripheral NAKs our
    /// address and the initiator sees a busy device.
    pub fn set_ack(&mut self, enable: bool) {
        self.ack_enabled = enable;
        self.phy.set_ack(enable);
    }

    pub fn ack_enabled(&self) -> bool {
        self.ack_enabled
    }

    /// True only when no transfer is in flight and the address is being
    /// acknowledged, so low-power entry cannot race an active transaction.
    pub fn sleep_allowed(&self) -> bool {
        self.state == BusState::Idle && self.ack_enabled
    }

    /// Data bytes of the last completed write.
    pub fn rx_data(&self) -> &[u8] {
        self.scratch.get(..self.rx_len).unwrap_or(&[])
    }

    /// Advances the state machine on a bus event. Interrupt-context safe:
    /// only buffers bytes and flips state.
    pub fn on_event(&mut self, event: BusEvent, now: u32) -> Option<BusNotification> {
        if self.state == BusState::Disabled || self.state == BusState::Init {
            return None;
        }
        self.started_at = Some(now);
        match event {
            BusEvent::AddressMatch { read: false } => {
                if self.state == BusState::Idle {
                    self.state = BusState::Preamble;
                    self.preamble_len = 0;
                    self.rx_len = 0;
                } else {
                    self.state = BusState::Error;
                }
                None
            }
            BusEvent::AddressMatch { read: true } => {
                // Reads arrive either from Idle (address set by an earlier
                // write) or as a repeated start right after the preamble.
                let from_preamble =
                    self.state == BusState::Preamble && self.preamble_len == 2 && self.rx_len == 0;
                if self.state == BusState::Idle || from_preamble {
                    match self.addr {
                        Some(addr) => {
                            self.state = BusState::ClockStretch;
                            Some(BusNotification::ReadAddressed { addr })
                        }
                        None => {
                            self.state = BusState::Error;
                            None
                        }
                    }
                } else {
                    self.state = BusState::Error;
                    None
                }
            }
            BusEvent::Byte(b) => self.on_byte(b),
            BusEvent::Stop => self.on_stop(),
        }
    }

    fn on_byte(&mut self, b: u8) -> Option<BusNotification> {
        match self.state {
            BusState::Preamble => {
                if self.preamble_len < 2 {
                    if let Some(slot) = self.preamble.get_mut(self.preamble_len) {
                        *slot = b;
                    }
                    self.preamble_len += 1;
                    if self.preamble_len == 2 {
                        match RegAddr::decode(self.preamble) {
                            Ok(addr) => self.addr = Some(addr),
                            Err(_) => self.state = BusState::Error,
                        }
                    }
                } else {
                    self.state = BusState::Write;
                    return self.buffer_byte(b);
                }
                None
            }
            BusState::Write => self.buffer_byte(b),
            _ => None,
        }
    }

    fn buffer_byte(&mut self, b: u8) -> Option<BusNotification> {
        match self.scratch.get_mut(self.rx_len) {
            Some(slot) => {
                *slot = b;
                self.rx_len += 1;
                None
            }
            None => {
                // Scratch exhausted: the byte is NAKed on the wire, the
                // transfer is poisoned.
                self.state = BusState::Error;
                None
            }
        }
    }

    fn on_stop(&mut self) -> Option<BusNotification> {
        let ended = self.state;
        self.state = BusState::Idle;
        self.started_at = None;
        match ended {
            BusState::Write => self.addr.map(|addr| BusNotification::WriteDone {
                addr,
                len: self.rx_len as u16,
            }),
            BusState::Error => Some(BusNotification::Aborted),
            _ => None,
        }
    }

    /// Supplies response bytes for a stretched read; returns bytes accepted
    /// by the transmit FIFO.
    pub fn supply_read(&mut self, data: &[u8]) -> usize {
        if self.state != BusState::ClockStretch {
            return 0;
        }
        let n = self.phy.write_tx(data);
        self.state = BusState::Read;
        n
    }

    /// Timeout check, called from the foreground task. On expiry the
    /// peripheral is reset and the machine returns to `Idle`; reports `true`
    /// so the caller can surface the transport failure.
    pub fn poll_timeout(&mut self, now: u32) -> bool {
        let Some(started) = self.started_at else {
            return false;
        };
        let active = matches!(
            self.state,
            BusState::Preamble | BusState::Read | BusState::Write | BusState::ClockStretch
                | BusState::Error
        );
        if active && now.wrapping_sub(started) >= self.timeout.ticks() {
            self.phy.reset();
            self.state = BusState::Idle;
            self.started_at = None;
            self.addr = None;
            self.rx_len = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{RegAddr, Section};

    #[derive(Default)]
    struct MockPhy {
        ack: Option<bool>,
        tx: Vec<u8>,
        resets: usize,
        cfg: Option<(u8, u8, BusSpeed)>,
    }

    impl SlavePhy for &mut MockPhy {
        fn configure(&mut self, address: u8, mask: u8, speed: BusSpeed) {
            self.cfg = Some((address, mask, speed));
        }
        fn set_ack(&mut self, enable: bool) {
            self.ack = Some(enable);
        }
        fn write_tx(&mut self, data: &[u8]) -> usize {
            self.tx.extend_from_slice(data);
            data.len()
        }
        fn reset(&mut self) {
            self.resets += 1;
        }
    }

    fn timeout() -> MillisDurationU32 {
        MillisDurationU32::millis(500)
    }

    fn write_preamble(bus: &mut SlaveBus<&mut MockPhy>, addr: [u8; 2], now: u32) {
        assert!(bus.on_event(BusEvent::AddressMatch { read: false }, now).is_none());
        assert!(bus.on_event(BusEvent::Byte(addr[0]), now).is_none());
        assert!(bus.on_event(BusEvent::Byte(addr[1]), now).is_none());
    }

    #[test]
    fn write_transfer_reports_address_and_data() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 16];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        bus.enable();

        write_preamble(&mut bus, [0x00, 0x05], 0);
        bus.on_event(BusEvent::Byte(b'R'), 0);
        bus.on_event(BusEvent::Byte(1), 0);
        let done = bus.on_event(BusEvent::Stop, 0).unwrap();

        assert_eq!(
            done,
            BusNotification::WriteDone {
                addr: RegAddr::reg(Section::Device, 0x05),
                len: 2
            }
        );
        assert_eq!(bus.rx_data(), &[b'R', 1]);
        assert_eq!(bus.state(), BusState::Idle);
    }

    #[test]
    fn read_flow_stretches_until_supplied() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 16];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        bus.enable();

        write_preamble(&mut bus, [0x00, 0x7E], 0);
        let notif = bus.on_event(BusEvent::AddressMatch { read: true }, 0).unwrap();
        assert_eq!(
            notif,
            BusNotification::ReadAddressed {
                addr: RegAddr::reg(Section::Device, 0x7E)
            }
        );
        assert_eq!(bus.state(), BusState::ClockStretch);

        assert_eq!(bus.supply_read(&[0x02, 0x00]), 2);
        assert_eq!(bus.state(), BusState::Read);
        assert!(bus.on_event(BusEvent::Stop, 1).is_none());
        assert_eq!(bus.state(), BusState::Idle);
    }

    #[test]
    fn read_without_prior_address_faults() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 4];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        bus.enable();

        assert!(bus.on_event(BusEvent::AddressMatch { read: true }, 0).is_none());
        assert_eq!(bus.state(), BusState::Error);
        assert_eq!(bus.on_event(BusEvent::Stop, 0), Some(BusNotification::Aborted));
    }

    #[test]
    fn scratch_overflow_rejects_excess_bytes() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 2];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        bus.enable();

        write_preamble(&mut bus, [0x00, 0x40], 0);
        bus.on_event(BusEvent::Byte(1), 0);
        bus.on_event(BusEvent::Byte(2), 0);
        bus.on_event(BusEvent::Byte(3), 0); // no room: transfer poisoned
        assert_eq!(bus.state(), BusState::Error);
        assert_eq!(bus.on_event(BusEvent::Stop, 0), Some(BusNotification::Aborted));
        assert_eq!(bus.rx_data(), &[1, 2]);
    }

    #[test]
    fn bad_preamble_nibble_faults_transfer() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 4];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        bus.enable();

        bus.on_event(BusEvent::AddressMatch { read: false }, 0);
        bus.on_event(BusEvent::Byte(0x77), 0); // undefined section nibble
        bus.on_event(BusEvent::Byte(0x00), 0);
        assert_eq!(bus.state(), BusState::Error);
    }

    #[test]
    fn timeout_resets_to_idle_and_accepts_new_match() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 8];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        bus.enable();

        bus.on_event(BusEvent::AddressMatch { read: false }, 100);
        bus.on_event(BusEvent::Byte(0x00), 100);
        assert!(!bus.poll_timeout(400));
        assert!(bus.poll_timeout(700));
        assert_eq!(bus.state(), BusState::Idle);

        // A fresh transfer goes through normally.
        write_preamble(&mut bus, [0x00, 0x40], 800);
        bus.on_event(BusEvent::Byte(0xAB), 800);
        let done = bus.on_event(BusEvent::Stop, 801).unwrap();
        assert!(matches!(done, BusNotification::WriteDone { len: 1, .. }));
    }

    #[test]
    fn timeout_counts_resets_against_phy() {
        let mut phy = MockPhy::default();
        {
            let mut scratch = [0u8; 8];
            let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
            bus.enable();
            bus.on_event(BusEvent::AddressMatch { read: false }, 0);
            assert!(bus.poll_timeout(500));
        }
        assert_eq!(phy.resets, 1);
    }

    #[test]
    fn sleep_allowed_only_idle_with_ack() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 8];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        assert!(!bus.sleep_allowed()); // Init

        bus.enable();
        assert!(bus.sleep_allowed());

        bus.set_ack(false);
        assert!(!bus.sleep_allowed());
        bus.set_ack(true);

        bus.on_event(BusEvent::AddressMatch { read: false }, 0);
        assert!(!bus.sleep_allowed()); // mid-transfer
        bus.on_event(BusEvent::Stop, 0);
        assert!(bus.sleep_allowed());
    }

    #[test]
    fn configure_programs_the_phy() {
        let mut phy = MockPhy::default();
        {
            let mut scratch = [0u8; 4];
            let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
            bus.configure(0x42, 0xFE, BusSpeed::FastPlus);
        }
        assert_eq!(phy.cfg, Some((0x42, 0xFE, BusSpeed::FastPlus)));
    }

    #[test]
    fn disabled_interface_ignores_events() {
        let mut phy = MockPhy::default();
        let mut scratch = [0u8; 8];
        let mut bus = SlaveBus::new(&mut phy, &mut scratch, timeout());
        bus.enable();
        bus.disable();
        assert!(bus.on_event(BusEvent::AddressMatch { read: false }, 0).is_none());
        assert_eq!(bus.state(), BusState::Disabled);
    }
}
