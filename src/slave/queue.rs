// Licensed under the Apache-2.0 license

//! Per-section event queue.
//!
//! A circular byte buffer holding variable-length records laid out as
//! `[code:1][length:2 LE][payload]`. Enqueue is all-or-nothing: a record
//! that does not fit leaves the buffer untouched and opens an overflow
//! episode. At most one overflow notification is raised per episode; the
//! episode closes when a record is successfully enqueued or dequeued.

use crate::wire::HpiError;

/// Bytes of header preceding each record payload.
pub const RECORD_HEADER_LEN: usize = 3;

/// Header of the record returned by [`EventQueue::pop_into`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    /// Event or response code.
    pub code: u8,
    /// Declared payload length in bytes.
    pub len: u16,
}

/// Fixed-capacity circular queue of event records.
#[derive(Debug)]
pub struct EventQueue<const N: usize> {
    buf: [u8; N],
    head: usize,
    used: usize,
    in_overflow: bool,
    overflow_pending: bool,
}

impl<const N: usize> Default for EventQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> EventQueue<N> {
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            head: 0,
            used: 0,
            in_overflow: false,
            overflow_pending: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Bytes still available for new records.
    pub fn free(&self) -> usize {
        N - self.used
    }

    /// Appends one complete record, or leaves the queue byte-for-byte
    /// unchanged and reports overflow.
    pub fn enqueue(&mut self, code: u8, payload: &[u8]) -> Result<(), HpiError> {
        if payload.len() > u16::MAX as usize {
            return Err(HpiError::InvalidArgs);
        }
        let need = RECORD_HEADER_LEN + payload.len();
        if need > self.free() {
            if !self.in_overflow {
                self.in_overflow = true;
                self.overflow_pending = true;
            }
            return Err(HpiError::QueueOverflow);
        }
        let len = payload.len() as u16;
        self.push_byte(code);
        self.push_byte((len & 0xFF) as u8);
        self.push_byte((len >> 8) as u8);
        for &b in payload {
            self.push_byte(b);
        }
        self.in_overflow = false;
        Ok(())
    }

    /// Removes the record at the head, copying its payload into `out`.
    ///
    /// `out` must be at least as large as the longest payload ever enqueued;
    /// a shorter buffer receives a truncated copy while the returned header
    /// still carries the declared length.
    pub fn pop_into(&mut self, out: &mut [u8]) -> Option<EventRecord> {
        if self.used < RECORD_HEADER_LEN {
            return None;
        }
        let code = self.take_byte();
        let len = self.take_byte() as u16 | ((self.take_byte() as u16) << 8);
        let copy = (len as usize).min(out.len());
        for i in 0..len as usize {
            let b = self.take_byte();
            if i < copy {
                if let Some(slot) = out.get_mut(i) {
                    *slot = b;
                }
            }
        }
        self.in_overflow = false;
        Some(EventRecord { code, len })
    }

    /// Takes the pending overflow notification, if one is owed.
    pub fn take_overflow(&mut self) -> bool {
        core::mem::replace(&mut self.overflow_pending, false)
    }

    /// Drops all queued records and any overflow bookkeeping.
    pub fn clear(&mut self) {
        self.head = 0;
        self.used = 0;
        self.in_overflow = false;
        self.overflow_pending = false;
    }

    fn push_byte(&mut self, b: u8) {
        let pos = (self.head + self.used) % N;
        if let Some(slot) = self.buf.get_mut(pos) {
            *slot = b;
        }
        self.used += 1;
    }

    fn take_byte(&mut self) -> u8 {
        let b = self.buf.get(self.head).copied().unwrap_or(0);
        self.head = (self.head + 1) % N;
        self.used -= 1;
        b
    }
}
