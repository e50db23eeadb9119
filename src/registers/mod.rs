// SPDX-License-Identifier: GPL-3.0-only

//! Batched access to the imager's 16-bit register space
//!
//! Register writes travel over the bridge's vendor channel. Sequences of
//! writes to consecutive addresses coalesce into bursts; a timed register
//! list additionally interleaves sleeps at declared points. The observed bus
//! transactions for a transferred list are exactly its coalesced burst
//! representation.

pub mod shadow;

use crate::errors::{CoreError, CoreResult};
use std::time::Duration;
use tracing::debug;

/// Number of times `poll_until` sleeps for the polling interval before
/// giving up with a timeout
const MAX_POLL_RETRIES: usize = 4;

/// Low-level register transport provided by the bridge.
///
/// Implementations talk to the device over the vendor channel; the mock used
/// in tests records transactions instead. All operations may fail partway:
/// after an error the device may have accepted some of the writes.
pub trait RegisterIo {
    fn read_register(&mut self, address: u16) -> CoreResult<u16>;
    fn write_register(&mut self, address: u16, value: u16) -> CoreResult<()>;
    /// Read `values.len()` registers starting at `first_address`
    fn read_burst(&mut self, first_address: u16, values: &mut [u16]) -> CoreResult<()>;
    /// Write all values to consecutive addresses starting at `first_address`
    fn write_burst(&mut self, first_address: u16, values: &[u16]) -> CoreResult<()>;
    /// Assert or release the imager reset line
    fn set_imager_reset(&mut self, assert: bool) -> CoreResult<()>;
    /// Sleep used for register timing; routed through the trait so tests can
    /// observe rather than wait
    fn sleep_for(&mut self, duration: Duration);
}

/// One entry of a timed register list: write `value` to `address`, then
/// sleep for `sleep_micros` before the next entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedRegisterEntry {
    pub address: u16,
    pub value: u16,
    pub sleep_micros: u32,
}

impl TimedRegisterEntry {
    pub fn new(address: u16, value: u16) -> Self {
        Self {
            address,
            value,
            sleep_micros: 0,
        }
    }

    pub fn with_sleep(address: u16, value: u16, sleep_micros: u32) -> Self {
        Self {
            address,
            value,
            sleep_micros,
        }
    }
}

/// Ordered register write sequence with per-entry settle times
pub type TimedRegisterList = Vec<TimedRegisterEntry>;

/// Burst-coalescing register accessor over a [`RegisterIo`] transport
pub struct RegisterAccess<B> {
    bridge: B,
}

impl<B: RegisterIo> RegisterAccess<B> {
    pub fn new(bridge: B) -> Self {
        Self { bridge }
    }

    pub fn bridge_mut(&mut self) -> &mut B {
        &mut self.bridge
    }

    pub fn read(&mut self, address: u16) -> CoreResult<u16> {
        self.bridge.read_register(address)
    }

    pub fn write(&mut self, address: u16, value: u16) -> CoreResult<()> {
        self.bridge.write_register(address, value)
    }

    pub fn sleep_for(&mut self, duration: Duration) {
        self.bridge.sleep_for(duration);
    }

    /// Read `count` registers starting at `first_address` in one burst
    pub fn read_burst(&mut self, first_address: u16, count: usize) -> CoreResult<Vec<u16>> {
        let mut values = vec![0u16; count];
        self.bridge.read_burst(first_address, &mut values)?;
        Ok(values)
    }

    /// Write consecutive registers starting at `first_address` in one burst
    pub fn write_burst(&mut self, first_address: u16, values: &[u16]) -> CoreResult<()> {
        self.bridge.write_burst(first_address, values)
    }

    /// Read a set of registers, using a single burst when the addresses are
    /// consecutive
    pub fn read_registers(&mut self, addresses: &[u16], values: &mut [u16]) -> CoreResult<()> {
        if addresses.len() != values.len() {
            return Err(CoreError::Logic(
                "address and value slice length mismatch".to_string(),
            ));
        }
        if addresses.is_empty() {
            return Ok(());
        }

        if is_consecutive(addresses) {
            self.bridge.read_burst(addresses[0], values)
        } else {
            for (address, value) in addresses.iter().zip(values.iter_mut()) {
                *value = self.bridge.read_register(*address)?;
            }
            Ok(())
        }
    }

    /// Write a set of registers, using a single burst when the addresses are
    /// consecutive
    pub fn write_registers(&mut self, addresses: &[u16], values: &[u16]) -> CoreResult<()> {
        if addresses.len() != values.len() {
            return Err(CoreError::Logic(
                "address and value slice length mismatch".to_string(),
            ));
        }

        if addresses.len() > 1 && is_consecutive(addresses) {
            self.bridge.write_burst(addresses[0], values)
        } else {
            for (address, value) in addresses.iter().zip(values.iter()) {
                self.bridge.write_register(*address, *value)?;
            }
            Ok(())
        }
    }

    /// Transfer a timed register list.
    ///
    /// Maximal runs of consecutive addresses with zero sleep coalesce into
    /// bursts. A nonzero sleep terminates the current run and is applied
    /// after that run has been flushed.
    pub fn transfer_timed_register_list(&mut self, list: &[TimedRegisterEntry]) -> CoreResult<()> {
        let Some(first) = list.first() else {
            return Ok(());
        };

        let mut first_address = first.address;
        let mut sleep_micros = first.sleep_micros;
        // u32 so that a write to 0xffff followed by a write to 0x0000 is not
        // treated as a pair of consecutive addresses
        let mut next_address = u32::from(first_address);
        let mut batch: Vec<u16> = Vec::new();

        for entry in list {
            if next_address != u32::from(entry.address) || sleep_micros != 0 {
                if !batch.is_empty() {
                    self.bridge.write_burst(first_address, &batch)?;
                    if sleep_micros != 0 {
                        self.bridge
                            .sleep_for(Duration::from_micros(u64::from(sleep_micros)));
                    }
                    batch.clear();
                    first_address = entry.address;
                }
                next_address = u32::from(entry.address) + 1;
            } else {
                next_address += 1;
            }

            batch.push(entry.value);
            sleep_micros = entry.sleep_micros;
        }

        if !batch.is_empty() {
            self.bridge.write_burst(first_address, &batch)?;
            if sleep_micros != 0 {
                self.bridge
                    .sleep_for(Duration::from_micros(u64::from(sleep_micros)));
            }
        }

        Ok(())
    }

    /// Poll a register until it reads `expected`.
    ///
    /// Sleeps `first_sleep` before the first read, then retries up to four
    /// times at `poll_interval`.
    pub fn poll_until(
        &mut self,
        address: u16,
        expected: u16,
        first_sleep: Duration,
        poll_interval: Duration,
    ) -> CoreResult<()> {
        self.bridge.sleep_for(first_sleep);
        if self.bridge.read_register(address)? == expected {
            return Ok(());
        }

        for _ in 0..MAX_POLL_RETRIES {
            debug!(address, "additional sleep in poll_until");
            self.bridge.sleep_for(poll_interval);
            if self.bridge.read_register(address)? == expected {
                return Ok(());
            }
        }

        Err(CoreError::Timeout(format!(
            "register {address:#06x} never read {expected:#06x}"
        )))
    }
}

fn is_consecutive(addresses: &[u16]) -> bool {
    addresses
        .windows(2)
        .all(|pair| pair[1].wrapping_sub(pair[0]) == 1 && pair[1] > pair[0])
}


#[cfg(test)]
mod tests {
    use super::mock::{MockRegisterIo, Transaction};
    use super::*;

    #[test]
    fn test_write_registers_bursts_when_consecutive() {
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        access
            .write_registers(&[0x9800, 0x9801, 0x9802], &[1, 2, 3])
            .expect("write");
        assert_eq!(
            access.bridge_mut().transactions,
            vec![Transaction::WriteBurst(0x9800, vec![1, 2, 3])]
        );
    }

    #[test]
    fn test_write_registers_single_writes_when_scattered() {
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        access
            .write_registers(&[0x9800, 0x9803], &[1, 2])
            .expect("write");
        assert_eq!(
            access.bridge_mut().transactions,
            vec![
                Transaction::Write(0x9800, 1),
                Transaction::Write(0x9803, 2),
            ]
        );
    }

    #[test]
    fn test_length_mismatch_is_a_logic_error() {
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        let result = access.write_registers(&[0x9800], &[1, 2]);
        assert!(matches!(result, Err(CoreError::Logic(_))));
    }

    #[test]
    fn test_address_wraparound_is_not_consecutive() {
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        access
            .write_registers(&[0xffff, 0x0000], &[1, 2])
            .expect("write");
        // 0xffff -> 0x0000 must not coalesce into one burst
        assert_eq!(
            access.bridge_mut().transactions,
            vec![
                Transaction::Write(0xffff, 1),
                Transaction::Write(0x0000, 2),
            ]
        );
    }

    #[test]
    fn test_timed_list_coalesces_runs_and_applies_sleeps() {
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        let list = vec![
            TimedRegisterEntry::new(0xA000, 1),
            TimedRegisterEntry::new(0xA001, 2),
            TimedRegisterEntry::with_sleep(0xA002, 3, 100),
            TimedRegisterEntry::new(0xA003, 4),
            TimedRegisterEntry::new(0xB000, 5),
        ];
        access.transfer_timed_register_list(&list).expect("transfer");
        assert_eq!(
            access.bridge_mut().transactions,
            vec![
                // run up to and including the entry carrying the sleep
                Transaction::WriteBurst(0xA000, vec![1, 2, 3]),
                Transaction::Sleep(Duration::from_micros(100)),
                // consecutive address, but separated by the sleep
                Transaction::WriteBurst(0xA003, vec![4]),
                // discontinuity
                Transaction::WriteBurst(0xB000, vec![5]),
            ]
        );
    }

    #[test]
    fn test_timed_list_empty_is_a_no_op() {
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        access.transfer_timed_register_list(&[]).expect("transfer");
        assert!(access.bridge_mut().transactions.is_empty());
    }

    #[test]
    fn test_poll_until_succeeds_on_first_read() {
        let mut access = RegisterAccess::new(MockRegisterIo::default().with_register(0xB0A0, 1));
        access
            .poll_until(
                0xB0A0,
                1,
                Duration::from_micros(150),
                Duration::from_millis(10),
            )
            .expect("poll");
        assert_eq!(
            access.bridge_mut().transactions,
            vec![
                Transaction::Sleep(Duration::from_micros(150)),
                Transaction::Read(0xB0A0),
            ]
        );
    }

    #[test]
    fn test_poll_until_retries_then_succeeds() {
        let mut io = MockRegisterIo::default();
        io.script_reads(0xB0A0, &[0, 0, 1]);
        let mut access = RegisterAccess::new(io);
        access
            .poll_until(
                0xB0A0,
                1,
                Duration::from_micros(150),
                Duration::from_millis(10),
            )
            .expect("poll");
        let reads = access
            .bridge_mut()
            .transactions
            .iter()
            .filter(|t| matches!(t, Transaction::Read(_)))
            .count();
        assert_eq!(reads, 3);
    }

    #[test]
    fn test_poll_until_times_out_after_four_retries() {
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        let result = access.poll_until(
            0xB0A0,
            1,
            Duration::from_micros(150),
            Duration::from_millis(10),
        );
        assert!(matches!(result, Err(CoreError::Timeout(_))));
        let reads = access
            .bridge_mut()
            .transactions
            .iter()
            .filter(|t| matches!(t, Transaction::Read(_)))
            .count();
        // one initial read plus four retries
        assert_eq!(reads, 5);
    }
}
