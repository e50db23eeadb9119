// SPDX-License-Identifier: GPL-3.0-only

//! Shadow register cache and masked writes
//!
//! Some registers are write-only or expensive to read back, so the host
//! keeps a shadow of the last value it knows the device holds. Masked writes
//! read the shadow (or fall back to the register's reset value), merge the
//! masked bits and write the full word.
//!
//! Entries are invalidated whenever the device may have changed a value
//! autonomously and re-confirmed only after a successful write. Deferred
//! writes (values staged for an indirect transfer) remove their entries
//! until [`ShadowRegisters::commit_or_rollback`] decides whether the staged
//! values reached the device.

use crate::errors::{CoreError, CoreResult};
use crate::registers::{RegisterAccess, RegisterIo};
use std::collections::HashMap;

/// Last-known device values, keyed by register address
#[derive(Debug, Default)]
pub struct ShadowRegisters {
    known: HashMap<u16, u16>,
    pending: Option<HashMap<u16, u16>>,
}

impl ShadowRegisters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last value confirmed written to `address`, if any
    pub fn known_value(&self, address: u16) -> Option<u16> {
        self.known.get(&address).copied()
    }

    /// Forget the cached value; the device may have changed it autonomously
    pub fn invalidate(&mut self, address: u16) {
        self.known.remove(&address);
    }

    /// Forget everything, e.g. after a reset or power cycle
    pub fn invalidate_all(&mut self) {
        self.known.clear();
        self.pending = None;
    }

    /// Write and, on success, record the value as known
    pub fn track_and_write<B: RegisterIo>(
        &mut self,
        access: &mut RegisterAccess<B>,
        address: u16,
        value: u16,
    ) -> CoreResult<()> {
        access.write(address, value)?;
        self.known.insert(address, value);
        Ok(())
    }

    /// Merge `value & mask` into the register, keeping the other bits.
    ///
    /// The current value comes from the shadow when available and from
    /// `reset_value` otherwise. The full word is written and the shadow
    /// updated on success.
    pub fn write_masked<B: RegisterIo>(
        &mut self,
        access: &mut RegisterAccess<B>,
        address: u16,
        mask: u16,
        value: u16,
        reset_value: u16,
    ) -> CoreResult<()> {
        let current = self.known_value(address).unwrap_or(reset_value);
        let merged = (current & !mask) | (value & mask);
        self.track_and_write(access, address, merged)
    }

    /// Stage a value for an indirect or deferred transfer.
    ///
    /// The address is removed from the shadow immediately: until the
    /// transfer's outcome is known, the device value is undefined from the
    /// host's point of view.
    pub fn track_shadowed(&mut self, address: u16, value: u16) {
        self.known.remove(&address);
        self.pending
            .get_or_insert_with(HashMap::new)
            .insert(address, value);
    }

    /// Resolve staged values: merge them into the shadow if the transfer
    /// succeeded, discard them otherwise (leaving the addresses unknown).
    pub fn commit_or_rollback(&mut self, success: bool) -> CoreResult<()> {
        let Some(pending) = self.pending.take() else {
            return Err(CoreError::Logic(
                "commit_or_rollback without staged writes".to_string(),
            ));
        };
        if success {
            self.known.extend(pending);
        }
        Ok(())
    }

    /// Whether a deferred transfer is currently staged
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::mock::{MockRegisterIo, Transaction};

    #[test]
    fn test_masked_write_uses_reset_value_when_unknown() {
        let mut shadow = ShadowRegisters::new();
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        shadow
            .write_masked(&mut access, 0xB300, 0x00F0, 0x0050, 0x1234)
            .expect("write");
        // (0x1234 & !0x00F0) | (0x0050 & 0x00F0) = 0x1204 | 0x0050
        assert_eq!(
            access.bridge_mut().transactions,
            vec![Transaction::Write(0xB300, 0x1254)]
        );
        assert_eq!(shadow.known_value(0xB300), Some(0x1254));
    }

    #[test]
    fn test_masked_write_uses_shadow_when_known() {
        let mut shadow = ShadowRegisters::new();
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        shadow
            .track_and_write(&mut access, 0xB300, 0xFF00)
            .expect("write");
        shadow
            .write_masked(&mut access, 0xB300, 0x000F, 0x0007, 0x0000)
            .expect("write");
        assert_eq!(shadow.known_value(0xB300), Some(0xFF07));
    }

    #[test]
    fn test_invalidate_falls_back_to_reset_value() {
        let mut shadow = ShadowRegisters::new();
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        shadow
            .track_and_write(&mut access, 0xB300, 0xFFFF)
            .expect("write");
        shadow.invalidate(0xB300);
        shadow
            .write_masked(&mut access, 0xB300, 0x000F, 0x0003, 0x0100)
            .expect("write");
        assert_eq!(shadow.known_value(0xB300), Some(0x0103));
    }

    #[test]
    fn test_deferred_commit_merges_pending() {
        let mut shadow = ShadowRegisters::new();
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        shadow
            .track_and_write(&mut access, 0xB300, 0x0001)
            .expect("write");

        shadow.track_shadowed(0xB300, 0x0002);
        // mid-transfer the value is unknown
        assert_eq!(shadow.known_value(0xB300), None);
        assert!(shadow.has_pending());

        shadow.commit_or_rollback(true).expect("commit");
        assert_eq!(shadow.known_value(0xB300), Some(0x0002));
        assert!(!shadow.has_pending());
    }

    #[test]
    fn test_deferred_rollback_leaves_addresses_unknown() {
        let mut shadow = ShadowRegisters::new();
        let mut access = RegisterAccess::new(MockRegisterIo::default());
        shadow
            .track_and_write(&mut access, 0xB300, 0x0001)
            .expect("write");

        shadow.track_shadowed(0xB300, 0x0002);
        shadow.commit_or_rollback(false).expect("rollback");
        assert_eq!(shadow.known_value(0xB300), None);
    }

    #[test]
    fn test_commit_without_transaction_is_a_logic_error() {
        let mut shadow = ShadowRegisters::new();
        assert!(matches!(
            shadow.commit_or_rollback(true),
            Err(CoreError::Logic(_))
        ));
    }
}
