//! Fault injection hooks for exercising failure paths deterministically.
//!
//! A test harness arms a hook, performs one operation, and observes the
//! failure the engine reports. Every hook is one-shot: arming affects exactly
//! the next send/receive/encode it applies to, then clears itself. Unarmed
//! hooks change nothing about encode/decode or transport behavior.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Shared switchboard of one-shot fault hooks.
///
/// Thread-safe so a harness task can arm hooks while the session is in use
/// elsewhere.
#[derive(Debug, Default)]
pub struct FaultInjector {
    drop_connection: AtomicBool,
    corrupt_payload: AtomicBool,
    address_override: Mutex<Option<u16>>,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm: the next send or receive fails with `ConnectionLost` and the
    /// socket is physically closed.
    pub fn simulate_connection_loss(&self) {
        self.drop_connection.store(true, Ordering::SeqCst);
    }

    /// Arm: the next outgoing frame has its declared Length field corrupted
    /// after encoding, so the peer (or a loopback decode) rejects it.
    pub fn force_invalid_payload(&self) {
        self.corrupt_payload.store(true, Ordering::SeqCst);
    }

    /// Arm: the next encoded request carries `address` in place of the
    /// address the caller supplied, for negative testing against a live
    /// device.
    pub fn set_invalid_register_address(&self, address: u16) {
        if let Ok(mut slot) = self.address_override.lock() {
            *slot = Some(address);
        }
    }

    /// Consume the connection-loss arm, if set.
    pub(crate) fn take_connection_loss(&self) -> bool {
        self.drop_connection.swap(false, Ordering::SeqCst)
    }

    /// Consume the payload-corruption arm and apply it to an encoded frame.
    pub(crate) fn corrupt_frame(&self, frame: &mut [u8]) {
        if self.corrupt_payload.swap(false, Ordering::SeqCst) {
            // Flip the low byte of the MBAP Length field; the declared
            // length no longer matches the bytes on the wire.
            if let Some(byte) = frame.get_mut(5) {
                *byte = byte.wrapping_add(1);
            }
        }
    }

    /// Consume the address override, if set.
    pub(crate) fn take_address_override(&self) -> Option<u16> {
        self.address_override.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hooks_are_one_shot() {
        let faults = FaultInjector::new();
        assert!(!faults.take_connection_loss());

        faults.simulate_connection_loss();
        assert!(faults.take_connection_loss());
        assert!(!faults.take_connection_loss());

        faults.set_invalid_register_address(0xFFFF);
        assert_eq!(faults.take_address_override(), Some(0xFFFF));
        assert_eq!(faults.take_address_override(), None);
    }

    #[test]
    fn test_corrupt_frame_touches_length_field_once() {
        let faults = FaultInjector::new();
        let original = vec![0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];

        let mut frame = original.clone();
        faults.corrupt_frame(&mut frame);
        assert_eq!(frame, original);

        faults.force_invalid_payload();
        faults.corrupt_frame(&mut frame);
        assert_eq!(frame[5], 0x07);

        // Disarmed again after one use.
        let mut next = original.clone();
        faults.corrupt_frame(&mut next);
        assert_eq!(next, original);
    }
}
