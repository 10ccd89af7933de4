//! Bluetooth UUIDs for supported glucose transmitters.
//!
//! These are fixed by the transmitter firmware and must match exactly.

use uuid::{Uuid, uuid};

// --- Blucon ---

/// Blucon primary service.
pub const BLUCON_SERVICE: Uuid = uuid!("436a62c0-082e-4ce8-a08b-01d81f195b24");

/// Blucon notify characteristic (transmitter to host).
pub const BLUCON_RECEIVE: Uuid = uuid!("436a0c82-082e-4ce8-a08b-01d81f195b24");

/// Blucon write characteristic (host to transmitter).
pub const BLUCON_WRITE: Uuid = uuid!("436aa6e9-082e-4ce8-a08b-01d81f195b24");

// --- MiaoMiao, Bubble and Atom (Nordic UART service) ---

/// MiaoMiao primary service.
pub const MIAOMIAO_SERVICE: Uuid = uuid!("6e400001-b5a3-f393-e0a9-e50e24dcca9e");

/// MiaoMiao notify characteristic.
pub const MIAOMIAO_RECEIVE: Uuid = uuid!("6e400003-b5a3-f393-e0a9-e50e24dcca9e");

/// MiaoMiao write characteristic.
pub const MIAOMIAO_WRITE: Uuid = uuid!("6e400002-b5a3-f393-e0a9-e50e24dcca9e");

/// Bubble and Atom primary service.
pub const BUBBLE_SERVICE: Uuid = MIAOMIAO_SERVICE;

/// Bubble and Atom notify characteristic.
pub const BUBBLE_RECEIVE: Uuid = MIAOMIAO_RECEIVE;

/// Bubble and Atom write characteristic.
pub const BUBBLE_WRITE: Uuid = MIAOMIAO_WRITE;

// --- Dexcom ---

/// Service UUID advertised by Dexcom G5/G6/G7 transmitters (16-bit 0xFEBC).
pub const DEXCOM_ADVERTISEMENT: Uuid = uuid!("0000febc-0000-1000-8000-00805f9b34fb");

/// Dexcom CGM service.
pub const DEXCOM_SERVICE: Uuid = uuid!("f8083532-849e-531c-c594-30f1f86a4ea5");

/// Communication characteristic.
pub const DEXCOM_COMMUNICATION: Uuid = uuid!("f8083533-849e-531c-c594-30f1f86a4ea5");

/// Control characteristic; glucose messages arrive here as notifications.
pub const DEXCOM_CONTROL: Uuid = uuid!("f8083534-849e-531c-c594-30f1f86a4ea5");

/// Authentication characteristic.
pub const DEXCOM_AUTHENTICATION: Uuid = uuid!("f8083535-849e-531c-c594-30f1f86a4ea5");

/// Backfill characteristic.
pub const DEXCOM_BACKFILL: Uuid = uuid!("f8083536-849e-531c-c594-30f1f86a4ea5");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dexcom_characteristics_share_base() {
        let base = &DEXCOM_SERVICE.as_bytes()[4..];
        for c in [
            DEXCOM_COMMUNICATION,
            DEXCOM_CONTROL,
            DEXCOM_AUTHENTICATION,
            DEXCOM_BACKFILL,
        ] {
            assert_eq!(&c.as_bytes()[4..], base);
        }
    }

    #[test]
    fn test_uart_bridges_share_layout() {
        assert_eq!(BUBBLE_SERVICE, MIAOMIAO_SERVICE);
        assert_eq!(BUBBLE_RECEIVE, MIAOMIAO_RECEIVE);
        assert_eq!(BUBBLE_WRITE, MIAOMIAO_WRITE);
    }

    #[test]
    fn test_uuids_are_distinct() {
        let all = [
            BLUCON_SERVICE,
            BLUCON_RECEIVE,
            BLUCON_WRITE,
            MIAOMIAO_SERVICE,
            MIAOMIAO_RECEIVE,
            MIAOMIAO_WRITE,
            DEXCOM_SERVICE,
            DEXCOM_CONTROL,
            DEXCOM_AUTHENTICATION,
            DEXCOM_BACKFILL,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
