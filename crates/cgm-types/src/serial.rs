//! Libre sensor serial number derivation.
//!
//! The printed serial number is the sensor family digit followed by the
//! first 48 bits of the reversed NFC UID, encoded five bits at a time with
//! a 32-symbol alphabet that omits `B`, `I`, `O` and `S`.

use crate::types::LibreFamily;

const ALPHABET: &[u8; 32] = b"0123456789ACDEFGHJKLMNPQRTUVWXYZ";

/// Derive the serial number from an 8-byte sensor UID.
///
/// ```
/// use cgm_types::{LibreFamily, serial::libre_serial_number};
///
/// let uid = [0x5e, 0x90, 0x25, 0x00, 0x00, 0xa0, 0x07, 0xe0];
/// assert_eq!(libre_serial_number(&uid, LibreFamily::Libre1), "0M00009DHCR");
/// ```
#[must_use]
pub fn libre_serial_number(uid: &[u8; 8], family: LibreFamily) -> String {
    let b = [uid[5], uid[4], uid[3], uid[2], uid[1], uid[0]];
    let groups = [
        b[0] >> 3,
        (b[0] << 2) | (b[1] >> 6),
        b[1] >> 1,
        (b[1] << 4) | (b[2] >> 4),
        (b[2] << 1) | (b[3] >> 7),
        b[3] >> 2,
        (b[3] << 3) | (b[4] >> 5),
        b[4],
        b[5] >> 3,
        b[5] << 2,
    ];

    let mut serial = String::with_capacity(11);
    serial.push(family.serial_prefix());
    for g in groups {
        serial.push(ALPHABET[usize::from(g & 0x1F)] as char);
    }
    serial
}

/// Derive the serial number from a slice, if it holds exactly eight bytes.
#[must_use]
pub fn serial_from_slice(uid: &[u8], family: LibreFamily) -> Option<String> {
    let uid: &[u8; 8] = uid.try_into().ok()?;
    Some(libre_serial_number(uid, family))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_serial() {
        let uid = [0x5e, 0x90, 0x25, 0x00, 0x00, 0xa0, 0x07, 0xe0];
        assert_eq!(libre_serial_number(&uid, LibreFamily::Libre1), "0M00009DHCR");
    }

    #[test]
    fn test_family_prefix() {
        let uid = [0x5e, 0x90, 0x25, 0x00, 0x00, 0xa0, 0x07, 0xe0];
        assert!(libre_serial_number(&uid, LibreFamily::LibreProH).starts_with('1'));
        assert!(libre_serial_number(&uid, LibreFamily::Libre2).starts_with('3'));
    }

    #[test]
    fn test_trailing_bytes_are_ignored() {
        let a = [1, 2, 3, 4, 5, 6, 0x00, 0x00];
        let b = [1, 2, 3, 4, 5, 6, 0xa0, 0x07];
        assert_eq!(
            libre_serial_number(&a, LibreFamily::Libre1),
            libre_serial_number(&b, LibreFamily::Libre1)
        );
    }

    #[test]
    fn test_slice_length_checked() {
        assert!(serial_from_slice(&[0u8; 7], LibreFamily::Libre1).is_none());
        assert_eq!(
            serial_from_slice(&[0u8; 8], LibreFamily::Libre1).as_deref(),
            Some("00000000000")
        );
    }
}
