//! CRC-16 verification of Libre sensor memory images.
//!
//! A Libre FRAM image is split into three regions (header, body, footer).
//! Each region stores its own CRC in its first two bytes, computed over the
//! rest of the region with the reflected CCITT polynomial (0x8408), seeded
//! with `0xFFFF`, then bit-reversed and stored big-endian.
//!
//! | Layout     | Header    | Body       | Footer      |
//! |------------|-----------|------------|-------------|
//! | Libre 1    | `0..24`   | `24..320`  | `320..344`  |
//! | Libre Pro/H| `0..40`   | `40..72`   | `72..176`   |
//!
//! All ranges are relative to a caller-supplied header offset, because some
//! transmitters (MiaoMiao) prepend their own header to the image.
//!
//! Dexcom G5/G6 control messages use a different CRC: CCITT XModem
//! (polynomial 0x1021, seed 0, not reflected) appended little-endian.

use core::ops::Range;

/// Size of a Libre 1 sensor memory image.
pub const LIBRE1_IMAGE_LEN: usize = 344;

const POLY: u16 = 0x8408;

const TABLE: [u16; 256] = build_table();

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ POLY } else { crc >> 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Memory layout used to locate the CRC regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrcLayout {
    /// Libre 1 / Libre 2 style image.
    #[default]
    Libre1,
    /// Libre Pro / H image.
    LibreProH,
}

impl CrcLayout {
    /// Header, body and footer ranges relative to offset 0.
    #[must_use]
    pub fn regions(&self) -> [(&'static str, Range<usize>); 3] {
        match self {
            CrcLayout::Libre1 => [
                ("header", 0..24),
                ("body", 24..320),
                ("footer", 320..344),
            ],
            CrcLayout::LibreProH => [
                ("header", 0..40),
                ("body", 40..72),
                ("footer", 72..176),
            ],
        }
    }

    fn end(&self) -> usize {
        self.regions()[2].1.end
    }
}

/// Compute the Libre CRC-16 of `bytes`.
///
/// ```
/// use cgm_types::crc::crc16;
///
/// // An empty message leaves the 0xFFFF seed untouched.
/// assert_eq!(crc16(&[]), 0xFFFF);
/// ```
#[must_use]
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in bytes {
        crc = (crc >> 8) ^ TABLE[((crc ^ u16::from(b)) & 0xFF) as usize];
    }
    crc.reverse_bits().swap_bytes()
}

/// CRC-16/XModem as used on the Dexcom control characteristic.
///
/// ```
/// use cgm_types::crc::crc16_xmodem;
///
/// assert_eq!(crc16_xmodem(b"123456789"), 0x31C3);
/// ```
#[must_use]
pub fn crc16_xmodem(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |crc, &b| {
        (0..8).fold(crc ^ (u16::from(b) << 8), |c, _| {
            if c & 0x8000 != 0 { (c << 1) ^ 0x1021 } else { c << 1 }
        })
    })
}

/// Append the XModem CRC of `message` to it, low byte first.
pub fn append_crc16_xmodem(message: &mut Vec<u8>) {
    let crc = crc16_xmodem(message);
    message.extend_from_slice(&crc.to_le_bytes());
}

/// Check a single region whose first two bytes carry its CRC.
#[must_use]
pub fn region_is_valid(block: &[u8]) -> bool {
    if block.len() < 2 {
        return false;
    }
    let enclosed = (u16::from(block[0]) << 8) | u16::from(block[1]);
    crc16(&block[2..]) == enclosed
}

/// Rewrite the first two bytes of `block` with the CRC of the remainder.
///
/// Used to build fixtures and to repair images after editing them.
pub fn with_valid_crc(block: &mut [u8]) {
    if block.len() < 2 {
        return;
    }
    let crc = crc16(&block[2..]);
    block[0] = (crc >> 8) as u8;
    block[1] = (crc & 0xFF) as u8;
}

/// Find the first region of the image that fails its CRC.
///
/// Returns `Some("short")` when the buffer cannot hold a full image.
#[must_use]
pub fn first_invalid_region(
    buffer: &[u8],
    header_offset: usize,
    layout: CrcLayout,
) -> Option<&'static str> {
    if buffer.len() < header_offset + layout.end() {
        return Some("short");
    }
    layout.regions().into_iter().find_map(|(name, range)| {
        let block = &buffer[header_offset + range.start..header_offset + range.end];
        (!region_is_valid(block)).then_some(name)
    })
}

/// Verify all three CRC regions of a Libre 1 image starting at `header_offset`.
///
/// A buffer too short to contain the image fails verification.
#[must_use]
pub fn verify_crc16(buffer: &[u8], header_offset: usize) -> bool {
    first_invalid_region(buffer, header_offset, CrcLayout::Libre1).is_none()
}

/// Recompute the CRCs of all three regions in place.
pub fn repair_image(buffer: &mut [u8], header_offset: usize, layout: CrcLayout) {
    if buffer.len() < header_offset + layout.end() {
        return;
    }
    for (_, range) in layout.regions() {
        with_valid_crc(&mut buffer[header_offset + range.start..header_offset + range.end]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_reflected_ccitt() {
        assert_eq!(TABLE[0], 0);
        assert_eq!(TABLE[1], 4489);
        assert_eq!(TABLE[2], 8978);
        assert_eq!(TABLE[255], 3960);
    }

    #[test]
    fn test_xmodem_control_suffix() {
        let mut time_request = vec![0x24];
        append_crc16_xmodem(&mut time_request);
        assert_eq!(time_request, vec![0x24, 0xe6, 0x64]);
        assert_eq!(crc16_xmodem(&[]), 0);
    }

    #[test]
    fn test_repaired_image_verifies() {
        let mut image: Vec<u8> = (0..LIBRE1_IMAGE_LEN).map(|i| (i * 7 % 251) as u8).collect();
        assert!(!verify_crc16(&image, 0));
        repair_image(&mut image, 0, CrcLayout::Libre1);
        assert!(verify_crc16(&image, 0));
    }

    #[test]
    fn test_header_offset_is_honoured() {
        let mut buf = vec![0xAAu8; 18];
        let mut image = vec![0x11u8; LIBRE1_IMAGE_LEN];
        repair_image(&mut image, 0, CrcLayout::Libre1);
        buf.extend_from_slice(&image);
        assert!(verify_crc16(&buf, 18));
        assert!(!verify_crc16(&buf, 0));
    }

    #[test]
    fn test_short_buffer_fails() {
        let image = vec![0u8; LIBRE1_IMAGE_LEN - 1];
        assert!(!verify_crc16(&image, 0));
        assert_eq!(first_invalid_region(&image, 0, CrcLayout::Libre1), Some("short"));
    }

    #[test]
    fn test_reports_failing_region() {
        let mut image = vec![0x42u8; LIBRE1_IMAGE_LEN];
        repair_image(&mut image, 0, CrcLayout::Libre1);
        image[100] ^= 0x01;
        assert_eq!(first_invalid_region(&image, 0, CrcLayout::Libre1), Some("body"));
    }

    #[test]
    fn test_pro_h_layout() {
        let mut image = vec![0x05u8; LIBRE1_IMAGE_LEN];
        repair_image(&mut image, 0, CrcLayout::LibreProH);
        assert_eq!(first_invalid_region(&image, 0, CrcLayout::LibreProH), None);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn single_bit_flip_is_detected(
                seed in proptest::collection::vec(any::<u8>(), LIBRE1_IMAGE_LEN),
                index in 0usize..LIBRE1_IMAGE_LEN,
                bit in 0u8..8,
            ) {
                let mut image = seed;
                repair_image(&mut image, 0, CrcLayout::Libre1);
                prop_assert!(verify_crc16(&image, 0));
                image[index] ^= 1 << bit;
                prop_assert!(!verify_crc16(&image, 0));
            }

            #[test]
            fn never_panics_on_arbitrary_input(
                data in proptest::collection::vec(any::<u8>(), 0..400),
                offset in 0usize..32,
            ) {
                let _ = verify_crc16(&data, offset);
            }
        }
    }
}
