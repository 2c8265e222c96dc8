//! Conversions between host surface pixels and guest pixel encodings

use vbuf_common::Color;

/// Host RGBA8 to guest 32-bit RGBA.
#[inline]
#[must_use]
pub fn rgba_to_guest32(color: Color) -> u32 {
    u32::from_be_bytes([color.r, color.g, color.b, color.a])
}

/// Host RGBA8 to guest 16-bit RGBA5551. Any nonzero alpha sets the coverage bit.
#[inline]
#[must_use]
pub fn rgba_to_guest16(color: Color) -> u16 {
    (u16::from(color.r >> 3) << 11)
        | (u16::from(color.g >> 3) << 6)
        | (u16::from(color.b >> 3) << 1)
        | u16::from(color.a != 0)
}

/// Guest 16-bit RGBA5551 to host RGBA8.
///
/// When `opaque` is false, alpha is only set for pixels that have the coverage bit set and are
/// not black, so that black pixels written by the guest blend away when drawn over a buffer.
#[inline]
#[must_use]
pub fn guest16_to_rgba(value: u16, opaque: bool) -> Color {
    let color = Color::from_rgba5551(value);
    let alpha = if opaque || (value & 1 != 0 && value & 0xFFFE != 0) { 0xFF } else { 0x00 };
    Color { a: alpha, ..color }
}

/// Guest 32-bit RGBA8888 to host RGBA8.
#[inline]
#[must_use]
pub fn guest32_to_rgba(value: u32, opaque: bool) -> Color {
    let color = Color::from_rgba8888(value);
    let alpha = if opaque {
        0xFF
    } else if value & 0xFFFF_FF00 != 0 {
        color.a
    } else {
        0x00
    };
    Color { a: alpha, ..color }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn guest32_round_trip_is_lossless() {
        for value in [0x1234_5678_u32, 0xFFFF_FFFF, 0x80FF_0001, 0x0000_0100] {
            assert_eq!(rgba_to_guest32(guest32_to_rgba(value, false)), value);
        }
    }

    #[test]
    fn guest16_round_trip_keeps_top_five_bits() {
        let color = Color::rgba(0xAB, 0x47, 0x12, 0xFF);
        let encoded = rgba_to_guest16(color);
        assert_eq!(encoded & 1, 1);

        let decoded = guest16_to_rgba(encoded, true);
        assert_eq!(decoded, Color::rgba(0xA8, 0x40, 0x10, 0xFF));
    }

    #[test]
    fn black_is_transparent_unless_opaque() {
        assert_eq!(guest16_to_rgba(0x0001, false).a, 0);
        assert_eq!(guest16_to_rgba(0x0001, true).a, 0xFF);
        assert_eq!(guest32_to_rgba(0x0000_00FF, false).a, 0);
        assert_eq!(guest32_to_rgba(0x0100_0080, false).a, 0x80);
    }
}
