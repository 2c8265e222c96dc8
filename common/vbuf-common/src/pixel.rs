//! Guest pixel encodings

use bincode::{Decode, Encode};
use std::fmt::{Display, Formatter};

/// Bits per pixel of a guest image, as encoded in the console's 2-bit size field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub enum PixelSize {
    Bits4,
    Bits8,
    Bits16,
    Bits32,
}

impl PixelSize {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Bits4,
            1 => Self::Bits8,
            2 => Self::Bits16,
            3 => Self::Bits32,
            _ => unreachable!("value & 3 is always <= 3"),
        }
    }

    #[must_use]
    pub fn to_bits(self) -> u8 {
        match self {
            Self::Bits4 => 0,
            Self::Bits8 => 1,
            Self::Bits16 => 2,
            Self::Bits32 => 3,
        }
    }

    /// Number of bytes occupied by `pixels` pixels, saturating at `u32::MAX`.
    #[inline]
    #[must_use]
    pub fn bytes_for(self, pixels: u32) -> u32 {
        let bytes = (u64::from(pixels) << self.to_bits()) >> 1;
        u32::try_from(bytes).unwrap_or(u32::MAX)
    }

    /// Bytes per pixel; 0 for 4-bit images.
    #[inline]
    #[must_use]
    pub fn bytes_per_pixel(self) -> u32 {
        self.bytes_for(1)
    }
}

impl Display for PixelSize {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bits4 => write!(f, "4bpp"),
            Self::Bits8 => write!(f, "8bpp"),
            Self::Bits16 => write!(f, "16bpp"),
            Self::Bits32 => write!(f, "32bpp"),
        }
    }
}

/// Guest image format field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Encode, Decode)]
pub enum ImageFormat {
    #[default]
    Rgba,
    Yuv,
    ColorIndexed,
    IntensityAlpha,
    Intensity,
}

impl ImageFormat {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits & 7 {
            0 => Some(Self::Rgba),
            1 => Some(Self::Yuv),
            2 => Some(Self::ColorIndexed),
            3 => Some(Self::IntensityAlpha),
            4 => Some(Self::Intensity),
            _ => None,
        }
    }
}

/// 8-bit-per-channel RGBA color in host byte order.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, bytemuck::Pod, bytemuck::Zeroable, Encode, Decode)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const TRANSPARENT: Self = Self::rgba(0, 0, 0, 0);

    pub const WHITE: Self = Self::rgba(255, 255, 255, 255);

    #[must_use]
    #[inline]
    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Self { r, g, b, a }
    }

    /// Decode a 5-5-5-1 guest pixel, expanding each channel by shifting left 3.
    #[must_use]
    #[inline]
    pub fn from_rgba5551(value: u16) -> Self {
        let r = ((value >> 11) & 0x1F) as u8;
        let g = ((value >> 6) & 0x1F) as u8;
        let b = ((value >> 1) & 0x1F) as u8;
        let a = if value & 1 != 0 { 255 } else { 0 };
        Self::rgba(r << 3, g << 3, b << 3, a)
    }

    /// Decode an 8-8-8-8 guest pixel (red in the most significant byte).
    #[must_use]
    #[inline]
    pub fn from_rgba8888(value: u32) -> Self {
        let [r, g, b, a] = value.to_be_bytes();
        Self::rgba(r, g, b, a)
    }

    /// Normalized channels, as clear colors are specified to host graphics APIs.
    #[must_use]
    pub fn to_f32(self) -> [f32; 4] {
        [self.r, self.g, self.b, self.a].map(|c| f32::from(c) / 255.0)
    }
}

impl Default for Color {
    #[inline]
    fn default() -> Self {
        Self::TRANSPARENT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn byte_counts() {
        assert_eq!(50, PixelSize::Bits4.bytes_for(100));
        assert_eq!(100, PixelSize::Bits8.bytes_for(100));
        assert_eq!(200, PixelSize::Bits16.bytes_for(100));
        assert_eq!(400, PixelSize::Bits32.bytes_for(100));
        assert_eq!(0, PixelSize::Bits4.bytes_per_pixel());
        assert_eq!(4, PixelSize::Bits32.bytes_per_pixel());
    }

    #[test]
    fn rgba5551_expansion() {
        assert_eq!(Color::rgba(0xF8, 0xF8, 0xF8, 255), Color::from_rgba5551(0xFFFF));
        assert_eq!(Color::rgba(0xF8, 0, 0, 0), Color::from_rgba5551(0xF800));
        assert_eq!(Color::rgba(0, 0, 0x08, 255), Color::from_rgba5551(0x0003));
    }
}
