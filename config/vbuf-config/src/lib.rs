use bincode::{Decode, Encode};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CopyToGuestMode {
    Disabled,
    /// Read back and write to guest memory within the same call
    Sync,
    /// Read back this frame's pixels and write the previous frame's pixels to guest memory
    #[default]
    DoubleBuffered,
}

impl CopyToGuestMode {
    #[must_use]
    pub fn is_enabled(self) -> bool {
        self != Self::Disabled
    }
}

impl Display for CopyToGuestMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "Disabled"),
            Self::Sync => write!(f, "Synchronous"),
            Self::DoubleBuffered => write!(f, "Double buffered"),
        }
    }
}

/// Compatibility switches for games that need special handling of specific buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct GameHacks {
    /// Score overlay drawn by the CPU into a fixed buffer (international releases)
    pub scoreboard: bool,
    /// Score overlay drawn by the CPU into a fixed buffer (Japanese release)
    pub scoreboard_japan: bool,
    /// Games that only test whether a display-sized buffer was written; fill it with white
    /// instead of reading back
    pub subscreen: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameBufferConfig {
    pub enabled: bool,
    pub copy_to_guest: CopyToGuestMode,
    pub copy_depth_to_guest: bool,
    pub copy_from_guest: bool,
    pub copy_auxiliary_to_guest: bool,
    /// 0 to follow the display's oversampling factors, otherwise a fixed factor
    pub native_resolution_factor: u32,
    /// MSAA sample count, or 0 to disable multisampling
    pub multisampling: u32,
    pub hacks: GameHacks,
}

impl FrameBufferConfig {
    #[must_use]
    pub fn multisampling_enabled(&self) -> bool {
        self.multisampling != 0
    }

    /// Oversampling factors to use for a newly created buffer.
    #[must_use]
    pub fn buffer_scale(&self, auxiliary: bool, display_scale: (f32, f32)) -> (f32, f32) {
        if auxiliary && self.copy_auxiliary_to_guest {
            (1.0, 1.0)
        } else if self.native_resolution_factor != 0 {
            let factor = self.native_resolution_factor as f32;
            (factor, factor)
        } else {
            display_scale
        }
    }
}

impl Default for FrameBufferConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            copy_to_guest: CopyToGuestMode::default(),
            copy_depth_to_guest: true,
            copy_from_guest: true,
            copy_auxiliary_to_guest: false,
            native_resolution_factor: 0,
            multisampling: 0,
            hacks: GameHacks::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn buffer_scale_precedence() {
        let mut config = FrameBufferConfig::default();
        assert_eq!((2.5, 2.0), config.buffer_scale(true, (2.5, 2.0)));

        config.native_resolution_factor = 3;
        assert_eq!((3.0, 3.0), config.buffer_scale(false, (2.5, 2.0)));

        config.copy_auxiliary_to_guest = true;
        assert_eq!((1.0, 1.0), config.buffer_scale(true, (2.5, 2.0)));
        assert_eq!((3.0, 3.0), config.buffer_scale(false, (2.5, 2.0)));
    }
}
