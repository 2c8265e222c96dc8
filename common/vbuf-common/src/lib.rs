//! Types shared between the frame-buffer cache and the code that owns guest memory

pub mod guest;
pub mod pixel;

pub use guest::{GuestMemory, GuestMemoryError};
pub use pixel::{Color, ImageFormat, PixelSize};
