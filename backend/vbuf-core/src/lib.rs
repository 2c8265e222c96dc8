//! Host-side cache of guest frame buffers
//!
//! Guest color images are rendered into host surfaces ("virtual buffers") keyed by their guest
//! memory range. The cache decides when a cached buffer is still valid, and keeps host surfaces
//! and guest memory in sync in both directions.

pub mod api;
pub mod buffer;
pub mod depth;
pub mod host;
pub mod registry;
pub mod sync;
pub mod transcode;
pub mod validity;

pub use api::{FrameBufferError, FrameBufferResult, FrameBufferSession};
pub use buffer::{BufferId, BufferRequest, VirtualBuffer};
pub use depth::{DepthBuffer, DepthBufferId, DepthBufferList};
pub use host::{GraphicsApi, GraphicsError, Host, RenderState, TextureCache, VideoState};
pub use registry::{BufferRegistry, FrameBufferInfo};
pub use validity::{ValidityOracle, ValidityStrategy};
