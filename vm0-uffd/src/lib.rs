mod error;
mod handler;
mod handshake;
mod region;

pub use error::{UffdError, UffdResult};
pub use handler::{FaultMode, PreloadedHandler, UffdHandler, uffd_available};
pub use handshake::accept_handshake;
pub use region::{Extent, MemoryRegion, scan_extents};
