pub mod codec;
pub mod message;

pub use codec::{encode, FrameDecoder, MAX_FRAME_BYTES};
pub use message::{Message, Value};

/// Service type advertised over discovery beacons. Publishers announce it,
/// subscribers browse for exactly this string.
pub const SERVICE_TYPE: &str = "dx-tune";

/// Well-known TCP port parameter servers listen on.
pub const DEFAULT_PORT: u16 = 47800;

/// UDP port discovery beacons are exchanged on.
pub const DISCOVERY_PORT: u16 = 47801;
