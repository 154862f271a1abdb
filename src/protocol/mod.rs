pub mod framing;
pub mod message;

// Re-exports for easier access from crate::protocol::{...}
pub use framing::{Frame, FrameReader, encode_control, encode_header};
pub use message::{ControlMessage, TransferHeader};

/// Default TCP port for peer sessions.
pub const DEFAULT_PORT: u16 = 5000;

/// Frame terminator on the wire. Payloads are byte-stuffed so this sequence
/// can never legally occur inside a frame body.
pub const DELIMITER: &[u8] = b"<<END>>";
