//! Framing of [`NetworkPacket`](crate::NetworkPacket)s on a byte stream.

mod binary;
pub use binary::*;
