use codee::{Decoder, Encoder};

use crate::{BridgeMessage, NetworkPacket, error::BridgeError};

/// Size of the little-endian length prefix in front of every frame.
pub const LENGTH_PREFIX_BYTES: usize = 8;

/// Reads the payload length out of a frame header.
pub fn frame_length(header: [u8; LENGTH_PREFIX_BYTES]) -> usize {
    u64::from_le_bytes(header) as usize
}

/// Codec for the front-end stream.
///
/// Each frame is:
/// - 8-byte little-endian length prefix
/// - Bincode-serialized [`NetworkPacket`]
///
/// The front-end routes frames by `NetworkPacket::type_name`, falling back to
/// `schema_hash`.
pub struct SliceLinkCodec;

impl Encoder<NetworkPacket> for SliceLinkCodec {
    type Error = BridgeError;
    type Encoded = Vec<u8>;

    fn encode(val: &NetworkPacket) -> Result<Self::Encoded, Self::Error> {
        let encoded_packet = bincode::serde::encode_to_vec(val, bincode::config::standard())
            .map_err(|_| BridgeError::Serialization)?;

        let len = encoded_packet.len() as u64;
        let mut buffer = Vec::with_capacity(LENGTH_PREFIX_BYTES + encoded_packet.len());
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(&encoded_packet);

        Ok(buffer)
    }
}

impl Decoder<NetworkPacket> for SliceLinkCodec {
    type Error = BridgeError;
    type Encoded = [u8];

    fn decode(val: &Self::Encoded) -> Result<NetworkPacket, Self::Error> {
        let Some((header, body)) = val.split_first_chunk::<LENGTH_PREFIX_BYTES>() else {
            return Err(BridgeError::Serialization);
        };
        if frame_length(*header) != body.len() {
            return Err(BridgeError::Serialization);
        }

        bincode::serde::decode_from_slice(body, bincode::config::standard())
            .map(|(packet, _)| packet)
            .map_err(|_| BridgeError::Serialization)
    }
}

/// Convenience codec that wraps and unwraps [`BridgeMessage`]s directly.
pub struct BridgeMessageCodec;

impl Encoder<BridgeMessage> for BridgeMessageCodec {
    type Error = BridgeError;
    type Encoded = Vec<u8>;

    fn encode(val: &BridgeMessage) -> Result<Self::Encoded, Self::Error> {
        SliceLinkCodec::encode(&val.to_packet()?)
    }
}

impl Decoder<BridgeMessage> for BridgeMessageCodec {
    type Error = BridgeError;
    type Encoded = [u8];

    fn decode(val: &Self::Encoded) -> Result<BridgeMessage, Self::Error> {
        let packet: NetworkPacket = SliceLinkCodec::decode(val)?;
        BridgeMessage::from_packet(&packet)
    }
}
