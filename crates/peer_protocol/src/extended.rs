// BEP 10 extended messaging: the bencoded extended handshake and the
// ut_metadata subprotocol (BEP 9).

use std::collections::BTreeMap;

use bencode::{OwnedValue, Value};
use bytes::Bytes;
use torq_core::constants::BLOCK_SIZE;

/// The id we register for ut_metadata in our extended handshake. Remotes
/// address ut_metadata messages to us with this id.
pub const UT_METADATA_ID: u8 = 1;

/// Metadata bigger than this is refused outright.
pub const MAX_METADATA_SIZE: u32 = 4 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum ExtendedError {
    #[error("invalid bencode in extended message: {0}")]
    Bencode(#[from] bencode::DecodeError),
    #[error("extended handshake is not a dict")]
    NotADict,
    #[error("ut_metadata message has no msg_type")]
    NoMsgType,
    #[error("ut_metadata unknown msg_type {0}")]
    UnknownMsgType(i64),
    #[error("ut_metadata message has no piece")]
    NoPiece,
    #[error("ut_metadata data message has no total_size")]
    NoTotalSize,
    #[error("ut_metadata piece {piece} out of bounds for total_size {total_size}")]
    PieceOutOfBounds { piece: u32, total_size: u32 },
    #[error("ut_metadata piece {piece}: expected {expected} bytes, got {got}")]
    WrongPieceSize { piece: u32, expected: u32, got: u32 },
    #[error("ut_metadata trailing bytes on a non-data message")]
    TrailingBytes,
    #[error("peer did not advertise ut_metadata")]
    PeerLacksUtMetadata,
}

/// The bencoded dict exchanged as extended message id 0.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExtendedHandshake {
    /// The id the sender registered for ut_metadata, from its `m` dict.
    pub ut_metadata_id: Option<u8>,
    pub metadata_size: Option<u32>,
    pub client: Option<String>,
    /// How many requests the sender is willing to queue.
    pub reqq: Option<u32>,
    pub port: Option<u16>,
}

impl ExtendedHandshake {
    /// Our own handshake: advertises ut_metadata and, when the metadata is
    /// known, its size.
    pub fn ours(metadata_size: Option<u32>, port: Option<u16>) -> Self {
        Self {
            ut_metadata_id: Some(UT_METADATA_ID),
            metadata_size,
            client: Some(format!("torq {}", env!("CARGO_PKG_VERSION"))),
            reqq: Some(64),
            port,
        }
    }

    fn to_value(&self) -> OwnedValue {
        let mut m = BTreeMap::new();
        if let Some(id) = self.ut_metadata_id {
            m.insert(b"ut_metadata".to_vec(), OwnedValue::Int(id as i64));
        }
        let mut dict = BTreeMap::new();
        dict.insert(b"m".to_vec(), OwnedValue::Dict(m));
        if let Some(size) = self.metadata_size {
            dict.insert(b"metadata_size".to_vec(), OwnedValue::Int(size as i64));
        }
        if let Some(client) = &self.client {
            dict.insert(b"v".to_vec(), OwnedValue::str(client));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(b"reqq".to_vec(), OwnedValue::Int(reqq as i64));
        }
        if let Some(port) = self.port {
            dict.insert(b"p".to_vec(), OwnedValue::Int(port as i64));
        }
        OwnedValue::Dict(dict)
    }

    fn from_value(v: &Value<'_>) -> Result<Self, ExtendedError> {
        if v.as_dict().is_none() {
            return Err(ExtendedError::NotADict);
        }
        let ut_metadata_id = v
            .get(b"m")
            .and_then(|m| m.get_int(b"ut_metadata"))
            .and_then(|id| u8::try_from(id).ok());
        Ok(Self {
            ut_metadata_id,
            metadata_size: v
                .get_int(b"metadata_size")
                .and_then(|s| u32::try_from(s).ok()),
            client: v.get_str(b"v").map(str::to_owned),
            reqq: v.get_int(b"reqq").and_then(|r| u32::try_from(r).ok()),
            port: v.get_int(b"p").and_then(|p| u16::try_from(p).ok()),
        })
    }
}

/// BEP 9 metadata exchange, carried inside extended messages. Metadata is
/// requested and served in 16 KiB pieces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UtMetadata {
    Request(u32),
    Data {
        piece: u32,
        total_size: u32,
        data: Bytes,
    },
    Reject(u32),
}

impl UtMetadata {
    /// Expected size of metadata piece `piece` given the total.
    pub fn piece_size(piece: u32, total_size: u32) -> u32 {
        total_size
            .saturating_sub(piece * BLOCK_SIZE)
            .min(BLOCK_SIZE)
    }

    fn serialize_into(&self, out: &mut Vec<u8>) {
        let mut dict = BTreeMap::new();
        let (msg_type, piece) = match self {
            UtMetadata::Request(piece) => (0, *piece),
            UtMetadata::Data {
                piece, total_size, ..
            } => {
                dict.insert(
                    b"total_size".to_vec(),
                    OwnedValue::Int(*total_size as i64),
                );
                (1, *piece)
            }
            UtMetadata::Reject(piece) => (2, *piece),
        };
        dict.insert(b"msg_type".to_vec(), OwnedValue::Int(msg_type));
        dict.insert(b"piece".to_vec(), OwnedValue::Int(piece as i64));
        OwnedValue::Dict(dict).encode_into(out);
        if let UtMetadata::Data { data, .. } = self {
            out.extend_from_slice(data);
        }
    }

    fn deserialize(payload: Bytes) -> Result<Self, ExtendedError> {
        let (dict, consumed) = bencode::decode_prefix(&payload)?;
        let msg_type = dict.get_int(b"msg_type").ok_or(ExtendedError::NoMsgType)?;
        let piece = dict
            .get_int(b"piece")
            .and_then(|p| u32::try_from(p).ok())
            .ok_or(ExtendedError::NoPiece)?;
        let trailing = payload.len() - consumed;
        match msg_type {
            0 | 2 => {
                if trailing != 0 {
                    return Err(ExtendedError::TrailingBytes);
                }
                Ok(if msg_type == 0 {
                    UtMetadata::Request(piece)
                } else {
                    UtMetadata::Reject(piece)
                })
            }
            1 => {
                let total_size = dict
                    .get_int(b"total_size")
                    .and_then(|s| u32::try_from(s).ok())
                    .filter(|s| *s > 0)
                    .ok_or(ExtendedError::NoTotalSize)?;
                let total_pieces = total_size.div_ceil(BLOCK_SIZE);
                if piece >= total_pieces {
                    return Err(ExtendedError::PieceOutOfBounds { piece, total_size });
                }
                let expected = Self::piece_size(piece, total_size);
                if trailing as u32 != expected {
                    return Err(ExtendedError::WrongPieceSize {
                        piece,
                        expected,
                        got: trailing as u32,
                    });
                }
                Ok(UtMetadata::Data {
                    piece,
                    total_size,
                    data: payload.slice(consumed..),
                })
            }
            other => Err(ExtendedError::UnknownMsgType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtendedMessage {
    Handshake(ExtendedHandshake),
    UtMetadata(UtMetadata),
    /// An extension we don't speak; kept for logging, otherwise ignored.
    Unknown(u8, Bytes),
}

impl ExtendedMessage {
    /// `peer_ut_metadata_id` is the id the remote registered in its
    /// extended handshake; ut_metadata messages cannot be addressed
    /// without it.
    pub fn serialize_into(
        &self,
        out: &mut Vec<u8>,
        peer_ut_metadata_id: Option<u8>,
    ) -> Result<(), ExtendedError> {
        match self {
            ExtendedMessage::Handshake(h) => {
                out.push(0);
                h.to_value().encode_into(out);
            }
            ExtendedMessage::UtMetadata(m) => {
                out.push(peer_ut_metadata_id.ok_or(ExtendedError::PeerLacksUtMetadata)?);
                m.serialize_into(out);
            }
            ExtendedMessage::Unknown(id, payload) => {
                out.push(*id);
                out.extend_from_slice(payload);
            }
        }
        Ok(())
    }

    pub fn deserialize(ext_id: u8, payload: Bytes) -> Result<Self, ExtendedError> {
        match ext_id {
            0 => {
                let value = bencode::decode_prefix(&payload)?.0;
                Ok(ExtendedMessage::Handshake(ExtendedHandshake::from_value(
                    &value,
                )?))
            }
            UT_METADATA_ID => Ok(ExtendedMessage::UtMetadata(UtMetadata::deserialize(
                payload,
            )?)),
            other => Ok(ExtendedMessage::Unknown(other, payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_dict_shape() {
        let h = ExtendedHandshake::ours(Some(31337), Some(6881));
        let mut buf = Vec::new();
        ExtendedMessage::Handshake(h.clone())
            .serialize_into(&mut buf, None)
            .unwrap();
        assert_eq!(buf[0], 0);
        // The m dict and metadata_size must be visible to a plain decoder.
        let v = bencode::decode(&buf[1..]).unwrap();
        assert_eq!(
            v.get(b"m").unwrap().get_int(b"ut_metadata"),
            Some(UT_METADATA_ID as i64)
        );
        assert_eq!(v.get_int(b"metadata_size"), Some(31337));
        assert_eq!(v.get_int(b"p"), Some(6881));

        let back = ExtendedMessage::deserialize(0, Bytes::from(buf[1..].to_vec())).unwrap();
        assert_eq!(back, ExtendedMessage::Handshake(h));
    }

    #[test]
    fn test_handshake_tolerates_extra_keys() {
        let raw = b"d1:md11:ut_metadatai3e6:ut_pexi2ee13:metadata_sizei100e6:yourip4:\x7f\x00\x00\x01e";
        let m = ExtendedMessage::deserialize(0, Bytes::from_static(raw)).unwrap();
        match m {
            ExtendedMessage::Handshake(h) => {
                assert_eq!(h.ut_metadata_id, Some(3));
                assert_eq!(h.metadata_size, Some(100));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_ut_metadata_piece_size() {
        assert_eq!(UtMetadata::piece_size(0, 100), 100);
        assert_eq!(UtMetadata::piece_size(0, 16384), 16384);
        assert_eq!(UtMetadata::piece_size(0, 16385), 16384);
        assert_eq!(UtMetadata::piece_size(1, 16385), 1);
    }

    #[test]
    fn test_ut_metadata_data_validation() {
        // wrong size for the declared piece
        let mut buf = Vec::new();
        UtMetadata::Data {
            piece: 0,
            total_size: 100,
            data: Bytes::from_static(b"short"),
        }
        .serialize_into(&mut buf);
        assert!(matches!(
            UtMetadata::deserialize(Bytes::from(buf)),
            Err(ExtendedError::WrongPieceSize { .. })
        ));

        // piece index out of bounds
        let mut buf = Vec::new();
        UtMetadata::Data {
            piece: 2,
            total_size: 16385,
            data: Bytes::from_static(b"x"),
        }
        .serialize_into(&mut buf);
        assert!(matches!(
            UtMetadata::deserialize(Bytes::from(buf)),
            Err(ExtendedError::PieceOutOfBounds { .. })
        ));

        // request with trailing junk
        let mut buf = Vec::new();
        UtMetadata::Request(0).serialize_into(&mut buf);
        buf.extend_from_slice(b"junk");
        assert!(matches!(
            UtMetadata::deserialize(Bytes::from(buf)),
            Err(ExtendedError::TrailingBytes)
        ));
    }
}
