// BitTorrent peer wire protocol: framing and parsing, no I/O.

pub mod extended;

use byteorder::{ByteOrder, BE};
use bytes::Bytes;
use torq_core::constants::BLOCK_SIZE;
use torq_core::{InfoHash, PeerId};

use crate::extended::ExtendedMessage;

const PSTR: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

const LEN_PREFIX: usize = 4;
const MSGID_LEN: usize = 1;
const PREAMBLE_LEN: usize = LEN_PREFIX + MSGID_LEN;
/// A REQUEST/CANCEL/REJECT frame fits in this many bytes; serialization of
/// those goes through a fixed stack buffer, never the heap.
pub const REQUEST_FRAME_LEN: usize = PREAMBLE_LEN + 12;

/// Anything claiming to be longer than this is garbage or abuse; the
/// connection is closed. A PIECE frame with one block tops out well below.
pub const MAX_MSG_LEN: u32 = 17 * 1024 * 1024;

type MsgId = u8;

const MSGID_CHOKE: MsgId = 0;
const MSGID_UNCHOKE: MsgId = 1;
const MSGID_INTERESTED: MsgId = 2;
const MSGID_NOT_INTERESTED: MsgId = 3;
const MSGID_HAVE: MsgId = 4;
const MSGID_BITFIELD: MsgId = 5;
const MSGID_REQUEST: MsgId = 6;
const MSGID_PIECE: MsgId = 7;
const MSGID_CANCEL: MsgId = 8;
// BEP 6 (fast extension)
const MSGID_SUGGEST: MsgId = 0x0D;
const MSGID_HAVE_ALL: MsgId = 0x0E;
const MSGID_HAVE_NONE: MsgId = 0x0F;
const MSGID_REJECT: MsgId = 0x10;
const MSGID_ALLOWED_FAST: MsgId = 0x11;
// BEP 10
const MSGID_EXTENDED: MsgId = 20;

// Reserved-bits layout: byte 5 bit 0x10 advertises BEP 10, byte 7 bit 0x04
// advertises BEP 6.
const RESERVED_EXTENDED: u64 = 0x10 << 16;
const RESERVED_FAST: u64 = 0x04;

#[derive(thiserror::Error, Debug)]
pub enum MessageError {
    #[error("not enough data: need at least {0} more bytes")]
    NotEnoughData(usize),
    #[error("message of {0} bytes exceeds the frame limit")]
    MessageTooLarge(u32),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("message id {msg_id} with payload {received}, expected {expected}")]
    IncorrectLength {
        msg_id: u8,
        received: u32,
        expected: u32,
    },
    #[error("handshake protocol string mismatch")]
    BadHandshake,
    #[error("error decoding extended message: {0}")]
    Extended(#[from] extended::ExtendedError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    reserved: u64,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        Self {
            info_hash,
            peer_id,
            reserved: RESERVED_EXTENDED | RESERVED_FAST,
        }
    }

    pub fn supports_extended(&self) -> bool {
        self.reserved & RESERVED_EXTENDED != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.reserved & RESERVED_FAST != 0
    }

    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PSTR);
        buf[20..28].copy_from_slice(&self.reserved.to_be_bytes());
        buf[28..48].copy_from_slice(&self.info_hash.0);
        buf[48..68].copy_from_slice(&self.peer_id.0);
        buf
    }

    pub fn deserialize(buf: &[u8]) -> Result<(Handshake, usize), MessageError> {
        if buf.len() < HANDSHAKE_LEN {
            return Err(MessageError::NotEnoughData(HANDSHAKE_LEN - buf.len()));
        }
        if buf[0] != 19 || &buf[1..20] != PSTR {
            return Err(MessageError::BadHandshake);
        }
        let h = Handshake {
            reserved: BE::read_u64(&buf[20..28]),
            info_hash: InfoHash::new(buf[28..48].try_into().unwrap()),
            peer_id: PeerId::new(buf[48..68].try_into().unwrap()),
        };
        Ok((h, HANDSHAKE_LEN))
    }
}

/// A (piece, offset, length) block address as it appears in REQUEST, CANCEL
/// and REJECT payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    fn frame(&self, msg_id: MsgId) -> [u8; REQUEST_FRAME_LEN] {
        let mut buf = [0u8; REQUEST_FRAME_LEN];
        BE::write_u32(&mut buf[0..4], 13);
        buf[4] = msg_id;
        BE::write_u32(&mut buf[5..9], self.index);
        BE::write_u32(&mut buf[9..13], self.begin);
        BE::write_u32(&mut buf[13..17], self.length);
        buf
    }
}

/// A received or outgoing block. The payload is a refcounted slice of the
/// read buffer; it is handed to the piece assembler without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub index: u32,
    pub begin: u32,
    pub block: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request(Request),
    Piece(Piece),
    Cancel(Request),
    Suggest(u32),
    HaveAll,
    HaveNone,
    Reject(Request),
    AllowedFast(u32),
    Extended(ExtendedMessage),
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep_alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not_interested",
            Message::Have(_) => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request(_) => "request",
            Message::Piece(_) => "piece",
            Message::Cancel(_) => "cancel",
            Message::Suggest(_) => "suggest",
            Message::HaveAll => "have_all",
            Message::HaveNone => "have_none",
            Message::Reject(_) => "reject",
            Message::AllowedFast(_) => "allowed_fast",
            Message::Extended(_) => "extended",
        }
    }

    /// Append the framed message to `out`. `peer_ut_metadata_id` is the id
    /// the remote registered for ut_metadata in its extended handshake.
    pub fn serialize_into(
        &self,
        out: &mut Vec<u8>,
        peer_ut_metadata_id: Option<u8>,
    ) -> Result<(), MessageError> {
        fn preamble(out: &mut Vec<u8>, payload_len: u32, msg_id: MsgId) {
            out.extend_from_slice(&(payload_len + 1).to_be_bytes());
            out.push(msg_id);
        }
        match self {
            Message::KeepAlive => out.extend_from_slice(&0u32.to_be_bytes()),
            Message::Choke => preamble(out, 0, MSGID_CHOKE),
            Message::Unchoke => preamble(out, 0, MSGID_UNCHOKE),
            Message::Interested => preamble(out, 0, MSGID_INTERESTED),
            Message::NotInterested => preamble(out, 0, MSGID_NOT_INTERESTED),
            Message::HaveAll => preamble(out, 0, MSGID_HAVE_ALL),
            Message::HaveNone => preamble(out, 0, MSGID_HAVE_NONE),
            Message::Have(index) => {
                preamble(out, 4, MSGID_HAVE);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Message::Suggest(index) => {
                preamble(out, 4, MSGID_SUGGEST);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Message::AllowedFast(index) => {
                preamble(out, 4, MSGID_ALLOWED_FAST);
                out.extend_from_slice(&index.to_be_bytes());
            }
            Message::Bitfield(bits) => {
                preamble(out, bits.len() as u32, MSGID_BITFIELD);
                out.extend_from_slice(bits);
            }
            Message::Request(r) => out.extend_from_slice(&r.frame(MSGID_REQUEST)),
            Message::Cancel(r) => out.extend_from_slice(&r.frame(MSGID_CANCEL)),
            Message::Reject(r) => out.extend_from_slice(&r.frame(MSGID_REJECT)),
            Message::Piece(p) => {
                preamble(out, 8 + p.block.len() as u32, MSGID_PIECE);
                out.extend_from_slice(&p.index.to_be_bytes());
                out.extend_from_slice(&p.begin.to_be_bytes());
                out.extend_from_slice(&p.block);
            }
            Message::Extended(e) => {
                let start = out.len();
                // Reserve the preamble, come back for the length.
                out.extend_from_slice(&[0u8; PREAMBLE_LEN]);
                out[start + 4] = MSGID_EXTENDED;
                e.serialize_into(out, peer_ut_metadata_id)?;
                let payload_len = (out.len() - start - LEN_PREFIX) as u32;
                out[start..start + 4].copy_from_slice(&payload_len.to_be_bytes());
            }
        }
        Ok(())
    }

    /// Decode one message from the front of `buf`, returning it and the
    /// number of bytes consumed. `buf` must be the start of a frame.
    pub fn deserialize(buf: &Bytes) -> Result<(Message, usize), MessageError> {
        if buf.len() < LEN_PREFIX {
            return Err(MessageError::NotEnoughData(LEN_PREFIX - buf.len()));
        }
        let len_prefix = BE::read_u32(&buf[0..4]);
        if len_prefix == 0 {
            return Ok((Message::KeepAlive, LEN_PREFIX));
        }
        if len_prefix > MAX_MSG_LEN {
            return Err(MessageError::MessageTooLarge(len_prefix));
        }
        let total_len = LEN_PREFIX + len_prefix as usize;
        if buf.len() < total_len {
            return Err(MessageError::NotEnoughData(total_len - buf.len()));
        }
        let msg_id = buf[4];
        let payload_len = len_prefix - 1;
        let payload = &buf[PREAMBLE_LEN..total_len];

        let check_len = |expected: u32| -> Result<(), MessageError> {
            if payload_len != expected {
                return Err(MessageError::IncorrectLength {
                    msg_id,
                    received: payload_len,
                    expected,
                });
            }
            Ok(())
        };

        let msg = match msg_id {
            MSGID_CHOKE => {
                check_len(0)?;
                Message::Choke
            }
            MSGID_UNCHOKE => {
                check_len(0)?;
                Message::Unchoke
            }
            MSGID_INTERESTED => {
                check_len(0)?;
                Message::Interested
            }
            MSGID_NOT_INTERESTED => {
                check_len(0)?;
                Message::NotInterested
            }
            MSGID_HAVE_ALL => {
                check_len(0)?;
                Message::HaveAll
            }
            MSGID_HAVE_NONE => {
                check_len(0)?;
                Message::HaveNone
            }
            MSGID_HAVE => {
                check_len(4)?;
                Message::Have(BE::read_u32(payload))
            }
            MSGID_SUGGEST => {
                check_len(4)?;
                Message::Suggest(BE::read_u32(payload))
            }
            MSGID_ALLOWED_FAST => {
                check_len(4)?;
                Message::AllowedFast(BE::read_u32(payload))
            }
            MSGID_BITFIELD => Message::Bitfield(buf.slice(PREAMBLE_LEN..total_len)),
            MSGID_REQUEST | MSGID_CANCEL | MSGID_REJECT => {
                check_len(12)?;
                let r = Request {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    length: BE::read_u32(&payload[8..12]),
                };
                match msg_id {
                    MSGID_REQUEST => Message::Request(r),
                    MSGID_CANCEL => Message::Cancel(r),
                    _ => Message::Reject(r),
                }
            }
            MSGID_PIECE => {
                if payload_len < 9 {
                    return Err(MessageError::IncorrectLength {
                        msg_id,
                        received: payload_len,
                        expected: 9,
                    });
                }
                Message::Piece(Piece {
                    index: BE::read_u32(&payload[0..4]),
                    begin: BE::read_u32(&payload[4..8]),
                    block: buf.slice(PREAMBLE_LEN + 8..total_len),
                })
            }
            MSGID_EXTENDED => {
                if payload_len < 1 {
                    return Err(MessageError::IncorrectLength {
                        msg_id,
                        received: payload_len,
                        expected: 1,
                    });
                }
                Message::Extended(ExtendedMessage::deserialize(
                    payload[0],
                    buf.slice(PREAMBLE_LEN + 1..total_len),
                )?)
            }
            other => return Err(MessageError::UnsupportedMessageId(other)),
        };
        Ok((msg, total_len))
    }
}

/// Sanity bound used when validating incoming block addresses before they
/// reach piece arithmetic.
pub const fn max_block_len() -> u32 {
    BLOCK_SIZE
}
