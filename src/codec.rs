// WAL wire codec.
// Pure framing and payload encoding; no file handles, no state. The
// on-disk format is a compatibility contract, so every field is written
// explicitly little-endian rather than run through a serializer.
//
// Frame layout:
//
//   [len:u32 LE][seq:u64 LE][type:u8][payload][crc32c:u32 LE]
//
// `len` is the total entry length excluding itself (seq + type + payload
// + crc). The checksum covers len..payload inclusive.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, WarpError};

/// Frame type tags. New readers must accept these; an unrecognized tag
/// stops recovery (tail) or fails it (mid-file).
pub const TYPE_PUT: u8 = 1;
pub const TYPE_DELETE: u8 = 2;
pub const TYPE_CHECKPOINT: u8 = 3;

/// Fixed overhead around the payload: seq (8) + type (1) + crc (4).
pub const FRAME_OVERHEAD: usize = 8 + 1 + 4;

/// Absolute cap on a single frame, over and above the configured key and
/// value bounds. Put payload worst case plus slack.
pub const MAX_FRAME_LEN: usize = 32 * 1024 * 1024;

/// A single logged mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    Put { key: Vec<u8>, value: Bytes, ts: u64 },
    Delete { key: Vec<u8>, ts: u64 },
    Checkpoint { ref_seq: u64 },
}

impl WalRecord {
    pub fn type_tag(&self) -> u8 {
        match self {
            WalRecord::Put { .. } => TYPE_PUT,
            WalRecord::Delete { .. } => TYPE_DELETE,
            WalRecord::Checkpoint { .. } => TYPE_CHECKPOINT,
        }
    }

    fn payload_len(&self) -> usize {
        match self {
            WalRecord::Put { key, value, .. } => 4 + key.len() + 4 + value.len() + 8,
            WalRecord::Delete { key, .. } => 4 + key.len() + 8,
            WalRecord::Checkpoint { .. } => 8,
        }
    }

    /// Total frame size on disk, including the leading len field.
    pub fn frame_len(&self) -> usize {
        4 + FRAME_OVERHEAD + self.payload_len()
    }
}

/// Outcome of decoding one frame from a byte slice.
#[derive(Debug)]
pub enum Decoded {
    /// A valid frame. `frame_len` is the total bytes consumed.
    Frame {
        seq: u64,
        record: WalRecord,
        frame_len: usize,
    },
    /// The buffer ends before the frame does (torn tail candidate).
    Incomplete,
    /// Structurally valid frame with an unrecognized type tag. The
    /// recovery reader stops here if this is the file's last frame and
    /// fails otherwise.
    UnknownType { frame_len: usize },
    /// Framing or checksum violation.
    Corrupt { reason: &'static str },
}

/// Append one framed entry to `buf`.
pub fn encode_frame(record: &WalRecord, seq: u64, buf: &mut BytesMut) {
    let payload_len = record.payload_len();
    let len = (FRAME_OVERHEAD + payload_len) as u32;
    let start = buf.len();

    buf.put_u32_le(len);
    buf.put_u64_le(seq);
    buf.put_u8(record.type_tag());
    match record {
        WalRecord::Put { key, value, ts } => {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(key);
            buf.put_u32_le(value.len() as u32);
            buf.put_slice(value);
            buf.put_u64_le(*ts);
        }
        WalRecord::Delete { key, ts } => {
            buf.put_u32_le(key.len() as u32);
            buf.put_slice(key);
            buf.put_u64_le(*ts);
        }
        WalRecord::Checkpoint { ref_seq } => {
            buf.put_u64_le(*ref_seq);
        }
    }
    let crc = crc32c::crc32c(&buf[start..]);
    buf.put_u32_le(crc);
}

/// Decode one frame from the front of `buf`.
pub fn decode_frame(buf: &[u8]) -> Decoded {
    if buf.len() < 4 {
        return Decoded::Incomplete;
    }
    let mut cursor = buf;
    let len = cursor.get_u32_le() as usize;
    if len < FRAME_OVERHEAD {
        return Decoded::Corrupt {
            reason: "frame length below fixed overhead",
        };
    }
    if len > MAX_FRAME_LEN {
        return Decoded::Corrupt {
            reason: "frame length exceeds maximum",
        };
    }
    let frame_len = 4 + len;
    if buf.len() < frame_len {
        return Decoded::Incomplete;
    }

    let crc_offset = frame_len - 4;
    let stored_crc = u32::from_le_bytes([
        buf[crc_offset],
        buf[crc_offset + 1],
        buf[crc_offset + 2],
        buf[crc_offset + 3],
    ]);
    let computed = crc32c::crc32c(&buf[..crc_offset]);
    if stored_crc != computed {
        return Decoded::Corrupt {
            reason: "checksum mismatch",
        };
    }

    let seq = cursor.get_u64_le();
    let type_tag = cursor.get_u8();
    let payload = &buf[4 + 8 + 1..crc_offset];

    let record = match type_tag {
        TYPE_PUT => match decode_put(payload) {
            Some(record) => record,
            None => {
                return Decoded::Corrupt {
                    reason: "malformed put payload",
                }
            }
        },
        TYPE_DELETE => match decode_delete(payload) {
            Some(record) => record,
            None => {
                return Decoded::Corrupt {
                    reason: "malformed delete payload",
                }
            }
        },
        TYPE_CHECKPOINT => {
            if payload.len() != 8 {
                return Decoded::Corrupt {
                    reason: "malformed checkpoint payload",
                };
            }
            let mut p = payload;
            WalRecord::Checkpoint {
                ref_seq: p.get_u64_le(),
            }
        }
        _ => return Decoded::UnknownType { frame_len },
    };

    Decoded::Frame {
        seq,
        record,
        frame_len,
    }
}

fn decode_put(payload: &[u8]) -> Option<WalRecord> {
    let mut p = payload;
    if p.remaining() < 4 {
        return None;
    }
    let key_len = p.get_u32_le() as usize;
    if p.remaining() < key_len + 4 {
        return None;
    }
    let key = p[..key_len].to_vec();
    p.advance(key_len);
    let value_len = p.get_u32_le() as usize;
    if p.remaining() != value_len + 8 {
        return None;
    }
    let value = Bytes::copy_from_slice(&p[..value_len]);
    p.advance(value_len);
    let ts = p.get_u64_le();
    Some(WalRecord::Put { key, value, ts })
}

fn decode_delete(payload: &[u8]) -> Option<WalRecord> {
    let mut p = payload;
    if p.remaining() < 4 {
        return None;
    }
    let key_len = p.get_u32_le() as usize;
    if p.remaining() != key_len + 8 {
        return None;
    }
    let key = p[..key_len].to_vec();
    p.advance(key_len);
    let ts = p.get_u64_le();
    Some(WalRecord::Delete { key, ts })
}

/// Convenience for snapshot streams: encode a record and return the bytes.
pub fn encode_frame_vec(record: &WalRecord, seq: u64) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(record.frame_len());
    encode_frame(record, seq, &mut buf);
    buf.to_vec()
}

/// Decode a whole buffer of frames, failing on any damage. Used for
/// snapshot streams, which are written atomically and carry no torn tail.
pub fn decode_all(mut buf: &[u8]) -> Result<Vec<(u64, WalRecord)>> {
    let mut out = Vec::new();
    while !buf.is_empty() {
        match decode_frame(buf) {
            Decoded::Frame {
                seq,
                record,
                frame_len,
            } => {
                out.push((seq, record));
                buf = &buf[frame_len..];
            }
            Decoded::Incomplete => {
                return Err(WarpError::Corrupted("truncated snapshot stream".into()))
            }
            Decoded::UnknownType { .. } => {
                return Err(WarpError::Corrupted(
                    "unknown frame type in snapshot stream".into(),
                ))
            }
            Decoded::Corrupt { reason } => {
                return Err(WarpError::Corrupted(format!("snapshot stream: {reason}")))
            }
        }
    }
    Ok(out)
}
