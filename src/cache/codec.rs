//! Catalog Codec Module
//!
//! Encoding and decoding for the on-disk catalog format.
//!
//! ## Wire Format
//!
//! All integers little-endian, all strings UTF-8.
//!
//! ```text
//! header  : version (1) | mode (1)
//! record* : key_len (2)  | key
//!           meta_len (2) | meta JSON        -- meta_len 0 = no meta
//!           value_len (4)| value            -- single-file mode only
//! ```
//!
//! In multi-file catalogs no value bytes follow a record; the value
//! lives in the sidecar named by the record's `meta.file`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, StoreError};

// == Format Constants ==
/// Current catalog format version.
pub const VERSION: u8 = 1;

/// Upper bound for key frames (u16 length prefix).
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Upper bound for meta frames (u16 length prefix).
pub const MAX_META_LEN: usize = u16::MAX as usize;

/// Upper bound for inline value frames (u32 length prefix).
pub const MAX_VALUE_LEN: usize = u32::MAX as usize;

// == Mode ==
/// Value storage strategy, recorded in the catalog header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Values live in per-entry sidecar files
    MultiFile,
    /// Values are inlined in the catalog
    SingleFile,
}

impl Mode {
    /// The header byte for this mode.
    pub fn as_byte(self) -> u8 {
        match self {
            Mode::MultiFile => 0,
            Mode::SingleFile => 1,
        }
    }

    /// Parses a header byte; `None` for unknown modes.
    pub fn from_byte(byte: u8) -> Option<Mode> {
        match byte {
            0 => Some(Mode::MultiFile),
            1 => Some(Mode::SingleFile),
            _ => None,
        }
    }
}

// == Decoded Records ==
/// One record parsed out of a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub key: String,
    /// Raw meta JSON bytes; `None` when the record carried no meta.
    pub meta: Option<Bytes>,
    /// Inline value bytes; always `None` in multi-file catalogs.
    pub value: Option<Bytes>,
}

/// Outcome of decoding a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Catalog {
    /// The first byte did not match the expected version. Not an error:
    /// the catalog belongs to an incompatible prior installation and the
    /// cache is to be treated as empty.
    VersionMismatch,
    /// Records decoded up to the furthest complete boundary. Truncated
    /// or malformed tails are dropped silently.
    Records(Vec<RawRecord>),
}

// == Encoding ==
/// Encodes the two-byte catalog header.
pub fn encode_header(version: u8, mode: Mode) -> [u8; 2] {
    [version, mode.as_byte()]
}

/// Appends one record frame to `buf`.
///
/// `meta_len = 0` is written when meta is absent or empty. A `value` is
/// framed only when present (single-file catalogs); multi-file callers
/// pass `None`. Oversize fields are rejected, never truncated.
pub fn encode_record(
    buf: &mut BytesMut,
    key: &str,
    meta: Option<&[u8]>,
    value: Option<&[u8]>,
) -> Result<()> {
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::TooLarge {
            what: "key",
            len: key.len(),
            max: MAX_KEY_LEN,
        });
    }
    let meta = meta.filter(|m| !m.is_empty());
    if let Some(meta) = meta {
        if meta.len() > MAX_META_LEN {
            return Err(StoreError::TooLarge {
                what: "meta",
                len: meta.len(),
                max: MAX_META_LEN,
            });
        }
    }
    if let Some(value) = value {
        if value.len() > MAX_VALUE_LEN {
            return Err(StoreError::TooLarge {
                what: "value",
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }
    }

    buf.put_u16_le(key.len() as u16);
    buf.put_slice(key.as_bytes());
    buf.put_u16_le(meta.map_or(0, |m| m.len()) as u16);
    if let Some(meta) = meta {
        buf.put_slice(meta);
    }
    if let Some(value) = value {
        buf.put_u32_le(value.len() as u32);
        buf.put_slice(value);
    }
    Ok(())
}

// == Decoding ==
/// Decodes a catalog image.
///
/// Decoding never fails: a version mismatch reports
/// [`Catalog::VersionMismatch`], and any malformed or truncated input
/// ends the record stream at the furthest complete boundary. The mode
/// byte in the header, not the store's configured mode, decides whether
/// value frames are expected.
pub fn decode(expected_version: u8, data: &[u8]) -> Catalog {
    if data.is_empty() {
        return Catalog::Records(Vec::new());
    }
    if data[0] != expected_version {
        return Catalog::VersionMismatch;
    }
    let mode = match data.get(1).copied().and_then(Mode::from_byte) {
        Some(mode) => mode,
        None => return Catalog::Records(Vec::new()),
    };

    let mut buf = &data[2..];
    let mut records = Vec::new();
    loop {
        if buf.remaining() < 2 {
            break;
        }
        let key_len = buf.get_u16_le() as usize;
        if key_len == 0 || buf.remaining() < key_len {
            break;
        }
        let key = match std::str::from_utf8(&buf.chunk()[..key_len]) {
            Ok(key) => key.to_string(),
            Err(_) => break,
        };
        buf.advance(key_len);

        if buf.remaining() < 2 {
            break;
        }
        let meta_len = buf.get_u16_le() as usize;
        if buf.remaining() < meta_len {
            break;
        }
        let meta = if meta_len == 0 {
            None
        } else {
            Some(buf.copy_to_bytes(meta_len))
        };

        let value = match mode {
            Mode::MultiFile => None,
            Mode::SingleFile => {
                if buf.remaining() < 4 {
                    break;
                }
                let value_len = buf.get_u32_le() as usize;
                if buf.remaining() < value_len {
                    break;
                }
                Some(buf.copy_to_bytes(value_len))
            }
        };

        records.push(RawRecord { key, meta, value });
    }
    Catalog::Records(records)
}
