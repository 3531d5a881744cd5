//! The on-disk format of a cache entry.
//!
//! ```text
//! magic       8 bytes   "CSYMCE01"
//! kind        u8        0 = parsed, 1 = raw, 2 = missing, 3 = invalid
//! created_at  u64 LE    milliseconds since the Unix epoch
//! payload               encoded address table, raw file bytes,
//!                       nothing, or the UTF-8 reason string
//! ```

use std::io::{Cursor, Read};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use crashsym_table::AddressTable;

use crate::artifact::SymbolArtifact;
use crate::error::EntryDecodeError;

const MAGIC: &[u8; 8] = b"CSYMCE01";

pub const HEADER_LEN: usize = 17;

const KIND_PARSED: u8 = 0;
const KIND_RAW: u8 = 1;
const KIND_MISSING: u8 = 2;
const KIND_INVALID: u8 = 3;

pub struct EntryHeader {
    pub is_negative: bool,
    pub created_at: SystemTime,
}

pub fn encode(artifact: &SymbolArtifact, created_at: SystemTime) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(MAGIC);
    let kind = match artifact {
        SymbolArtifact::Parsed(_) => KIND_PARSED,
        SymbolArtifact::Raw(_) => KIND_RAW,
        SymbolArtifact::Missing => KIND_MISSING,
        SymbolArtifact::Invalid(_) => KIND_INVALID,
    };
    buf.push(kind);
    let _ = buf.write_u64::<LittleEndian>(to_millis(created_at));
    match artifact {
        SymbolArtifact::Parsed(table) => {
            let _ = table.write_to(&mut buf);
        }
        SymbolArtifact::Raw(bytes) => buf.extend_from_slice(bytes),
        SymbolArtifact::Missing => {}
        SymbolArtifact::Invalid(reason) => buf.extend_from_slice(reason.as_bytes()),
    }
    buf
}

/// Reads only the fixed-size header, so that the cache can be inventoried
/// without loading every table.
pub fn decode_header(data: &[u8]) -> Result<EntryHeader, EntryDecodeError> {
    let mut r = Cursor::new(data);
    let mut magic = [0; 8];
    r.read_exact(&mut magic)?;
    if &magic != MAGIC {
        return Err(EntryDecodeError::BadMagic);
    }
    let kind = r.read_u8()?;
    if kind > KIND_INVALID {
        return Err(EntryDecodeError::UnknownKind(kind));
    }
    let created_at = from_millis(r.read_u64::<LittleEndian>()?);
    Ok(EntryHeader {
        is_negative: kind == KIND_MISSING || kind == KIND_INVALID,
        created_at,
    })
}

pub fn decode(data: &[u8]) -> Result<(SymbolArtifact, SystemTime), EntryDecodeError> {
    let header = decode_header(data)?;
    let kind = data[8];
    let payload = &data[HEADER_LEN..];
    let artifact = match kind {
        KIND_PARSED => SymbolArtifact::Parsed(Arc::new(AddressTable::from_bytes(payload)?)),
        KIND_RAW => SymbolArtifact::Raw(Bytes::copy_from_slice(payload)),
        KIND_MISSING => SymbolArtifact::Missing,
        _ => {
            let reason = std::str::from_utf8(payload).map_err(|_| EntryDecodeError::BadReason)?;
            SymbolArtifact::Invalid(reason.to_string())
        }
    };
    Ok((artifact, header.created_at))
}

fn to_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn from_millis(millis: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis)
}
