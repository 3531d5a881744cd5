//! A compact binary encoding of [`AddressTable`], so that parsed tables can
//! be cached without re-parsing the text symbol file.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Write};
use std::str::FromStr;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use debugid::DebugId;

use crate::address_table::{AddressTable, FunctionRecord, InlineSite, LineRecord, SymbolKind};

const MAGIC: &[u8; 8] = b"CSYMTAB1";

/// Preallocation cap, so that a corrupt count can't make us allocate
/// gigabytes up front.
const MAX_PREALLOC: usize = 4096;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("Not an encoded address table (bad magic bytes)")]
    BadMagic,

    #[error("Truncated or unreadable table data: {0}")]
    Io(#[from] io::Error),

    #[error("Table data contains a string that is not valid UTF-8")]
    BadUtf8,

    #[error("Table data contains an invalid debug ID: {0:?}")]
    BadDebugId(String),

    #[error("Table data contains an unknown symbol kind {0}")]
    InvalidKind(u8),

    #[error("Table data has {0} trailing bytes")]
    TrailingBytes(u64),
}

impl AddressTable {
    /// Serializes the table. [`AddressTable::from_bytes`] reproduces an
    /// equal table.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = Vec::new();
        // Writing into a Vec can't fail.
        let _ = self.write_to(&mut writer);
        writer
    }

    pub fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(MAGIC)?;
        write_str(w, &self.debug_id.breakpad().to_string())?;
        write_str(w, &self.name)?;
        write_str(w, &self.os)?;
        write_str(w, &self.arch)?;

        w.write_u32::<LittleEndian>(self.files.len() as u32)?;
        for (index, path) in &self.files {
            w.write_u32::<LittleEndian>(*index)?;
            write_str(w, path)?;
        }

        w.write_u32::<LittleEndian>(self.records.len() as u32)?;
        for record in &self.records {
            write_record(w, record)?;
        }
        Ok(())
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Cursor::new(data);
        let mut magic = [0; 8];
        r.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let debug_id_str = read_string(&mut r)?;
        let debug_id = DebugId::from_breakpad(&debug_id_str)
            .or_else(|_| DebugId::from_str(&debug_id_str))
            .map_err(|_| DecodeError::BadDebugId(debug_id_str))?;
        let name = read_string(&mut r)?;
        let os = read_string(&mut r)?;
        let arch = read_string(&mut r)?;

        let file_count = r.read_u32::<LittleEndian>()?;
        let mut files = BTreeMap::new();
        for _ in 0..file_count {
            let index = r.read_u32::<LittleEndian>()?;
            files.insert(index, read_string(&mut r)?);
        }

        let record_count = r.read_u32::<LittleEndian>()? as usize;
        let mut records = Vec::with_capacity(record_count.min(MAX_PREALLOC));
        for _ in 0..record_count {
            records.push(read_record(&mut r)?);
        }

        let trailing = data.len() as u64 - r.position();
        if trailing != 0 {
            return Err(DecodeError::TrailingBytes(trailing));
        }

        Ok(AddressTable {
            debug_id,
            name,
            os,
            arch,
            files,
            records,
        })
    }
}

fn write_str<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    w.write_u32::<LittleEndian>(s.len() as u32)?;
    w.write_all(s.as_bytes())
}

fn read_string(r: &mut Cursor<&[u8]>) -> Result<String, DecodeError> {
    let len = r.read_u32::<LittleEndian>()? as usize;
    let start = r.position() as usize;
    let bytes = r
        .get_ref()
        .get(start..)
        .and_then(|rest| rest.get(..len))
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::BadUtf8)?;
    r.set_position((start + len) as u64);
    Ok(s.to_string())
}

fn write_record<W: Write>(w: &mut W, record: &FunctionRecord) -> io::Result<()> {
    w.write_u64::<LittleEndian>(record.start)?;
    w.write_u64::<LittleEndian>(record.end)?;
    w.write_u8(match record.kind {
        SymbolKind::Func => 0,
        SymbolKind::Public => 1,
    })?;
    write_str(w, &record.name)?;
    match record.source_file {
        Some(file) => {
            w.write_u8(1)?;
            w.write_u32::<LittleEndian>(file)?;
        }
        None => w.write_u8(0)?,
    }

    w.write_u32::<LittleEndian>(record.lines.len() as u32)?;
    for line in &record.lines {
        w.write_u64::<LittleEndian>(line.offset)?;
        w.write_u64::<LittleEndian>(line.size)?;
        w.write_u32::<LittleEndian>(line.line)?;
        w.write_u32::<LittleEndian>(line.file)?;
    }

    w.write_u32::<LittleEndian>(record.inline_sites.len() as u32)?;
    for site in &record.inline_sites {
        w.write_u32::<LittleEndian>(site.depth)?;
        w.write_u64::<LittleEndian>(site.start)?;
        w.write_u64::<LittleEndian>(site.end)?;
        write_str(w, &site.function_name)?;
        w.write_u32::<LittleEndian>(site.call_file)?;
        w.write_u32::<LittleEndian>(site.call_line)?;
    }
    Ok(())
}

fn read_record(r: &mut Cursor<&[u8]>) -> Result<FunctionRecord, DecodeError> {
    let start = r.read_u64::<LittleEndian>()?;
    let end = r.read_u64::<LittleEndian>()?;
    let kind = match r.read_u8()? {
        0 => SymbolKind::Func,
        1 => SymbolKind::Public,
        other => return Err(DecodeError::InvalidKind(other)),
    };
    let name = read_string(r)?;
    let source_file = match r.read_u8()? {
        0 => None,
        _ => Some(r.read_u32::<LittleEndian>()?),
    };

    let line_count = r.read_u32::<LittleEndian>()? as usize;
    let mut lines = Vec::with_capacity(line_count.min(MAX_PREALLOC));
    for _ in 0..line_count {
        lines.push(LineRecord {
            offset: r.read_u64::<LittleEndian>()?,
            size: r.read_u64::<LittleEndian>()?,
            line: r.read_u32::<LittleEndian>()?,
            file: r.read_u32::<LittleEndian>()?,
        });
    }

    let inline_count = r.read_u32::<LittleEndian>()? as usize;
    let mut inline_sites = Vec::with_capacity(inline_count.min(MAX_PREALLOC));
    for _ in 0..inline_count {
        let depth = r.read_u32::<LittleEndian>()?;
        let start = r.read_u64::<LittleEndian>()?;
        let end = r.read_u64::<LittleEndian>()?;
        let function_name = read_string(r)?;
        let call_file = r.read_u32::<LittleEndian>()?;
        let call_line = r.read_u32::<LittleEndian>()?;
        inline_sites.push(InlineSite {
            depth,
            start,
            end,
            function_name,
            call_file,
            call_line,
        });
    }

    Ok(FunctionRecord {
        start,
        end,
        name,
        kind,
        source_file,
        lines,
        inline_sites,
    })
}
