use std::collections::{BTreeMap, HashMap};
use std::{mem, str};

use debugid::DebugId;
use memchr::memchr;
use nom::bytes::complete::{tag, take_while};
use nom::character::complete::{hex_digit1, space0, space1};
use nom::combinator::{cut, eof, map_res, opt, rest};
use nom::error::{Error, ErrorKind, ParseError as _};
use nom::multi::separated_list1;
use nom::sequence::{terminated, tuple};
use nom::{Err, IResult};

use crate::address_table::{
    AddressTable, FunctionRecord, InlineSite, LineRecord, SymbolKind,
};
use crate::ModuleKey;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("The symbol file did not start with a valid MODULE line")]
    NoModuleHeader,

    #[error("Line {line}: unexpected second MODULE record")]
    DuplicateModuleHeader { line: u64 },

    #[error("Line {line}: error parsing {record} record")]
    MalformedRecord { line: u64, record: &'static str },

    #[error("Line {line}: {record} record outside of a FUNC block")]
    OrphanRecord { line: u64, record: &'static str },

    #[error(
        "Line {line}: {record} range {start:#x}..{end:#x} is not inside the FUNC range {func_start:#x}..{func_end:#x}"
    )]
    OutsideFunctionRange {
        line: u64,
        record: &'static str,
        start: u64,
        end: u64,
        func_start: u64,
        func_end: u64,
    },

    #[error("Line {line}: malformed UTF-8")]
    BadUtf8 { line: u64 },

    #[error("Unmatched debug ID: expected {expected}, but the symbol file declares {found}")]
    DebugIdMismatch { expected: DebugId, found: DebugId },
}

/// Parses a complete Breakpad symbol file.
///
/// Parsing is pure and deterministic: the same bytes always produce the same
/// table.
pub fn parse_sym_file(data: &[u8]) -> Result<AddressTable, ParseError> {
    let mut parser = SymFileParser::new();
    parser.consume(data);
    parser.finish()
}

/// Parses a symbol file which was requested for `key`, and checks that the
/// debug ID in the `MODULE` header matches the key.
pub fn parse_for_module(data: &[u8], key: &ModuleKey) -> Result<AddressTable, ParseError> {
    let table = parse_sym_file(data)?;
    if table.debug_id != key.debug_id() {
        return Err(ParseError::DebugIdMismatch {
            expected: key.debug_id(),
            found: table.debug_id,
        });
    }
    Ok(table)
}

/// A chunked parser, so that files can be parsed while they are being
/// downloaded.
#[derive(Debug, Clone, Default)]
pub struct SymFileParser {
    line_buffer: LineBuffer,
    inner: SymFileParserInner,
}

impl SymFileParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume(&mut self, chunk: &[u8]) {
        let inner = &mut self.inner;
        self.line_buffer
            .consume(chunk, |line| inner.process_line(line));
    }

    pub fn finish(mut self) -> Result<AddressTable, ParseError> {
        let inner = &mut self.inner;
        self.line_buffer.finish(|line| inner.process_line(line));
        self.inner.finish()
    }
}

#[derive(Debug, Clone)]
struct ModuleInfo {
    os: String,
    arch: String,
    debug_id: DebugId,
    name: String,
}

#[derive(Debug, Clone)]
struct PendingFunc {
    start: u64,
    end: u64,
    name: String,
    lines: Vec<LineRecord>,
    inlinees: Vec<Inlinee>,
}

#[derive(Debug, Clone)]
struct Inlinee {
    depth: u32,
    start: u64,
    end: u64,
    call_file: u32,
    call_line: u32,
    origin_id: u32,
}

#[derive(Debug, Clone, Default)]
struct SymFileParserInner {
    line_number: u64,
    module_info: Option<ModuleInfo>,
    files: BTreeMap<u32, String>,
    inline_origins: HashMap<u32, String>,
    funcs: Vec<PendingFunc>,
    publics: Vec<(u64, String)>,
    pending_func: Option<PendingFunc>,
    error: Option<ParseError>,
}

impl SymFileParserInner {
    fn process_line(&mut self, line: &[u8]) {
        self.line_number += 1;
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.process_line_impl(line) {
            self.error = Some(e);
        }
    }

    fn process_line_impl(&mut self, mut input: &[u8]) -> Result<(), ParseError> {
        while let Some((b'\r' | b' ', rest)) = input.split_last() {
            input = rest;
        }
        if input.is_empty() {
            return Ok(());
        }
        let line = self.line_number;
        let malformed = |record| ParseError::MalformedRecord { line, record };

        if self.module_info.is_none() {
            // Every file must start with a "MODULE " line.
            let (_rest, (os, arch, debug_id, name)) =
                module_line(input).map_err(|_| ParseError::NoModuleHeader)?;
            self.module_info = Some(ModuleInfo {
                os: os.to_string(),
                arch: arch.to_string(),
                debug_id,
                name: name.to_string(),
            });
            return Ok(());
        }

        let keyword = match memchr(b' ', input) {
            Some(space) => &input[..space],
            None => input,
        };
        match keyword {
            b"MODULE" => return Err(ParseError::DuplicateModuleHeader { line }),
            b"FILE" => {
                let (_rest, (index, name)) = file_line(input).map_err(|_| malformed("FILE"))?;
                self.files.insert(index, utf8(name, line)?);
            }
            b"INLINE_ORIGIN" => {
                let (_rest, (index, name)) =
                    inline_origin_line(input).map_err(|_| malformed("INLINE_ORIGIN"))?;
                self.inline_origins.insert(index, utf8(name, line)?);
            }
            b"FUNC" => {
                self.finish_pending_func();
                let (_rest, (start, size, name)) =
                    func_line(input).map_err(|_| malformed("FUNC"))?;
                if size == 0 {
                    return Err(malformed("FUNC"));
                }
                let end = start.checked_add(size).ok_or(malformed("FUNC"))?;
                self.pending_func = Some(PendingFunc {
                    start,
                    end,
                    name: utf8(name, line)?,
                    lines: Vec::new(),
                    inlinees: Vec::new(),
                });
            }
            b"PUBLIC" => {
                self.finish_pending_func();
                let (_rest, (address, name)) =
                    public_line(input).map_err(|_| malformed("PUBLIC"))?;
                self.publics.push((address, utf8(name, line)?));
            }
            b"INLINE" => {
                let func = self
                    .pending_func
                    .as_mut()
                    .ok_or(ParseError::OrphanRecord { line, record: "INLINE" })?;
                let (_rest, inlinees) = inline_line(input).map_err(|_| malformed("INLINE"))?;
                for inlinee in inlinees {
                    let inlinee = inlinee.ok_or(malformed("INLINE"))?;
                    check_in_range(func, "INLINE", inlinee.start, inlinee.end, line)?;
                    func.inlinees.push(inlinee);
                }
            }
            _ if !keyword.is_empty() && keyword.iter().all(u8::is_ascii_hexdigit) => {
                let func = self
                    .pending_func
                    .as_mut()
                    .ok_or(ParseError::OrphanRecord { line, record: "line" })?;
                let (_rest, record) = func_line_data(input).map_err(|_| malformed("line"))?;
                let end = record
                    .offset
                    .checked_add(record.size)
                    .ok_or(malformed("line"))?;
                check_in_range(func, "line", record.offset, end, line)?;
                func.lines.push(record);
            }
            _ => {
                // Unknown record kinds (INFO, STACK, or anything newer) are
                // skipped, but they do end the current FUNC block.
                self.finish_pending_func();
            }
        }
        Ok(())
    }

    fn finish_pending_func(&mut self) {
        if let Some(func) = self.pending_func.take() {
            self.funcs.push(func);
        }
    }

    fn finish(mut self) -> Result<AddressTable, ParseError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.finish_pending_func();
        let SymFileParserInner {
            module_info,
            files,
            inline_origins,
            funcs,
            publics,
            ..
        } = self;
        let ModuleInfo {
            os,
            arch,
            debug_id,
            name,
        } = module_info.ok_or(ParseError::NoModuleHeader)?;

        let funcs = funcs
            .into_iter()
            .map(|func| make_func_record(func, &inline_origins))
            .collect();
        let records = merge_records(funcs, publics);

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

fn check_in_range(
    func: &PendingFunc,
    record: &'static str,
    start: u64,
    end: u64,
    line: u64,
) -> Result<(), ParseError> {
    if start >= func.start && end <= func.end {
        Ok(())
    } else {
        Err(ParseError::OutsideFunctionRange {
            line,
            record,
            start,
            end,
            func_start: func.start,
            func_end: func.end,
        })
    }
}

fn utf8(bytes: &[u8], line: u64) -> Result<String, ParseError> {
    str::from_utf8(bytes)
        .map(ToOwned::to_owned)
        .map_err(|_| ParseError::BadUtf8 { line })
}

fn make_func_record(func: PendingFunc, inline_origins: &HashMap<u32, String>) -> FunctionRecord {
    let PendingFunc {
        start,
        end,
        name,
        mut lines,
        inlinees,
    } = func;
    lines.sort_by_key(|line| line.offset);

    // Inline sites whose origin is not declared anywhere can't be named, so
    // they are dropped.
    let mut inline_sites: Vec<InlineSite> = inlinees
        .into_iter()
        .filter_map(|inlinee| {
            let function_name = inline_origins.get(&inlinee.origin_id)?.clone();
            Some(InlineSite {
                depth: inlinee.depth,
                start: inlinee.start,
                end: inlinee.end,
                function_name,
                call_file: inlinee.call_file,
                call_line: inlinee.call_line,
            })
        })
        .collect();
    inline_sites.sort_by_key(|site| (site.depth, site.start));

    FunctionRecord {
        start,
        end,
        name,
        kind: SymbolKind::Func,
        source_file: lines.first().map(|line| line.file),
        lines,
        inline_sites,
    }
}

/// Sorts the FUNC records, drops duplicates and clamps overlaps, then fills
/// the gaps with PUBLIC symbols. A PUBLIC symbol extends up to the next
/// record, and the last one extends to the end of the address space.
fn merge_records(
    mut funcs: Vec<FunctionRecord>,
    mut publics: Vec<(u64, String)>,
) -> Vec<FunctionRecord> {
    funcs.sort_by_key(|func| func.start);
    funcs.dedup_by_key(|func| func.start);
    for i in 1..funcs.len() {
        let next_start = funcs[i].start;
        let prev = &mut funcs[i - 1];
        if prev.end > next_start {
            prev.end = next_start;
        }
    }

    publics.sort_by_key(|(address, _)| *address);
    publics.dedup_by_key(|(address, _)| *address);
    publics.retain(|(address, _)| {
        let index = funcs.partition_point(|func| func.start <= *address);
        match index.checked_sub(1) {
            Some(i) => !funcs[i].contains(*address),
            None => true,
        }
    });
    if publics.is_empty() {
        return funcs;
    }

    let mut records = funcs;
    records.extend(publics.into_iter().map(|(start, name)| FunctionRecord {
        start,
        end: u64::MAX,
        name,
        kind: SymbolKind::Public,
        source_file: None,
        lines: Vec::new(),
        inline_sites: Vec::new(),
    }));
    records.sort_by_key(|record| record.start);
    for i in 1..records.len() {
        let next_start = records[i].start;
        let prev = &mut records[i - 1];
        if prev.kind == SymbolKind::Public {
            prev.end = next_start;
        }
    }
    records
}

/// Consumes chunks and calls a callback for each line.
/// Leftover pieces are stored in a dynamically growing `Vec` in this object.
#[derive(Debug, Clone, Default)]
struct LineBuffer {
    leftover_bytes: Vec<u8>,
}

impl LineBuffer {
    fn consume(&mut self, mut chunk: &[u8], mut f: impl FnMut(&[u8])) {
        while let Some(line_break_pos) = memchr(b'\n', chunk) {
            let chunk_until_line_break = &chunk[..line_break_pos];
            chunk = &chunk[(line_break_pos + 1)..];
            if self.leftover_bytes.is_empty() {
                f(chunk_until_line_break);
            } else {
                self.leftover_bytes.extend_from_slice(chunk_until_line_break);
                f(&self.leftover_bytes);
                self.leftover_bytes.clear();
            }
        }
        self.leftover_bytes.extend_from_slice(chunk);
    }

    fn finish(self, mut f: impl FnMut(&[u8])) {
        if !self.leftover_bytes.is_empty() {
            f(&self.leftover_bytes);
        }
    }
}

/// Match a hex string, parse it to a u32 or a u64.
fn hex_str<T: std::ops::Shl<T, Output = T> + std::ops::BitOr<T, Output = T> + From<u8>>(
    input: &[u8],
) -> IResult<&[u8], T> {
    // Consume up to max_len digits. For u32 that's 8 digits and for u64 that's 16 digits.
    // Two hex digits form one byte.
    let max_len = mem::size_of::<T>() * 2;

    let mut res: T = T::from(0);
    let mut k = 0;
    for v in input.iter().take(max_len) {
        let digit = match (*v as char).to_digit(16) {
            Some(v) => v,
            None => break,
        };
        res = res << T::from(4);
        res = res | T::from(digit as u8);
        k += 1;
    }
    if k == 0 {
        return Err(Err::Error(Error::from_error_kind(
            input,
            ErrorKind::HexDigit,
        )));
    }
    let remaining = &input[k..];
    Ok((remaining, res))
}

/// Match a decimal string, parse it to a u32.
///
/// This is doing everything manually so that we only look at each byte once.
fn decimal_u32(input: &[u8]) -> IResult<&[u8], u32> {
    const MAX_LEN: usize = 10; // u32::MAX has 10 decimal digits
    let mut res: u64 = 0;
    let mut k = 0;
    for v in input.iter().take(MAX_LEN) {
        let digit_value = match (*v as char).to_digit(10) {
            Some(v) => v,
            None => break,
        };
        res = res * 10 + digit_value as u64;
        k += 1;
    }
    if k == 0 {
        return Err(Err::Error(Error::from_error_kind(input, ErrorKind::Digit)));
    }
    let res = u32::try_from(res)
        .map_err(|_| Err::Error(Error::from_error_kind(input, ErrorKind::TooLarge)))?;
    let remaining = &input[k..];
    Ok((remaining, res))
}

/// Take 0 or more non-space bytes.
fn non_space(input: &[u8]) -> IResult<&[u8], &[u8]> {
    take_while(|c: u8| c != b' ')(input)
}

/// Succeeds only if nothing but trailing spaces remains.
fn end_of_record(input: &[u8]) -> IResult<&[u8], &[u8]> {
    terminated(space0, eof)(input)
}

// Matches a MODULE record.
fn module_line(input: &[u8]) -> IResult<&[u8], (&str, &str, DebugId, &str)> {
    let (input, _) = terminated(tag("MODULE"), space1)(input)?;
    let (input, (os, cpu, debug_id, name)) = cut(tuple((
        terminated(map_res(non_space, str::from_utf8), space1), // os
        terminated(map_res(non_space, str::from_utf8), space1), // cpu
        terminated(
            map_res(map_res(hex_digit1, str::from_utf8), DebugId::from_breakpad),
            space1,
        ), // debug id
        map_res(rest, str::from_utf8),                          // filename
    )))(input)?;
    Ok((input, (os, cpu, debug_id, name)))
}

// Matches a FILE record.
fn file_line(input: &[u8]) -> IResult<&[u8], (u32, &[u8])> {
    let (input, _) = terminated(tag("FILE"), space1)(input)?;
    let (input, (id, filename)) = cut(tuple((terminated(decimal_u32, space1), rest)))(input)?;
    Ok((input, (id, filename)))
}

// Matches an INLINE_ORIGIN record.
fn inline_origin_line(input: &[u8]) -> IResult<&[u8], (u32, &[u8])> {
    let (input, _) = terminated(tag("INLINE_ORIGIN"), space1)(input)?;
    let (input, (id, function)) = cut(tuple((terminated(decimal_u32, space1), rest)))(input)?;
    Ok((input, (id, function)))
}

// Matches a PUBLIC record.
fn public_line(input: &[u8]) -> IResult<&[u8], (u64, &[u8])> {
    let (input, _) = terminated(tag("PUBLIC"), space1)(input)?;
    let (input, (_multiple, address, _parameter_size, name)) = cut(tuple((
        opt(terminated(tag("m"), space1)),
        terminated(hex_str::<u64>, space1),
        terminated(hex_str::<u64>, space1),
        rest,
    )))(input)?;
    Ok((input, (address, name)))
}

// Matches a FUNC record.
fn func_line(input: &[u8]) -> IResult<&[u8], (u64, u64, &[u8])> {
    let (input, _) = terminated(tag("FUNC"), space1)(input)?;
    let (input, (_multiple, address, size, _parameter_size, name)) = cut(tuple((
        opt(terminated(tag("m"), space1)),
        terminated(hex_str::<u64>, space1),
        terminated(hex_str::<u64>, space1),
        terminated(hex_str::<u64>, space1),
        rest,
    )))(input)?;
    Ok((input, (address, size, name)))
}

// Matches line data after a FUNC record: `<address> <size> <line> <file_id>`.
fn func_line_data(input: &[u8]) -> IResult<&[u8], LineRecord> {
    let (input, (offset, size, line, file, _)) = tuple((
        terminated(hex_str::<u64>, space1),
        terminated(hex_str::<u64>, space1),
        terminated(decimal_u32, space1),
        decimal_u32,
        end_of_record,
    ))(input)?;
    Ok((
        input,
        LineRecord {
            offset,
            size,
            line,
            file,
        },
    ))
}

// Matches one entry of the form <address> <size> which is used at the end of an INLINE record.
fn inline_address_range(input: &[u8]) -> IResult<&[u8], (u64, u64)> {
    tuple((terminated(hex_str::<u64>, space1), hex_str::<u64>))(input)
}

/// Matches an INLINE record.
///
/// An INLINE record has the form
/// `INLINE <inline_nest_level> <call_site_line> <call_site_file_id> <origin_id> [<address> <size>]+`.
///
/// Yields `None` for ranges whose end overflows.
fn inline_line(input: &[u8]) -> IResult<&[u8], impl Iterator<Item = Option<Inlinee>>> {
    let (input, _) = terminated(tag("INLINE"), space1)(input)?;
    let (input, (depth, call_line, call_file, origin_id)) = cut(tuple((
        terminated(decimal_u32, space1),
        terminated(decimal_u32, space1),
        terminated(decimal_u32, space1),
        terminated(decimal_u32, space1),
    )))(input)?;
    let (input, address_ranges) = cut(terminated(
        separated_list1(space1, inline_address_range),
        end_of_record,
    ))(input)?;
    Ok((
        input,
        address_ranges.into_iter().map(move |(start, size)| {
            Some(Inlinee {
                depth,
                start,
                end: start.checked_add(size)?,
                call_file,
                call_line,
                origin_id,
            })
        }),
    ))
}
