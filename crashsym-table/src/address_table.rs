use std::collections::BTreeMap;

use debugid::DebugId;

/// Whether a record came from a `FUNC` block (with line and inline
/// information) or from a bare `PUBLIC` symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SymbolKind {
    Func,
    Public,
}

/// One entry of a function's line table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineRecord {
    /// The start offset relative to the module's load address.
    pub offset: u64,
    /// The size of this range of instructions in bytes.
    pub size: u64,
    /// The line number in `file` that generated this machine code.
    pub line: u32,
    /// An index into [`AddressTable::files`].
    pub file: u32,
}

/// A range of a function's code which was inlined from another function.
///
/// Line records describe locations at the deepest level of inlining; the
/// call site of an inline site describes the location in the function one
/// level further out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineSite {
    /// Nesting depth; depth 0 is inlined directly into the outer function.
    pub depth: u32,
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    /// The name of the inlined function.
    pub function_name: String,
    /// An index into [`AddressTable::files`].
    pub call_file: u32,
    pub call_line: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionRecord {
    pub start: u64,
    /// Exclusive.
    pub end: u64,
    pub name: String,
    pub kind: SymbolKind,
    /// The file of the first line record, as an index into [`AddressTable::files`].
    pub source_file: Option<u32>,
    /// Sorted by `offset`.
    pub lines: Vec<LineRecord>,
    /// Sorted by `(depth, start)`.
    pub inline_sites: Vec<InlineSite>,
}

impl FunctionRecord {
    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.end
    }

    /// Returns the line record with the greatest offset that does not exceed
    /// `offset`: the last line at or before the address.
    pub fn line_at(&self, offset: u64) -> Option<&LineRecord> {
        let index = self.lines.partition_point(|line| line.offset <= offset);
        index.checked_sub(1).map(|i| &self.lines[i])
    }

    /// Returns the inline site at the given depth which covers `offset`.
    ///
    /// For example, if we have an "inline call stack" A -> B -> C at this
    /// address, i.e. both the call to B and the call to C have been inlined
    /// all the way into A, then the call A -> B is at depth zero, and the
    /// call B -> C is at depth one.
    pub fn inline_site_at(&self, depth: u32, offset: u64) -> Option<&InlineSite> {
        let index = self
            .inline_sites
            .partition_point(|site| (site.depth, site.start) <= (depth, offset));
        let site = &self.inline_sites[index.checked_sub(1)?];
        if site.depth == depth && offset < site.end {
            Some(site)
        } else {
            None
        }
    }
}

/// The parsed form of a symbol file: function records sorted by start
/// offset, non-overlapping, ready for binary search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTable {
    pub debug_id: DebugId,
    pub name: String,
    pub os: String,
    pub arch: String,
    pub files: BTreeMap<u32, String>,
    pub records: Vec<FunctionRecord>,
}

/// A single (possibly inlined) function at a looked-up address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFrame<'a> {
    pub function: &'a str,
    pub file: Option<&'a str>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressLookup<'a> {
    pub record: &'a FunctionRecord,
    /// The distance from the start of the function.
    pub function_offset: u64,
    /// Innermost frame first; the last frame is always `record` itself.
    pub frames: Vec<SourceFrame<'a>>,
}

impl<'a> AddressLookup<'a> {
    /// The outer function, i.e. the one that owns the machine code.
    pub fn outer_frame(&self) -> &SourceFrame<'a> {
        self.frames
            .last()
            .expect("frames always contains the outer function")
    }

    /// The frames inlined into the outer function, innermost first.
    pub fn inlined_frames(&self) -> &[SourceFrame<'a>] {
        &self.frames[..self.frames.len() - 1]
    }
}

impl AddressTable {
    pub fn symbol_count(&self) -> usize {
        self.records.len()
    }

    pub fn file_path(&self, index: u32) -> Option<&str> {
        self.files.get(&index).map(String::as_str)
    }

    /// Finds the record whose `[start, end)` range contains `offset`.
    pub fn record_for(&self, offset: u64) -> Option<&FunctionRecord> {
        let index = self.records.partition_point(|r| r.start <= offset);
        let record = &self.records[index.checked_sub(1)?];
        record.contains(offset).then_some(record)
    }

    /// Looks up the function, inline stack and source location at `offset`.
    ///
    /// Returns `None` if no record covers the offset.
    pub fn lookup(&self, offset: u64) -> Option<AddressLookup<'_>> {
        let record = self.record_for(offset)?;

        let mut inline_chain = Vec::new();
        let mut depth = 0;
        while let Some(site) = record.inline_site_at(depth, offset) {
            inline_chain.push(site);
            depth += 1;
        }

        let innermost_line = record.line_at(offset);
        let mut frames = Vec::with_capacity(inline_chain.len() + 1);

        // Build outer-first, then reverse.
        let names = std::iter::once(record.name.as_str())
            .chain(inline_chain.iter().map(|site| site.function_name.as_str()));
        for (i, function) in names.enumerate() {
            let (file, line) = match inline_chain.get(i) {
                Some(call_site) => (
                    self.file_path(call_site.call_file),
                    Some(call_site.call_line),
                ),
                None => match innermost_line {
                    Some(line) => (self.file_path(line.file), Some(line.line)),
                    None => (None, None),
                },
            };
            frames.push(SourceFrame {
                function,
                file,
                line,
            });
        }
        frames.reverse();

        Some(AddressLookup {
            record,
            function_offset: offset - record.start,
            frames,
        })
    }
}
