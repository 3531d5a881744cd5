use std::path::PathBuf;

use crashsym_table::{
    parse_for_module, parse_sym_file, AddressTable, ModuleKey, ParseError, SourceFrame,
    SymFileParser, SymbolKind,
};

fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("..")
        .join("fixtures")
        .join("breakpad")
}

fn example_sym() -> Vec<u8> {
    std::fs::read(fixtures_dir().join("example.sym")).unwrap()
}

fn example_key() -> ModuleKey {
    ModuleKey::new("example.pdb", "AA152DEB2D9B76084C4C44205044422E1").unwrap()
}

#[test]
fn example_file_records() {
    let table = parse_for_module(&example_sym(), &example_key()).unwrap();
    assert_eq!(table.name, "example.pdb");
    assert_eq!(table.files.len(), 3);

    let summary: Vec<_> = table
        .records
        .iter()
        .map(|r| (r.start, r.end, r.kind))
        .collect();
    assert_eq!(
        summary,
        [
            (0x1000, 0x105a, SymbolKind::Func),
            (0x1060, 0x10a0, SymbolKind::Func),
            (0x10a0, 0x1100, SymbolKind::Public),
            (0x1100, 0x1200, SymbolKind::Public),
            (0x1200, 0x1210, SymbolKind::Func),
        ]
    );
    assert_eq!(
        table.records[4].name,
        "<folded> mozilla::detail::EmptyHelper()"
    );
}

#[test]
fn inline_stack_lookup() {
    let table = parse_sym_file(&example_sym()).unwrap();
    let lookup = table.lookup(0x101a).unwrap();
    assert_eq!(lookup.function_offset, 0x1a);
    assert_eq!(
        lookup.frames,
        vec![
            SourceFrame {
                function: "mozilla::Span<const char>::Length() const",
                file: Some("/builds/worker/workspace/obj-build/dist/include/mozilla/Span.h"),
                line: Some(412),
            },
            SourceFrame {
                function: "mozilla::Vector<char,0,mozilla::MallocAllocPolicy>::append(const char*, size_t)",
                file: Some("hg:hg.mozilla.org/mozilla-central:mfbt/Vector.h:2e3f6e1ab3b4"),
                line: Some(88),
            },
            SourceFrame {
                function: "mozilla::PrintfTarget::vprint(const char*, va_list)",
                file: Some("hg:hg.mozilla.org/mozilla-central:mozglue/misc/Printf.cpp:2e3f6e1ab3b4"),
                line: Some(210),
            },
        ]
    );

    // Outside of any inline site the outer function gets its own line.
    let lookup = table.lookup(0x1035).unwrap();
    assert_eq!(lookup.frames.len(), 1);
    assert_eq!(lookup.outer_frame().line, Some(215));
}

#[test]
fn gaps_and_publics() {
    let table = parse_sym_file(&example_sym()).unwrap();
    // Between the end of the first FUNC and the start of the second.
    assert!(table.lookup(0x105a).is_none());
    assert!(table.lookup(0xfff).is_none());

    let lookup = table.lookup(0x10b0).unwrap();
    assert_eq!(lookup.record.name, "__security_check_cookie");
    assert_eq!(lookup.function_offset, 0x10);
    assert_eq!(lookup.outer_frame().file, None);
    assert_eq!(lookup.outer_frame().line, None);
}

#[test]
fn parsing_is_deterministic() {
    let data = example_sym();
    let first = parse_sym_file(&data).unwrap();
    let second = parse_sym_file(&data).unwrap();
    assert_eq!(first, second);
    assert_eq!(first.to_bytes(), second.to_bytes());

    let mut parser = SymFileParser::new();
    for chunk in data.chunks(17) {
        parser.consume(chunk);
    }
    assert_eq!(parser.finish().unwrap(), first);
}

#[test]
fn encoded_table_round_trip() {
    let table = parse_sym_file(&example_sym()).unwrap();
    let decoded = AddressTable::from_bytes(&table.to_bytes()).unwrap();
    assert_eq!(decoded, table);
}

#[test]
fn wrong_module_is_rejected() {
    let other = ModuleKey::new("example.pdb", "AA152DEB2D9B76084C4C44205044422E2").unwrap();
    let err = parse_for_module(&example_sym(), &other).unwrap_err();
    assert_eq!(
        err,
        ParseError::DebugIdMismatch {
            expected: other.debug_id(),
            found: example_key().debug_id(),
        }
    );
}

#[test]
fn html_error_page_is_not_a_symbol_file() {
    let page = b"<!DOCTYPE html>\n<html><body>Not Found</body></html>\n";
    assert_eq!(parse_sym_file(page), Err(ParseError::NoModuleHeader));
}
