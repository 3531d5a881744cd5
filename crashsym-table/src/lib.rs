//! This crate parses Breakpad `.sym` files into address tables which map
//! module-relative code offsets to function names, source locations and
//! inline call stacks.
//!
//! It also defines [`ModuleKey`], the identity of a symbol file, which the
//! rest of the crashsym crates use for caching and downloading.
//!
//! # Example
//!
//! ```rust
//! use crashsym_table::{parse_for_module, ModuleKey};
//!
//! let sym = b"MODULE windows x86_64 44E4EC8C2F41492B9369D6B9A059577C2 xul.pdb
//! FILE 0 main.cpp
//! FUNC 1000 20 0 main
//! 1000 20 42 0
//! ";
//! let key = ModuleKey::new("xul.pdb", "44E4EC8C2F41492B9369D6B9A059577C2").unwrap();
//! let table = parse_for_module(sym, &key).unwrap();
//! let lookup = table.lookup(0x1010).unwrap();
//! assert_eq!(lookup.record.name, "main");
//! assert_eq!(lookup.function_offset, 0x10);
//! assert_eq!(lookup.outer_frame().line, Some(42));
//! ```
//!
//! # Format notes
//!
//! Records that this crate does not understand (`INFO`, `STACK`, and
//! anything added to the format later) are skipped. Malformed numbers in
//! records that it does understand make the whole file invalid, as do line
//! and `INLINE` records which fall outside their `FUNC` range.

pub use debugid;

mod address_table;
mod module_key;
mod parser;
mod serialization;

pub use address_table::{
    AddressLookup, AddressTable, FunctionRecord, InlineSite, LineRecord, SourceFrame, SymbolKind,
};
pub use module_key::{ModuleKey, ModuleKeyError};
pub use parser::{parse_for_module, parse_sym_file, ParseError, SymFileParser};
pub use serialization::DecodeError;
