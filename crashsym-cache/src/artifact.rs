use std::sync::Arc;

use bytes::Bytes;
use crashsym_table::AddressTable;

/// What the cache knows about one symbol file.
///
/// `Missing` and `Invalid` are negative results: they record that fetching
/// or parsing already failed, so that the work isn't repeated for every
/// request. They expire after the cache's negative retention period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolArtifact {
    /// The downloaded symbol file, not parsed yet.
    Raw(Bytes),
    Parsed(Arc<AddressTable>),
    /// No mirror had the file.
    Missing,
    /// The file was downloaded but could not be parsed. Carries the reason.
    Invalid(String),
}

impl SymbolArtifact {
    pub fn is_negative(&self) -> bool {
        matches!(self, SymbolArtifact::Missing | SymbolArtifact::Invalid(_))
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            SymbolArtifact::Raw(_) => "raw",
            SymbolArtifact::Parsed(_) => "parsed",
            SymbolArtifact::Missing => "missing",
            SymbolArtifact::Invalid(_) => "invalid",
        }
    }
}
