use std::fmt;
use std::str::FromStr;

use debugid::DebugId;

/// The error type for [`ModuleKey::new`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ModuleKeyError {
    #[error("Invalid debug ID {0:?}")]
    InvalidDebugId(String),

    #[error("Invalid debug file name {0:?}")]
    InvalidDebugFile(String),
}

/// Identifies one debug symbol file: the debug file name (e.g. `xul.pdb`)
/// together with its debug ID.
///
/// The debug ID is normalized on construction, so two keys compare equal iff
/// they refer to the same file name and the same ID, regardless of how the
/// ID was spelled in the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleKey {
    debug_file: String,
    debug_id: DebugId,
}

impl ModuleKey {
    /// Creates a key from a debug file name and a debug ID string.
    ///
    /// The debug ID can be given in Breakpad form (`44E4EC8C2F41492B9369D6B9A059577C2`,
    /// any case) or as a hyphenated GUID with an optional age suffix.
    ///
    /// The debug file name becomes a path component both in the cache and in
    /// mirror URLs, so names containing path separators are rejected.
    pub fn new(debug_file: impl Into<String>, debug_id: &str) -> Result<Self, ModuleKeyError> {
        let debug_file = debug_file.into();
        if !is_valid_debug_file(&debug_file) {
            return Err(ModuleKeyError::InvalidDebugFile(debug_file));
        }
        let debug_id = parse_debug_id(debug_id)?;
        Ok(Self {
            debug_file,
            debug_id,
        })
    }

    /// Creates a key from an already-parsed debug ID.
    pub fn from_debug_id(
        debug_file: impl Into<String>,
        debug_id: DebugId,
    ) -> Result<Self, ModuleKeyError> {
        let debug_file = debug_file.into();
        if !is_valid_debug_file(&debug_file) {
            return Err(ModuleKeyError::InvalidDebugFile(debug_file));
        }
        Ok(Self {
            debug_file,
            debug_id,
        })
    }

    pub fn debug_file(&self) -> &str {
        &self.debug_file
    }

    pub fn debug_id(&self) -> DebugId {
        self.debug_id
    }

    /// The normalized debug ID: uppercase hex, no separators.
    pub fn debug_id_string(&self) -> String {
        self.debug_id.breakpad().to_string()
    }

    /// The name of the Breakpad symbol file, e.g. `xul.sym` for `xul.pdb`
    /// and `libxul.so.sym` for `libxul.so`.
    pub fn sym_file_name(&self) -> String {
        match self.debug_file.strip_suffix(".pdb") {
            Some(stem) if !stem.is_empty() => format!("{stem}.sym"),
            _ => format!("{}.sym", self.debug_file),
        }
    }

    /// The relative path under which symbol servers store this file:
    /// `<debug_file>/<DEBUG_ID>/<sym_file_name>`.
    pub fn sym_path(&self) -> String {
        format!(
            "{}/{}/{}",
            self.debug_file,
            self.debug_id_string(),
            self.sym_file_name()
        )
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.debug_file, self.debug_id.breakpad())
    }
}

fn parse_debug_id(s: &str) -> Result<DebugId, ModuleKeyError> {
    let trimmed = s.trim();
    DebugId::from_breakpad(trimmed)
        .or_else(|_| DebugId::from_str(trimmed))
        .map_err(|_| ModuleKeyError::InvalidDebugId(s.to_string()))
}

fn is_valid_debug_file(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}
