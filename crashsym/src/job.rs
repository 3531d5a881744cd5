use crashsym_table::ModuleKey;

/// One frame to symbolicate: an offset relative to the start of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    /// An index into [`Job::modules`]. `None`, or an index that is out of
    /// range, means that the frame's module is unknown.
    pub module_index: Option<usize>,
    pub module_offset: u64,
}

impl FrameRequest {
    pub fn new(module_index: Option<usize>, module_offset: u64) -> Self {
        Self {
            module_index,
            module_offset,
        }
    }
}

/// A set of stacks, together with the modules their frames refer to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Job {
    pub modules: Vec<ModuleKey>,
    pub stacks: Vec<Vec<FrameRequest>>,
}

impl Job {
    pub fn new(modules: Vec<ModuleKey>, stacks: Vec<Vec<FrameRequest>>) -> Self {
        Self { modules, stacks }
    }

    /// The module a frame refers to, if the index is valid.
    pub fn module_for(&self, frame: &FrameRequest) -> Option<&ModuleKey> {
        frame.module_index.and_then(|index| self.modules.get(index))
    }

    pub fn frame_count(&self) -> usize {
        self.stacks.iter().map(Vec::len).sum()
    }
}

/// The outcome of loading one module's symbols for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleStatus {
    /// Symbols were found and used.
    Found,
    /// No symbol server has a symbol file for this module.
    Missing,
    /// The symbol file exists but could not be parsed, or belongs to a
    /// different build.
    Invalid,
    /// The symbol servers could not be reached.
    Unavailable,
    /// The job's time budget ran out before the symbols were loaded.
    TimedOut,
    /// No frame referred to this module, so it wasn't looked up.
    NotRequested,
}

impl ModuleStatus {
    /// `Some(true)` if symbols were found, `None` if the module wasn't looked
    /// up, `Some(false)` otherwise.
    pub fn found(self) -> Option<bool> {
        match self {
            ModuleStatus::Found => Some(true),
            ModuleStatus::NotRequested => None,
            _ => Some(false),
        }
    }
}

/// A function that was inlined at a frame's address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineFrame {
    pub function: String,
    pub file: Option<String>,
    pub line: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedFrame {
    /// The frame's position in its stack.
    pub frame: usize,
    pub module_offset: u64,
    /// The debug file name of the frame's module, if the module is known.
    pub module: Option<String>,
    /// `None` if the frame could not be symbolicated.
    pub function: Option<String>,
    /// The distance from the start of `function`.
    pub function_offset: Option<u64>,
    pub file: Option<String>,
    pub line: Option<u32>,
    /// Functions inlined at this address, innermost first. `function` is the
    /// outermost one.
    pub inlines: Vec<InlineFrame>,
}

impl ResolvedFrame {
    pub fn unsymbolicated(frame: usize, module_offset: u64, module: Option<String>) -> Self {
        Self {
            frame,
            module_offset,
            module,
            function: None,
            function_offset: None,
            file: None,
            line: None,
            inlines: Vec::new(),
        }
    }

    pub fn is_symbolicated(&self) -> bool {
        self.function.is_some()
    }
}

/// The result of [`Symbolicator::resolve`](crate::Symbolicator::resolve), in
/// the same order as the job's stacks and modules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobResult {
    pub stacks: Vec<Vec<ResolvedFrame>>,
    /// One status per entry of [`Job::modules`].
    pub modules: Vec<ModuleStatus>,
}
