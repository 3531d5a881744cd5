use std::collections::HashSet;

use crashsym::{InlineFrame, Job, JobResult, ModuleStatus, ResolvedFrame};
use serde::ser::{SerializeMap, SerializeSeq};

/// `{"symbolicatedStacks": [...], "knownModules": [...]}`
pub struct LegacyResponse<'a> {
    pub result: &'a JobResult,
}

impl serde::Serialize for LegacyResponse<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("symbolicatedStacks", &ResponseStacks(&self.result.stacks))?;
        map.serialize_entry("knownModules", &KnownModules(&self.result.modules))?;
        map.end()
    }
}

/// `{"results": [{"stacks": [...], "found_modules": {...}}, ...]}`
pub struct ModernResponse<'a> {
    pub jobs: &'a [Job],
    pub results: &'a [JobResult],
}

impl serde::Serialize for ModernResponse<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(
            "results",
            &ModernResults {
                jobs: self.jobs,
                results: self.results,
            },
        )?;
        map.end()
    }
}

struct ModernResults<'a> {
    jobs: &'a [Job],
    results: &'a [JobResult],
}

impl serde::Serialize for ModernResults<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.results.len()))?;
        for (job, result) in self.jobs.iter().zip(self.results) {
            seq.serialize_element(&ModernResult { job, result })?;
        }
        seq.end()
    }
}

struct ModernResult<'a> {
    job: &'a Job,
    result: &'a JobResult,
}

impl serde::Serialize for ModernResult<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("stacks", &ResponseStacks(&self.result.stacks))?;
        map.serialize_entry(
            "found_modules",
            &FoundModules {
                job: self.job,
                statuses: &self.result.modules,
            },
        )?;
        map.end()
    }
}

/// One `found` value per memory map entry: true, false, or null if no frame
/// referred to the module.
struct KnownModules<'a>(&'a [ModuleStatus]);

impl serde::Serialize for KnownModules<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.0.iter().map(|status| status.found()))
    }
}

/// Keyed by `<debug_file>/<DEBUG_ID>`. A module that appears twice in the
/// memory map is listed once.
struct FoundModules<'a> {
    job: &'a Job,
    statuses: &'a [ModuleStatus],
}

impl serde::Serialize for FoundModules<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seen = HashSet::new();
        let mut map = serializer.serialize_map(None)?;
        for (key, status) in self.job.modules.iter().zip(self.statuses) {
            if seen.insert(key) {
                map.serialize_entry(&key.to_string(), &status.found())?;
            }
        }
        map.end()
    }
}

struct ResponseStacks<'a>(&'a [Vec<ResolvedFrame>]);

impl serde::Serialize for ResponseStacks<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for stack in self.0 {
            seq.serialize_element(&ResponseStack(stack))?;
        }
        seq.end()
    }
}

struct ResponseStack<'a>(&'a [ResolvedFrame]);

impl serde::Serialize for ResponseStack<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.0.iter().map(ResponseFrame))
    }
}

struct ResponseFrame<'a>(&'a ResolvedFrame);

impl serde::Serialize for ResponseFrame<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let frame = self.0;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("frame", &frame.frame)?;
        map.serialize_entry("module_offset", &frame.module_offset)?;
        map.serialize_entry("module", &frame.module)?;
        map.serialize_entry("function", &frame.function)?;
        map.serialize_entry("function_offset", &frame.function_offset)?;
        map.serialize_entry("file", &frame.file)?;
        map.serialize_entry("line", &frame.line)?;
        if !frame.inlines.is_empty() {
            map.serialize_entry("inlines", &ResponseInlineFrames(&frame.inlines))?;
        }
        map.end()
    }
}

struct ResponseInlineFrames<'a>(&'a [InlineFrame]);

impl serde::Serialize for ResponseInlineFrames<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for inline in self.0 {
            seq.serialize_element(&ResponseInlineFrame(inline))?;
        }
        seq.end()
    }
}

struct ResponseInlineFrame<'a>(&'a InlineFrame);

impl serde::Serialize for ResponseInlineFrame<'_> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("function", &self.0.function)?;
        map.serialize_entry("file", &self.0.file)?;
        map.serialize_entry("line", &self.0.line)?;
        map.end()
    }
}
