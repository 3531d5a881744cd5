use crashsym::crashsym_table::ModuleKey;
use crashsym::{FrameRequest, Job};
use serde_derive::Deserialize;

use crate::error::ApiError;

/// The wire protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiVersion {
    /// One implicit job: `{"stacks", "memoryMap"}`.
    V4,
    /// A list of jobs: `{"jobs": [{"stacks", "memoryMap"}]}`.
    V5,
}

impl ApiVersion {
    fn from_number(version: u64) -> Result<Self, ApiError> {
        match version {
            4 => Ok(ApiVersion::V4),
            5 => Ok(ApiVersion::V5),
            other => Err(ApiError::UnsupportedVersion(other)),
        }
    }
}

/// The document as it comes off the wire, before the version and shape have
/// been checked against each other.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct RawRequest {
    version: Option<u64>,
    jobs: Option<Vec<JobDocument>>,
    memory_map: Option<Vec<Lib>>,
    stacks: Option<Vec<Stack>>,
}

#[derive(Debug)]
pub enum Request {
    Legacy(JobDocument),
    Modern(Vec<JobDocument>),
}

impl Request {
    /// Parses a request document. `url_version` is the version implied by
    /// the request URL, if any; the document's own `version` field has to
    /// agree with it.
    pub fn parse(request_json: &str, url_version: Option<ApiVersion>) -> Result<Self, ApiError> {
        let raw: RawRequest = serde_json::from_str(request_json)?;
        let declared = raw.version.map(ApiVersion::from_number).transpose()?;
        let version = match (declared, url_version) {
            (Some(declared), Some(url_version)) if declared != url_version => {
                return Err(ApiError::ParseRequestErrorContents(
                    "the version field does not match the requested API version",
                ));
            }
            (Some(version), _) | (None, Some(version)) => version,
            (None, None) if raw.jobs.is_some() => ApiVersion::V5,
            (None, None) => ApiVersion::V4,
        };

        match (version, raw) {
            (
                ApiVersion::V4,
                RawRequest {
                    jobs: None,
                    memory_map: Some(memory_map),
                    stacks: Some(stacks),
                    ..
                },
            ) => Ok(Request::Legacy(JobDocument { memory_map, stacks })),
            (ApiVersion::V4, RawRequest { jobs: Some(_), .. }) => Err(
                ApiError::ParseRequestErrorContents("version 4 requests don't have a jobs list"),
            ),
            (ApiVersion::V4, _) => Err(ApiError::ParseRequestErrorContents(
                "version 4 requests need stacks and memoryMap",
            )),
            (
                ApiVersion::V5,
                RawRequest {
                    jobs: Some(jobs),
                    memory_map: None,
                    stacks: None,
                    ..
                },
            ) => Ok(Request::Modern(jobs)),
            (ApiVersion::V5, RawRequest { jobs: None, .. }) => Err(
                ApiError::ParseRequestErrorContents("version 5 requests need a jobs list"),
            ),
            (ApiVersion::V5, _) => Err(ApiError::ParseRequestErrorContents(
                "version 5 requests keep stacks and memoryMap inside each job",
            )),
        }
    }

    pub fn version(&self) -> ApiVersion {
        match self {
            Request::Legacy(_) => ApiVersion::V4,
            Request::Modern(_) => ApiVersion::V5,
        }
    }

    pub fn job_documents(&self) -> &[JobDocument] {
        match self {
            Request::Legacy(job) => std::slice::from_ref(job),
            Request::Modern(jobs) => jobs,
        }
    }

    /// Converts every job into the symbolicator's representation. Each job
    /// keeps its own module list.
    pub fn to_jobs(&self) -> Result<Vec<Job>, ApiError> {
        self.job_documents().iter().map(JobDocument::to_job).collect()
    }
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct JobDocument {
    pub memory_map: Vec<Lib>,
    pub stacks: Vec<Stack>,
}

impl JobDocument {
    pub fn to_job(&self) -> Result<Job, ApiError> {
        let modules = self
            .memory_map
            .iter()
            .map(Lib::to_module_key)
            .collect::<Result<Vec<_>, _>>()?;
        let stacks = self
            .stacks
            .iter()
            .map(|stack| stack.0.iter().map(StackFrame::to_frame_request).collect())
            .collect();
        Ok(Job::new(modules, stacks))
    }
}

/// `[debug_file, debug_id]`
#[derive(Deserialize, Debug, PartialEq, Eq, Hash, Clone)]
pub struct Lib(pub String, pub String);

impl Lib {
    fn to_module_key(&self) -> Result<ModuleKey, ApiError> {
        let Lib(debug_file, debug_id) = self;
        ModuleKey::new(debug_file.as_str(), debug_id).map_err(|source| ApiError::InvalidModule {
            debug_file: debug_file.clone(),
            debug_id: debug_id.clone(),
            source,
        })
    }
}

#[derive(Deserialize, Debug)]
pub struct Stack(pub Vec<StackFrame>);

/// `[module_index, module_offset]`. A null or negative module index means
/// the frame's module is unknown.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct StackFrame(pub Option<i64>, pub u64);

impl StackFrame {
    fn to_frame_request(&self) -> FrameRequest {
        let StackFrame(module_index, module_offset) = *self;
        let module_index = module_index.and_then(|index| usize::try_from(index).ok());
        FrameRequest::new(module_index, module_offset)
    }
}
