//! Core job data model: records, events, requests, and the pure helper
//! functions (AOI parsing, path sandboxing) the admission and worker paths
//! consume.

pub mod aoi;
pub mod model;
pub mod request;
pub mod sandbox;

pub use model::{
    CancelOutcome, Job, JobError, JobErrorCode, JobEvent, JobEventKind, JobOutcome, JobResult,
    JobState, ProgressPatch,
};
pub use request::{JobRequest, ProviderKind, RequestError};
