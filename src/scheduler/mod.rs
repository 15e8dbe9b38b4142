pub mod job;
pub mod pending;
pub mod request;
pub mod submitter;

pub use job::{Job, JobDetail, JobId, JobKind, JobName, JobStatus};
pub use pending::pending_jobs;
pub use request::{ReportAddress, RequestBuilder, ScriptRequestBuilder};
pub use submitter::{CycleReport, JobSubmitter};
