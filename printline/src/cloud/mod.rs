//! Remote photogrammetry: service client, job record and the polling loop.

pub mod api;
mod job;
pub mod openscan;
mod poller;

pub use api::{CloudError, PhotogrammetryApi, Submission};
pub use job::{CloudJob, CloudJobState, JobStatus};
pub use openscan::OpenScanCloudClient;
pub use poller::{CloudJobPoller, PollPolicy};
