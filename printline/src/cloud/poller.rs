//! Submit-and-wait loop over a [`PhotogrammetryApi`].

use super::api::{PhotogrammetryApi, Submission};
use super::job::{CloudJob, CloudJobState, JobStatus};
use crate::config::CloudConfig;
use crate::errors::PrintlineError;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Cadence and bounds of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay before each status poll.
    pub poll_interval: Duration,
    /// Total time to wait for a terminal state.
    pub max_wait: Duration,
    /// Immediate retries of one poll on transient errors.
    pub transient_retries: u32,
}

impl PollPolicy {
    /// Reads the policy from the cloud section.
    #[must_use]
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            max_wait: config.max_wait(),
            transient_retries: config.transient_retries,
        }
    }

    /// The most polls a wait can make: `ceil(max_wait / poll_interval)`.
    #[must_use]
    pub fn max_polls(&self) -> u32 {
        max_polls(self.poll_interval, self.max_wait)
    }
}

fn max_polls(poll_interval: Duration, max_wait: Duration) -> u32 {
    let interval = poll_interval.as_millis().max(1);
    let polls = max_wait.as_millis().div_ceil(interval).max(1);
    u32::try_from(polls).unwrap_or(u32::MAX)
}

/// Tracks cloud jobs from submission to downloaded result.
#[derive(Clone)]
pub struct CloudJobPoller {
    api: Arc<dyn PhotogrammetryApi>,
    policy: PollPolicy,
}

impl std::fmt::Debug for CloudJobPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudJobPoller")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl CloudJobPoller {
    /// Creates a poller.
    #[must_use]
    pub fn new(api: Arc<dyn PhotogrammetryApi>, policy: PollPolicy) -> Self {
        Self { api, policy }
    }

    /// The default policy.
    #[must_use]
    pub fn policy(&self) -> PollPolicy {
        self.policy
    }

    /// Uploads the submission and starts processing.
    pub async fn submit(&self, submission: &Submission) -> Result<CloudJob, PrintlineError> {
        let job_id = self.api.submit(submission).await?;
        info!(job_id = %job_id, label = %submission.label, "cloud job submitted");
        Ok(CloudJob::submitted(job_id))
    }

    /// Polls until the job finishes, fails, or `max_wait` elapses, then
    /// downloads the result into `dest_dir`.
    ///
    /// Makes at most `ceil(max_wait / poll_interval)` polls. Each waits
    /// `poll_interval`, except the last, which is pulled in to land on the
    /// deadline rather than after it.
    pub async fn await_completion(
        &self,
        job: &mut CloudJob,
        poll_interval: Duration,
        max_wait: Duration,
        dest_dir: &Path,
    ) -> Result<PathBuf, PrintlineError> {
        let limit = max_polls(poll_interval, max_wait);
        let deadline = Instant::now() + max_wait;

        while job.poll_count < limit && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(poll_interval.min(remaining)).await;

            let status = self.poll_once(&job.job_id).await?;
            job.record_poll(status.state);
            debug!(
                job_id = %job.job_id,
                poll_count = job.poll_count,
                state = %status.state,
                detail = %status.detail,
                progress = ?status.progress,
                "cloud job polled"
            );

            match status.state {
                CloudJobState::Complete => {
                    info!(job_id = %job.job_id, poll_count = job.poll_count, "cloud job complete");
                    return Ok(self.api.download(&job.job_id, dest_dir).await?);
                }
                CloudJobState::Failed => {
                    return Err(PrintlineError::RemoteJob(format!(
                        "cloud job {} failed: {}",
                        job.job_id, status.detail
                    )));
                }
                _ => {}
            }
        }

        job.state = CloudJobState::TimedOut;
        warn!(job_id = %job.job_id, poll_count = job.poll_count, "cloud job timed out");
        Err(PrintlineError::Timeout {
            operation: format!("cloud job {}", job.job_id),
            after: max_wait,
        })
    }

    /// Submits, waits with the default policy and downloads.
    pub async fn reconstruct(&self, submission: &Submission, dest_dir: &Path) -> Result<PathBuf, PrintlineError> {
        let mut job = self.submit(submission).await?;
        self.await_completion(
            &mut job,
            self.policy.poll_interval,
            self.policy.max_wait,
            dest_dir,
        )
        .await
    }

    async fn poll_once(&self, job_id: &str) -> Result<JobStatus, PrintlineError> {
        let mut retries = 0;
        loop {
            match self.api.status(job_id).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_transient() && retries < self.policy.transient_retries => {
                    retries += 1;
                    warn!(job_id, retry = retries, error = %e, "transient poll error, retrying");
                }
                Err(e) if e.is_transient() => {
                    return Err(PrintlineError::Connectivity(format!(
                        "cloud status for {job_id} unavailable after {} retries: {e}",
                        self.policy.transient_retries
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::api::{CloudError, MockPhotogrammetryApi};
    use crate::errors::ErrorKind;
    use mockall::Sequence;

    fn policy() -> PollPolicy {
        PollPolicy {
            poll_interval: Duration::from_secs(3),
            max_wait: Duration::from_secs(10),
            transient_retries: 2,
        }
    }

    fn transport() -> CloudError {
        CloudError::Transport("connection reset".to_string())
    }

    #[test]
    fn test_max_polls_rounds_up() {
        assert_eq!(policy().max_polls(), 4);
        assert_eq!(max_polls(Duration::from_secs(60), Duration::from_secs(3600)), 60);
        assert_eq!(max_polls(Duration::from_secs(60), Duration::from_secs(10)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_after_bounded_polls() {
        let mut api = MockPhotogrammetryApi::new();
        api.expect_status()
            .times(4)
            .returning(|_| Ok(JobStatus::processing("processing")));
        api.expect_download().never();

        let poller = CloudJobPoller::new(Arc::new(api), policy());
        let mut job = CloudJob::submitted("1-owl-OSC.zip");
        let err = poller
            .await_completion(&mut job, policy().poll_interval, policy().max_wait, Path::new("/tmp"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(job.poll_count, 4);
        assert_eq!(job.state, CloudJobState::TimedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_poll_lands_on_deadline() {
        let started = Instant::now();
        let polled_at = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let mut api = MockPhotogrammetryApi::new();
        {
            let polled_at = Arc::clone(&polled_at);
            api.expect_status().returning(move |_| {
                polled_at.lock().push(started.elapsed());
                Ok(JobStatus::processing("processing"))
            });
        }

        let poller = CloudJobPoller::new(Arc::new(api), policy());
        let mut job = CloudJob::submitted("1-owl-OSC.zip");
        poller
            .await_completion(&mut job, policy().poll_interval, policy().max_wait, Path::new("/tmp"))
            .await
            .unwrap_err();

        let secs: Vec<u64> = polled_at.lock().iter().map(Duration::as_secs).collect();
        assert_eq!(secs, vec![3, 6, 9, 10]);
        assert!(started.elapsed() <= policy().max_wait);
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_downloads_result() {
        let mut seq = Sequence::new();
        let mut api = MockPhotogrammetryApi::new();
        api.expect_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(JobStatus::processing("queued")));
        api.expect_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(JobStatus::complete()));
        api.expect_download()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, dest| Ok(dest.join("owl.obj")));

        let poller = CloudJobPoller::new(Arc::new(api), policy());
        let mut job = CloudJob::submitted("1-owl-OSC.zip");
        let mesh = poller
            .await_completion(&mut job, policy().poll_interval, policy().max_wait, Path::new("/r"))
            .await
            .unwrap();

        assert_eq!(mesh, PathBuf::from("/r/owl.obj"));
        assert_eq!(job.poll_count, 2);
        assert_eq!(job.state, CloudJobState::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_job_is_remote_job_error() {
        let mut api = MockPhotogrammetryApi::new();
        api.expect_status()
            .times(1)
            .returning(|_| Ok(JobStatus::failed(r#"{"status":"failed"}"#)));

        let poller = CloudJobPoller::new(Arc::new(api), policy());
        let mut job = CloudJob::submitted("1-owl-OSC.zip");
        let err = poller
            .await_completion(&mut job, policy().poll_interval, policy().max_wait, Path::new("/r"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteJob);
        assert_eq!(job.state, CloudJobState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_within_one_poll() {
        let mut seq = Sequence::new();
        let mut api = MockPhotogrammetryApi::new();
        api.expect_status()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(transport()));
        api.expect_status()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(JobStatus::complete()));
        api.expect_download()
            .returning(|_, dest| Ok(dest.join("mesh.glb")));

        let poller = CloudJobPoller::new(Arc::new(api), policy());
        let mut job = CloudJob::submitted("j");
        poller
            .await_completion(&mut job, policy().poll_interval, policy().max_wait, Path::new("/r"))
            .await
            .unwrap();

        assert_eq!(job.poll_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_transient_retries_is_connectivity() {
        let mut api = MockPhotogrammetryApi::new();
        api.expect_status().times(3).returning(|_| Err(transport()));

        let poller = CloudJobPoller::new(Arc::new(api), policy());
        let mut job = CloudJob::submitted("j");
        let err = poller
            .await_completion(&mut job, policy().poll_interval, policy().max_wait, Path::new("/r"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Connectivity);
        assert_eq!(job.poll_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconstruct_submits_then_waits() {
        let mut api = MockPhotogrammetryApi::new();
        api.expect_submit()
            .times(1)
            .returning(|s| Ok(format!("1-{}-OSC.zip", s.label)));
        api.expect_status()
            .withf(|id| id == "1-owl-OSC.zip")
            .returning(|_| Ok(JobStatus::complete()));
        api.expect_download()
            .returning(|_, dest| Ok(dest.join("owl.obj")));

        let poller = CloudJobPoller::new(Arc::new(api), policy());
        let submission = Submission {
            label: "owl".to_string(),
            images: PathBuf::from("/scans/owl"),
            work_dir: PathBuf::from("/results/owl"),
        };
        let mesh = poller
            .reconstruct(&submission, Path::new("/results/owl"))
            .await
            .unwrap();
        assert_eq!(mesh, PathBuf::from("/results/owl/owl.obj"));
    }
}
