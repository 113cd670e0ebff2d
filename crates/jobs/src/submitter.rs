//! Job submission.
//!
//! [`JobSubmitter`] forwards a request to the [`JobService`] and, on
//! success, registers the returned identifier with the [`JobTracker`]
//! before reporting success. A completion event can therefore never be
//! processed for a successfully submitted job before that job is
//! trackable.

use std::sync::Arc;

use metascan_core::entity::EntityScope;
use metascan_core::metadata::JobRequest;
use metascan_core::types::JobId;

use crate::api::{JobService, JobServiceError};
use crate::tracker::{JobTracker, TrackerError};

/// Errors surfaced to the caller of [`JobSubmitter::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SubmissionError {
    /// The service refused or failed the job and said why.
    #[error("{0}")]
    Rejected(String),

    /// The service failed without a readable message.
    #[error("Unknown error")]
    Unknown,

    /// The service returned an identifier this session already tracks.
    #[error("Job {0} was already submitted in this session")]
    DuplicateJob(JobId),
}

impl From<JobServiceError> for SubmissionError {
    fn from(error: JobServiceError) -> Self {
        match error.message() {
            Some(message) => Self::Rejected(message.to_string()),
            None => Self::Unknown,
        }
    }
}

impl From<TrackerError> for SubmissionError {
    fn from(error: TrackerError) -> Self {
        match error {
            TrackerError::DuplicateJob(id) => Self::DuplicateJob(id),
        }
    }
}

/// Outcome of one scope's submission in [`JobSubmitter::submit_selection`].
#[derive(Debug)]
pub struct ScopedSubmission {
    pub scope: EntityScope,
    pub result: Result<JobId, SubmissionError>,
}

/// Submits extraction jobs and records their identifiers.
pub struct JobSubmitter {
    service: Arc<dyn JobService>,
    tracker: Arc<JobTracker>,
}

impl JobSubmitter {
    pub fn new(service: Arc<dyn JobService>, tracker: Arc<JobTracker>) -> Self {
        Self { service, tracker }
    }

    /// Submit one job.
    ///
    /// Nothing is tracked when the service call fails.
    pub async fn submit(&self, request: &JobRequest) -> Result<JobId, SubmissionError> {
        let job_id = self.service.submit_job(request).await.map_err(|e| {
            tracing::warn!(error = %e, "Job submission failed");
            SubmissionError::from(e)
        })?;

        self.tracker.track(job_id.clone()).await?;

        tracing::info!(
            job_id = %job_id,
            entities = request.target_entities().len(),
            kinds = request.requested_kinds().len(),
            "Job submitted",
        );
        Ok(job_id)
    }

    /// Submit a selection that may span both entity scopes, one job per
    /// scope (standard first).
    pub async fn submit_selection(&self, request: JobRequest) -> Vec<ScopedSubmission> {
        let mut outcomes = Vec::new();

        for part in request.split_by_scope() {
            // Parts produced by `split_by_scope` always have a single scope.
            let Some(scope) = part.scope() else { continue };
            let result = self.submit(&part).await;
            outcomes.push(ScopedSubmission { scope, result });
        }

        outcomes
    }
}
