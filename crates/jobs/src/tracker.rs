//! Set of job identifiers awaited by one session instance.
//!
//! The tracker is the only writer of the job set. Insertion happens on
//! the submission path and membership queries on the delivery path,
//! possibly from different tasks, so both go through an async
//! `RwLock`.

use std::collections::HashSet;

use metascan_core::types::JobId;
use tokio::sync::RwLock;

/// Errors returned by [`JobTracker::track`].
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The service handed out an identifier this session already tracks.
    #[error("Job {0} is already tracked")]
    DuplicateJob(JobId),
}

/// Append-only set of tracked job identifiers.
#[derive(Default)]
pub struct JobTracker {
    jobs: RwLock<HashSet<JobId>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `id`.
    ///
    /// A collision leaves the set unchanged and returns
    /// [`TrackerError::DuplicateJob`].
    pub async fn track(&self, id: JobId) -> Result<(), TrackerError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains(&id) {
            tracing::warn!(job_id = %id, "Job identifier collision");
            return Err(TrackerError::DuplicateJob(id));
        }
        tracing::debug!(job_id = %id, "Tracking job");
        jobs.insert(id);
        Ok(())
    }

    pub async fn is_tracked(&self, id: &JobId) -> bool {
        self.jobs.read().await.contains(id)
    }

    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;

    #[tokio::test]
    async fn tracked_ids_are_members() {
        let tracker = JobTracker::new();
        tracker.track(JobId::from("J1")).await.unwrap();

        assert!(tracker.is_tracked(&JobId::from("J1")).await);
        assert!(!tracker.is_tracked(&JobId::from("J2")).await);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let tracker = JobTracker::new();
        tracker.track(JobId::from("J1")).await.unwrap();

        assert_matches!(
            tracker.track(JobId::from("J1")).await,
            Err(TrackerError::DuplicateJob(id)) if id.as_str() == "J1"
        );
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn concurrent_inserts_and_queries() {
        let tracker = Arc::new(JobTracker::new());

        let writers: Vec<_> = (0..32)
            .map(|n| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move { tracker.track(JobId::new(format!("J{n}"))).await })
            })
            .collect();
        let readers: Vec<_> = (0..32)
            .map(|n| {
                let tracker = Arc::clone(&tracker);
                tokio::spawn(async move { tracker.is_tracked(&JobId::new(format!("J{n}"))).await })
            })
            .collect();

        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        for reader in readers {
            reader.await.unwrap();
        }

        assert_eq!(tracker.len().await, 32);
        assert!(tracker.is_tracked(&JobId::from("J31")).await);
    }
}
