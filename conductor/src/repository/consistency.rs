//! Read-after-create polling for eventually consistent repositories.

use std::time::Duration;
use tracing::debug;

use super::{PipelineRepository, RepositoryError};
use crate::core::Pipeline;

/// Polls `get(id)` until the record is readable.
///
/// Makes at most `attempts` reads, sleeping `interval` between them. Returns
/// `Ok(None)` if the record never became visible; callers fall back to the
/// record they built locally.
pub async fn wait_for_pipeline(
    repository: &dyn PipelineRepository,
    id: &str,
    interval: Duration,
    attempts: u32,
) -> Result<Option<Pipeline>, RepositoryError> {
    for attempt in 1..=attempts.max(1) {
        if let Some(pipeline) = repository.get(id).await? {
            debug!(pipeline_id = id, attempt, "Pipeline readable after create");
            return Ok(Some(pipeline));
        }
        if attempt < attempts {
            tokio::time::sleep(interval).await;
        }
    }
    debug!(pipeline_id = id, attempts, "Pipeline not readable yet, using local record");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NewPipeline;
    use crate::repository::{InMemoryPipelineRepository, MockPipelineRepository};

    #[tokio::test(start_paused = true)]
    async fn test_waits_out_read_lag() {
        let repo = InMemoryPipelineRepository::new().with_read_lag(Duration::from_millis(250));
        let pipeline = Pipeline::from_request(&NewPipeline::new("app", "demo"));
        let id = repo.create(&pipeline).await.unwrap();

        let found = wait_for_pipeline(&repo, &id, Duration::from_millis(100), 5)
            .await
            .unwrap();
        assert_eq!(found.unwrap().id, id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_attempts() {
        let mut repo = MockPipelineRepository::new();
        repo.expect_get().times(3).returning(|_| Ok(None));

        let found = wait_for_pipeline(&repo, "p1", Duration::from_millis(10), 3)
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_propagates_errors() {
        let mut repo = MockPipelineRepository::new();
        repo.expect_get()
            .returning(|_| Err(RepositoryError::Unavailable("db down".into())));

        let err = wait_for_pipeline(&repo, "p1", Duration::from_millis(10), 3)
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
