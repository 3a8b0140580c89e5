use crate::types::{ClassificationRequest, ClassificationResponse};
use anyhow::Result;
use async_trait::async_trait;

/// One-request-at-a-time view of the classifier, as seen by HTTP handlers.
#[async_trait]
pub trait Engine {
    async fn classify(&self, request: ClassificationRequest) -> Result<ClassificationResponse>;
}

/// Batch-oriented backend. One inner `Result` per submitted request so a
/// single bad input cannot fail the whole batch.
#[async_trait]
pub trait BatchedEngine: Send + Sync {
    async fn classify_batch(
        &self,
        requests: Vec<ClassificationRequest>,
    ) -> Result<Vec<Result<ClassificationResponse>>>;
}
