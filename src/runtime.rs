use std::time::Duration;

use async_trait::async_trait;

use crate::storage::S3Location;

/// What the hosting platform hands back when it accepts an asynchronous request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncInvocation {
    pub inference_id: String,
    pub output_location: S3Location,
    pub failure_location: Option<S3Location>,
}

#[async_trait]
pub trait AsyncInvoker: Send + Sync {
    /// Queues a request whose body lives at `input`. Returns without waiting for the result.
    async fn invoke_async(
        &self,
        endpoint_name: &str,
        input: &S3Location,
        timeout: Duration,
    ) -> anyhow::Result<AsyncInvocation>;
}
