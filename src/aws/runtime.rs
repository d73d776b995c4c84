use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sagemakerruntime::error::DisplayErrorContext;
use aws_sdk_sagemakerruntime::Client;

use super::seconds;
use crate::runtime::{AsyncInvocation, AsyncInvoker};
use crate::storage::S3Location;

#[derive(Clone)]
pub struct SageMakerRuntime {
    client: Client,
}

impl SageMakerRuntime {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

#[async_trait]
impl AsyncInvoker for SageMakerRuntime {
    async fn invoke_async(
        &self,
        endpoint_name: &str,
        input: &S3Location,
        timeout: Duration,
    ) -> Result<AsyncInvocation> {
        let output = self
            .client
            .invoke_endpoint_async()
            .endpoint_name(endpoint_name)
            .input_location(input.to_string())
            .content_type("application/json")
            .invocation_timeout_seconds(seconds(timeout))
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;

        let inference_id: Option<&str> = output.inference_id().into();
        let output_location: Option<&str> = output.output_location().into();
        let failure_location: Option<&str> = output.failure_location().into();

        let output_location = output_location
            .context("invocation was accepted without an output location")
            .and_then(S3Location::parse)?;
        Ok(AsyncInvocation {
            inference_id: inference_id.unwrap_or_default().to_string(),
            output_location,
            failure_location: failure_location.map(S3Location::parse).transpose()?,
        })
    }
}
