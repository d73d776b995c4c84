//! Bindings of the storage, runtime, hosting and scaling seams to AWS.

mod autoscaling;
mod runtime;
mod s3;
mod sagemaker;

use std::time::Duration;

use aws_config::{BehaviorVersion, Region, SdkConfig};
use tracing::debug;

pub use autoscaling::AwsScaling;
pub use runtime::SageMakerRuntime;
pub use s3::S3Store;
pub use sagemaker::SageMakerHosting;

pub async fn load_config(region: Option<&str>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(Region::new(region.to_string()));
    }
    let config = loader.load().await;
    debug!(region = ?config.region(), "loaded AWS configuration");
    config
}

/// Whole seconds, saturating at the API's `i32` range.
fn seconds(duration: Duration) -> i32 {
    i32::try_from(duration.as_secs()).unwrap_or(i32::MAX)
}
