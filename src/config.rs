//! Process-wide settings, split per component so each one only sees its own.

use std::path::PathBuf;
use std::time::Duration;

use crate::storage::S3Location;

#[derive(Debug, Clone, Default)]
pub struct PlumeConfig {
    pub region: Option<String>,
    pub storage: StorageConfig,
    pub endpoint: EndpointConfig,
    pub scaling: ScalingConfig,
    pub job: JobConfig,
    pub package: PackageConfig,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub input_prefix: String,
    pub output_prefix: String,
    pub failure_prefix: String,
    pub model_key: String,
}

impl StorageConfig {
    /// Where asynchronous results are written by the hosting platform.
    pub fn output_path(&self) -> String {
        format!("s3://{}/{}/", self.bucket, self.output_prefix)
    }

    pub fn failure_path(&self) -> String {
        format!("s3://{}/{}/", self.bucket, self.failure_prefix)
    }

    pub fn model_location(&self) -> S3Location {
        S3Location::new(&self.bucket, &self.model_key)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            bucket: "mahitm-genai".to_string(),
            input_prefix: "sdxl-inputs".to_string(),
            output_prefix: "sdxl-output".to_string(),
            failure_prefix: "sdxl-failures".to_string(),
            model_key: "sdxl/model.tar.gz".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub model_name: String,
    pub endpoint_name: String,
    pub variant_name: String,
    pub instance_type: String,
    pub initial_instance_count: i32,
    pub max_concurrent_invocations: i32,
    /// The `plume-server` image built from the repository's Dockerfile.
    pub image_uri: Option<String>,
    pub execution_role_arn: Option<String>,
    /// Register the packaged artifact with the model; off for images that bake the weights in.
    pub use_model_artifact: bool,
    pub environment: Vec<(String, String)>,
    pub status_poll_interval: Duration,
    pub deploy_timeout: Duration,
}

impl EndpointConfig {
    pub fn resource_id(&self) -> String {
        format!("endpoint/{}/variant/{}", self.endpoint_name, self.variant_name)
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            model_name: "sdxl-async-model".to_string(),
            endpoint_name: "sdxl-async-endpoint".to_string(),
            variant_name: "AllTraffic".to_string(),
            instance_type: "ml.g4dn.xlarge".to_string(),
            initial_instance_count: 1,
            max_concurrent_invocations: 1,
            image_uri: None,
            execution_role_arn: None,
            use_model_artifact: true,
            environment: vec![("RUST_LOG".to_string(), "info".to_string())],
            status_poll_interval: Duration::from_secs(15),
            deploy_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// Metric the target-tracking policy follows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalingTarget {
    /// `ApproximateBacklogSizePerInstance`, the queue depth per instance.
    Backlog { target_value: f64 },
    /// The predefined `SageMakerVariantInvocationsPerInstance` metric.
    InvocationsPerInstance { target_value: f64 },
}

#[derive(Debug, Clone)]
pub struct ScalingConfig {
    pub min_capacity: i32,
    pub max_capacity: i32,
    pub target: ScalingTarget,
    pub scale_in_cooldown: Option<Duration>,
    pub scale_out_cooldown: Option<Duration>,
    /// Adds the step policy and alarm that wake the endpoint from zero instances.
    pub scale_from_zero: bool,
    pub step_cooldown: Duration,
    pub alarm_period: Duration,
    pub alarm_evaluation_periods: i32,
}

impl Default for ScalingConfig {
    fn default() -> Self {
        Self {
            min_capacity: 0,
            max_capacity: 1,
            target: ScalingTarget::Backlog { target_value: 1.0 },
            scale_in_cooldown: None,
            scale_out_cooldown: None,
            scale_from_zero: true,
            step_cooldown: Duration::from_secs(30),
            alarm_period: Duration::from_secs(60),
            alarm_evaluation_periods: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub invocation_timeout: Duration,
    pub poll_interval: Duration,
    /// `None` waits until the caller cancels.
    pub max_wait: Option<Duration>,
    pub output_dir: PathBuf,
}

impl JobConfig {
    /// Existence checks performed before giving up, if capped.
    pub fn max_polls(&self) -> Option<u32> {
        let interval = self.poll_interval.as_millis().max(1);
        self.max_wait
            .map(|wait| u32::try_from((wait.as_millis() / interval).max(1)).unwrap_or(u32::MAX))
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            invocation_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(1),
            max_wait: Some(Duration::from_secs(30)),
            output_dir: PathBuf::from("output"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtraFile {
    pub repo: String,
    pub file: String,
    pub destination: String,
}

#[derive(Debug, Clone)]
pub struct PackageConfig {
    pub model_id: String,
    pub revision: Option<String>,
    pub components: Vec<String>,
    pub weight_variant: String,
    pub extra_files: Vec<ExtraFile>,
    pub model_dir: PathBuf,
    pub archive_path: PathBuf,
    pub entry_point: PathBuf,
}

impl Default for PackageConfig {
    fn default() -> Self {
        let components = [
            "scheduler",
            "text_encoder",
            "text_encoder_2",
            "tokenizer",
            "tokenizer_2",
            "unet",
            "vae",
        ];
        Self {
            model_id: "stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            revision: None,
            components: components.iter().map(ToString::to_string).collect(),
            weight_variant: "fp16".to_string(),
            extra_files: vec![
                ExtraFile {
                    repo: "openai/clip-vit-large-patch14".to_string(),
                    file: "tokenizer.json".to_string(),
                    destination: "tokenizer/tokenizer.json".to_string(),
                },
                ExtraFile {
                    repo: "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k".to_string(),
                    file: "tokenizer.json".to_string(),
                    destination: "tokenizer_2/tokenizer.json".to_string(),
                },
            ],
            model_dir: PathBuf::from("tmp/sdxl_model"),
            archive_path: PathBuf::from("tmp/model.tar.gz"),
            entry_point: PathBuf::from("target/release/plume-server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_endpoint() {
        let config = PlumeConfig::default();
        assert_eq!(config.storage.output_path(), "s3://mahitm-genai/sdxl-output/");
        assert_eq!(
            config.storage.model_location().to_string(),
            "s3://mahitm-genai/sdxl/model.tar.gz"
        );
        assert_eq!(
            config.endpoint.resource_id(),
            "endpoint/sdxl-async-endpoint/variant/AllTraffic"
        );
        assert_eq!((config.scaling.min_capacity, config.scaling.max_capacity), (0, 1));
        assert_eq!(config.endpoint.max_concurrent_invocations, 1);
        assert_eq!(config.job.invocation_timeout, Duration::from_secs(120));
    }

    #[test]
    fn poll_cap_is_derived_from_wait_and_interval() {
        let mut job = JobConfig::default();
        assert_eq!(job.max_polls(), Some(30));

        job.poll_interval = Duration::from_millis(500);
        assert_eq!(job.max_polls(), Some(60));

        job.poll_interval = Duration::from_secs(1);
        job.max_wait = Some(Duration::from_secs(5_000_000_000));
        assert_eq!(job.max_polls(), Some(u32::MAX));

        job.max_wait = None;
        assert_eq!(job.max_polls(), None);
    }
}
