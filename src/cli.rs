use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use hf_hub::api::tokio::Api;
use plume_core::{GenerationParameters, InvocationRequest};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::aws::{self, AwsScaling, S3Store, SageMakerHosting, SageMakerRuntime};
use crate::config::PlumeConfig;
use crate::endpoint::{EndpointManager, HostingPlatform, ScalingPlatform};
use crate::extract::{extract_png, DEFAULT_OUTPUT_NAME};
use crate::job::{JobClient, JobOutcome};
use crate::package::Packager;

#[derive(Parser, Debug)]
#[command(author, version, about = "Deploy, scale and invoke the asynchronous SDXL endpoint")]
pub struct Cli {
    #[command(flatten)]
    pub overrides: Overrides,

    #[command(subcommand)]
    pub command: Command,
}

/// Settings worth changing without a rebuild.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// Bucket holding requests, results and the model artifact
    #[arg(long, env = "PLUME_BUCKET", global = true)]
    pub bucket: Option<String>,

    #[arg(long, env = "PLUME_ENDPOINT_NAME", global = true)]
    pub endpoint_name: Option<String>,

    #[arg(long, env = "PLUME_MODEL_NAME", global = true)]
    pub model_name: Option<String>,

    /// IAM role the hosted model runs as
    #[arg(long, env = "PLUME_ROLE_ARN", global = true)]
    pub role_arn: Option<String>,

    /// `plume-server` container image, as pushed to the registry
    #[arg(long, env = "PLUME_IMAGE_URI", global = true)]
    pub image_uri: Option<String>,

    #[arg(long, env = "PLUME_REGION", global = true)]
    pub region: Option<String>,
}

impl Overrides {
    pub fn apply(&self, config: &mut PlumeConfig) {
        if let Some(bucket) = &self.bucket {
            config.storage.bucket = bucket.clone();
        }
        if let Some(name) = &self.endpoint_name {
            config.endpoint.endpoint_name = name.clone();
        }
        if let Some(name) = &self.model_name {
            config.endpoint.model_name = name.clone();
        }
        if let Some(arn) = &self.role_arn {
            config.endpoint.execution_role_arn = Some(arn.clone());
        }
        if let Some(uri) = &self.image_uri {
            config.endpoint.image_uri = Some(uri.clone());
        }
        if let Some(region) = &self.region {
            config.region = Some(region.clone());
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create the model, endpoint configuration and endpoint, then configure autoscaling
    Deploy,
    /// Delete the endpoint, its configuration and the model
    Delete,
    /// Delete, deploy and autoscale again
    Redeploy,
    /// Attach the scaling target, policies and alarm to a running endpoint
    Autoscale,
    /// Download the model, archive it with the server binary and upload it
    Package,
    /// Submit a prompt and optionally wait for the generated image
    Trigger(TriggerArgs),
    /// Decode a downloaded result file into a PNG
    Extract(ExtractArgs),
}

#[derive(Args, Debug)]
pub struct TriggerArgs {
    #[arg(long, default_value = "a photo of a cat")]
    pub prompt: String,

    #[arg(long, default_value_t = 1024)]
    pub width: u32,

    #[arg(long, default_value_t = 30)]
    pub steps: usize,

    #[arg(long, default_value_t = 10.0)]
    pub guidance: f64,

    /// Return right after submitting
    #[arg(long)]
    pub no_download: bool,

    /// Seconds to wait for the result; 0 waits until interrupted
    #[arg(long, default_value_t = 30)]
    pub max_wait: u64,

    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,
}

impl TriggerArgs {
    pub fn request(&self) -> InvocationRequest {
        InvocationRequest::new(&self.prompt).with_parameters(GenerationParameters {
            width: Some(self.width),
            num_inference_steps: Some(self.steps),
            guidance_scale: Some(self.guidance),
        })
    }
}

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Result file as downloaded from the output bucket
    pub input: PathBuf,

    /// File name of the PNG, without extension
    #[arg(default_value = DEFAULT_OUTPUT_NAME)]
    pub name: String,

    #[arg(long, default_value = "output")]
    pub output_dir: PathBuf,
}

pub async fn run(cli: Cli, cancel: CancellationToken) -> Result<()> {
    let mut config = PlumeConfig::default();
    cli.overrides.apply(&mut config);

    if let Command::Extract(args) = &cli.command {
        extract_png(&args.input, &args.output_dir, &args.name)?;
        return Ok(());
    }

    let sdk = aws::load_config(config.region.as_deref()).await;

    match &cli.command {
        Command::Deploy | Command::Delete | Command::Redeploy | Command::Autoscale => {
            let manager = EndpointManager::new(
                SageMakerHosting::new(&sdk),
                AwsScaling::new(&sdk),
                config.endpoint.clone(),
                config.scaling.clone(),
                config.storage.clone(),
            );
            manage(&cli.command, &manager).await?;
        }
        Command::Package => {
            let api = Api::new().context("failed to create the model hub client")?;
            let packager = Packager::new(
                S3Store::new(&sdk),
                api,
                config.storage.clone(),
                config.package.clone(),
            );
            packager.run().await?;
        }
        Command::Trigger(args) => {
            let mut job = config.job.clone();
            job.max_wait = (args.max_wait > 0).then(|| Duration::from_secs(args.max_wait));
            job.output_dir = args.output_dir.clone();
            let client = JobClient::new(
                S3Store::new(&sdk),
                SageMakerRuntime::new(&sdk),
                &config.endpoint.endpoint_name,
                config.storage.clone(),
                job,
            );
            match client.run(&args.request(), !args.no_download, &cancel).await? {
                JobOutcome::Completed { image, .. } => info!("Saved {}", image.display()),
                JobOutcome::Submitted(_) | JobOutcome::TimedOut(_) | JobOutcome::Cancelled(_) => {}
            }
        }
        Command::Extract(_) => bail!("extract is handled without cloud access"),
    }

    Ok(())
}

/// Endpoint lifecycle commands. Scaling failures are logged and never fail the command.
async fn manage<H: HostingPlatform, A: ScalingPlatform>(
    command: &Command,
    manager: &EndpointManager<H, A>,
) -> Result<()> {
    match command {
        Command::Deploy => {
            manager.deploy().await?;
            manager.autoscale_best_effort().await;
        }
        Command::Delete => {
            let report = manager.delete().await;
            if !report.is_clean() {
                warn!("{} resources could not be deleted", report.failures().count());
            }
        }
        Command::Redeploy => {
            manager.redeploy().await?;
        }
        Command::Autoscale => {
            manager.autoscale_best_effort().await;
        }
        Command::Package | Command::Trigger(_) | Command::Extract(_) => {
            bail!("{command:?} does not manage the endpoint")
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EndpointConfig, ScalingConfig, StorageConfig};
    use crate::testing::{RecordingHosting, RecordingScaling};

    fn manager(
        hosting: RecordingHosting,
        scaling: RecordingScaling,
    ) -> EndpointManager<RecordingHosting, RecordingScaling> {
        EndpointManager::new(
            hosting,
            scaling,
            EndpointConfig {
                execution_role_arn: Some("arn:aws:iam::123456789012:role/sagemaker".into()),
                image_uri: Some("123456789012.dkr.ecr.us-east-1.amazonaws.com/plume-server:latest".into()),
                ..EndpointConfig::default()
            },
            ScalingConfig::default(),
            StorageConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn autoscale_command_survives_scaling_errors() {
        let scaling = RecordingScaling::default();
        scaling.fail_registration();
        let manager = manager(RecordingHosting::default(), scaling.clone());

        manage(&Command::Autoscale, &manager).await.unwrap();
        manage(&Command::Deploy, &manager).await.unwrap();

        assert!(scaling.registered().is_empty());
        assert!(scaling.tracking_policies().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_command_still_fails_without_an_image() {
        let hosting = RecordingHosting::default();
        let manager = EndpointManager::new(
            hosting.clone(),
            RecordingScaling::default(),
            EndpointConfig {
                execution_role_arn: Some("arn:aws:iam::123456789012:role/sagemaker".into()),
                ..EndpointConfig::default()
            },
            ScalingConfig::default(),
            StorageConfig::default(),
        );

        assert!(manage(&Command::Deploy, &manager).await.is_err());
        assert!(manage(&Command::Package, &manager).await.is_err());
        assert!(hosting.calls().is_empty());
    }

    #[test]
    fn trigger_defaults_to_the_cat_payload() {
        let cli = Cli::try_parse_from(["plume", "trigger"]).unwrap();
        let Command::Trigger(args) = cli.command else {
            panic!("expected trigger");
        };

        let payload = serde_json::to_value(args.request()).unwrap();
        assert_eq!(
            payload,
            serde_json::json!({
                "inputs": "a photo of a cat",
                "parameters": {"width": 1024, "num_inference_steps": 30, "guidance_scale": 10.0}
            })
        );
        assert!(!args.no_download);
        assert_eq!(args.max_wait, 30);
    }

    #[test]
    fn unknown_subcommands_are_rejected() {
        let err = Cli::try_parse_from(["plume", "scale-up"]).unwrap_err();
        assert!(err.use_stderr());
        assert!(Cli::try_parse_from(["plume"]).is_err());
        assert!(!Cli::try_parse_from(["plume", "--help"]).unwrap_err().use_stderr());
    }

    #[test]
    fn extract_takes_an_optional_name() {
        let cli = Cli::try_parse_from(["plume", "extract", "result.out"]).unwrap();
        let Command::Extract(args) = cli.command else {
            panic!("expected extract");
        };
        assert_eq!(args.input, PathBuf::from("result.out"));
        assert_eq!(args.name, "output");

        let cli = Cli::try_parse_from(["plume", "extract", "result.out", "cat"]).unwrap();
        let Command::Extract(args) = cli.command else {
            panic!("expected extract");
        };
        assert_eq!(args.name, "cat");
    }

    #[test]
    fn overrides_replace_only_what_is_given() {
        let cli = Cli::try_parse_from([
            "plume",
            "deploy",
            "--bucket",
            "other-bucket",
            "--role-arn",
            "arn:aws:iam::123456789012:role/sagemaker",
        ])
        .unwrap();
        let mut config = PlumeConfig::default();
        cli.overrides.apply(&mut config);

        assert_eq!(config.storage.bucket, "other-bucket");
        assert_eq!(
            config.endpoint.execution_role_arn.as_deref(),
            Some("arn:aws:iam::123456789012:role/sagemaker")
        );
        assert_eq!(config.endpoint.endpoint_name, "sdxl-async-endpoint");
    }
}
