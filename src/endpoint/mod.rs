//! Lifecycle of the hosted model and its asynchronous endpoint.
//!
//! There is no partial update: configuration changes go through
//! [`EndpointManager::redeploy`], which tears everything down and recreates it.

mod scaling;

use std::fmt;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::{EndpointConfig, ScalingConfig, StorageConfig};

pub use scaling::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub image_uri: String,
    pub model_data_url: Option<String>,
    pub execution_role_arn: String,
    pub environment: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantSpec {
    pub name: String,
    pub model_name: String,
    pub instance_type: String,
    pub initial_instance_count: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncInferenceSpec {
    pub output_path: String,
    pub failure_path: Option<String>,
    pub max_concurrent_invocations: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfigSpec {
    pub name: String,
    pub variant: VariantSpec,
    pub async_inference: AsyncInferenceSpec,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointStatus {
    InService,
    Failed,
    /// Creating, updating, deleting and the like.
    Transitioning(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub status: EndpointStatus,
    pub failure_reason: Option<String>,
}

/// Model hosting operations of the managed platform.
#[async_trait]
pub trait HostingPlatform: Send + Sync {
    async fn create_model(&self, model: &ModelSpec) -> Result<()>;
    async fn create_endpoint_config(&self, config: &EndpointConfigSpec) -> Result<()>;
    async fn create_endpoint(&self, endpoint_name: &str, config_name: &str) -> Result<()>;
    /// `None` when no endpoint with that name exists.
    async fn describe_endpoint(&self, endpoint_name: &str) -> Result<Option<EndpointState>>;
    async fn delete_endpoint(&self, endpoint_name: &str) -> Result<()>;
    async fn delete_endpoint_config(&self, config_name: &str) -> Result<()>;
    async fn delete_model(&self, model_name: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Endpoint,
    EndpointConfig,
    Model,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Endpoint => "endpoint",
            Self::EndpointConfig => "endpoint config",
            Self::Model => "model",
        })
    }
}

#[derive(Debug)]
pub struct TeardownStep {
    pub resource: Resource,
    pub name: String,
    pub result: Result<()>,
}

/// Outcome of every independent delete, in the order they ran.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub steps: Vec<TeardownStep>,
}

impl TeardownReport {
    fn record(&mut self, resource: Resource, name: &str, result: Result<()>) {
        match &result {
            Ok(()) => info!("Deleted {resource} {name}"),
            Err(e) => error!("Error deleting {resource} {name}: {e:#}"),
        }
        self.steps.push(TeardownStep {
            resource,
            name: name.to_string(),
            result,
        });
    }

    pub fn is_clean(&self) -> bool {
        self.steps.iter().all(|step| step.result.is_ok())
    }

    pub fn failures(&self) -> impl Iterator<Item = &TeardownStep> {
        self.steps.iter().filter(|step| step.result.is_err())
    }
}

/// Hugging Face inference images only look for `code/inference.py` in the artifact.
fn runs_python_handlers(image_uri: &str) -> bool {
    image_uri.contains("huggingface-pytorch-inference")
        || image_uri.contains("huggingface-pytorch-tgi-inference")
}

pub struct EndpointManager<H, A> {
    hosting: H,
    scaling_platform: A,
    endpoint: EndpointConfig,
    scaling: ScalingConfig,
    storage: StorageConfig,
}

impl<H: HostingPlatform, A: ScalingPlatform> EndpointManager<H, A> {
    pub fn new(
        hosting: H,
        scaling_platform: A,
        endpoint: EndpointConfig,
        scaling: ScalingConfig,
        storage: StorageConfig,
    ) -> Self {
        Self {
            hosting,
            scaling_platform,
            endpoint,
            scaling,
            storage,
        }
    }

    pub fn model_spec(&self) -> Result<ModelSpec> {
        let execution_role_arn = self
            .endpoint
            .execution_role_arn
            .clone()
            .context("an execution role ARN is required to deploy (--role-arn or PLUME_ROLE_ARN)")?;
        let image_uri = self.endpoint.image_uri.clone().context(
            "a plume-server image is required to deploy (--image-uri or PLUME_IMAGE_URI)",
        )?;
        if runs_python_handlers(&image_uri) {
            bail!("{image_uri} serves Python handlers and never starts plume-server");
        }
        Ok(ModelSpec {
            name: self.endpoint.model_name.clone(),
            image_uri,
            model_data_url: self
                .endpoint
                .use_model_artifact
                .then(|| self.storage.model_location().to_string()),
            execution_role_arn,
            environment: self.endpoint.environment.clone(),
        })
    }

    /// The endpoint configuration shares the endpoint's name.
    pub fn endpoint_config_spec(&self) -> EndpointConfigSpec {
        EndpointConfigSpec {
            name: self.endpoint.endpoint_name.clone(),
            variant: VariantSpec {
                name: self.endpoint.variant_name.clone(),
                model_name: self.endpoint.model_name.clone(),
                instance_type: self.endpoint.instance_type.clone(),
                initial_instance_count: self.endpoint.initial_instance_count,
            },
            async_inference: AsyncInferenceSpec {
                output_path: self.storage.output_path(),
                failure_path: Some(self.storage.failure_path()),
                max_concurrent_invocations: self.endpoint.max_concurrent_invocations,
            },
        }
    }

    /// Registers the model, its async endpoint configuration and the endpoint,
    /// then blocks until the endpoint serves traffic.
    pub async fn deploy(&self) -> Result<()> {
        let model = self.model_spec()?;
        let config = self.endpoint_config_spec();

        self.hosting
            .create_model(&model)
            .await
            .with_context(|| format!("failed to create model {}", model.name))?;
        info!(image = %model.image_uri, artifact = ?model.model_data_url, "Created model {}", model.name);

        self.hosting
            .create_endpoint_config(&config)
            .await
            .with_context(|| format!("failed to create endpoint config {}", config.name))?;
        info!(output = %config.async_inference.output_path, "Created endpoint config {}", config.name);

        self.hosting
            .create_endpoint(&self.endpoint.endpoint_name, &config.name)
            .await
            .with_context(|| format!("failed to create endpoint {}", self.endpoint.endpoint_name))?;
        info!(
            instance_type = %self.endpoint.instance_type,
            "Creating endpoint {}", self.endpoint.endpoint_name
        );

        self.wait_until_in_service().await
    }

    /// Removes endpoint, endpoint configuration and model. Each delete runs
    /// regardless of how the previous one went.
    pub async fn delete(&self) -> TeardownReport {
        let name = &self.endpoint.endpoint_name;
        let mut report = TeardownReport::default();

        let result = self.hosting.delete_endpoint(name).await;
        report.record(Resource::Endpoint, name, result);

        let result = self.hosting.delete_endpoint_config(name).await;
        report.record(Resource::EndpointConfig, name, result);

        let model = &self.endpoint.model_name;
        let result = self.hosting.delete_model(model).await;
        report.record(Resource::Model, model, result);

        report
    }

    /// Delete, deploy, autoscale. Nothing is rolled back if a later step fails.
    pub async fn redeploy(&self) -> Result<TeardownReport> {
        let report = self.delete().await;
        self.wait_until_gone().await?;
        self.deploy().await?;
        self.autoscale_best_effort().await;
        Ok(report)
    }

    async fn wait_until_in_service(&self) -> Result<()> {
        let name = &self.endpoint.endpoint_name;
        let started = Instant::now();
        loop {
            let state = self
                .hosting
                .describe_endpoint(name)
                .await
                .with_context(|| format!("failed to describe endpoint {name}"))?;
            match state {
                None => bail!("endpoint {name} disappeared while being created"),
                Some(EndpointState {
                    status: EndpointStatus::InService,
                    ..
                }) => {
                    info!("Endpoint {name} is in service");
                    return Ok(());
                }
                Some(EndpointState {
                    status: EndpointStatus::Failed,
                    failure_reason,
                }) => bail!(
                    "endpoint {name} failed: {}",
                    failure_reason.as_deref().unwrap_or("no reason given")
                ),
                Some(EndpointState {
                    status: EndpointStatus::Transitioning(status),
                    ..
                }) => {
                    if started.elapsed() >= self.endpoint.deploy_timeout {
                        bail!("endpoint {name} still {status} after {:?}", self.endpoint.deploy_timeout);
                    }
                    info!("Endpoint {name} is {status}");
                }
            }
            tokio::time::sleep(self.endpoint.status_poll_interval).await;
        }
    }

    /// Endpoint deletion is asynchronous on the platform; recreating under the
    /// same name has to wait for it.
    async fn wait_until_gone(&self) -> Result<()> {
        let name = &self.endpoint.endpoint_name;
        let started = Instant::now();
        while let Some(state) = self
            .hosting
            .describe_endpoint(name)
            .await
            .with_context(|| format!("failed to describe endpoint {name}"))?
        {
            if started.elapsed() >= self.endpoint.deploy_timeout {
                bail!("endpoint {name} still exists ({:?})", state.status);
            }
            warn!("Waiting for endpoint {name} to go away ({:?})", state.status);
            tokio::time::sleep(self.endpoint.status_poll_interval).await;
        }
        Ok(())
    }
}
