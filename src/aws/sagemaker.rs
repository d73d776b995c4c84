use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_config::SdkConfig;
use aws_sdk_sagemaker::error::{DisplayErrorContext, ProvideErrorMetadata};
use aws_sdk_sagemaker::types::{
    AsyncInferenceClientConfig, AsyncInferenceConfig, AsyncInferenceOutputConfig,
    ContainerDefinition, EndpointStatus as SdkEndpointStatus, ProductionVariant,
    ProductionVariantInstanceType,
};
use aws_sdk_sagemaker::Client;

use crate::endpoint::{
    EndpointConfigSpec, EndpointState, EndpointStatus, HostingPlatform, ModelSpec,
};

#[derive(Clone)]
pub struct SageMakerHosting {
    client: Client,
}

impl SageMakerHosting {
    pub fn new(config: &SdkConfig) -> Self {
        Self {
            client: Client::new(config),
        }
    }
}

fn endpoint_status(status: &SdkEndpointStatus) -> EndpointStatus {
    match status.as_str() {
        "InService" => EndpointStatus::InService,
        "Failed" => EndpointStatus::Failed,
        other => EndpointStatus::Transitioning(other.to_string()),
    }
}

fn production_variant(config: &EndpointConfigSpec) -> ProductionVariant {
    ProductionVariant::builder()
        .variant_name(&config.variant.name)
        .model_name(&config.variant.model_name)
        .instance_type(ProductionVariantInstanceType::from(
            config.variant.instance_type.as_str(),
        ))
        .initial_instance_count(config.variant.initial_instance_count)
        .build()
}

fn async_inference_config(config: &EndpointConfigSpec) -> AsyncInferenceConfig {
    let output_config = AsyncInferenceOutputConfig::builder()
        .s3_output_path(&config.async_inference.output_path)
        .set_s3_failure_path(config.async_inference.failure_path.clone())
        .build();
    let client_config = AsyncInferenceClientConfig::builder()
        .max_concurrent_invocations_per_instance(config.async_inference.max_concurrent_invocations)
        .build();
    AsyncInferenceConfig::builder()
        .output_config(output_config)
        .client_config(client_config)
        .build()
}

#[async_trait]
impl HostingPlatform for SageMakerHosting {
    async fn create_model(&self, model: &ModelSpec) -> Result<()> {
        let container = ContainerDefinition::builder()
            .image(&model.image_uri)
            .set_model_data_url(model.model_data_url.clone())
            .set_environment(Some(model.environment.iter().cloned().collect()))
            .build();
        self.client
            .create_model()
            .model_name(&model.name)
            .execution_role_arn(&model.execution_role_arn)
            .primary_container(container)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn create_endpoint_config(&self, config: &EndpointConfigSpec) -> Result<()> {
        self.client
            .create_endpoint_config()
            .endpoint_config_name(&config.name)
            .production_variants(production_variant(config))
            .async_inference_config(async_inference_config(config))
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn create_endpoint(&self, endpoint_name: &str, config_name: &str) -> Result<()> {
        self.client
            .create_endpoint()
            .endpoint_name(endpoint_name)
            .endpoint_config_name(config_name)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn describe_endpoint(&self, endpoint_name: &str) -> Result<Option<EndpointState>> {
        let output = match self
            .client
            .describe_endpoint()
            .endpoint_name(endpoint_name)
            .send()
            .await
        {
            Ok(output) => output,
            // the API reports a missing endpoint as a validation error
            Err(e)
                if e.code() == Some("ValidationException")
                    && e.message().is_some_and(|m| m.contains("Could not find")) =>
            {
                return Ok(None)
            }
            Err(e) => return Err(anyhow!("{}", DisplayErrorContext(e))),
        };

        let status: Option<&SdkEndpointStatus> = output.endpoint_status().into();
        let status = status
            .map(endpoint_status)
            .unwrap_or_else(|| EndpointStatus::Transitioning("Unknown".to_string()));
        Ok(Some(EndpointState {
            status,
            failure_reason: output.failure_reason().map(String::from),
        }))
    }

    async fn delete_endpoint(&self, endpoint_name: &str) -> Result<()> {
        self.client
            .delete_endpoint()
            .endpoint_name(endpoint_name)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn delete_endpoint_config(&self, config_name: &str) -> Result<()> {
        self.client
            .delete_endpoint_config()
            .endpoint_config_name(config_name)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }

    async fn delete_model(&self, model_name: &str) -> Result<()> {
        self.client
            .delete_model()
            .model_name(model_name)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{AsyncInferenceSpec, VariantSpec};

    fn endpoint_config() -> EndpointConfigSpec {
        EndpointConfigSpec {
            name: "sdxl-async-endpoint".to_string(),
            variant: VariantSpec {
                name: "AllTraffic".to_string(),
                model_name: "sdxl-async-model".to_string(),
                instance_type: "ml.g4dn.xlarge".to_string(),
                initial_instance_count: 1,
            },
            async_inference: AsyncInferenceSpec {
                output_path: "s3://mahitm-genai/sdxl-output/".to_string(),
                failure_path: Some("s3://mahitm-genai/sdxl-failures/".to_string()),
                max_concurrent_invocations: 1,
            },
        }
    }

    #[test]
    fn variant_carries_model_and_instance() {
        let variant = production_variant(&endpoint_config());

        assert_eq!(variant.variant_name(), Some("AllTraffic"));
        assert_eq!(variant.model_name(), Some("sdxl-async-model"));
        assert_eq!(
            variant.instance_type().map(ProductionVariantInstanceType::as_str),
            Some("ml.g4dn.xlarge")
        );
        assert_eq!(variant.initial_instance_count(), Some(1));
    }

    #[test]
    fn async_config_writes_results_and_failures_to_the_bucket() {
        let config = async_inference_config(&endpoint_config());

        let output = config.output_config().unwrap();
        assert_eq!(output.s3_output_path(), Some("s3://mahitm-genai/sdxl-output/"));
        assert_eq!(output.s3_failure_path(), Some("s3://mahitm-genai/sdxl-failures/"));
        assert_eq!(
            config
                .client_config()
                .and_then(|client| client.max_concurrent_invocations_per_instance()),
            Some(1)
        );
    }

    #[test]
    fn maps_platform_statuses() {
        assert_eq!(
            endpoint_status(&SdkEndpointStatus::InService),
            EndpointStatus::InService
        );
        assert_eq!(endpoint_status(&SdkEndpointStatus::Failed), EndpointStatus::Failed);
        assert_eq!(
            endpoint_status(&SdkEndpointStatus::Creating),
            EndpointStatus::Transitioning("Creating".to_string())
        );
    }
}
