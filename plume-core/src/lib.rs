pub mod device_map;
pub mod loader;
mod predict;

#[cfg(feature = "sdxl")]
mod sdxl;
#[cfg(feature = "sdxl")]
mod util;

pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use predict::*;
#[cfg(feature = "sdxl")]
pub use sdxl::{SdxlLoader, SdxlModel};
use serde::{Deserialize, Serialize};
#[cfg(feature = "sdxl")]
pub(crate) use util::*;

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_INFERENCE_STEPS: usize = 30;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

/// Body of an asynchronous invocation, as written to object storage by the
/// job client and read back by the serving container.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct InvocationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<GenerationParameters>,
}

impl InvocationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            inputs: Some(prompt.into()),
            parameters: None,
        }
    }

    pub fn with_parameters(mut self, parameters: GenerationParameters) -> Self {
        self.parameters = Some(parameters);
        self
    }
}

/// Optional knobs; every field falls back to its own default.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_inference_steps: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidance_scale: Option<f64>,
}

/// A validated request with every default applied.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub width: u32,
    pub num_inference_steps: usize,
    pub guidance_scale: f64,
}

impl TryFrom<InvocationRequest> for GenerationRequest {
    type Error = AdapterError;

    fn try_from(request: InvocationRequest) -> Result<Self, Self::Error> {
        let prompt = match request.inputs {
            Some(prompt) if !prompt.is_empty() => prompt,
            _ => return Err(AdapterError::MissingPrompt),
        };
        let parameters = request.parameters.unwrap_or_default();

        Ok(Self {
            prompt,
            width: parameters.width.unwrap_or(DEFAULT_WIDTH),
            num_inference_steps: parameters
                .num_inference_steps
                .unwrap_or(DEFAULT_INFERENCE_STEPS),
            guidance_scale: parameters.guidance_scale.unwrap_or(DEFAULT_GUIDANCE_SCALE),
        })
    }
}

/// Payload returned by [`predict`].
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PredictionResponse {
    pub output_path: String,
}

pub trait ModelLike: Send + Sync {
    fn run(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}
