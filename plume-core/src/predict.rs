use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, info};

use crate::{GenerationRequest, InvocationRequest, ModelLike, PredictionResponse};

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("prompt is required")]
    MissingPrompt,
    #[error("width {0} must be a positive multiple of 8")]
    InvalidWidth(u32),
    #[error("generation failed: {0:#}")]
    Generation(#[source] anyhow::Error),
    #[error("failed to prepare output directory {path}")]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to save image to {path}")]
    Save {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl AdapterError {
    /// True when the request itself was bad, as opposed to the model or disk.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::MissingPrompt | Self::InvalidWidth(_))
    }
}

/// Validates `request`, runs the model and writes the image under `output_dir`.
///
/// Validation happens before anything touches the model or the filesystem.
pub fn predict(
    model: &dyn ModelLike,
    request: InvocationRequest,
    output_dir: &Path,
) -> Result<PredictionResponse, AdapterError> {
    debug!(?request, "running inference");
    let request = GenerationRequest::try_from(request)?;
    if request.width == 0 || request.width % 8 != 0 {
        return Err(AdapterError::InvalidWidth(request.width));
    }

    fs::create_dir_all(output_dir).map_err(|source| AdapterError::OutputDir {
        path: output_dir.to_path_buf(),
        source,
    })?;
    let output_path = output_dir.join(output_file_name());

    let image = model.run(&request).map_err(AdapterError::Generation)?;
    image
        .save_with_format(&output_path, image::ImageFormat::Png)
        .map_err(|source| AdapterError::Save {
            path: output_path.clone(),
            source,
        })?;
    info!(path = %output_path.display(), "saved generated image");

    Ok(PredictionResponse {
        output_path: output_path.to_string_lossy().into_owned(),
    })
}

fn output_file_name() -> String {
    format!("sdxl_async_{}.png", Local::now().format("%d-%m-%Y_%H-%M-%S"))
}
