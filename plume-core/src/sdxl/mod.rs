use std::path::{Path, PathBuf};

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip, clip::ClipTextTransformer, schedulers::Scheduler,
    unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    reduced_precision, select_best_device, tensor_to_image, DeviceMap, GenerationRequest, Loader,
    ModelLike,
};

const VAE_SCALE: f64 = 0.13025;
const LATENT_CHANNELS: usize = 4;

/// One CLIP text encoder together with its tokenizer.
struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    max_len: usize,
    pad_id: u32,
}

impl TextEncoder {
    fn load(
        model_dir: &Path,
        component: &str,
        tokenizer_dir: &str,
        config: &clip::Config,
        device: &Device,
    ) -> Result<Self> {
        let tokenizer_file = model_dir.join(tokenizer_dir).join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(Error::msg)
            .with_context(|| format!("failed to load {}", tokenizer_file.display()))?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("{tokenizer_dir} has no {pad_token} token"))?;

        let weights = weights_file(model_dir, component, "model")?;
        // CLIP runs in f32, embeddings are cast down afterwards.
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .with_context(|| format!("failed to load {component}"))?;

        Ok(Self {
            tokenizer,
            model,
            max_len: config.max_position_embeddings,
            pad_id,
        })
    }

    fn encode(&self, prompt: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.truncate(self.max_len);
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Stable Diffusion XL base pipeline. No safety checker is ever run.
pub struct SdxlModel {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    clip: TextEncoder,
    clip2: TextEncoder,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl SdxlModel {
    fn text_embeddings(&self, prompt: &str, use_guidance: bool) -> Result<Tensor> {
        let mut per_encoder = Vec::with_capacity(2);
        for encoder in [&self.clip, &self.clip2] {
            let cond = encoder.encode(prompt, &self.device)?;
            let embeddings = if use_guidance {
                let uncond = encoder.encode("", &self.device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            per_encoder.push(embeddings);
        }
        Ok(Tensor::cat(&per_encoder, D::Minus1)?.to_dtype(self.dtype)?)
    }
}

impl ModelLike for SdxlModel {
    fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
        let size = request.width as usize;
        let use_guidance = request.guidance_scale > 1.0;
        let mut scheduler = self.config.build_scheduler(request.num_inference_steps)?;

        let text_embeddings = self.text_embeddings(&request.prompt, use_guidance)?;

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, LATENT_CHANNELS, size / 8, size / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising");
        }

        // The stock SDXL VAE overflows in f16.
        let latents = latents.to_dtype(DType::F32)?;
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let decoded = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (decoded.clamp(0f32, 1f32)? * 255.)?
            .to_dtype(DType::U8)?
            .i(0)?;

        tensor_to_image(&img)
    }
}

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Model = SdxlModel;

    async fn load(model_dir: &Path, device_map: DeviceMap) -> Result<Self::Model> {
        info!(model_dir = %model_dir.display(), "loading SDXL pipeline");
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = reduced_precision(&device);
        let config = StableDiffusionConfig::sdxl(None, None, None);

        let clip = TextEncoder::load(model_dir, "text_encoder", "tokenizer", &config.clip, &device)?;
        let clip2_config = config
            .clip2
            .as_ref()
            .context("SDXL configuration has no second text encoder")?;
        let clip2 = TextEncoder::load(
            model_dir,
            "text_encoder_2",
            "tokenizer_2",
            clip2_config,
            &device,
        )?;

        let unet_weights = weights_file(model_dir, "unet", "diffusion_pytorch_model")?;
        let unet = config
            .build_unet(
                unet_weights,
                &device,
                LATENT_CHANNELS,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .context("failed to load unet")?;

        let vae_weights = weights_file(model_dir, "vae", "diffusion_pytorch_model")?;
        let vae = config
            .build_vae(vae_weights, &device, DType::F32)
            .context("failed to load vae")?;

        info!(?dtype, "SDXL pipeline ready");
        Ok(SdxlModel {
            device,
            dtype,
            config,
            clip,
            clip2,
            unet,
            vae,
        })
    }
}

/// Prefers the fp16 variant that the packager ships, falling back to full weights.
fn weights_file(model_dir: &Path, component: &str, stem: &str) -> Result<PathBuf> {
    let dir = model_dir.join(component);
    [
        format!("{stem}.fp16.safetensors"),
        format!("{stem}.safetensors"),
    ]
    .into_iter()
    .map(|name| dir.join(name))
    .find(|path| path.is_file())
    .with_context(|| format!("no {stem} weights under {}", dir.display()))
}
