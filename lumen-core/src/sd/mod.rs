use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use tokenizers::Tokenizer;
use tracing::info;

use crate::device_map::{select_best_device, DeviceMap};
use crate::params::GenerationParams;
use crate::pipeline::{PipelineLoader, TextToImage};
use crate::postprocess::RawImage;

/// Model ids this loader can serve.
pub const AVAILABLE_MODELS: &[&str] = &[
    "runwayml/stable-diffusion-v1-5",
    "stabilityai/stable-diffusion-2-1",
];

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const VAE_SCALE: f64 = 0.18215;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

impl StableDiffusionVersion {
    /// Detect the version from a model id such as
    /// `stabilityai/stable-diffusion-2-1`.
    pub fn from_model_id(model_id: &str) -> Option<Self> {
        let id = model_id.to_lowercase();
        if id.contains("2-1") || id.contains("2.1") {
            Some(Self::V2_1)
        } else if id.contains("1-5") || id.contains("1.5") {
            Some(Self::V1_5)
        } else {
            None
        }
    }

    fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }
}

/// Fetches weights from the Hugging Face Hub and assembles the pipeline.
pub struct SdLoader {
    model_id: String,
    version: StableDiffusionVersion,
    device_map: DeviceMap,
    sliced_attention_size: Option<usize>,
}

impl SdLoader {
    pub fn new(
        model_id: &str,
        device_map: DeviceMap,
        sliced_attention_size: Option<usize>,
    ) -> Result<Self> {
        let version = StableDiffusionVersion::from_model_id(model_id)
            .ok_or_else(|| anyhow!("unsupported model: {model_id}"))?;
        Ok(Self {
            model_id: model_id.to_string(),
            version,
            device_map,
            sliced_attention_size,
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }
}

#[async_trait]
impl PipelineLoader for SdLoader {
    async fn load(&self) -> Result<Box<dyn TextToImage>> {
        let device = select_best_device(self.device_map).context("failed to set up device")?;
        let dtype = if matches!(device, Device::Cpu) {
            DType::F32
        } else {
            DType::F16
        };
        let config = self.version.config(self.sliced_attention_size);

        info!(model = %self.model_id, "fetching model weights");
        let api = Api::new().context("failed to create hub API")?;
        let repo = api.repo(hf_hub::Repo::model(self.model_id.clone()));
        let tokenizer_file = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_weights = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get text encoder weights")?;
        let vae_weights = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get VAE weights")?;
        let unet_weights = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get UNet weights")?;

        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load tokenizer")?;
        let pad_token = config
            .clip
            .pad_with
            .clone()
            .unwrap_or_else(|| "<|endoftext|>".to_string());
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token.as_str())
            .ok_or_else(|| anyhow!("pad token {pad_token:?} missing from tokenizer vocab"))?;

        let text_model = stable_diffusion::build_clip_transformer(
            &config.clip,
            clip_weights,
            &device,
            DType::F32,
        )
        .context("failed to build CLIP transformer")?;
        let vae = config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to build VAE")?;
        let unet = config
            .build_unet(
                unet_weights,
                &device,
                4,
                cfg!(feature = "flash-attn"),
                dtype,
            )
            .context("failed to build UNet")?;
        info!(model = %self.model_id, "pipeline components ready");

        Ok(Box::new(SdPipeline {
            device,
            dtype,
            config,
            tokenizer,
            pad_id,
            text_model,
            vae,
            unet,
        }))
    }
}

/// The assembled Stable Diffusion pipeline. All model math lives in
/// candle-transformers; this type only drives it.
pub struct SdPipeline {
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
}

impl SdPipeline {
    fn text_embedding(&self, text: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        let max_len = self.config.clip.max_position_embeddings;
        if tokens.len() > max_len {
            bail!("prompt is too long: {} tokens, limit {max_len}", tokens.len());
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

impl TextToImage for SdPipeline {
    fn run(&mut self, params: &GenerationParams) -> Result<RawImage> {
        // Optionally set seed for reproducibility.
        if let Some(seed) = params.seed {
            self.device.set_seed(seed)?;
        }

        // guidance_scale is clamped to >= 1.0 upstream; exactly 1.0 means no
        // classifier-free guidance and a single UNet pass per step.
        let use_guidance = params.guidance_scale > 1.0;

        let cond = self.text_embedding(&params.prompt)?;
        let text_embeddings = if use_guidance {
            let uncond = self.text_embedding(&params.negative_prompt)?;
            Tensor::cat(&[uncond, cond], 0)?.to_dtype(self.dtype)?
        } else {
            cond.to_dtype(self.dtype)?
        };

        let mut scheduler = self.config.build_scheduler(params.steps)?;
        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )?
        .to_dtype(self.dtype)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?;

        // --- Run denoising through the scheduler's timestep sequence ---
        let timesteps = scheduler.timesteps().to_vec();
        for &timestep in timesteps.iter() {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond_pred, cond_pred) = (&chunks[0], &chunks[1]);
                (uncond_pred + ((cond_pred - uncond_pred)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        // --- Decode the latent image using the autoencoder ---
        let decoded = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        // Scaled to nominal [0, 255] but left unclamped: the post-processor
        // owns clamping and NaN repair.
        let pixels = (((decoded / 2.)? + 0.5)? * 255.)?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .i(0)?;
        let (channels, height, width) = pixels.dims3()?;
        let data = pixels.permute((1, 2, 0))?.flatten_all()?.to_vec1::<f32>()?;
        Ok(RawImage {
            width,
            height,
            channels,
            data,
        })
    }
}
