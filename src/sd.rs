use crate::config::SdConfig;
use crate::error::PipelineError;
use crate::regions::{compose_regions, hero_prompt, TiledDiffusionArgs};
use crate::story::{StoryMetadata, StoryPage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// Fixed negative prompt for every request; quality/anatomy failure modes of
// the SD 1.5 family plus frame-splitting and nudity blocks.
pub const NEGATIVE_PROMPT: &str = "multiple people, lowres, text, error, cropped, worst quality, low quality, jpeg artifacts, ugly, duplicate, morbid, mutilated, out of frame, extra fingers, mutated hands, poorly drawn hands, poorly drawn face, mutation, deformed, blurry, dehydrated, bad anatomy, bad proportions, extra limbs, cloned face, disfigured, gross proportions, malformed limbs, missing arms, missing legs, extra arms, extra legs, fused fingers, too many fingers, long neck, username, watermark, signature, split frame, multiple frame, split panel, multi panel, cropped, diptych, triptych, nude, naked";

#[derive(Debug, Clone, Serialize)]
pub struct ImageRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub seed: i64,
    pub sampler_name: String,
    pub batch_size: u32,
    pub steps: u32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub restore_faces: bool,
    pub refiner_switch_at: f32,
    pub disable_extra_networks: bool,
    pub send_images: bool,
    pub save_images: bool,
    pub alwayson_scripts: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoising_strength: Option<f32>,
}

impl ImageRequest {
    pub fn txt2img(prompt: String, scripts: Value, cfg: &SdConfig) -> Self {
        Self {
            prompt,
            negative_prompt: NEGATIVE_PROMPT.to_string(),
            seed: -1,
            sampler_name: cfg.sampler.clone(),
            batch_size: cfg.batch_size,
            steps: cfg.steps,
            cfg_scale: cfg.cfg_scale,
            width: cfg.width,
            height: cfg.height,
            restore_faces: true,
            refiner_switch_at: 0.8,
            disable_extra_networks: false,
            send_images: true,
            save_images: true,
            alwayson_scripts: scripts,
            init_images: None,
            denoising_strength: None,
        }
    }

    /// Image-to-image variant of this request against one source image.
    pub fn refine_from(&self, image_b64: String, denoise: f32) -> Self {
        let mut req = self.clone();
        req.batch_size = 1;
        req.init_images = Some(vec![image_b64]);
        req.denoising_strength = Some(denoise);
        req
    }
}

#[derive(Debug, Deserialize)]
pub struct ImageResponse {
    pub images: Vec<String>,
    #[serde(default)]
    pub parameters: Value,
}

#[async_trait]
pub trait SdApi: Send + Sync {
    async fn txt2img(&self, request: &ImageRequest) -> Result<ImageResponse>;
    async fn img2img(&self, request: &ImageRequest) -> Result<ImageResponse>;
    async fn set_model(&self, name: &str) -> Result<()>;
}

pub struct HttpSdClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSdClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self.client.post(&url).json(body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_text = resp.text().await.unwrap_or_default();
            return Err(PipelineError::Upstream(format!(
                "stable diffusion API error ({}): {}",
                status, error_text
            ))
            .into());
        }

        Ok(resp)
    }
}

#[async_trait]
impl SdApi for HttpSdClient {
    async fn txt2img(&self, request: &ImageRequest) -> Result<ImageResponse> {
        debug!("txt2img prompt: {}", request.prompt);
        let resp = self.post("/sdapi/v1/txt2img", request).await?;
        Ok(resp.json().await?)
    }

    async fn img2img(&self, request: &ImageRequest) -> Result<ImageResponse> {
        let resp = self.post("/sdapi/v1/img2img", request).await?;
        Ok(resp.json().await?)
    }

    async fn set_model(&self, name: &str) -> Result<()> {
        info!("Switching checkpoint to {}", name);
        self.post("/sdapi/v1/options", &json!({ "sd_model_checkpoint": name }))
            .await?;
        Ok(())
    }
}

fn decode_image(b64: &str) -> Result<Vec<u8>> {
    general_purpose::STANDARD
        .decode(b64)
        .context("image payload is not valid base64")
}

/// One txt2img batch, then an img2img sharpening pass over everything except
/// the first image, which is kept verbatim as a preview. Output preserves
/// batch order. A batch of one returns as-is with no refinement calls.
pub async fn generate_then_refine(
    api: &dyn SdApi,
    request: &ImageRequest,
    denoise: f32,
) -> Result<Vec<Vec<u8>>> {
    let resp = api.txt2img(request).await?;
    if resp.images.is_empty() {
        return Err(PipelineError::Upstream("image service returned no images".to_string()).into());
    }

    if resp.images.len() == 1 {
        return Ok(vec![decode_image(&resp.images[0])?]);
    }

    let mut out = vec![decode_image(&resp.images[0])?];
    for b64 in resp.images.iter().skip(1) {
        let refine = request.refine_from(b64.clone(), denoise);
        let refined = api.img2img(&refine).await?;
        let first = refined.images.first().ok_or_else(|| {
            PipelineError::Upstream("refinement returned no images".to_string())
        })?;
        out.push(decode_image(first)?);
    }

    Ok(out)
}

/// One img2img pass per chosen image at the run's original settings. Strictly
/// sequential: each image gets its own region composition, recomputed from
/// its page's secondary-character presence.
pub async fn upscale_pages(
    api: &dyn SdApi,
    meta: &StoryMetadata,
    items: &[(Vec<u8>, &StoryPage)],
) -> Result<Vec<Vec<u8>>> {
    let hero = hero_prompt(&meta.lora, &meta.lora_weight, &meta.hero_description);
    let cfg = SdConfig {
        sampler: meta.sampler.clone(),
        steps: meta.steps,
        cfg_scale: meta.cfg_scale,
        width: meta.width,
        height: meta.height,
        batch_size: 1,
        lora: meta.lora.clone(),
        lora_weight: meta.lora_weight.clone(),
        extra_prompt: meta.extra_prompt.clone(),
        ..SdConfig::default()
    };

    let mut out = Vec::with_capacity(items.len());
    for (bytes, page) in items {
        let use_regions = page.other_characters.is_some();
        let regions = compose_regions(page, &hero, &meta.extra_prompt, use_regions);
        let scripts = TiledDiffusionArgs::new(meta.width, meta.height).script_value(&regions);
        let request = ImageRequest::txt2img(meta.extra_prompt.clone(), scripts, &cfg)
            .refine_from(general_purpose::STANDARD.encode(bytes), cfg.refine_denoise);
        let resp = api.img2img(&request).await?;
        let first = resp
            .images
            .first()
            .ok_or_else(|| PipelineError::Upstream("upscale returned no images".to_string()))?;
        out.push(decode_image(first)?);
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn b64(data: &[u8]) -> String {
        general_purpose::STANDARD.encode(data)
    }

    struct MockSd {
        txt2img_calls: Arc<Mutex<usize>>,
        img2img_calls: Arc<Mutex<usize>>,
        batch: usize,
    }

    impl MockSd {
        fn new(batch: usize) -> Self {
            Self {
                txt2img_calls: Arc::new(Mutex::new(0)),
                img2img_calls: Arc::new(Mutex::new(0)),
                batch,
            }
        }
    }

    #[async_trait]
    impl SdApi for MockSd {
        async fn txt2img(&self, request: &ImageRequest) -> Result<ImageResponse> {
            *self.txt2img_calls.lock().unwrap() += 1;
            assert!(request.init_images.is_none());
            let images = (0..self.batch).map(|i| b64(&[i as u8])).collect();
            Ok(ImageResponse {
                images,
                parameters: Value::Null,
            })
        }

        async fn img2img(&self, request: &ImageRequest) -> Result<ImageResponse> {
            *self.img2img_calls.lock().unwrap() += 1;
            assert_eq!(request.batch_size, 1);
            assert_eq!(request.denoising_strength, Some(0.5));
            let source = request.init_images.as_ref().unwrap()[0].clone();
            let mut bytes = general_purpose::STANDARD.decode(source).unwrap();
            bytes.push(0xff); // mark as refined
            Ok(ImageResponse {
                images: vec![b64(&bytes)],
                parameters: Value::Null,
            })
        }

        async fn set_model(&self, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    fn request(batch_size: u32) -> ImageRequest {
        let mut req = ImageRequest::txt2img(
            "extra".to_string(),
            Value::Null,
            &SdConfig::default(),
        );
        req.batch_size = batch_size;
        req
    }

    #[tokio::test]
    async fn test_refine_skipped_for_single_image_batch() {
        let api = MockSd::new(1);
        let images = generate_then_refine(&api, &request(1), 0.5).await.unwrap();

        assert_eq!(images.len(), 1);
        assert_eq!(*api.txt2img_calls.lock().unwrap(), 1);
        assert_eq!(*api.img2img_calls.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refine_batch_of_five() {
        let api = MockSd::new(5);
        let images = generate_then_refine(&api, &request(5), 0.5).await.unwrap();

        assert_eq!(images.len(), 5);
        assert_eq!(*api.txt2img_calls.lock().unwrap(), 1);
        assert_eq!(*api.img2img_calls.lock().unwrap(), 4);

        // The preview is untouched, the rest carry the refinement mark.
        assert_eq!(images[0], vec![0u8]);
        for (i, image) in images.iter().enumerate().skip(1) {
            assert_eq!(image, &vec![i as u8, 0xff]);
        }
    }

    #[tokio::test]
    async fn test_upscale_recomputes_regions_per_page() {
        let api = MockSd::new(1);
        let meta = StoryMetadata {
            model: "mistral".to_string(),
            sd_model: "dreamshaper_8".to_string(),
            sampler: "DPM++ 2M Karras".to_string(),
            steps: 45,
            cfg_scale: 12.0,
            width: 768,
            height: 512,
            lora: "el gavin".to_string(),
            lora_weight: "1".to_string(),
            extra_prompt: "extra".to_string(),
            hero: "Gavin".to_string(),
            hero_description: "a boy toddler".to_string(),
            character_descriptions: Default::default(),
            region_pages: vec![false, true],
        };

        let mut solo = StoryPage::new("Gavin alone.".to_string());
        solo.background = Some("a field".to_string());
        let mut pair = StoryPage::new("Gavin and Maya.".to_string());
        pair.background = Some("a pond".to_string());
        pair.other_characters = Some("a tall girl, waving".to_string());

        let items = vec![(vec![1u8], &solo), (vec![2u8], &pair)];
        let images = upscale_pages(&api, &meta, &items).await.unwrap();

        assert_eq!(images.len(), 2);
        assert_eq!(*api.img2img_calls.lock().unwrap(), 2);
        assert_eq!(*api.txt2img_calls.lock().unwrap(), 0);
    }

    #[test]
    fn test_img2img_fields_only_serialized_when_set() {
        let req = request(3);
        let json = serde_json::to_value(&req).unwrap();
        assert!(json.get("init_images").is_none());
        assert!(json.get("denoising_strength").is_none());

        let refined = req.refine_from("YWJj".to_string(), 0.5);
        let json = serde_json::to_value(&refined).unwrap();
        assert_eq!(json["init_images"], serde_json::json!(["YWJj"]));
        assert_eq!(json["denoising_strength"], serde_json::json!(0.5));
        assert_eq!(json["batch_size"], serde_json::json!(1));
    }
}
