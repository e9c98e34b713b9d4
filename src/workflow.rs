use crate::config::Config;
use crate::error::PipelineError;
use crate::extract::StoryExtractor;
use crate::llm::LlmClient;
use crate::regions::{compose_regions, hero_prompt, TiledDiffusionArgs};
use crate::sd::{generate_then_refine, ImageRequest, SdApi};
use crate::story::StoryMetadata;
use crate::template;
use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sequences one full run: story extraction, per-page image generation, then
/// file output. All upstream calls are issued one at a time in page order.
pub struct WorkflowManager {
    config: Config,
    llm: Box<dyn LlmClient>,
    sd: Box<dyn SdApi>,
}

impl WorkflowManager {
    pub fn new(config: Config, llm: Box<dyn LlmClient>, sd: Box<dyn SdApi>) -> Self {
        Self { config, llm, sd }
    }

    /// Cheap disk checks, run before the backend is even started so a bad
    /// setup fails before any expensive work.
    pub fn check_preconditions(&self) -> Result<()> {
        let lora_path = Path::new(&self.config.webui.workdir)
            .join(&self.config.webui.lora_folder)
            .join(format!("{}.safetensors", self.config.sd.lora));
        if !lora_path.exists() {
            return Err(PipelineError::Precondition(format!(
                "lora model not found: {}",
                lora_path.display()
            ))
            .into());
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<PathBuf> {
        println!("Generating story...");
        let extractor = StoryExtractor::new(self.llm.as_ref(), &self.config.story);
        let extracted = extractor.run().await?;
        info!("Story extracted: {} pages", extracted.pages.len());

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_secs();
        let story_dir = Path::new(&self.config.stories_folder).join(timestamp.to_string());
        fs::create_dir_all(&story_dir)?;

        self.sd.set_model(&self.config.sd.model).await?;

        let sd_cfg = &self.config.sd;
        let hero = hero_prompt(&sd_cfg.lora, &sd_cfg.lora_weight, &self.config.story.hero_description);

        println!("Rendering {} pages...", extracted.pages.len());
        let bar = ProgressBar::new(extracted.pages.len() as u64);
        let mut region_pages = Vec::with_capacity(extracted.pages.len());

        for (index, page) in extracted.pages.iter().enumerate() {
            let use_regions = page.other_characters.is_some();
            region_pages.push(use_regions);

            let regions = compose_regions(page, &hero, &sd_cfg.extra_prompt, use_regions);
            let scripts = TiledDiffusionArgs::new(sd_cfg.width, sd_cfg.height).script_value(&regions);
            let request = ImageRequest::txt2img(sd_cfg.extra_prompt.clone(), scripts, sd_cfg);

            let images = generate_then_refine(self.sd.as_ref(), &request, sd_cfg.refine_denoise).await?;
            for (image_index, bytes) in images.iter().enumerate() {
                fs::write(story_dir.join(format!("{}-{}.png", index, image_index)), bytes)?;
            }

            bar.inc(1);
        }
        bar.finish();

        let metadata = StoryMetadata {
            model: self.config.llm.model.clone(),
            sd_model: sd_cfg.model.clone(),
            sampler: sd_cfg.sampler.clone(),
            steps: sd_cfg.steps,
            cfg_scale: sd_cfg.cfg_scale,
            width: sd_cfg.width,
            height: sd_cfg.height,
            lora: sd_cfg.lora.clone(),
            lora_weight: sd_cfg.lora_weight.clone(),
            extra_prompt: sd_cfg.extra_prompt.clone(),
            hero: self.config.story.hero.clone(),
            hero_description: self.config.story.hero_description.clone(),
            character_descriptions: extracted.descriptions,
            region_pages,
        };

        fs::write(
            story_dir.join("story.json"),
            serde_json::to_string_pretty(&extracted.pages)?,
        )?;
        fs::write(
            story_dir.join("metadata.json"),
            serde_json::to_string_pretty(&metadata)?,
        )?;
        fs::write(
            story_dir.join("index.html"),
            template::render(
                &extracted.pages,
                &template::first_candidates(extracted.pages.len()),
            ),
        )?;

        println!("Story written to {}", story_dir.display());
        Ok(story_dir)
    }
}
