use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_stories")]
    pub stories_folder: String,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub sd: SdConfig,

    #[serde(default)]
    pub story: StoryConfig,

    #[serde(default)]
    pub webui: WebUiConfig,

    pub train: Option<TrainConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String, // only "ollama" for now
    pub base_url: String,
    pub model: String,
    pub keep_alive: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct SdConfig {
    pub base_url: String,
    pub model: String,
    pub sampler: String,
    pub steps: u32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub batch_size: u32,
    pub refine_denoise: f32,
    pub lora: String,
    pub lora_weight: String,
    pub extra_prompt: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StoryConfig {
    pub genre: String,
    pub hero: String,
    pub hero_description: String,
    pub plot: String,
    pub pages: usize,
    pub support_character: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct WebUiConfig {
    pub command: String,
    pub args: Vec<String>,
    pub workdir: String,
    pub ready_marker: String,
    pub lora_folder: String,
    pub viewer: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TrainConfig {
    pub onetrainer_dir: String,
    pub base_model: String,
    #[serde(default = "default_train_epochs")]
    pub epochs: u32,
    #[serde(default = "default_train_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_train_resolution")]
    pub resolution: String,
    #[serde(default = "default_train_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_train_lora_rank")]
    pub lora_rank: u32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            base_url: "http://localhost:11434".to_string(),
            model: "mistral".to_string(),
            keep_alive: "0".to_string(),
        }
    }
}

impl Default for SdConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:7860".to_string(),
            model: "dreamshaper_8".to_string(),
            sampler: "DPM++ 2M Karras".to_string(),
            steps: 45,
            cfg_scale: 12.0,
            width: 768,
            height: 512,
            batch_size: 4,
            refine_denoise: 0.5,
            lora: "el gavin".to_string(),
            lora_weight: "1".to_string(),
            extra_prompt: "masterpiece, best quality, highres, extremely clear 8k wallpaper"
                .to_string(),
        }
    }
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            genre: "children's story".to_string(),
            hero: "Gavin".to_string(),
            hero_description: "a boy toddler".to_string(),
            plot: String::new(),
            pages: 5,
            support_character: None,
        }
    }
}

impl Default for WebUiConfig {
    fn default() -> Self {
        Self {
            command: "./webui.sh".to_string(),
            args: vec![],
            workdir: "../stable-diffusion-webui".to_string(),
            ready_marker: "Running on local URL".to_string(),
            lora_folder: "models/Lora".to_string(),
            viewer: "/usr/bin/display".to_string(),
        }
    }
}

fn default_stories() -> String {
    "stories".to_string()
}
fn default_train_epochs() -> u32 {
    75
}
fn default_train_batch_size() -> u32 {
    5
}
fn default_train_resolution() -> String {
    "512".to_string()
}
fn default_train_learning_rate() -> f64 {
    0.0003
}
fn default_train_lora_rank() -> u32 {
    16
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = Path::new("config.yml");
        if !path.exists() {
            anyhow::bail!("config.yml not found. Please create one.");
        }

        let content = fs::read_to_string(path).context("Failed to read config.yml")?;
        let config: Config =
            serde_yaml_ng::from_str(&content).context("Failed to parse config.yml")?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write("config.yml", content).context("Failed to write config.yml")?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> Result<()> {
        fs::create_dir_all(&self.stories_folder)?;
        Ok(())
    }
}
