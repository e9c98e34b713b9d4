use crate::config::TrainConfig;
use anyhow::{bail, Context, Result};
use log::{info, warn};
use serde_json::json;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

const PYTHON: &str = "./venv/bin/python3";

/// Drives a OneTrainer checkout through a full LoRA run: caption the photo
/// set, mask it, then train against the generated config.
pub struct LoraTrainer<'a> {
    config: &'a TrainConfig,
}

impl<'a> LoraTrainer<'a> {
    pub fn new(config: &'a TrainConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, photos_dir: &Path, concept_name: &str) -> Result<()> {
        if !photos_dir.is_dir() {
            bail!("Photo directory not found: {}", photos_dir.display());
        }
        let photos_dir = photos_dir
            .canonicalize()
            .context("Failed to resolve photo directory")?;

        println!("Captioning photos...");
        self.run_script(
            "scripts/generate_captions.py",
            &[
                "--model",
                "BLIP",
                "--sample-dir",
                &photos_dir.to_string_lossy(),
                "--initial-caption",
                concept_name,
                "--mode",
                "fill",
            ],
        )
        .await?;

        println!("Masking photos...");
        self.run_script(
            "scripts/generate_masks.py",
            &[
                "--model",
                "CLIPSEG",
                "--sample-dir",
                &photos_dir.to_string_lossy(),
                "--add-prompt",
                concept_name,
                "--mode",
                "fill",
            ],
        )
        .await?;

        let config_path = photos_dir.join("train_config.json");
        let output_path = photos_dir.join(format!("{}.safetensors", concept_name));
        std::fs::write(
            &config_path,
            serde_json::to_string_pretty(&self.train_config(&photos_dir, concept_name, &output_path))?,
        )?;

        println!("Training {}...", concept_name);
        self.run_script(
            "scripts/train.py",
            &["--config-path", &config_path.to_string_lossy()],
        )
        .await?;

        println!("LoRA written to {}", output_path.display());
        Ok(())
    }

    /// The fields OneTrainer actually reads for a LoRA run; everything else
    /// falls back to its own defaults.
    fn train_config(&self, photos_dir: &Path, concept_name: &str, output: &Path) -> serde_json::Value {
        json!({
            "training_method": "LORA",
            "model_type": "STABLE_DIFFUSION_15",
            "base_model_name": self.config.base_model,
            "epochs": self.config.epochs,
            "batch_size": self.config.batch_size,
            "resolution": self.config.resolution,
            "learning_rate": self.config.learning_rate,
            "lora_rank": self.config.lora_rank,
            "lora_alpha": self.config.lora_rank,
            "output_model_format": "SAFETENSORS",
            "output_model_destination": output.to_string_lossy(),
            "concepts": [{
                "name": concept_name,
                "path": photos_dir.to_string_lossy(),
                "include_subdirectories": false,
            }],
        })
    }

    async fn run_script(&self, script: &str, args: &[&str]) -> Result<()> {
        info!("Running {} {:?}", script, args);
        let mut child = Command::new(PYTHON)
            .arg(script)
            .args(args)
            .current_dir(&self.config.onetrainer_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to run {} in {}", script, self.config.onetrainer_dir))?;

        let stdout = child.stdout.take().context("Failed to open script stdout")?;
        let stderr = child.stderr.take().context("Failed to open script stderr")?;

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!("[trainer] {}", line);
            }
        });

        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("[trainer] {}", line);
        }

        let status = child.wait().await?;
        if !status.success() {
            bail!("{} exited with {}", script, status);
        }
        Ok(())
    }
}
