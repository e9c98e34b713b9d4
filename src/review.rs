use crate::config::Config;
use crate::sd::{upscale_pages, SdApi};
use crate::story::{StoryMetadata, StoryPage};
use crate::template;
use crate::webui::WebUiManager;
use anyhow::{Context, Result};
use inquire::{Confirm, Select};
use log::{info, warn};
use std::fs;
use std::path::Path;
use tokio::process::{Child, Command};

/// Interactive pass over a finished story directory: pick the best candidate
/// image per page, optionally upscale the picks, then rebuild index.html.
pub struct ReviewSession<'a> {
    config: &'a Config,
    dir: &'a Path,
    pages: Vec<StoryPage>,
    metadata: StoryMetadata,
}

impl<'a> ReviewSession<'a> {
    pub fn open(config: &'a Config, dir: &'a Path) -> Result<Self> {
        let pages: Vec<StoryPage> = serde_json::from_str(
            &fs::read_to_string(dir.join("story.json"))
                .with_context(|| format!("No story.json in {}", dir.display()))?,
        )?;
        let metadata: StoryMetadata = serde_json::from_str(
            &fs::read_to_string(dir.join("metadata.json"))
                .with_context(|| format!("No metadata.json in {}", dir.display()))?,
        )?;
        Ok(Self {
            config,
            dir,
            pages,
            metadata,
        })
    }

    pub async fn run(&self, sd: &dyn SdApi) -> Result<()> {
        let mut chosen = Vec::with_capacity(self.pages.len());

        for (index, page) in self.pages.iter().enumerate() {
            let candidates = candidate_files(self.dir, index)?;
            if candidates.is_empty() {
                warn!("No images for page {}, keeping default name", index);
                chosen.push(format!("{}-0.png", index));
                continue;
            }

            println!("\nPage {}: {}", index + 1, page.paragraph);
            let viewer = match self.spawn_viewer(&candidates[0]) {
                Ok(child) => Some(child),
                Err(e) => {
                    warn!("{}", e);
                    None
                }
            };

            let pick = Select::new("Which image fits this page best?", candidates).prompt()?;

            if let Some(mut child) = viewer {
                let _ = child.kill().await;
            }
            chosen.push(pick);
        }

        if Confirm::new("Upscale the selected images?")
            .with_default(false)
            .prompt()?
        {
            chosen = self.upscale_selection(sd, &chosen).await?;
        }

        fs::write(
            self.dir.join("index.html"),
            template::render(&self.pages, &chosen),
        )?;
        println!("Review written to {}", self.dir.join("index.html").display());

        Ok(())
    }

    fn spawn_viewer(&self, file: &str) -> Result<Child> {
        Command::new(&self.config.webui.viewer)
            .arg(self.dir.join(file))
            .kill_on_drop(true)
            .spawn()
            .context("Failed to launch image viewer")
    }

    /// Runs one img2img pass per page over the picked candidates, writing the
    /// results next to the originals with an `-up` suffix.
    async fn upscale_selection(&self, sd: &dyn SdApi, chosen: &[String]) -> Result<Vec<String>> {
        let webui = WebUiManager::new(self.config.webui.clone());
        webui.start().await?;

        let result = self.upscale_with_backend(sd, chosen).await;
        webui.stop().await;
        result
    }

    async fn upscale_with_backend(&self, sd: &dyn SdApi, chosen: &[String]) -> Result<Vec<String>> {
        sd.set_model(&self.metadata.sd_model).await?;

        let mut items = Vec::with_capacity(chosen.len());
        for (file, page) in chosen.iter().zip(&self.pages) {
            items.push((fs::read(self.dir.join(file))?, page));
        }

        let upscaled = upscale_pages(sd, &self.metadata, &items).await?;

        let mut names = Vec::with_capacity(upscaled.len());
        for (file, bytes) in chosen.iter().zip(upscaled) {
            let name = upscaled_name(file);
            fs::write(self.dir.join(&name), bytes)?;
            info!("Upscaled {} -> {}", file, name);
            names.push(name);
        }
        Ok(names)
    }
}

/// All generated candidates for one page, sorted by image index.
pub fn candidate_files(dir: &Path, page_index: usize) -> Result<Vec<String>> {
    let prefix = format!("{}-", page_index);
    let mut files: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| {
            name.starts_with(&prefix) && name.ends_with(".png") && !name.ends_with("-up.png")
        })
        .collect();
    files.sort();
    Ok(files)
}

pub fn upscaled_name(file: &str) -> String {
    match file.strip_suffix(".png") {
        Some(stem) => format!("{}-up.png", stem),
        None => format!("{}-up", file),
    }
}
