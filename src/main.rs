mod config;
mod error;
mod extract;
mod llm;
mod regions;
mod review;
mod sd;
mod setup;
mod story;
mod template;
mod trainer;
mod webui;
mod workflow;

use anyhow::{bail, Result};
use config::Config;
use llm::create_llm;
use review::ReviewSession;
use sd::HttpSdClient;
use std::env;
use std::path::Path;
use trainer::LoraTrainer;
use webui::WebUiManager;
use workflow::WorkflowManager;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    config.ensure_directories()?;

    let args: Vec<String> = env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("review") => {
            let dir = args
                .get(2)
                .map(Path::new)
                .ok_or_else(|| anyhow::anyhow!("Usage: story2picturebook review <story-dir>"))?;
            run_review(&config, dir).await
        }
        Some("train") => {
            let (photos, name) = match (args.get(2), args.get(3)) {
                (Some(photos), Some(name)) => (Path::new(photos), name.as_str()),
                _ => bail!("Usage: story2picturebook train <photos-dir> <concept-name>"),
            };
            run_train(&config, photos, name).await
        }
        Some(other) => bail!("Unknown command: {}", other),
        None => run_generate(config).await,
    }
}

async fn run_generate(mut config: Config) -> Result<()> {
    setup::run_setup(&mut config)?;

    let llm = create_llm(&config)?;
    let sd = HttpSdClient::new(&config.sd.base_url);
    let webui = WebUiManager::new(config.webui.clone());

    let manager = WorkflowManager::new(config, llm, Box::new(sd));
    manager.check_preconditions()?;

    webui.start().await?;
    let result = manager.run().await;
    webui.stop().await;

    result.map(|_| ())
}

async fn run_review(config: &Config, dir: &Path) -> Result<()> {
    let sd = HttpSdClient::new(&config.sd.base_url);
    let session = ReviewSession::open(config, dir)?;
    session.run(&sd).await
}

async fn run_train(config: &Config, photos: &Path, name: &str) -> Result<()> {
    let Some(train) = &config.train else {
        bail!("No train section in config.yml");
    };
    LoraTrainer::new(train).run(photos, name).await
}
