use crate::config::Config;
use anyhow::Result;
use inquire::Text;

/// Fills in missing story parameters interactively before a generation run.
/// Persistent fields are written back to config.yml; the plot is per-run and
/// never saved.
pub fn run_setup(config: &mut Config) -> Result<()> {
    let mut needs_save = false;

    if config.story.hero.is_empty() {
        config.story.hero = Text::new("Name of the hero:").prompt()?.trim().to_string();
        needs_save = true;
    }

    if config.story.hero_description.is_empty() {
        config.story.hero_description = Text::new("Describe the hero in a few words:")
            .prompt()?
            .trim()
            .to_string();
        needs_save = true;
    }

    if config.story.plot.is_empty() {
        let plot = Text::new("Plot for this story (leave empty to let the model invent one):")
            .prompt()?;
        config.story.plot = plot.trim().to_string();
    }

    if needs_save {
        config.save()?;
    }

    Ok(())
}
