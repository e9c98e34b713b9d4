use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One narrative unit of the story. `paragraph` is set once at story
/// generation; the remaining fields are filled in by later extraction steps.
/// Page order is significant and never changes after generation.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryPage {
    pub paragraph: String,

    /// Scene description, excluding the protagonist and the secondary character.
    #[serde(default)]
    pub background: Option<String>,

    /// How the protagonist looks/acts in this page.
    #[serde(default)]
    pub paragraph_tags: Option<String>,

    /// Composed appearance + reaction of the chosen secondary character.
    /// `None` means no secondary character is visible on this page; it is
    /// never `Some("")`.
    #[serde(default)]
    pub other_characters: Option<String>,
}

impl StoryPage {
    pub fn new(paragraph: String) -> Self {
        Self {
            paragraph,
            background: None,
            paragraph_tags: None,
            other_characters: None,
        }
    }
}

/// Character name -> persisted visual description. Built incrementally during
/// one run; an entry is never overwritten once set.
pub type CharacterDescriptionMap = HashMap<String, String>;

/// Run-level record of the generation parameters, written once per run so the
/// review/upscale stage can rebuild identical requests.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryMetadata {
    pub model: String,
    pub sd_model: String,
    pub sampler: String,
    pub steps: u32,
    pub cfg_scale: f32,
    pub width: u32,
    pub height: u32,
    pub lora: String,
    pub lora_weight: String,
    pub extra_prompt: String,
    pub hero: String,
    pub hero_description: String,
    pub character_descriptions: CharacterDescriptionMap,
    /// Whether multi-region composition was used, per page.
    pub region_pages: Vec<bool>,
}
