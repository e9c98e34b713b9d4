use crate::config::StoryConfig;
use crate::error::PipelineError;
use crate::llm::{strip_code_blocks, GenContext, LlmClient};
use crate::story::{CharacterDescriptionMap, StoryPage};
use anyhow::Result;
use log::{debug, info};
use serde::de::DeserializeOwned;
use serde::Deserialize;

/// Multi-turn script that builds the story and its per-page derived fields.
///
/// Owns the single running conversation context: every call threads the
/// previous call's returned context, so later questions can rely on earlier
/// answers. Steps are strictly sequential, per page in document order.
pub struct StoryExtractor<'a> {
    llm: &'a dyn LlmClient,
    params: &'a StoryConfig,
    context: Option<GenContext>,
    descriptions: CharacterDescriptionMap,
}

#[derive(Debug)]
pub struct ExtractedStory {
    pub pages: Vec<StoryPage>,
    pub descriptions: CharacterDescriptionMap,
}

// One decode struct per schema the prompts ask for. Decoding never reaches
// past these boundaries into untyped JSON.

#[derive(Deserialize)]
struct StoryEnvelope {
    story: Vec<StoryPart>,
}

#[derive(Deserialize)]
struct StoryPart {
    paragraph: String,
}

#[derive(Deserialize)]
struct RosterEnvelope {
    characters: Vec<String>,
}

#[derive(Deserialize)]
struct PresenceEnvelope {
    #[serde(default)]
    people: Vec<String>,
    #[serde(default)]
    animals: Vec<String>,
}

#[derive(Deserialize)]
struct DescriptionEnvelope {
    description: String,
}

#[derive(Deserialize)]
struct ReactionEnvelope {
    reaction: String,
}

#[derive(Deserialize)]
struct BackgroundEnvelope {
    background: String,
}

fn decode<T: DeserializeOwned>(raw: &str, detail: &str) -> Result<T> {
    let clean = strip_code_blocks(raw);
    serde_json::from_str(&clean).map_err(|e| {
        PipelineError::Parse {
            detail: format!("{}: {}", detail, e),
            raw: clean,
        }
        .into()
    })
}

impl<'a> StoryExtractor<'a> {
    pub fn new(llm: &'a dyn LlmClient, params: &'a StoryConfig) -> Self {
        Self {
            llm,
            params,
            context: None,
            descriptions: CharacterDescriptionMap::new(),
        }
    }

    /// Runs the whole protocol: story, roster, then the per-page follow-ups.
    /// Any upstream or parse failure aborts the phase; no partial story
    /// escapes, so image generation never starts on an incomplete one.
    pub async fn run(mut self) -> Result<ExtractedStory> {
        let mut pages = self.generate_story().await?;
        let roster = self.character_roster().await?;

        for (index, page) in pages.iter_mut().enumerate() {
            info!("Extracting page {} details...", index + 1);
            self.fill_page(page, &roster).await?;
        }

        Ok(ExtractedStory {
            pages,
            descriptions: self.descriptions,
        })
    }

    /// One call; updates the running context and decodes the nested JSON.
    async fn ask<T: DeserializeOwned>(&mut self, prompt: &str, detail: &str) -> Result<T> {
        debug!("Prompt: {}", prompt);
        let generation = self.llm.generate(prompt, self.context.as_deref()).await?;
        self.context = Some(generation.context);
        decode(&generation.text, detail)
    }

    async fn generate_story(&mut self) -> Result<Vec<StoryPage>> {
        let p = self.params;
        let plot_clause = if p.plot.is_empty() {
            String::new()
        } else {
            format!("where {} ", p.plot)
        };
        let prompt = format!(
            "Make me a {} about {} named {} {}in {} separate parts. \
            Respond in JSON by placing an array in a key called story that holds each part. \
            Each array element contains a paragraph key holding that part of the story.",
            p.genre, p.hero_description, p.hero, plot_clause, p.pages
        );
        info!("Story prompt: {}", prompt);

        let envelope: StoryEnvelope = self.ask(&prompt, "story").await?;
        if envelope.story.is_empty() {
            return Err(PipelineError::Parse {
                detail: "story array is empty".to_string(),
                raw: String::new(),
            }
            .into());
        }

        Ok(envelope
            .story
            .into_iter()
            .map(|part| StoryPage::new(part.paragraph))
            .collect())
    }

    async fn character_roster(&mut self) -> Result<Vec<String>> {
        let p = self.params;
        let force = match &p.support_character {
            Some(support) => format!(", always including {} and {}", p.hero, support),
            None => format!(", always including {}", p.hero),
        };
        let prompt = format!(
            "List the important characters appearing in the story{}. \
            Respond in JSON with a key called characters holding an array of character names.",
            force
        );

        let envelope: RosterEnvelope = self.ask(&prompt, "character roster").await?;
        Ok(envelope
            .characters
            .into_iter()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .collect())
    }

    async fn fill_page(&mut self, page: &mut StoryPage, roster: &[String]) -> Result<()> {
        let present = self.detect_characters(page, roster).await?;

        for name in &present {
            if !self.descriptions.contains_key(name) {
                let description = self.describe_character(name).await?;
                self.descriptions.insert(name.clone(), description);
            }
        }

        // Tie-break policy: the first detected character gets the reaction.
        let chosen = present.first().cloned();

        page.other_characters = match &chosen {
            Some(name) => {
                let reaction = self.character_reaction(name, &page.paragraph).await?;
                let description = self.descriptions.get(name).cloned().unwrap_or_default();
                let composed = format!("{} {}", description, reaction).trim().to_string();
                // Never store an empty composed string.
                (!composed.is_empty()).then_some(composed)
            }
            None => None,
        };

        page.background = Some(self.page_background(page, chosen.as_deref()).await?);
        page.paragraph_tags = Some(self.hero_reaction(page, chosen.as_deref()).await?);

        Ok(())
    }

    async fn detect_characters(
        &mut self,
        page: &StoryPage,
        roster: &[String],
    ) -> Result<Vec<String>> {
        let hero = &self.params.hero;
        let prompt = format!(
            "Which of these characters are visible in this part of the story, not counting {}: [{}]? \
            The part: \"{}\". \
            Respond in JSON with a people key and an animals key, each holding an array of \
            names from that list. Use empty arrays when none apply.",
            hero,
            roster.join(", "),
            page.paragraph
        );

        let envelope: PresenceEnvelope = self.ask(&prompt, "character presence").await?;
        let hero_lower = hero.to_lowercase();

        Ok(envelope
            .people
            .into_iter()
            .chain(envelope.animals)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty() && !name.to_lowercase().contains(&hero_lower))
            .collect())
    }

    async fn describe_character(&mut self, name: &str) -> Result<String> {
        let prompt = format!(
            "Describe {}'s physical appearance in one sentence. Do not describe {}. \
            Do not mention hair, eye, or skin colour. \
            Respond in JSON with a single description key.",
            name, self.params.hero
        );

        let envelope: DescriptionEnvelope = self.ask(&prompt, "character description").await?;
        Ok(envelope.description.trim().to_string())
    }

    async fn character_reaction(&mut self, name: &str, paragraph: &str) -> Result<String> {
        let prompt = format!(
            "In one sentence, describe how {} reacts to this part of the story: \"{}\". \
            Respond in JSON with a single reaction key.",
            name, paragraph
        );

        let envelope: ReactionEnvelope = self.ask(&prompt, "character reaction").await?;
        Ok(envelope.reaction.trim().to_string())
    }

    async fn page_background(&mut self, page: &StoryPage, chosen: Option<&str>) -> Result<String> {
        let excluded = match chosen {
            Some(name) => format!("{} or {}", self.params.hero, name),
            None => self.params.hero.clone(),
        };
        let prompt = format!(
            "Describe the surroundings in this part of the story in one or two sentences, \
            without mentioning {}: \"{}\". \
            Respond in JSON with a single background key.",
            excluded, page.paragraph
        );

        let envelope: BackgroundEnvelope = self.ask(&prompt, "page background").await?;
        Ok(envelope.background.trim().to_string())
    }

    async fn hero_reaction(&mut self, page: &StoryPage, chosen: Option<&str>) -> Result<String> {
        let p = self.params;
        let also_excluded = match chosen {
            Some(name) => format!(", and do not mention {}", name),
            None => String::new(),
        };
        let prompt = format!(
            "In one sentence, describe how {}, {}, reacts to this part of the story: \"{}\". \
            Do not mention hair, eye, or skin colour{}. \
            Respond in JSON with a single reaction key.",
            p.hero, p.hero_description, page.paragraph, also_excluded
        );

        let envelope: ReactionEnvelope = self.ask(&prompt, "hero reaction").await?;
        Ok(envelope.reaction.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::Generation;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    const PAGE_1: &str = "Gavin woke up early.";
    const PAGE_2: &str = "Gavin met Maya by the pond.";
    const PAGE_3: &str = "Gavin went home to sleep.";

    #[derive(Debug, Default)]
    struct Counters {
        calls: usize,
        description_calls: usize,
        contexts_seen: Vec<Option<Vec<i64>>>,
    }

    #[derive(Debug)]
    struct MockLlm {
        counters: Arc<Mutex<Counters>>,
        maya_pages: Vec<&'static str>,
    }

    impl MockLlm {
        fn new(maya_pages: Vec<&'static str>) -> Self {
            Self {
                counters: Arc::new(Mutex::new(Counters::default())),
                maya_pages,
            }
        }
    }

    #[async_trait]
    impl LlmClient for MockLlm {
        async fn generate(&self, prompt: &str, context: Option<&[i64]>) -> Result<Generation> {
            let call_index = {
                let mut counters = self.counters.lock().unwrap();
                counters.calls += 1;
                counters.contexts_seen.push(context.map(|c| c.to_vec()));
                counters.calls
            };

            let text = if prompt.starts_with("Make me a") {
                format!(
                    r#"{{"story": [{{"paragraph": "{}"}}, {{"paragraph": "{}"}}, {{"paragraph": "{}"}}]}}"#,
                    PAGE_1, PAGE_2, PAGE_3
                )
            } else if prompt.starts_with("List the important characters") {
                r#"{"characters": ["Gavin", "Maya"]}"#.to_string()
            } else if prompt.starts_with("Which of these characters") {
                if self.maya_pages.iter().any(|p| prompt.contains(p)) {
                    r#"{"people": ["Maya"], "animals": []}"#.to_string()
                } else {
                    r#"{"people": [], "animals": []}"#.to_string()
                }
            } else if prompt.contains("physical appearance") {
                self.counters.lock().unwrap().description_calls += 1;
                r#"{"description": "a tall girl in a yellow raincoat"}"#.to_string()
            } else if prompt.starts_with("Describe the surroundings") {
                r#"{"background": "a quiet pond at sunrise"}"#.to_string()
            } else if prompt.starts_with("In one sentence, describe how Maya") {
                r#"{"reaction": "waving excitedly"}"#.to_string()
            } else if prompt.starts_with("In one sentence, describe how Gavin") {
                r#"{"reaction": "smiling shyly"}"#.to_string()
            } else {
                return Err(anyhow!("unexpected prompt: {}", prompt));
            };

            Ok(Generation {
                text,
                context: vec![call_index as i64],
            })
        }
    }

    fn params() -> StoryConfig {
        StoryConfig {
            pages: 3,
            ..StoryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_maya_scenario() {
        let llm = MockLlm::new(vec![PAGE_2]);
        let params = params();
        let extracted = StoryExtractor::new(&llm, &params).run().await.unwrap();

        assert_eq!(extracted.pages.len(), 3);
        assert!(extracted.pages[0].other_characters.is_none());
        assert!(extracted.pages[2].other_characters.is_none());

        let other = extracted.pages[1].other_characters.as_ref().unwrap();
        assert!(other.contains("yellow raincoat"));
        assert!(other.contains("waving excitedly"));

        for page in &extracted.pages {
            assert!(page.background.is_some());
            assert!(page.paragraph_tags.is_some());
            if let Some(s) = &page.other_characters {
                assert!(!s.is_empty());
            }
        }

        // Maya appears on exactly one page, so exactly one description call.
        assert_eq!(llm.counters.lock().unwrap().description_calls, 1);
        assert_eq!(
            extracted.descriptions.get("Maya").map(String::as_str),
            Some("a tall girl in a yellow raincoat")
        );
    }

    #[tokio::test]
    async fn test_description_cached_across_pages() {
        let llm = MockLlm::new(vec![PAGE_1, PAGE_2, PAGE_3]);
        let params = params();
        let extracted = StoryExtractor::new(&llm, &params).run().await.unwrap();

        // Maya shows up on all three pages but is described only once.
        assert_eq!(llm.counters.lock().unwrap().description_calls, 1);
        for page in &extracted.pages {
            assert!(page.other_characters.is_some());
        }
    }

    #[tokio::test]
    async fn test_context_threads_sequentially() {
        let llm = MockLlm::new(vec![PAGE_2]);
        let params = params();
        StoryExtractor::new(&llm, &params).run().await.unwrap();

        let counters = llm.counters.lock().unwrap();
        assert!(counters.contexts_seen[0].is_none(), "first call has no context");
        for (i, ctx) in counters.contexts_seen.iter().enumerate().skip(1) {
            assert_eq!(
                ctx.as_deref(),
                Some([i as i64].as_slice()),
                "call {} must carry call {}'s returned context",
                i + 1,
                i
            );
        }
    }

    #[tokio::test]
    async fn test_parse_failure_aborts() {
        #[derive(Debug)]
        struct Garbage;

        #[async_trait]
        impl LlmClient for Garbage {
            async fn generate(&self, _: &str, _: Option<&[i64]>) -> Result<Generation> {
                Ok(Generation {
                    text: "this is not json".to_string(),
                    context: vec![],
                })
            }
        }

        let params = params();
        let err = StoryExtractor::new(&Garbage, &params)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn test_detection_filters_hero_and_blanks() {
        #[derive(Debug)]
        struct HeroEcho;

        #[async_trait]
        impl LlmClient for HeroEcho {
            async fn generate(&self, prompt: &str, _: Option<&[i64]>) -> Result<Generation> {
                let text = if prompt.starts_with("Make me a") {
                    r#"{"story": [{"paragraph": "The whole family went hiking."}]}"#.to_string()
                } else if prompt.starts_with("List the important characters") {
                    r#"{"characters": ["Gavin", "Gavin's mom", "Rex"]}"#.to_string()
                } else if prompt.starts_with("Which of these characters") {
                    // Model returns the hero-derived name, a blank, and a dog.
                    r#"{"people": ["Gavin's mom", "gavin", " "], "animals": ["Rex"]}"#.to_string()
                } else if prompt.contains("physical appearance") {
                    r#"{"description": "a woman with a sunhat"}"#.to_string()
                } else if prompt.starts_with("Describe the surroundings") {
                    r#"{"background": "a forest trail"}"#.to_string()
                } else {
                    r#"{"reaction": "pointing at a bird"}"#.to_string()
                };
                Ok(Generation {
                    text,
                    context: vec![],
                })
            }
        }

        let params = params();
        let extracted = StoryExtractor::new(&HeroEcho, &params).run().await.unwrap();

        // Hero-derived names and blanks are dropped, leaving Rex as the only
        // detected character.
        let other = extracted.pages[0].other_characters.as_ref().unwrap();
        assert!(other.contains("pointing at a bird"));
        assert!(extracted.descriptions.contains_key("Rex"));
        assert!(!extracted.descriptions.contains_key("gavin"));
        assert!(!extracted.descriptions.contains_key("Gavin's mom"));
    }
}
