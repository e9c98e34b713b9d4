use crate::story::StoryPage;
use serde_json::{json, Value};

/// Rectangular sub-area of the canvas with its own prompt, in unit
/// coordinates. Region order is z-order: background first, then foregrounds.
#[derive(Debug, Clone)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub prompt: String,
    pub negative_prompt: String,
    pub blend_mode: BlendMode,
    pub feather_ratio: f64,
    pub seed: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    Background,
    Foreground,
}

impl BlendMode {
    fn as_str(self) -> &'static str {
        match self {
            BlendMode::Background => "Background",
            BlendMode::Foreground => "Foreground",
        }
    }
}

impl Region {
    fn new(rect: (f64, f64, f64, f64), prompt: String, blend_mode: BlendMode, feather: f64) -> Self {
        Self {
            x: rect.0,
            y: rect.1,
            w: rect.2,
            h: rect.3,
            prompt,
            negative_prompt: String::new(),
            blend_mode,
            feather_ratio: feather,
            seed: -1,
        }
    }
}

const FULL_CANVAS: (f64, f64, f64, f64) = (0.0, 0.0, 1.0, 1.0);

// Layout policy: left/right split. The protagonist takes the lower-left 55%
// of the canvas, the secondary character the remaining right side. Fixed
// heuristic rectangles, never derived from content.
const HERO_RECT: (f64, f64, f64, f64) = (0.0, 0.25, 0.55, 0.75);
const OTHER_RECT: (f64, f64, f64, f64) = (0.55, 0.0, 0.45, 0.75);

const BACKGROUND_FEATHER: f64 = 0.2;
const SINGLE_FEATHER: f64 = 0.2;
// Tighter feather on the hero so the subject reads sharply; wider on the
// secondary character so it blends into the background.
const HERO_FEATHER: f64 = 0.1;
const OTHER_FEATHER: f64 = 0.3;

/// The protagonist half of every prompt: personalization adapter tag plus the
/// operator-supplied physical description.
pub fn hero_prompt(lora: &str, lora_weight: &str, hero_description: &str) -> String {
    format!("<lora:{}:{}>(portrait), 1person, {}", lora, lora_weight, hero_description)
}

fn join_prompt(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Turns a story page's accumulated fields into an ordered region list.
///
/// With `use_regions` off this is the fast path: one full-canvas region
/// carrying the whole combined prompt. With it on, a fixed three-region
/// layout: full background, protagonist, secondary character.
pub fn compose_regions(
    page: &StoryPage,
    hero_prompt: &str,
    extra_prompt: &str,
    use_regions: bool,
) -> Vec<Region> {
    if !use_regions {
        let prompt = join_prompt(&[
            hero_prompt,
            page.paragraph_tags.as_deref().unwrap_or(""),
            page.background.as_deref().unwrap_or(""),
            extra_prompt,
        ]);
        return vec![Region::new(
            FULL_CANVAS,
            prompt,
            BlendMode::Foreground,
            SINGLE_FEATHER,
        )];
    }

    let background = page
        .background
        .clone()
        .unwrap_or_else(|| page.paragraph.clone());
    let hero = join_prompt(&[hero_prompt, page.paragraph_tags.as_deref().unwrap_or("")]);
    // Callers enable regions only when a secondary character is present.
    let other = page.other_characters.clone().unwrap_or_default();

    vec![
        Region::new(FULL_CANVAS, background, BlendMode::Background, BACKGROUND_FEATHER),
        Region::new(HERO_RECT, hero, BlendMode::Foreground, HERO_FEATHER),
        Region::new(OTHER_RECT, other, BlendMode::Foreground, OTHER_FEATHER),
    ]
}

/// Fixed scalar block of the Tiled Diffusion plugin protocol, with named
/// fields so nothing gets silently reordered. Conversion to the positional
/// wire array happens only in `script_value`.
#[derive(Debug, Clone)]
pub struct TiledDiffusionArgs {
    pub method: &'static str,
    pub overwrite_size: bool,
    pub keep_input_size: bool,
    pub image_width: u32,
    pub image_height: u32,
    pub tile_width: u32,
    pub tile_height: u32,
    pub overlap: u32,
    pub tile_batch_size: u32,
    pub upscaler_name: &'static str,
    pub scale_factor: f64,
    pub noise_inverse: bool,
    pub noise_inverse_steps: u32,
    pub noise_inverse_retouch: f64,
    pub noise_inverse_renoise_strength: f64,
    pub noise_inverse_renoise_kernel: u32,
    pub control_tensor_cpu: bool,
    pub enable_bbox_control: bool,
    pub draw_background: bool,
    pub causal_layers: bool,
}

impl TiledDiffusionArgs {
    pub fn new(image_width: u32, image_height: u32) -> Self {
        Self {
            method: "MultiDiffusion",
            overwrite_size: false,
            keep_input_size: true,
            image_width,
            image_height,
            // Tiling parameters are inert while region control is active but
            // the plugin still expects them at these positions.
            tile_width: 96,
            tile_height: 96,
            overlap: 48,
            tile_batch_size: 4,
            upscaler_name: "None",
            scale_factor: 1.0,
            noise_inverse: false,
            noise_inverse_steps: 10,
            noise_inverse_retouch: 1.0,
            noise_inverse_renoise_strength: 1.0,
            noise_inverse_renoise_kernel: 64,
            control_tensor_cpu: false,
            enable_bbox_control: true,
            draw_background: false,
            causal_layers: false,
        }
    }

    /// The full `alwayson_scripts` value for one request. The positional
    /// order and count are the wire contract; the plugin does no validation
    /// and misaligned arguments fail silently downstream.
    pub fn script_value(&self, regions: &[Region]) -> Value {
        json!({
            "Tiled Diffusion": {
                "args": self.positional(regions),
                "Tiled VAE": {
                    "args": ["True", "True", "True", "True", "False", 2048, 192],
                },
            },
        })
    }

    fn positional(&self, regions: &[Region]) -> Vec<Value> {
        let mut args = vec![
            bool_str(true).into(),
            self.method.into(),
            bool_str(self.overwrite_size).into(),
            bool_str(self.keep_input_size).into(),
            self.image_width.into(),
            self.image_height.into(),
            self.tile_width.into(),
            self.tile_height.into(),
            self.overlap.into(),
            self.tile_batch_size.into(),
            self.upscaler_name.into(),
            self.scale_factor.into(),
            bool_str(self.noise_inverse).into(),
            self.noise_inverse_steps.into(),
            self.noise_inverse_retouch.into(),
            self.noise_inverse_renoise_strength.into(),
            self.noise_inverse_renoise_kernel.into(),
            bool_str(self.control_tensor_cpu).into(),
            bool_str(self.enable_bbox_control).into(),
            bool_str(self.draw_background).into(),
            bool_str(self.causal_layers).into(),
        ];

        for region in regions {
            args.extend([
                bool_str(true).into(),
                region.x.into(),
                region.y.into(),
                region.w.into(),
                region.h.into(),
                region.prompt.clone().into(),
                region.negative_prompt.clone().into(),
                region.blend_mode.as_str().into(),
                region.feather_ratio.into(),
                region.seed.into(),
            ]);
        }

        args
    }
}

// The plugin takes its booleans as capitalized strings, not JSON booleans.
fn bool_str(b: bool) -> &'static str {
    if b {
        "True"
    } else {
        "False"
    }
}

/// Number of fixed scalars before the per-region tuples start.
pub const SCALAR_ARG_COUNT: usize = 21;
/// Width of one region tuple.
pub const REGION_ARG_COUNT: usize = 10;
