//! Prompt evolution for endless dreams.
//!
//! Each journey theme owns a table of templates with `{color}`, `{color2}`
//! and `{element}` slots. A journey walks those templates, and every step
//! mutates at most one axis of its state (the template stage or a single
//! slot choice) so consecutive images stay visually related instead of
//! jumping between unrelated scenes.
//!
//! The core is the pure function [`next`]: given a [`JourneyState`] and a
//! random source it returns the next [`Prompt`] and the successor state.
//! [`PromptEvolver`] wraps that with an owned, optionally seeded RNG.
//!
//! # Example
//!
//! ```
//! use ascii_dream::prompt_evolution::{PromptEvolver, Theme};
//!
//! let mut evolver = PromptEvolver::new(Theme::Cosmic, Some(42));
//! let first = evolver.next_prompt();
//! let second = evolver.next_prompt();
//! assert_eq!(first.index() + 1, second.index());
//! ```

use std::fmt;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DreamError, DreamResult};

const ABSTRACT_TEMPLATES: &[&str] = &[
    "geometric {color} shapes flowing smoothly",
    "swirling {color} and {color2} patterns",
    "abstract {color} waves in motion",
    "crystalline {color} structures forming",
    "fluid {color} ribbons dancing",
    "scattered {color} particles coalescing",
    "radiating {color} energy patterns",
    "interlocking {color} geometric forms",
    "flowing {color} liquid streams",
    "dynamic {color} and {color2} composition",
];

const NATURE_TEMPLATES: &[&str] = &[
    "{element} in {color} light",
    "organic {element} patterns growing",
    "{element} flowing like {color} water",
    "ethereal {color} {element} swirling",
    "dreamy {element} in {color} mist",
    "{element} blooming with {color} energy",
    "wild {color} {element} dancing",
    "serene {element} in {color} atmosphere",
];

const COSMIC_TEMPLATES: &[&str] = &[
    "{color} nebula swirling in space",
    "cosmic {color} energy flowing",
    "stellar {color} and {color2} clouds",
    "galactic {color} vortex spinning",
    "celestial {color} patterns forming",
    "astral {color} waves rippling",
    "interstellar {color} matter dispersing",
    "cosmic {color2} dust in {color} void",
];

const LIQUID_TEMPLATES: &[&str] = &[
    "{color} paint swirling in water",
    "liquid {color} and {color2} mixing",
    "flowing {color} ink dispersing",
    "{color} liquid marble patterns",
    "viscous {color} fluid in motion",
    "aquatic {color} and {color2} streams",
    "molten {color} material flowing",
    "fluid {color} dynamics in motion",
];

/// Colour words substituted into `{color}` and `{color2}`.
pub const COLOR_PALETTE: &[&str] = &[
    "blue", "purple", "orange", "red", "green", "turquoise", "magenta", "cyan", "amber", "violet",
    "crimson", "emerald", "golden", "silver", "coral", "indigo", "rose", "teal",
];

/// Subjects substituted into `{element}`.
pub const NATURE_ELEMENTS: &[&str] = &[
    "leaves",
    "water",
    "fire",
    "clouds",
    "mountains",
    "flowers",
    "trees",
    "waves",
    "wind",
    "rain",
    "lightning",
    "mist",
];

/// Journey theme.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    /// Geometric shapes and patterns
    #[default]
    Abstract,
    /// Organic elements in coloured light
    Nature,
    /// Nebulae, vortices, star dust
    Cosmic,
    /// Paint, ink and molten fluids
    Liquid,
    /// A single user-supplied prompt, never evolved
    Custom,
}

impl Theme {
    /// Every theme, in menu order.
    pub const ALL: [Theme; 5] = [
        Theme::Abstract,
        Theme::Nature,
        Theme::Cosmic,
        Theme::Liquid,
        Theme::Custom,
    ];

    /// Config/CLI key.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Abstract => "abstract",
            Self::Nature => "nature",
            Self::Cosmic => "cosmic",
            Self::Liquid => "liquid",
            Self::Custom => "custom",
        }
    }

    /// Template table. Empty for [`Theme::Custom`].
    #[must_use]
    pub fn templates(&self) -> &'static [&'static str] {
        match self {
            Self::Abstract => ABSTRACT_TEMPLATES,
            Self::Nature => NATURE_TEMPLATES,
            Self::Cosmic => COSMIC_TEMPLATES,
            Self::Liquid => LIQUID_TEMPLATES,
            Self::Custom => &[],
        }
    }

    /// Whether prompts for this theme change over time.
    #[must_use]
    pub fn evolves(&self) -> bool {
        !matches!(self, Self::Custom)
    }

    /// Next evolving theme, wrapping around. Used by the "next theme" key.
    #[must_use]
    pub fn cycle(&self) -> Theme {
        match self {
            Self::Abstract => Self::Nature,
            Self::Nature => Self::Cosmic,
            Self::Cosmic => Self::Liquid,
            Self::Liquid | Self::Custom => Self::Abstract,
        }
    }
}

impl FromStr for Theme {
    type Err = DreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim().to_lowercase();
        Theme::ALL
            .iter()
            .copied()
            .find(|theme| theme.key() == key)
            .ok_or_else(|| DreamError::InvalidTheme(s.to_string()))
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Immutable text prompt handed to the Generation Backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Prompt {
    text: String,
    theme: Option<Theme>,
    index: u64,
}

impl Prompt {
    /// Create a prompt outside of a journey (fallbacks, tests).
    pub fn new(text: impl Into<String>, theme: Option<Theme>, index: u64) -> Self {
        Self {
            text: text.into(),
            theme,
            index,
        }
    }

    /// Prompt text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Theme the prompt was drawn from.
    #[must_use]
    pub fn theme(&self) -> Option<Theme> {
        self.theme
    }

    /// Session-wide generation index.
    #[must_use]
    pub fn index(&self) -> u64 {
        self.index
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// One independently mutable dimension of a journey.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    /// Which template of the theme is in use
    Stage,
    /// The `{color}` slot
    Color,
    /// The `{color2}` slot
    Color2,
    /// The `{element}` slot
    Element,
}

/// Journey state, owned by exactly one evolver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JourneyState {
    theme: Theme,
    stage: usize,
    color: usize,
    color2: usize,
    element: usize,
    step: u64,
    generation: u64,
    base_prompt: Option<String>,
    start_pending: bool,
}

impl JourneyState {
    /// Fresh journey with randomly chosen starting slots.
    pub fn new<R: Rng + ?Sized>(theme: Theme, rng: &mut R) -> Self {
        Self {
            theme,
            stage: 0,
            color: rng.gen_range(0..COLOR_PALETTE.len()),
            color2: rng.gen_range(0..COLOR_PALETTE.len()),
            element: rng.gen_range(0..NATURE_ELEMENTS.len()),
            step: 0,
            generation: 0,
            base_prompt: None,
            start_pending: false,
        }
    }

    /// Static journey repeating `prompt` forever.
    pub fn custom(prompt: impl Into<String>) -> Self {
        Self {
            theme: Theme::Custom,
            stage: 0,
            color: 0,
            color2: 0,
            element: 0,
            step: 0,
            generation: 0,
            base_prompt: Some(prompt.into()),
            start_pending: false,
        }
    }

    /// Emit `prompt` verbatim first, then continue the journey.
    #[must_use]
    pub fn with_start_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.base_prompt = Some(prompt.into());
        self.start_pending = self.theme.evolves();
        self
    }

    /// Build from a theme key, failing on unknown keys.
    pub fn from_key<R: Rng + ?Sized>(key: &str, rng: &mut R) -> DreamResult<Self> {
        let theme: Theme = key.parse()?;
        if theme == Theme::Custom {
            return Err(DreamError::config("the custom journey needs a prompt"));
        }
        Ok(Self::new(theme, rng))
    }

    /// Replace the theme, resetting every journey axis. The session-wide
    /// generation counter and the user's base prompt carry over.
    #[must_use]
    pub fn rethemed<R: Rng + ?Sized>(&self, theme: Theme, rng: &mut R) -> Self {
        let mut next = Self::new(theme, rng);
        next.generation = self.generation;
        next.base_prompt = self.base_prompt.clone();
        next
    }

    /// Current theme.
    #[must_use]
    pub fn theme(&self) -> Theme {
        self.theme
    }

    /// Prompts produced since this journey started.
    #[must_use]
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Prompts produced in the session, across theme changes.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current template index.
    #[must_use]
    pub fn stage(&self) -> usize {
        self.stage
    }

    /// Axes on which two states disagree.
    #[must_use]
    pub fn differing_axes(&self, other: &JourneyState) -> Vec<Axis> {
        let mut axes = Vec::new();
        if self.stage != other.stage {
            axes.push(Axis::Stage);
        }
        if self.color != other.color {
            axes.push(Axis::Color);
        }
        if self.color2 != other.color2 {
            axes.push(Axis::Color2);
        }
        if self.element != other.element {
            axes.push(Axis::Element);
        }
        axes
    }

    fn template(&self) -> Option<&'static str> {
        let templates = self.theme.templates();
        (!templates.is_empty()).then(|| templates[self.stage % templates.len()])
    }

    fn render_text(&self) -> String {
        match (self.template(), &self.base_prompt) {
            (Some(template), _) => template
                .replace("{color2}", COLOR_PALETTE[self.color2])
                .replace("{color}", COLOR_PALETTE[self.color])
                .replace("{element}", NATURE_ELEMENTS[self.element]),
            (None, Some(base)) => base.clone(),
            (None, None) => "abstract colorful shapes".to_string(),
        }
    }

    /// Axes that would visibly change the current template.
    fn mutable_axes(&self) -> Vec<Axis> {
        let mut axes = vec![Axis::Stage];
        if let Some(template) = self.template() {
            if template.contains("{color}") {
                axes.push(Axis::Color);
            }
            if template.contains("{color2}") {
                axes.push(Axis::Color2);
            }
            if template.contains("{element}") {
                axes.push(Axis::Element);
            }
        }
        axes
    }

    fn mutate<R: Rng + ?Sized>(&mut self, axis: Axis, rng: &mut R) {
        match axis {
            Axis::Stage => {
                let len = self.theme.templates().len().max(1);
                self.stage = (self.stage + 1) % len;
            }
            Axis::Color => self.color = different_index(self.color, COLOR_PALETTE.len(), rng),
            Axis::Color2 => self.color2 = different_index(self.color2, COLOR_PALETTE.len(), rng),
            Axis::Element => {
                self.element = different_index(self.element, NATURE_ELEMENTS.len(), rng);
            }
        }
    }
}

fn different_index<R: Rng + ?Sized>(current: usize, len: usize, rng: &mut R) -> usize {
    if len < 2 {
        return current;
    }
    let pick = rng.gen_range(0..len - 1);
    if pick >= current { pick + 1 } else { pick }
}

/// Produce the next prompt and the successor state.
///
/// The first call on a fresh journey renders the starting slots as-is;
/// every later call mutates exactly one axis. Custom journeys and a pending
/// start prompt mutate nothing.
pub fn next<R: Rng + ?Sized>(state: &JourneyState, rng: &mut R) -> (Prompt, JourneyState) {
    let mut successor = state.clone();

    let text = if state.start_pending {
        successor.start_pending = false;
        state.base_prompt.clone().unwrap_or_else(|| state.render_text())
    } else if !state.theme.evolves() || state.step == 0 {
        state.render_text()
    } else {
        let axes = state.mutable_axes();
        let axis = axes[rng.gen_range(0..axes.len())];
        successor.mutate(axis, rng);
        debug!(theme = %state.theme, ?axis, step = state.step, "evolving journey");
        successor.render_text()
    };

    let prompt = Prompt::new(text, Some(state.theme), state.generation);
    successor.step += 1;
    successor.generation += 1;
    (prompt, successor)
}

/// Stateful prompt generator owning its journey and random source.
pub struct PromptEvolver {
    state: JourneyState,
    rng: StdRng,
}

impl PromptEvolver {
    /// Evolving journey. With a seed the prompt sequence is reproducible.
    #[must_use]
    pub fn new(theme: Theme, seed: Option<u64>) -> Self {
        let mut rng = Self::rng_for(seed);
        let state = if theme.evolves() {
            JourneyState::new(theme, &mut rng)
        } else {
            JourneyState::custom("abstract colorful shapes")
        };
        Self { state, rng }
    }

    /// Static custom prompt, repeated without evolution.
    #[must_use]
    pub fn custom(prompt: impl Into<String>) -> Self {
        Self {
            state: JourneyState::custom(prompt),
            rng: Self::rng_for(None),
        }
    }

    /// Build from a theme key, failing with [`DreamError::InvalidTheme`].
    pub fn from_key(key: &str, seed: Option<u64>) -> DreamResult<Self> {
        let mut rng = Self::rng_for(seed);
        let state = JourneyState::from_key(key, &mut rng)?;
        Ok(Self { state, rng })
    }

    /// Emit `prompt` first, then follow the journey.
    #[must_use]
    pub fn with_start_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.state = self.state.with_start_prompt(prompt);
        self
    }

    fn rng_for(seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    /// Advance the journey by one prompt.
    pub fn next_prompt(&mut self) -> Prompt {
        let (prompt, successor) = next(&self.state, &mut self.rng);
        self.state = successor;
        prompt
    }

    /// Switch theme mid-session. Journey state restarts from scratch.
    pub fn set_theme(&mut self, theme: Theme) -> DreamResult<()> {
        if theme == Theme::Custom && self.state.base_prompt.is_none() {
            return Err(DreamError::config("the custom journey needs a prompt"));
        }
        self.state = if theme.evolves() {
            self.state.rethemed(theme, &mut self.rng)
        } else {
            let mut custom = JourneyState::custom(self.state.base_prompt.clone().unwrap_or_default());
            custom.generation = self.state.generation;
            custom
        };
        Ok(())
    }

    /// Current journey state.
    #[must_use]
    pub fn state(&self) -> &JourneyState {
        &self.state
    }
}

impl Iterator for PromptEvolver {
    type Item = Prompt;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_prompt())
    }
}
