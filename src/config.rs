use anyhow::{anyhow, Result};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::ascii_renderer::{MAX_RENDER_WIDTH, TargetWidth};
use crate::error::{DreamError, DreamResult};
use crate::generation::{AspectRatio, HttpImageBackend, ImageBackend, MockImageBackend, QualityTier};
use crate::prefetch_queue::{MAX_CAPACITY, QueueConfig};
use crate::prompt_evolution::{PromptEvolver, Theme};

/// Narrowest explicit render width accepted.
pub const MIN_RENDER_WIDTH: u16 = 8;
pub const MIN_FPS: f64 = 0.1;
pub const MAX_FPS: f64 = 5.0;

/// Effective settings for a dream session.
///
/// Layered as: defaults, then `~/.ascii-dream/config.toml`, then
/// `ASCII_DREAM_*` environment variables, then command-line flags.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub journey: Theme,
    /// Custom prompt, or the start prompt when `evolve` is set
    pub prompt: Option<String>,
    pub evolve: bool,
    pub capacity: usize,
    pub width: TargetWidth,
    pub quality: QualityTier,
    pub aspect_ratio: AspectRatio,
    pub color: bool,
    /// Display ticks per second
    pub fps: f64,
    /// Longest a single tick waits for a frame
    pub take_timeout_secs: u64,
    /// Fill the buffer before the first frame is shown
    pub prefill: bool,
    pub seed: Option<u64>,
    pub endpoint: Option<String>,
    pub api_token: Option<String>,
    /// Per-request timeout for the HTTP backend
    pub request_timeout_secs: u64,
    pub use_mock: bool,
    pub mock_latency_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journey: Theme::Abstract,
            prompt: None,
            evolve: false,
            capacity: 3,
            width: TargetWidth::Auto,
            quality: QualityTier::Normal,
            aspect_ratio: AspectRatio::Square,
            color: true,
            fps: 1.0,
            take_timeout_secs: 30,
            prefill: true,
            seed: None,
            endpoint: None,
            api_token: None,
            request_timeout_secs: 120,
            use_mock: false,
            mock_latency_ms: 800,
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables, or defaults
    pub fn load() -> Result<Self> {
        Self::load_with(&Self::get_config_path()?, |key| std::env::var(key).ok())
    }

    /// Load `path` if it exists, then apply environment overrides.
    ///
    /// A missing file means defaults; a file that exists but does not parse
    /// is a [`DreamError::Config`].
    pub fn load_with<F>(path: &Path, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = if path.exists() {
            Self::load_from(path).map_err(|e| DreamError::config(format!("{e:#}")))?
        } else {
            info!("No config file at {}, using defaults", path.display());
            Self::default()
        };

        config.apply_env_with(lookup);
        Ok(config)
    }

    /// Parse a config file at `path`.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(anyhow!("Config file not found"));
        }
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Invalid config file {}: {}", path.display(), e))?;
        info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Environment variables override the config file
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(endpoint) = lookup("ASCII_DREAM_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Some(token) = lookup("ASCII_DREAM_API_TOKEN") {
            self.api_token = Some(token);
        }
        if let Some(flag) = lookup("ASCII_DREAM_USE_MOCK") {
            self.use_mock = !matches!(flag.trim(), "" | "0" | "false" | "no");
        }
        if let Some(latency) = lookup("ASCII_DREAM_MOCK_LATENCY_MS") {
            match latency.trim().parse() {
                Ok(ms) => self.mock_latency_ms = ms,
                Err(_) => warn!("Ignoring ASCII_DREAM_MOCK_LATENCY_MS={}: not a number", latency),
            }
        }
    }

    /// Persist as the last-used settings.
    pub fn save(&self) -> Result<PathBuf> {
        let config_path = Self::get_config_path()?;
        self.save_to(&config_path)?;
        Ok(config_path)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(config_path, content)?;
        info!("Saved config to: {}", config_path.display());
        Ok(())
    }

    fn get_config_path() -> Result<PathBuf> {
        Ok(Self::get_config_dir()?.join("config.toml"))
    }

    pub fn get_config_dir() -> Result<PathBuf> {
        let home = home_dir().ok_or_else(|| anyhow!("Could not find home directory"))?;
        Ok(home.join(".ascii-dream"))
    }

    /// Reject bad combinations before anything is generated.
    pub fn validate(&self) -> DreamResult<()> {
        self.to_queue_config().validate()?;

        if let TargetWidth::Columns(cols) = self.width {
            if !(MIN_RENDER_WIDTH..=MAX_RENDER_WIDTH).contains(&cols) {
                return Err(DreamError::config(format!(
                    "width {cols} out of range ({MIN_RENDER_WIDTH}..={MAX_RENDER_WIDTH} or auto)"
                )));
            }
        }
        if !self.fps.is_finite() || !(MIN_FPS..=MAX_FPS).contains(&self.fps) {
            return Err(DreamError::config(format!(
                "speed {} fps out of range ({MIN_FPS}..={MAX_FPS})",
                self.fps
            )));
        }
        if self.take_timeout_secs == 0 {
            return Err(DreamError::config("take_timeout_secs must be positive"));
        }
        let prompt_given = self.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        if self.prompt.is_some() && !prompt_given {
            return Err(DreamError::config("prompt must not be empty"));
        }
        if self.journey == Theme::Custom && !prompt_given {
            return Err(DreamError::config("the custom journey needs a prompt"));
        }
        if !self.use_mock {
            match self.endpoint.as_deref() {
                None => {
                    return Err(DreamError::config(
                        "no generation endpoint configured (set ASCII_DREAM_ENDPOINT, pass --endpoint, or use --mock)",
                    ));
                }
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    return Err(DreamError::config(format!("endpoint '{url}' is not an http(s) URL")));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            capacity: self.capacity,
            width: self.width,
            quality: self.quality,
            aspect_ratio: self.aspect_ratio,
            color: self.color,
        }
    }

    /// Prompt source for this session.
    ///
    /// A prompt on its own is a static custom journey; with `evolve` it is
    /// the first frame of the selected journey.
    pub fn build_evolver(&self) -> DreamResult<PromptEvolver> {
        let prompt = self.prompt.as_deref().map(str::trim).filter(|p| !p.is_empty());
        match (prompt, self.evolve) {
            (Some(prompt), true) => {
                let theme = if self.journey.evolves() { self.journey } else { Theme::Abstract };
                Ok(PromptEvolver::new(theme, self.seed).with_start_prompt(prompt))
            }
            (Some(prompt), false) => Ok(PromptEvolver::custom(prompt)),
            (None, _) if self.journey == Theme::Custom => {
                Err(DreamError::config("the custom journey needs a prompt"))
            }
            (None, _) => Ok(PromptEvolver::new(self.journey, self.seed)),
        }
    }

    /// Generation backend for this session.
    pub fn build_backend(&self) -> DreamResult<Arc<dyn ImageBackend>> {
        if self.use_mock {
            return Ok(Arc::new(MockImageBackend::new(Duration::from_millis(self.mock_latency_ms))));
        }
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| DreamError::config("no generation endpoint configured"))?;
        Ok(Arc::new(HttpImageBackend::new(
            endpoint,
            self.api_token.clone(),
            Duration::from_secs(self.request_timeout_secs),
        )))
    }

    /// Time between display ticks.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.clamp(MIN_FPS, MAX_FPS))
    }

    pub fn take_timeout(&self) -> Duration {
        Duration::from_secs(self.take_timeout_secs)
    }

    /// Bound on the startup prefill: one take timeout per buffered frame.
    pub fn prefill_timeout(&self) -> Duration {
        self.take_timeout() * u32::try_from(self.capacity).unwrap_or(u32::MAX)
    }

    /// Set the display rate from seconds between frames.
    pub fn set_seconds_per_frame(&mut self, seconds: f64) -> DreamResult<()> {
        if !seconds.is_finite() || seconds <= 0.0 {
            return Err(DreamError::config(format!("speed must be a positive number of seconds, got {seconds}")));
        }
        self.fps = 1.0 / seconds;
        Ok(())
    }

    pub fn is_mock_mode(&self) -> bool {
        self.use_mock
    }

    pub fn show_config_info() -> Result<()> {
        let config_path = Self::get_config_path()?;
        println!("Configuration file: {}", config_path.display());

        if config_path.exists() {
            println!("Status: Found");
        } else {
            println!("Status: Not found (using defaults)");
        }

        let config = Self::load()?;
        println!("Journey: {}", config.journey);
        println!("Prompt: {}", config.prompt.as_deref().unwrap_or("(none)"));
        println!("Evolve: {}", config.evolve);
        println!("Frame buffer: {}", config.capacity);
        println!("Width: {}", config.width);
        println!("Quality: {} ({})", config.quality, config.aspect_ratio);
        println!("Color: {}", config.color);
        println!("Speed: {} fps ({:.2}s per frame)", config.fps, 1.0 / config.fps);
        println!("Prefill: {}", config.prefill);
        println!("Endpoint: {}", config.endpoint.as_deref().unwrap_or("Not set"));
        println!("API token: {}", if config.api_token.is_some() { "Set" } else { "Not set" });
        println!("Mock mode: {}", config.use_mock);

        println!("\nTo point at a generation endpoint:");
        println!("  export ASCII_DREAM_ENDPOINT=https://<your-endpoint>/generate");
        println!("\nOr dream offline:");
        println!("  ascii-dream --mock");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn mock_config() -> Config {
        Config {
            use_mock: true,
            ..Config::default()
        }
    }

    #[test]
    fn test_defaults_need_endpoint_or_mock() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("endpoint"));
        assert!(mock_config().validate().is_ok());
    }

    #[test]
    fn test_zero_capacity_fails_fast() {
        let config = Config {
            capacity: 0,
            ..mock_config()
        };
        assert!(matches!(config.validate(), Err(DreamError::Config(_))));

        let config = Config {
            capacity: MAX_CAPACITY + 1,
            ..mock_config()
        };
        assert!(matches!(config.validate(), Err(DreamError::Config(_))));
    }

    #[test]
    fn test_width_and_fps_ranges() {
        let narrow = Config {
            width: TargetWidth::Columns(4),
            ..mock_config()
        };
        assert!(narrow.validate().is_err());

        let fast = Config {
            fps: 12.0,
            ..mock_config()
        };
        assert!(fast.validate().is_err());

        let nan = Config {
            fps: f64::NAN,
            ..mock_config()
        };
        assert!(nan.validate().is_err());

        let ok = Config {
            width: TargetWidth::Columns(100),
            fps: 2.0,
            ..mock_config()
        };
        assert!(ok.validate().is_ok());
        assert_eq!(ok.tick_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_speed_is_seconds_per_frame() {
        let mut config = mock_config();
        config.set_seconds_per_frame(3.0).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.tick_interval(), Duration::from_secs(3));

        config.set_seconds_per_frame(0.5).unwrap();
        assert_eq!(config.tick_interval(), Duration::from_millis(500));

        assert!(config.set_seconds_per_frame(0.0).is_err());
        assert!(config.set_seconds_per_frame(-2.0).is_err());

        // Slower than 10s per frame is out of range
        config.set_seconds_per_frame(20.0).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_prefill_timeout_scales_with_capacity() {
        let config = Config {
            capacity: 4,
            take_timeout_secs: 10,
            ..mock_config()
        };
        assert!(config.prefill);
        assert_eq!(config.prefill_timeout(), Duration::from_secs(40));
    }

    #[test]
    fn test_custom_journey_requires_prompt() {
        let config = Config {
            journey: Theme::Custom,
            ..mock_config()
        };
        assert!(config.validate().is_err());
        assert!(config.build_evolver().is_err());

        let config = Config {
            journey: Theme::Custom,
            prompt: Some("a lighthouse in fog".into()),
            ..mock_config()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_endpoint_must_be_http() {
        let config = Config {
            endpoint: Some("ftp://gpu.local".into()),
            ..Config::default()
        };
        assert!(config.validate().is_err());

        let config = Config {
            endpoint: Some("https://gpu.local/generate".into()),
            ..Config::default()
        };
        assert!(config.validate().is_ok());
        assert_eq!(config.build_backend().unwrap().name(), "http");
    }

    #[test]
    fn test_prompt_without_evolve_is_static() {
        let config = Config {
            prompt: Some("a lighthouse in fog".into()),
            ..mock_config()
        };
        let mut evolver = config.build_evolver().unwrap();
        let first = evolver.next_prompt();
        let second = evolver.next_prompt();
        assert_eq!(first.text(), "a lighthouse in fog");
        assert_eq!(second.text(), "a lighthouse in fog");
    }

    #[test]
    fn test_prompt_with_evolve_starts_then_journeys() {
        let config = Config {
            prompt: Some("a lighthouse in fog".into()),
            evolve: true,
            journey: Theme::Nature,
            seed: Some(3),
            ..mock_config()
        };
        let mut evolver = config.build_evolver().unwrap();
        assert_eq!(evolver.next_prompt().text(), "a lighthouse in fog");
        let next = evolver.next_prompt();
        assert_eq!(next.theme(), Some(Theme::Nature));
        assert_ne!(next.text(), "a lighthouse in fog");
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("ASCII_DREAM_ENDPOINT", "https://gpu.example/generate"),
            ("ASCII_DREAM_API_TOKEN", "tok"),
            ("ASCII_DREAM_USE_MOCK", "1"),
            ("ASCII_DREAM_MOCK_LATENCY_MS", "0"),
        ]);
        let mut config = Config::default();
        config.apply_env_with(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.endpoint.as_deref(), Some("https://gpu.example/generate"));
        assert_eq!(config.api_token.as_deref(), Some("tok"));
        assert!(config.is_mock_mode());
        assert_eq!(config.mock_latency_ms, 0);

        config.apply_env_with(|key| (key == "ASCII_DREAM_USE_MOCK").then(|| "false".to_string()));
        assert!(!config.is_mock_mode());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config {
            journey: Theme::Cosmic,
            width: TargetWidth::Columns(64),
            quality: QualityTier::Fast,
            aspect_ratio: AspectRatio::Widescreen,
            seed: Some(42),
            ..mock_config()
        };
        config.save_to(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("journey = \"cosmic\""));
        assert!(text.contains("aspect_ratio = \"16:9\""));

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "journey = \"liquid\"\nwidth = \"auto\"\ncolor = false\n").unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.journey, Theme::Liquid);
        assert_eq!(loaded.width, TargetWidth::Auto);
        assert!(!loaded.color);
        assert_eq!(loaded.capacity, 3);
    }

    #[test]
    fn test_unknown_journey_in_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "journey = \"jungle\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
        assert!(Config::load_from(&dir.path().join("missing.toml")).is_err());
    }

    #[test]
    fn test_missing_file_loads_defaults_with_env() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let config = Config::load_with(&path, |key| (key == "ASCII_DREAM_USE_MOCK").then(|| "1".to_string())).unwrap();
        assert_eq!(config, mock_config());
    }

    #[test]
    fn test_invalid_file_fails_instead_of_falling_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "journey = \"jungle\"\nendpoint = \"https://gpu.example/generate\"\ncapacity = 5\n",
        )
        .unwrap();

        let err = Config::load_with(&path, |_| None).unwrap_err();
        assert!(matches!(err.downcast_ref::<DreamError>(), Some(DreamError::Config(_))));
        assert!(err.to_string().contains("config.toml"), "{err}");

        fs::write(&path, "capacity = \"three\"\n").unwrap();
        assert!(Config::load_with(&path, |_| None).is_err());
    }
}
