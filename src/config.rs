use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Runtime configuration. Built once at startup and passed to the components that need it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Reflective prompt settings
    #[serde(default)]
    pub metacognitive: MetacognitiveConfig,

    /// Client-side stream application
    #[serde(default)]
    pub stream: StreamConfig,

    /// Multi-persona generation
    #[serde(default)]
    pub generation: GenerationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetacognitiveConfig {
    #[serde(default = "default_frequencies")]
    pub frequencies: Vec<u32>,
    #[serde(default = "default_comprehension_prompts")]
    pub comprehension_prompts: Vec<String>,
    #[serde(default = "default_perspective_prompts")]
    pub perspective_prompts: Vec<String>,
    /// Delay after the conversation goes idle before a prompt is evaluated
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Minimum interval between commits of buffered text, per channel
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Capacity of the fan-in channel shared by persona tasks
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

fn default_frequencies() -> Vec<u32> {
    vec![5]
}

fn default_comprehension_prompts() -> Vec<String> {
    vec![
        "Is there anything in this response that you do not fully understand? If yes, try asking a follow-up question."
            .to_string(),
    ]
}

fn default_perspective_prompts() -> Vec<String> {
    vec![
        "Want to know what {{personaName}} thinks about this?".to_string(),
        "You've been talking with the same persona for a while. Maybe see what {{personaName}} would say?"
            .to_string(),
    ]
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_debounce_ms() -> u64 {
    50
}

fn default_channel_capacity() -> usize {
    64
}

fn default_max_tokens() -> u32 {
    1024
}

impl Default for MetacognitiveConfig {
    fn default() -> Self {
        Self {
            frequencies: default_frequencies(),
            comprehension_prompts: default_comprehension_prompts(),
            perspective_prompts: default_perspective_prompts(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl MetacognitiveConfig {
    /// The feature is on whenever at least one frequency is configured.
    pub fn enabled(&self) -> bool {
        !self.frequencies.is_empty()
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

impl StreamConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

/// Parse a comma-separated list of positive integers. Falls back to the defaults when
/// nothing valid remains.
pub fn parse_frequencies(value: &str) -> Vec<u32> {
    if value.trim().is_empty() {
        return default_frequencies();
    }
    let parsed: Vec<u32> = value
        .split(',')
        .filter_map(|s| s.trim().parse::<u32>().ok())
        .filter(|&n| n > 0)
        .collect();
    if parsed.is_empty() {
        warn!(value, "frequency list parsed to nothing, using defaults");
        return default_frequencies();
    }
    parsed
}

/// Parse a JSON array of prompt templates. Falls back to `defaults` unless the value is a
/// non-empty array of strings.
pub fn parse_prompts(value: &str, defaults: Vec<String>) -> Vec<String> {
    if value.trim().is_empty() {
        return defaults;
    }
    match serde_json::from_str::<Vec<String>>(value) {
        Ok(prompts) if !prompts.is_empty() => prompts,
        Ok(_) => {
            warn!("prompt list is empty, using defaults");
            defaults
        }
        Err(e) => {
            warn!(error = %e, "failed to parse prompt list, using defaults");
            defaults
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.log_loaded();
        Ok(config)
    }

    /// Override metacognitive settings from `METACOGNITIVE_*` environment variables.
    pub fn apply_env(mut self) -> Self {
        self.apply_vars(|key| std::env::var(key).ok());
        self
    }

    fn apply_vars(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let m = &mut self.metacognitive;
        if let Some(v) = lookup("METACOGNITIVE_FREQUENCIES") {
            m.frequencies = parse_frequencies(&v);
        }
        if let Some(v) = lookup("METACOGNITIVE_PROMPTS_COMPREHENSION") {
            m.comprehension_prompts = parse_prompts(&v, default_comprehension_prompts());
        }
        if let Some(v) = lookup("METACOGNITIVE_PROMPTS_PERSPECTIVE") {
            m.perspective_prompts = parse_prompts(&v, default_perspective_prompts());
        }
    }

    fn log_loaded(&self) {
        let m = &self.metacognitive;
        info!(
            frequencies = ?m.frequencies,
            comprehension_prompts = m.comprehension_prompts.len(),
            perspective_prompts = m.perspective_prompts.len(),
            enabled = m.enabled(),
            debounce_ms = self.stream.debounce_ms,
            "configuration loaded"
        );
    }
}
