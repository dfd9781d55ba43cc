//! Configuration module for loading TOML config files.
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! usable configuration apart from the storage namespace, which only matters
//! when publishing.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::NewscastError;
use crate::script::SpeakerId;

/// Root configuration structure.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub voices: VoicesConfig,
    pub script: ScriptConfig,
    pub synthesis: SynthesisConfig,
    pub audio: AudioConfig,
    pub storage: StorageConfig,
    pub digest: DigestConfig,
}

/// Default voice per speaker, as understood by the synthesis provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VoicesConfig {
    pub agent_a: String,
    pub agent_b: String,
    /// Voices for any additional speaker IDs, keyed by ID (e.g. `AGENT_C`).
    pub extra: BTreeMap<String, String>,
}

impl Default for VoicesConfig {
    fn default() -> Self {
        Self {
            agent_a: "alloy".to_string(),
            agent_b: "onyx".to_string(),
            extra: BTreeMap::new(),
        }
    }
}

/// Transcript parsing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Scripts yielding fewer utterances than this are malformed.
    pub min_utterances: usize,
    /// Line label (text before the colon) to speaker.
    pub tags: BTreeMap<String, SpeakerId>,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        let tags = [
            ("Agent Alpha", SpeakerId::AgentA),
            ("Agent Beta", SpeakerId::AgentB),
            ("AGENT_A", SpeakerId::AgentA),
            ("AGENT_B", SpeakerId::AgentB),
        ]
        .into_iter()
        .map(|(label, speaker)| (label.to_string(), speaker))
        .collect();

        Self {
            min_utterances: 1,
            tags,
        }
    }
}

/// Speech synthesis provider settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// OpenAI-compatible API base URL.
    pub api_base: String,
    pub model: String,
    /// One of `mp3`, `wav` or `pcm` (headerless s16le mono).
    pub response_format: String,
    /// Sample rate of `pcm` responses.
    pub pcm_sample_rate: u32,
    pub max_input_chars: usize,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Upper bound on synthesis calls in flight for one run.
    pub concurrency: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            model: "tts-1".to_string(),
            response_format: "mp3".to_string(),
            pcm_sample_rate: 24_000,
            max_input_chars: 4096,
            timeout_secs: 60,
            max_attempts: 3,
            backoff_base_ms: 1000,
            concurrency: 4,
        }
    }
}

impl SynthesisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Rate of headerless PCM fragments, when the provider sends them.
    pub fn raw_pcm_rate(&self) -> Option<u32> {
        (self.response_format == "pcm").then_some(self.pcm_sample_rate)
    }
}

/// Assembly and encoding settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub pause_ms: u64,
    pub sample_rate: u32,
    pub bitrate_kbps: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            pause_ms: 500,
            sample_rate: 24_000,
            bitrate_kbps: 128,
        }
    }
}

impl AudioConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

/// Object storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Host-style namespace, e.g. `my-bucket.storage.example.com`.
    pub namespace: String,
    pub scheme: String,
    pub timeout_secs: u64,
    /// Name of the environment variable holding a bearer token, if any.
    pub token_env: Option<String>,
    /// Where scratch files are written before upload. Defaults to the OS temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            scheme: "https".to_string(),
            timeout_secs: 120,
            token_env: None,
            scratch_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

/// News digest and dialogue writing settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DigestConfig {
    pub model: String,
    pub subject: String,
    pub max_topics: usize,
    pub max_tokens: u32,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o-mini".to_string(),
            subject: "AI".to_string(),
            max_topics: 5,
            max_tokens: 800,
        }
    }
}

/// Provider response formats the assembler can decode.
const RESPONSE_FORMATS: [&str; 3] = ["mp3", "wav", "pcm"];

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NewscastError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| NewscastError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, NewscastError> {
        let config: Config = toml::from_str(content)
            .map_err(|e| NewscastError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no run could succeed with.
    pub fn validate(&self) -> Result<(), NewscastError> {
        if !RESPONSE_FORMATS.contains(&self.synthesis.response_format.as_str()) {
            return Err(NewscastError::ConfigError(format!(
                "synthesis.response_format must be one of {}, got {:?}",
                RESPONSE_FORMATS.join(", "),
                self.synthesis.response_format
            )));
        }
        if self.synthesis.raw_pcm_rate() == Some(0) {
            return Err(NewscastError::ConfigError(
                "synthesis.pcm_sample_rate must be positive".to_string(),
            ));
        }
        if self.synthesis.max_attempts == 0 {
            return Err(NewscastError::ConfigError(
                "synthesis.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.synthesis.concurrency == 0 {
            return Err(NewscastError::ConfigError(
                "synthesis.concurrency must be at least 1".to_string(),
            ));
        }
        if self.synthesis.max_input_chars == 0 {
            return Err(NewscastError::ConfigError(
                "synthesis.max_input_chars must be at least 1".to_string(),
            ));
        }
        if self.audio.sample_rate == 0 {
            return Err(NewscastError::ConfigError(
                "audio.sample_rate must be positive".to_string(),
            ));
        }
        if self.script.tags.is_empty() {
            return Err(NewscastError::ConfigError(
                "script.tags must name at least one speaker label".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.voices.agent_a, "alloy");
        assert_eq!(config.audio.pause_ms, 500);
        assert_eq!(config.synthesis.max_attempts, 3);
        assert_eq!(
            config.script.tags.get("Agent Beta"),
            Some(&SpeakerId::AgentB)
        );
    }

    #[test]
    fn test_partial_sections_merge_with_defaults() {
        let config = Config::from_str(
            r#"
            [voices]
            agent_b = "nova"

            [voices.extra]
            AGENT_C = "echo"

            [audio]
            pause_ms = 250

            [storage]
            namespace = "casts.example.com"
            "#,
        )
        .unwrap();

        assert_eq!(config.voices.agent_a, "alloy");
        assert_eq!(config.voices.agent_b, "nova");
        assert_eq!(config.voices.extra.get("AGENT_C").map(String::as_str), Some("echo"));
        assert_eq!(config.audio.pause(), Duration::from_millis(250));
        assert_eq!(config.audio.sample_rate, 24_000);
        assert_eq!(config.storage.namespace, "casts.example.com");
        assert_eq!(config.storage.scheme, "https");
    }

    #[test]
    fn test_custom_tags_replace_defaults() {
        let config = Config::from_str(
            r#"
            [script.tags]
            "Host" = "AGENT_A"
            "Guest" = "AGENT_B"
            "#,
        )
        .unwrap();
        assert_eq!(config.script.tags.len(), 2);
        assert_eq!(config.script.tags.get("Host"), Some(&SpeakerId::AgentA));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let err = Config::from_str("[synthesis]\nmax_attempts = 0").unwrap_err();
        assert!(matches!(err, NewscastError::ConfigError(_)));
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let err = Config::from_str("[audio\npause_ms = ").unwrap_err();
        assert!(matches!(err, NewscastError::ConfigError(_)));
    }

    #[test]
    fn test_example_config_parses() {
        let config = Config::from_str(include_str!("../../../newscast.example.toml")).unwrap();
        assert_eq!(config.script.min_utterances, 2);
        assert_eq!(config.script.tags.len(), 2);
        assert_eq!(config.storage.token_env.as_deref(), Some("NEWSCAST_STORAGE_TOKEN"));
        assert_eq!(config.digest.subject, "AI");
    }

    #[test]
    fn test_response_format_must_be_decodable() {
        for format in ["opus", "aac", "flac", "MP3"] {
            let err = Config::from_str(&format!("[synthesis]\nresponse_format = \"{format}\""))
                .unwrap_err();
            assert!(matches!(err, NewscastError::ConfigError(_)), "{format}");
        }

        let config = Config::from_str("[synthesis]\nresponse_format = \"pcm\"").unwrap();
        assert_eq!(config.synthesis.raw_pcm_rate(), Some(24_000));
        let config = Config::from_str("[synthesis]\nresponse_format = \"wav\"").unwrap();
        assert_eq!(config.synthesis.raw_pcm_rate(), None);
    }
}
