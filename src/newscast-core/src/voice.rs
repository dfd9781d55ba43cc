//! Speaker to provider-voice mapping.

use std::collections::BTreeMap;

use crate::config::VoicesConfig;
use crate::error::NewscastError;
use crate::script::SpeakerId;

/// Immutable speaker → voice token mapping for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceProfile {
    voices: BTreeMap<SpeakerId, String>,
}

impl VoiceProfile {
    pub fn new(voices: BTreeMap<SpeakerId, String>) -> Result<Self, NewscastError> {
        if let Some((speaker, _)) = voices.iter().find(|(_, token)| token.trim().is_empty()) {
            return Err(NewscastError::ConfigError(format!(
                "Voice for {} cannot be empty",
                speaker
            )));
        }
        Ok(Self { voices })
    }

    pub fn from_config(config: &VoicesConfig) -> Result<Self, NewscastError> {
        let mut voices = BTreeMap::new();
        voices.insert(SpeakerId::AgentA, config.agent_a.clone());
        voices.insert(SpeakerId::AgentB, config.agent_b.clone());
        for (id, token) in &config.extra {
            voices.insert(SpeakerId::from(id.as_str()), token.clone());
        }
        Self::new(voices)
    }

    /// Build a new profile where caller-supplied voices win and every other
    /// speaker keeps its configured default.
    pub fn with_overrides(
        &self,
        overrides: &BTreeMap<SpeakerId, String>,
    ) -> Result<Self, NewscastError> {
        let mut voices = self.voices.clone();
        for (speaker, token) in overrides {
            voices.insert(speaker.clone(), token.clone());
        }
        Self::new(voices)
    }

    /// Look up the provider voice token for a speaker.
    pub fn resolve(&self, speaker: &SpeakerId) -> Result<&str, NewscastError> {
        self.voices
            .get(speaker)
            .map(String::as_str)
            .ok_or_else(|| NewscastError::UnknownSpeaker(speaker.to_string()))
    }

    pub fn entries(&self) -> impl Iterator<Item = (&SpeakerId, &str)> {
        self.voices.iter().map(|(s, v)| (s, v.as_str()))
    }
}
