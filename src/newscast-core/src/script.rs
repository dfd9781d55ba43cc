//! Dialogue scripts and the speaker segmenter.
//!
//! Speakers are tagged with a typed [`SpeakerId`] when the script is built, so
//! nothing downstream of the segmenter ever matches on label text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::ScriptConfig;
use crate::error::NewscastError;

/// Identity of a speaker in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SpeakerId {
    AgentA,
    AgentB,
    /// Any other speaker ID found in a structured script. Only usable when the
    /// voice profile maps it explicitly.
    Other(String),
}

impl SpeakerId {
    pub fn as_str(&self) -> &str {
        match self {
            SpeakerId::AgentA => "AGENT_A",
            SpeakerId::AgentB => "AGENT_B",
            SpeakerId::Other(id) => id,
        }
    }
}

impl From<String> for SpeakerId {
    fn from(value: String) -> Self {
        let normalized = value.trim().to_ascii_uppercase();
        match normalized.as_str() {
            "AGENT_A" => SpeakerId::AgentA,
            "AGENT_B" => SpeakerId::AgentB,
            _ => SpeakerId::Other(normalized),
        }
    }
}

impl From<&str> for SpeakerId {
    fn from(value: &str) -> Self {
        SpeakerId::from(value.to_string())
    }
}

impl From<SpeakerId> for String {
    fn from(value: SpeakerId) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One speaker-attributed line of dialogue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utterance {
    pub speaker: SpeakerId,
    pub text: String,
}

impl Utterance {
    /// Create an utterance, rejecting text that is blank after trimming.
    pub fn new(speaker: SpeakerId, text: impl Into<String>) -> Result<Self, NewscastError> {
        let text = text.into().trim().to_string();
        if text.is_empty() {
            return Err(NewscastError::MalformedScript(format!(
                "utterance for {} has no text",
                speaker
            )));
        }
        Ok(Self { speaker, text })
    }
}

/// Ordered, non-empty sequence of utterances in conversational order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawScript", into = "RawScript")]
pub struct DialogueScript {
    utterances: Vec<Utterance>,
}

#[derive(Serialize, Deserialize)]
struct RawScript {
    utterances: Vec<Utterance>,
}

impl TryFrom<RawScript> for DialogueScript {
    type Error = NewscastError;

    fn try_from(raw: RawScript) -> Result<Self, Self::Error> {
        DialogueScript::new(raw.utterances)
    }
}

impl From<DialogueScript> for RawScript {
    fn from(script: DialogueScript) -> Self {
        RawScript {
            utterances: script.utterances,
        }
    }
}

impl DialogueScript {
    pub fn new(utterances: Vec<Utterance>) -> Result<Self, NewscastError> {
        if utterances.is_empty() {
            return Err(NewscastError::MalformedScript(
                "script contains no utterances".to_string(),
            ));
        }
        if let Some(blank) = utterances.iter().position(|u| u.text.trim().is_empty()) {
            return Err(NewscastError::MalformedScript(format!(
                "utterance #{} has no text",
                blank
            )));
        }
        Ok(Self { utterances })
    }

    /// Parse a structured script from JSON (`{"utterances": [...]}`).
    pub fn from_json(content: &str) -> Result<Self, NewscastError> {
        serde_json::from_str(content)
            .map_err(|e| NewscastError::MalformedScript(format!("invalid JSON script: {}", e)))
    }

    /// Parse a structured script from TOML (`[[utterances]]` tables).
    pub fn from_toml(content: &str) -> Result<Self, NewscastError> {
        toml::from_str(content)
            .map_err(|e| NewscastError::MalformedScript(format!("invalid TOML script: {}", e)))
    }

    pub fn utterances(&self) -> &[Utterance] {
        &self.utterances
    }

    pub fn into_utterances(self) -> Vec<Utterance> {
        self.utterances
    }

    pub fn len(&self) -> usize {
        self.utterances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utterances.is_empty()
    }
}

/// Splits scripts into ordered utterances.
#[derive(Debug, Clone)]
pub struct Segmenter {
    /// Lowercased label to speaker.
    tags: BTreeMap<String, SpeakerId>,
    min_utterances: usize,
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new(&ScriptConfig::default())
    }
}

impl Segmenter {
    pub fn new(config: &ScriptConfig) -> Self {
        let tags = config
            .tags
            .iter()
            .map(|(label, speaker)| (label.trim().to_lowercase(), speaker.clone()))
            .collect();

        Self {
            tags,
            min_utterances: config.min_utterances.max(1),
        }
    }

    /// Validate an already speaker-tagged script and return its utterances in order.
    pub fn segment(&self, script: &DialogueScript) -> Result<Vec<Utterance>, NewscastError> {
        self.check_count(script.utterances().to_vec())
    }

    /// Parse a raw transcript where each line starts with a speaker label,
    /// e.g. `Agent Alpha: "Did you catch the news?"`.
    ///
    /// Lines without a known label are dropped, never reassigned.
    pub fn parse(&self, transcript: &str) -> Result<DialogueScript, NewscastError> {
        let utterances: Vec<Utterance> = transcript
            .lines()
            .filter_map(|line| self.parse_line(line))
            .collect();

        let utterances = self.check_count(utterances)?;
        DialogueScript::new(utterances)
    }

    fn parse_line(&self, line: &str) -> Option<Utterance> {
        let line = line
            .trim()
            .trim_start_matches(['-', '*', '•', '>'])
            .trim_start();
        let (label, rest) = line.split_once(':')?;
        let label = label.trim().trim_matches('*').trim().to_lowercase();
        let speaker = self.tags.get(&label)?.clone();

        let text = strip_quotes(rest.trim());
        Utterance::new(speaker, text).ok()
    }

    fn check_count(&self, utterances: Vec<Utterance>) -> Result<Vec<Utterance>, NewscastError> {
        if utterances.is_empty() {
            return Err(NewscastError::MalformedScript(
                "no utterance with a recognized speaker tag".to_string(),
            ));
        }
        if utterances.len() < self.min_utterances {
            return Err(NewscastError::MalformedScript(format!(
                "expected at least {} utterances, found {}",
                self.min_utterances,
                utterances.len()
            )));
        }
        Ok(utterances)
    }
}

/// Remove one matching pair of surrounding quotes.
fn strip_quotes(text: &str) -> &str {
    const PAIRS: [(char, char); 3] = [('"', '"'), ('\u{201c}', '\u{201d}'), ('\'', '\'')];

    for (open, close) in PAIRS {
        if let Some(inner) = text
            .strip_prefix(open)
            .and_then(|rest| rest.strip_suffix(close))
        {
            return inner.trim();
        }
    }
    text
}
