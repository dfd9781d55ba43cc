//! Newscast Core Library
//!
//! Turns a two-speaker dialogue script into one published audio file:
//! segmenting, per-utterance speech synthesis, ordered assembly with pauses,
//! and artifact publishing.

pub mod audio;
pub mod config;
pub mod digest;
pub mod error;
pub mod pipeline;
pub mod publish;
pub mod script;
pub mod synthesis;
pub mod voice;

pub use audio::{AssembledTrack, AudioAssembler, AudioFragment};
pub use config::Config;
pub use digest::{ChatSettings, DialogueStyle, DialogueWriter, NewsDigester, NewsItem};
pub use error::{FailureClass, NewscastError};
pub use pipeline::{
    Delivery, OutputMode, Pipeline, PipelineEvent, RunReport, RunRequest, RunState, ScriptInput,
    Stage,
};
pub use publish::{ArtifactPublisher, ArtifactReference, HttpObjectStore, ObjectStore};
pub use script::{DialogueScript, Segmenter, SpeakerId, Utterance};
pub use synthesis::{OpenAiSpeechProvider, SpeechProvider, SynthesisClient};
pub use voice::VoiceProfile;
