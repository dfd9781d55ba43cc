//! Pipeline orchestration.
//!
//! One [`Pipeline`] can serve many runs, concurrently if the caller wishes:
//! it holds only immutable configuration and shared provider handles, and
//! every run owns its fragments, scratch files and track.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span};
use uuid::Uuid;

use crate::audio::{AssembledTrack, AudioAssembler};
use crate::config::Config;
use crate::error::{FailureClass, NewscastError};
use crate::publish::{ArtifactPublisher, ArtifactReference, ObjectStore, save_track};
use crate::script::{DialogueScript, Segmenter, SpeakerId, Utterance};
use crate::synthesis::{SpeechProvider, SynthesisClient, SynthesisJob};
use crate::voice::VoiceProfile;

/// Stages of a run, in the order they execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    Start,
    Segmenting,
    Synthesizing,
    Assembling,
    Publishing,
}

impl Stage {
    pub fn display_name(&self) -> &str {
        match self {
            Stage::Start => "START",
            Stage::Segmenting => "SEGMENTING",
            Stage::Synthesizing => "SYNTHESIZING",
            Stage::Assembling => "ASSEMBLING",
            Stage::Publishing => "PUBLISHING",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// The script handed to a run.
#[derive(Debug, Clone)]
pub enum ScriptInput {
    /// Utterances already tagged with speakers.
    Structured(DialogueScript),
    /// Raw transcript with one `Label: text` line per utterance.
    Transcript(String),
}

/// Where the finished track goes.
#[derive(Debug, Clone)]
pub enum OutputMode {
    /// Upload to object storage under the given artifact name.
    Publish { name: String },
    /// Write to a local file and hand back its path.
    Download { path: PathBuf },
}

/// Everything one run needs from its caller.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub script: ScriptInput,
    /// Per-speaker voices that win over the configured defaults.
    pub voice_overrides: BTreeMap<SpeakerId, String>,
    pub output: OutputMode,
    /// Overrides the configured pause between utterances.
    pub pause: Option<Duration>,
}

impl RunRequest {
    pub fn new(script: ScriptInput, output: OutputMode) -> Self {
        Self {
            script,
            voice_overrides: BTreeMap::new(),
            output,
            pause: None,
        }
    }

    pub fn with_voice(mut self, speaker: SpeakerId, voice: impl Into<String>) -> Self {
        self.voice_overrides.insert(speaker, voice.into());
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = Some(pause);
        self
    }
}

/// The user-visible result of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Delivery {
    Published(ArtifactReference),
    Saved(PathBuf),
}

/// Terminal state of a run.
#[derive(Debug)]
pub enum RunState {
    Done(Delivery),
    Failed {
        /// Stage that was executing when the run failed.
        stage: Stage,
        error: NewscastError,
    },
}

/// Outcome of one run, with the stages it passed through.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub stages: Vec<Stage>,
    pub state: RunState,
}

impl RunReport {
    pub fn is_done(&self) -> bool {
        matches!(self.state, RunState::Done(_))
    }

    pub fn delivery(&self) -> Option<&Delivery> {
        match &self.state {
            RunState::Done(delivery) => Some(delivery),
            RunState::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&NewscastError> {
        match &self.state {
            RunState::Done(_) => None,
            RunState::Failed { error, .. } => Some(error),
        }
    }

    pub fn failure_class(&self) -> Option<FailureClass> {
        self.error().map(NewscastError::class)
    }

    pub fn into_result(self) -> Result<Delivery, NewscastError> {
        match self.state {
            RunState::Done(delivery) => Ok(delivery),
            RunState::Failed { error, .. } => Err(error),
        }
    }
}

/// Progress notifications emitted during a run.
#[derive(Debug, Clone)]
pub enum PipelineEvent {
    StageStarted { run_id: Uuid, stage: Stage },
    Segmented { run_id: Uuid, utterances: usize },
    FragmentReady { run_id: Uuid, sequence: usize, speaker: SpeakerId },
    Assembled { run_id: Uuid, duration: Duration, bytes: usize },
    Finished { run_id: Uuid, delivery: Delivery },
    Failed { run_id: Uuid, stage: Stage, class: FailureClass, message: String },
}

/// Callback for pipeline events.
pub type PipelineCallback = Box<dyn Fn(PipelineEvent) + Send + Sync>;

/// Sequences segmenting, synthesis, assembly and publishing for each run.
pub struct Pipeline {
    segmenter: Segmenter,
    voices: VoiceProfile,
    synthesis: SynthesisClient,
    assembler: AudioAssembler,
    publisher: ArtifactPublisher,
    callback: Option<PipelineCallback>,
}

impl Pipeline {
    /// Build a pipeline from configuration and explicit provider handles.
    pub fn new(
        config: &Config,
        provider: Arc<dyn SpeechProvider>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, NewscastError> {
        config.validate()?;
        let mut assembler = AudioAssembler::new(&config.audio)?;
        if let Some(rate) = config.synthesis.raw_pcm_rate() {
            assembler = assembler.with_raw_pcm(rate);
        }
        Ok(Self {
            segmenter: Segmenter::new(&config.script),
            voices: VoiceProfile::from_config(&config.voices)?,
            synthesis: SynthesisClient::new(provider, &config.synthesis),
            assembler,
            publisher: ArtifactPublisher::new(store, &config.storage),
            callback: None,
        })
    }

    /// Set a callback for pipeline events.
    pub fn with_callback(mut self, callback: PipelineCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn voices(&self) -> &VoiceProfile {
        &self.voices
    }

    /// Execute one run to completion.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        self.run_with_cancel(request, CancellationToken::new()).await
    }

    /// Execute one run, giving up as soon as `cancel` fires.
    ///
    /// Cancellation drops the in-flight stage: outstanding synthesis calls are
    /// aborted and any scratch file is deleted before `Cancelled` is reported.
    pub async fn run_with_cancel(
        &self,
        request: RunRequest,
        cancel: CancellationToken,
    ) -> RunReport {
        let run_id = Uuid::new_v4();
        let stages = Mutex::new(vec![Stage::Start]);
        let span = info_span!("run", %run_id);

        let outcome = async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(NewscastError::Cancelled),
                result = self.execute(run_id, request, &stages) => result,
            }
        }
        .instrument(span)
        .await;

        let stages = stages.into_inner().unwrap_or_else(|e| e.into_inner());
        let state = match outcome {
            Ok(delivery) => {
                info!(%run_id, "Run finished");
                self.emit_event(PipelineEvent::Finished {
                    run_id,
                    delivery: delivery.clone(),
                });
                RunState::Done(delivery)
            }
            Err(error) => {
                let stage = stages.last().copied().unwrap_or(Stage::Start);
                error!(%run_id, %stage, "Run failed: {}", error);
                self.emit_event(PipelineEvent::Failed {
                    run_id,
                    stage,
                    class: error.class(),
                    message: error.to_string(),
                });
                RunState::Failed { stage, error }
            }
        };

        RunReport {
            run_id,
            stages,
            state,
        }
    }

    async fn execute(
        &self,
        run_id: Uuid,
        request: RunRequest,
        stages: &Mutex<Vec<Stage>>,
    ) -> Result<Delivery, NewscastError> {
        self.enter(run_id, Stage::Segmenting, stages);
        let utterances = match &request.script {
            ScriptInput::Structured(script) => self.segmenter.segment(script)?,
            ScriptInput::Transcript(text) => self.segmenter.parse(text)?.into_utterances(),
        };
        self.emit_event(PipelineEvent::Segmented {
            run_id,
            utterances: utterances.len(),
        });

        self.enter(run_id, Stage::Synthesizing, stages);
        let voices = self.voices.with_overrides(&request.voice_overrides)?;
        // every speaker must resolve before the first provider call
        let jobs = build_jobs(&utterances, &voices)?;
        let fragments = self
            .synthesis
            .synthesize_all(jobs, |fragment| {
                self.emit_event(PipelineEvent::FragmentReady {
                    run_id,
                    sequence: fragment.sequence,
                    speaker: fragment.speaker.clone(),
                })
            })
            .await?;

        self.enter(run_id, Stage::Assembling, stages);
        let assembler = match request.pause {
            Some(pause) => self.assembler.clone().with_pause(pause),
            None => self.assembler.clone(),
        };
        let track = assembler.assemble(fragments)?;
        self.emit_event(PipelineEvent::Assembled {
            run_id,
            duration: track.duration(),
            bytes: track.bytes().len(),
        });

        self.enter(run_id, Stage::Publishing, stages);
        self.deliver(run_id, &track, &request.output).await
    }

    async fn deliver(
        &self,
        run_id: Uuid,
        track: &AssembledTrack,
        output: &OutputMode,
    ) -> Result<Delivery, NewscastError> {
        match output {
            OutputMode::Publish { name } => self
                .publisher
                .publish(track, name, run_id)
                .await
                .map(Delivery::Published),
            OutputMode::Download { path } => save_track(track, path).map(Delivery::Saved),
        }
    }

    fn enter(&self, run_id: Uuid, stage: Stage, stages: &Mutex<Vec<Stage>>) {
        info!(%run_id, "Entering {}", stage);
        stages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(stage);
        self.emit_event(PipelineEvent::StageStarted { run_id, stage });
    }

    /// Emit an event if a callback is registered.
    fn emit_event(&self, event: PipelineEvent) {
        if let Some(ref callback) = self.callback {
            callback(event);
        }
    }
}

fn build_jobs(
    utterances: &[Utterance],
    voices: &VoiceProfile,
) -> Result<Vec<SynthesisJob>, NewscastError> {
    utterances
        .iter()
        .enumerate()
        .map(|(sequence, utterance)| {
            Ok(SynthesisJob {
                sequence,
                speaker: utterance.speaker.clone(),
                text: utterance.text.clone(),
                voice: voices.resolve(&utterance.speaker)?.to_string(),
            })
        })
        .collect()
}
