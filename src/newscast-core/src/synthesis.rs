//! Speech synthesis: the provider seam, an OpenAI-compatible HTTP provider,
//! and the client that validates input, bounds each call and retries
//! transient failures.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::audio::AudioFragment;
use crate::config::SynthesisConfig;
use crate::error::NewscastError;
use crate::script::SpeakerId;

/// An external text-to-speech service.
///
/// Implementations report transport failures and 5xx/429 responses as
/// [`NewscastError::ProviderUnavailable`] and other 4xx responses as
/// [`NewscastError::ProviderRejected`].
#[async_trait]
pub trait SpeechProvider: Send + Sync {
    /// Synthesize `text` with `voice`, returning encoded audio bytes.
    async fn speak(&self, text: &str, voice: &str) -> Result<Vec<u8>, NewscastError>;
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// Calls the `/audio/speech` endpoint of an OpenAI-compatible API.
pub struct OpenAiSpeechProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    response_format: String,
}

impl OpenAiSpeechProvider {
    pub fn new(
        config: &SynthesisConfig,
        api_key: impl Into<String>,
    ) -> Result<Self, NewscastError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                NewscastError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            http,
            endpoint: format!("{}/audio/speech", config.api_base.trim_end_matches('/')),
            api_key: api_key.into(),
            model: config.model.clone(),
            response_format: config.response_format.clone(),
        })
    }
}

#[async_trait]
impl SpeechProvider for OpenAiSpeechProvider {
    async fn speak(&self, text: &str, voice: &str) -> Result<Vec<u8>, NewscastError> {
        let request = SpeechRequest {
            model: &self.model,
            input: text,
            voice,
            response_format: &self.response_format,
        };

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| NewscastError::ProviderUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(NewscastError::ProviderUnavailable(format!("HTTP {}", status)));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(NewscastError::ProviderRejected {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| NewscastError::ProviderUnavailable(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based): none before the
    /// first, then base, 2×base, 4×base, ...
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        self.base_delay * (1u32 << (attempt - 2).min(16))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

/// One utterance ready to be voiced.
#[derive(Debug, Clone)]
pub struct SynthesisJob {
    pub sequence: usize,
    pub speaker: SpeakerId,
    pub text: String,
    pub voice: String,
}

/// Wraps a [`SpeechProvider`] with input limits, timeouts and retries.
///
/// Cloning is cheap; clones share the provider.
#[derive(Clone)]
pub struct SynthesisClient {
    provider: Arc<dyn SpeechProvider>,
    retry: RetryPolicy,
    timeout: Duration,
    max_input_chars: usize,
    concurrency: usize,
}

impl SynthesisClient {
    pub fn new(provider: Arc<dyn SpeechProvider>, config: &SynthesisConfig) -> Self {
        Self {
            provider,
            retry: RetryPolicy {
                max_attempts: config.max_attempts.max(1),
                base_delay: config.backoff_base(),
            },
            timeout: config.timeout(),
            max_input_chars: config.max_input_chars,
            concurrency: config.concurrency.max(1),
        }
    }

    /// Check text against local limits without calling the provider.
    pub fn check_text(&self, text: &str) -> Result<(), NewscastError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(NewscastError::MalformedScript(
                "cannot synthesize empty text".to_string(),
            ));
        }
        let len = trimmed.chars().count();
        if len > self.max_input_chars {
            return Err(NewscastError::TextTooLong {
                len,
                limit: self.max_input_chars,
            });
        }
        Ok(())
    }

    /// Synthesize one utterance, retrying transient provider failures.
    pub async fn synthesize(&self, job: &SynthesisJob) -> Result<AudioFragment, NewscastError> {
        self.check_text(&job.text)?;
        let text = job.text.trim();

        let mut attempt = 1;
        loop {
            let delay = self.retry.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let call = self.provider.speak(text, &job.voice);
            let result = match tokio::time::timeout(self.timeout, call).await {
                Ok(result) => result,
                Err(_) => Err(NewscastError::ProviderUnavailable(format!(
                    "no response within {}s",
                    self.timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(bytes) => {
                    debug!(
                        "Utterance #{} ({}) synthesized: {} bytes",
                        job.sequence,
                        job.speaker,
                        bytes.len()
                    );
                    return Ok(AudioFragment::new(job.sequence, job.speaker.clone(), bytes));
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_attempts => {
                    warn!(
                        "[Retry {}/{}] Utterance #{} failed: {}",
                        attempt, self.retry.max_attempts, job.sequence, e
                    );
                    attempt += 1;
                }
                Err(NewscastError::ProviderUnavailable(message)) => {
                    return Err(NewscastError::ProviderUnavailable(format!(
                        "utterance #{} failed after {} attempt(s): {}",
                        job.sequence, attempt, message
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Synthesize every job with at most `concurrency` calls in flight.
    ///
    /// Fragments come back in completion order; each carries its `sequence`
    /// so the assembler can restore script order. The first failure aborts
    /// every outstanding call. `on_fragment` is invoked as each one lands.
    pub async fn synthesize_all<F>(
        &self,
        jobs: Vec<SynthesisJob>,
        on_fragment: F,
    ) -> Result<Vec<AudioFragment>, NewscastError>
    where
        F: Fn(&AudioFragment),
    {
        // reject anything over the limit before the first network call
        for job in &jobs {
            self.check_text(&job.text)?;
        }

        info!(
            "Synthesizing {} utterances ({} at a time)",
            jobs.len(),
            self.concurrency
        );

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let total = jobs.len();

        for job in jobs {
            let client = self.clone();
            let permits = Arc::clone(&permits);
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| NewscastError::TaskFailed(e.to_string()))?;
                client.synthesize(&job).await
            });
        }

        let mut fragments = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            let fragment = match joined {
                Ok(Ok(fragment)) => fragment,
                Ok(Err(e)) => {
                    tasks.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tasks.abort_all();
                    return Err(NewscastError::TaskFailed(e.to_string()));
                }
            };
            on_fragment(&fragment);
            fragments.push(fragment);
        }

        Ok(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted responses, then succeeds forever.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<Vec<u8>, NewscastError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedProvider {
        fn new(responses: Vec<Result<Vec<u8>, NewscastError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SpeechProvider for ScriptedProvider {
        async fn speak(&self, text: &str, _voice: &str) -> Result<Vec<u8>, NewscastError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.responses.lock().unwrap().pop_front();
            next.unwrap_or_else(|| Ok(text.as_bytes().to_vec()))
        }
    }

    struct SlowProvider;

    #[async_trait]
    impl SpeechProvider for SlowProvider {
        async fn speak(&self, _text: &str, _voice: &str) -> Result<Vec<u8>, NewscastError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }
    }

    fn config() -> SynthesisConfig {
        SynthesisConfig {
            backoff_base_ms: 1,
            max_input_chars: 20,
            timeout_secs: 1,
            ..SynthesisConfig::default()
        }
    }

    fn job(sequence: usize, text: &str) -> SynthesisJob {
        SynthesisJob {
            sequence,
            speaker: SpeakerId::AgentA,
            text: text.to_string(),
            voice: "alloy".to_string(),
        }
    }

    fn unavailable() -> Result<Vec<u8>, NewscastError> {
        Err(NewscastError::ProviderUnavailable("HTTP 503".to_string()))
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(100));
        assert_eq!(policy.delay_before(3), Duration::from_millis(200));
        assert_eq!(policy.delay_before(4), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_transient_failures_then_success() {
        let provider = ScriptedProvider::new(vec![unavailable(), unavailable()]);
        let client = SynthesisClient::new(provider.clone(), &config());

        let fragment = client.synthesize(&job(0, "Hello")).await.unwrap();
        assert_eq!(fragment.bytes, b"Hello");
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let provider = ScriptedProvider::new(vec![unavailable(), unavailable(), unavailable()]);
        let client = SynthesisClient::new(provider.clone(), &config());

        let err = client.synthesize(&job(4, "Hello")).await.unwrap_err();
        assert!(matches!(err, NewscastError::ProviderUnavailable(ref m) if m.contains("#4")));
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_rejection_not_retried() {
        let provider = ScriptedProvider::new(vec![Err(NewscastError::ProviderRejected {
            status: 400,
            message: "invalid voice".to_string(),
        })]);
        let client = SynthesisClient::new(provider.clone(), &config());

        let err = client.synthesize(&job(0, "Hello")).await.unwrap_err();
        assert!(matches!(err, NewscastError::ProviderRejected { status: 400, .. }));
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn test_too_long_rejected_locally() {
        let provider = ScriptedProvider::new(Vec::new());
        let client = SynthesisClient::new(provider.clone(), &config());

        let err = client
            .synthesize(&job(0, "this sentence is far beyond twenty characters"))
            .await
            .unwrap_err();
        assert!(matches!(err, NewscastError::TextTooLong { limit: 20, .. }));
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_blank_text_rejected_locally() {
        let provider = ScriptedProvider::new(Vec::new());
        let client = SynthesisClient::new(provider.clone(), &config());

        assert!(client.synthesize(&job(0, "  ")).await.is_err());
        assert_eq!(provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_timeout_counts_as_unavailable() {
        let client = SynthesisClient::new(
            Arc::new(SlowProvider),
            &SynthesisConfig {
                max_attempts: 1,
                ..config()
            },
        );
        let err = client.synthesize(&job(0, "Hello")).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_synthesize_all_returns_every_sequence() {
        let provider = ScriptedProvider::new(Vec::new());
        let client = SynthesisClient::new(provider.clone(), &config());
        let seen = AtomicUsize::new(0);

        let jobs = (0..6).map(|i| job(i, &format!("line {i}"))).collect();
        let mut fragments = client
            .synthesize_all(jobs, |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        fragments.sort_by_key(|f| f.sequence);
        let sequences: Vec<_> = fragments.iter().map(|f| f.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(fragments[3].bytes, b"line 3");
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_synthesize_all_checks_limits_before_any_call() {
        let provider = ScriptedProvider::new(Vec::new());
        let client = SynthesisClient::new(provider.clone(), &config());

        let jobs = vec![job(0, "short"), job(1, "a line that is much too long for the limit")];
        let err = client.synthesize_all(jobs, |_| {}).await.unwrap_err();
        assert!(matches!(err, NewscastError::TextTooLong { .. }));
        assert_eq!(provider.calls(), 0);
    }
}
