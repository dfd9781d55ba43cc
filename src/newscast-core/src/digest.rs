//! News digest and dialogue writing.
//!
//! Asks a chat model for the day's hottest topics and turns them into a
//! two-agent script, either from a fixed template or by letting the model
//! write the conversation.

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::DigestConfig;
use crate::error::NewscastError;
use crate::script::{DialogueScript, Segmenter, SpeakerId, Utterance};

/// Connection settings for an OpenAI-compatible chat API.
#[derive(Debug, Clone)]
pub struct ChatSettings {
    /// OpenAI-compatible API base URL.
    pub api_base: String,
    /// API key for authentication.
    pub api_key: String,
}

impl ChatSettings {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
        }
    }
}

/// One headline from the digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewsItem {
    pub title: String,
    pub summary: String,
}

/// How the conversation gets written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogueStyle {
    /// Deterministic alternating template.
    Template,
    /// Written by the chat model.
    Model,
}

/// Thin chat-completion wrapper with retries.
struct ChatClient {
    client: Client<OpenAIConfig>,
    model: String,
    max_tokens: u32,
}

impl ChatClient {
    fn new(settings: &ChatSettings, config: &DigestConfig) -> Result<Self, NewscastError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                NewscastError::ConfigError(format!("Failed to create HTTP client: {}", e))
            })?;

        let openai = OpenAIConfig::new()
            .with_api_key(&settings.api_key)
            .with_api_base(&settings.api_base);

        Ok(Self {
            client: Client::with_config(openai).with_http_client(http_client),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        })
    }

    /// Get a completion, retrying with exponential backoff (1s, 2s).
    async fn complete(&self, system: &str, user: &str) -> Result<String, NewscastError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: system.to_string().into(),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: user.to_string().into(),
                name: None,
            }),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .max_completion_tokens(self.max_tokens)
            .messages(messages)
            .build()?;

        let max_retries = 3;
        let mut last_error = None;

        for attempt in 0..max_retries {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_secs(1 << (attempt - 1))).await;
            }

            match self.client.chat().create(request.clone()).await {
                Ok(response) => {
                    let content = response
                        .choices
                        .first()
                        .and_then(|c| c.message.content.clone())
                        .unwrap_or_default();
                    debug!("Model returned {} characters", content.len());
                    return Ok(content);
                }
                Err(e) => {
                    warn!("[Retry {}/{}] Chat completion failed: {}", attempt + 1, max_retries, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map(NewscastError::from).unwrap_or_else(|| {
            NewscastError::ConfigError("Unknown API error after retries".to_string())
        }))
    }
}

/// Fetches the daily topic digest.
pub struct NewsDigester {
    chat: ChatClient,
    subject: String,
    max_topics: usize,
}

impl NewsDigester {
    pub fn new(settings: &ChatSettings, config: &DigestConfig) -> Result<Self, NewscastError> {
        Ok(Self {
            chat: ChatClient::new(settings, config)?,
            subject: config.subject.clone(),
            max_topics: config.max_topics.max(1),
        })
    }

    pub async fn fetch(&self) -> Result<Vec<NewsItem>, NewscastError> {
        info!("Fetching the {} hottest {} topics", self.max_topics, self.subject);

        let system = format!("You are a {} news aggregator.", self.subject);
        let user = format!(
            "Give me the {} hottest and most impactful {} news topics right now with a short \
             summary. Put each topic on its own line as `Title - summary`.",
            self.max_topics, self.subject
        );
        let text = self.chat.complete(&system, &user).await?;

        let items = parse_digest(&sanitize_response(&text), self.max_topics);
        if items.is_empty() {
            return Err(NewscastError::MalformedScript(
                "digest contained no `Title - summary` lines".to_string(),
            ));
        }
        Ok(items)
    }
}

/// Turns digest items into a two-agent script.
pub struct DialogueWriter {
    chat: Option<ChatClient>,
    segmenter: Segmenter,
}

impl DialogueWriter {
    /// Writer that only uses the template.
    pub fn template(segmenter: Segmenter) -> Self {
        Self {
            chat: None,
            segmenter,
        }
    }

    /// Writer that can also ask the model to script the conversation.
    pub fn with_model(
        settings: &ChatSettings,
        config: &DigestConfig,
        segmenter: Segmenter,
    ) -> Result<Self, NewscastError> {
        Ok(Self {
            chat: Some(ChatClient::new(settings, config)?),
            segmenter,
        })
    }

    pub async fn write(
        &self,
        items: &[NewsItem],
        style: DialogueStyle,
    ) -> Result<DialogueScript, NewscastError> {
        match (style, &self.chat) {
            (DialogueStyle::Template, _) => template_dialogue(items),
            (DialogueStyle::Model, Some(chat)) => {
                let transcript = chat
                    .complete(DIALOGUE_SYSTEM_PROMPT, &topics_prompt(items))
                    .await?;
                self.segmenter.parse(&sanitize_response(&transcript))
            }
            (DialogueStyle::Model, None) => Err(NewscastError::ConfigError(
                "model-written dialogue needs API credentials".to_string(),
            )),
        }
    }
}

const DIALOGUE_SYSTEM_PROMPT: &str = r#"You write short, lively two-host news podcast scripts.

HOSTS:
- Agent Alpha opens the show and introduces each topic
- Agent Beta reacts, adds context, and asks follow-up questions

OUTPUT RULES:
- One spoken line per row, starting with "Agent Alpha:" or "Agent Beta:"
- Alternate speakers, Agent Alpha speaks first
- Output ONLY spoken words, no stage directions, no markdown, no headings
- Keep each line under 400 characters
"#;

fn topics_prompt(items: &[NewsItem]) -> String {
    let topics = items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {} - {}", i + 1, item.title, item.summary))
        .collect::<Vec<_>>()
        .join("\n");
    format!("Today's topics:\n{}\n\nWrite the conversation.", topics)
}

/// Build the fixed alternating conversation.
///
/// Needs at least two items; the opening exchange discusses the first two and
/// every further item gets one line from each agent.
pub fn template_dialogue(items: &[NewsItem]) -> Result<DialogueScript, NewscastError> {
    let [first, second, rest @ ..] = items else {
        return Err(NewscastError::MalformedScript(format!(
            "template dialogue needs at least 2 topics, got {}",
            items.len()
        )));
    };

    let mut utterances = vec![
        Utterance::new(
            SpeakerId::AgentA,
            format!(
                "Did you catch the latest AI news? {} is the talk of the town!",
                first.title
            ),
        )?,
        Utterance::new(
            SpeakerId::AgentB,
            format!(
                "Absolutely! {} But I'm more intrigued by {}.",
                first.summary, second.title
            ),
        )?,
        Utterance::new(
            SpeakerId::AgentA,
            format!("Yeah, {} could change the industry.", second.summary),
        )?,
    ];

    for item in rest {
        utterances.push(Utterance::new(
            SpeakerId::AgentB,
            format!("There's more. {}", item.title),
        )?);
        utterances.push(Utterance::new(SpeakerId::AgentA, item.summary.clone())?);
    }

    DialogueScript::new(utterances)
}

/// Parse `Title - summary` lines, skipping anything without a separator.
pub fn parse_digest(text: &str, max_items: usize) -> Vec<NewsItem> {
    const SEPARATORS: [&str; 4] = [" - ", " \u{2013} ", " \u{2014} ", ": "];

    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() {
                return None;
            }
            let (title, summary) = SEPARATORS.iter().find_map(|sep| line.split_once(sep))?;
            let title = clean_title(title);
            let summary = summary.trim();
            if title.is_empty() || summary.is_empty() {
                return None;
            }
            Some(NewsItem {
                title,
                summary: summary.to_string(),
            })
        })
        .take(max_items)
        .collect()
}

/// Strip list numbering and emphasis from a headline.
fn clean_title(title: &str) -> String {
    title
        .trim()
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == ')' || c == '-')
        .trim()
        .trim_matches('*')
        .trim()
        .to_string()
}

/// Strip reasoning tags and markdown emphasis from model output, keeping
/// line structure intact.
pub fn sanitize_response(response: &str) -> String {
    let tags_to_strip = ["thinking", "think", "reflection", "reasoning", "analysis", "plan"];

    let mut result = response.to_string();

    for tag in &tags_to_strip {
        let pattern = format!(r"(?is)<{tag}[^>]*>.*?</{tag}>", tag = tag);
        if let Ok(re) = regex::Regex::new(&pattern) {
            result = re.replace_all(&result, "").to_string();
        }
    }

    if let Ok(orphan_re) = regex::Regex::new(r"</?[\w]+[^>]*>") {
        result = orphan_re.replace_all(&result, "").to_string();
    }

    // collapse runs of spaces but keep newlines
    let space_re = regex::Regex::new(r"[ \t]+").ok();
    result
        .lines()
        .map(|line| {
            let line = line.replace("**", "");
            match &space_re {
                Some(re) => re.replace_all(line.trim(), " ").to_string(),
                None => line.trim().to_string(),
            }
        })
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}
