//! Newscast CLI - AI news podcast tool
//!
//! Turns a daily topic digest, or a dialogue script from disk, into a
//! two-speaker audio episode.

use clap::{ArgAction, Parser, Subcommand};
use colored::Colorize;
use newscast_core::publish::daily_name;
use newscast_core::{
    ChatSettings, Config, Delivery, DialogueScript, DialogueStyle, DialogueWriter, HttpObjectStore,
    NewsDigester, OpenAiSpeechProvider, OutputMode, Pipeline, PipelineEvent, RunRequest,
    ScriptInput, Segmenter, SpeakerId, VoiceProfile,
};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "newscast",
    version,
    about = "AI news podcast tool - two agents talk through the day's news",
    long_about = "Generates a two-speaker audio conversation from a news digest or a dialogue \
                  script, using OpenAI-compatible text and speech APIs."
)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args)]
struct RenderArgs {
    /// Voice for AGENT_A (overrides config)
    #[arg(long, value_name = "VOICE")]
    voice_a: Option<String>,

    /// Voice for AGENT_B (overrides config)
    #[arg(long, value_name = "VOICE")]
    voice_b: Option<String>,

    /// Pause between utterances in milliseconds (overrides config)
    #[arg(long, value_name = "MS")]
    pause_ms: Option<u64>,

    /// Write the episode to this file instead of publishing it
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Artifact name when publishing (defaults to newscast-YYYY-MM-DD.mp3)
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch today's digest, script the conversation, and render it
    Daily {
        /// Let the model write the conversation instead of the template
        #[arg(long)]
        model_dialogue: bool,

        #[command(flatten)]
        render: RenderArgs,
    },
    /// Render a dialogue script file (.json, .toml, or a `Label: text` transcript)
    Speak {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,

        #[command(flatten)]
        render: RenderArgs,
    },
    /// Print the utterances parsed from a script file
    Segment {
        #[arg(value_name = "SCRIPT")]
        script: PathBuf,
    },
    /// Print the configured voice for each speaker
    Voices,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = match &cli.config {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            Config::load(path)?
        }
        None => Config::default(),
    };

    match cli.command {
        Command::Voices => {
            let profile = VoiceProfile::from_config(&config.voices)?;
            for (speaker, voice) in profile.entries() {
                println!("{} {}", format!("{:<10}", speaker).bright_cyan(), voice);
            }
            Ok(())
        }
        Command::Segment { script } => {
            let segmenter = Segmenter::new(&config.script);
            let script = match read_script(&script)? {
                ScriptInput::Structured(script) => script,
                ScriptInput::Transcript(text) => segmenter.parse(&text)?,
            };
            for (i, utterance) in segmenter.segment(&script)?.iter().enumerate() {
                println!(
                    "{:>3}. {} {}",
                    i + 1,
                    format!("[{}]", utterance.speaker).yellow(),
                    utterance.text
                );
            }
            Ok(())
        }
        Command::Speak { script, render } => {
            let input = read_script(&script)?;
            render_script(&config, input, render).await
        }
        Command::Daily {
            model_dialogue,
            render,
        } => {
            let settings = chat_settings();
            let digester = NewsDigester::new(&settings, &config.digest)?;
            let items = digester.fetch().await?;

            println!("{}", "Today's topics:".bold());
            for item in &items {
                println!("  - {} {}", item.title.bright_white(), item.summary.dimmed());
            }
            println!();

            let segmenter = Segmenter::new(&config.script);
            let (writer, style) = if model_dialogue {
                (
                    DialogueWriter::with_model(&settings, &config.digest, segmenter)?,
                    DialogueStyle::Model,
                )
            } else {
                (DialogueWriter::template(segmenter), DialogueStyle::Template)
            };
            let script = writer.write(&items, style).await?;
            render_script(&config, ScriptInput::Structured(script), render).await
        }
    }
}

/// Install the tracing subscriber; `RUST_LOG` wins over `-v`.
fn init_tracing(verbose: u8) {
    let default_level = match verbose {
        0 => "warn,newscast_core=info",
        1 => "info,newscast_core=debug",
        _ => "debug,newscast_core=trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn chat_settings() -> ChatSettings {
    ChatSettings::new(api_base(), api_key())
}

fn api_base() -> String {
    env::var("OPENAI_API_BASE")
        .or_else(|_| env::var("OPENAI_BASE_URL"))
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string())
}

fn api_key() -> String {
    env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!(
            "{}",
            "Warning: OPENAI_API_KEY not set. API calls may fail.".yellow()
        );
        String::new()
    })
}

/// Load a script file, choosing the format by extension.
fn read_script(path: &Path) -> Result<ScriptInput, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)?;
    let input = match path.extension().and_then(|e| e.to_str()) {
        Some("json") => ScriptInput::Structured(DialogueScript::from_json(&content)?),
        Some("toml") => ScriptInput::Structured(DialogueScript::from_toml(&content)?),
        _ => ScriptInput::Transcript(content),
    };
    debug!(path = %path.display(), "loaded script");
    Ok(input)
}

async fn render_script(
    config: &Config,
    script: ScriptInput,
    render: RenderArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut synthesis = config.synthesis.clone();
    if env::var("OPENAI_API_BASE").is_ok() || env::var("OPENAI_BASE_URL").is_ok() {
        synthesis.api_base = api_base();
    }
    let provider = Arc::new(OpenAiSpeechProvider::new(&synthesis, api_key())?);

    let output = match render.output {
        Some(path) => OutputMode::Download { path },
        None => OutputMode::Publish {
            name: render
                .name
                .unwrap_or_else(|| daily_name(chrono::Local::now().date_naive())),
        },
    };
    // storage credentials are only needed when publishing
    let mut storage = config.storage.clone();
    if matches!(output, OutputMode::Download { .. }) {
        storage.token_env = None;
    }
    let store = Arc::new(HttpObjectStore::new(&storage)?);

    let pipeline = Pipeline::new(config, provider, store)?.with_callback(create_console_callback());

    let mut request = RunRequest::new(script, output);
    if let Some(voice) = render.voice_a {
        request = request.with_voice(SpeakerId::AgentA, voice);
    }
    if let Some(voice) = render.voice_b {
        request = request.with_voice(SpeakerId::AgentB, voice);
    }
    if let Some(ms) = render.pause_ms {
        request = request.with_pause(Duration::from_millis(ms));
    }

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.cancel();
        }
    });

    let report = pipeline.run_with_cancel(request, cancel).await;
    if let Some(class) = report.failure_class() {
        eprintln!(
            "{} run {} failed ({})",
            "Error:".red().bold(),
            report.run_id,
            class.display_name().yellow()
        );
    }
    match report.into_result()? {
        Delivery::Published(reference) => {
            println!("{}", serde_json::to_string_pretty(&reference)?);
        }
        Delivery::Saved(path) => println!("{}", path.display()),
    }
    Ok(())
}

/// Create a callback that prints pipeline events to the console.
fn create_console_callback() -> Box<dyn Fn(PipelineEvent) + Send + Sync> {
    Box::new(move |event| match event {
        PipelineEvent::StageStarted { stage, .. } => {
            eprintln!("{} {}", "▶".bright_cyan(), stage.display_name().bright_cyan().bold());
        }
        PipelineEvent::Segmented { utterances, .. } => {
            eprintln!("  {} utterances", utterances);
        }
        PipelineEvent::FragmentReady {
            sequence, speaker, ..
        } => {
            eprintln!("  {} #{} {}", "✓".green(), sequence + 1, speaker.to_string().dimmed());
        }
        PipelineEvent::Assembled {
            duration, bytes, ..
        } => {
            eprintln!(
                "  {:.1}s of audio, {} KiB",
                duration.as_secs_f64(),
                bytes / 1024
            );
        }
        PipelineEvent::Finished { .. } => {
            eprintln!("{}", "Episode ready.".bright_green().bold());
        }
        PipelineEvent::Failed { stage, message, .. } => {
            eprintln!("{} {} {}", "✗".red(), stage.display_name().red(), message);
        }
    })
}
