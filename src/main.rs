use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use charla_gateway::audio::{AudioCodec, AudioFormat};
use charla_gateway::channels::{Channel, TelegramChannel};
use charla_gateway::{Config, ExchangeOutcome, Gateway, InboundMessage};

/// Charla - Spanish conversation tutor for messaging clients
#[derive(Parser)]
#[command(name = "charla", version, about)]
struct Cli {
    /// Path to the config file (defaults to ~/.config/charla/config.toml)
    #[arg(short, long, env = "CHARLA_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the Telegram bot (default)
    Run,
    /// Transcribe an audio file
    Transcribe {
        /// Audio file
        file: PathBuf,
        /// MIME type of the file (guessed from the extension if omitted)
        #[arg(long)]
        mime: Option<String>,
    },
    /// Synthesize text with the tutor's voice
    Speak {
        /// Text to speak
        #[arg(default_value = "¡Hola! ¿Cómo estás hoy?")]
        text: String,
        /// Output WAV file
        #[arg(short, long, default_value = "charla.wav")]
        out: PathBuf,
    },
    /// Chat with the tutor in the terminal
    Chat {
        /// Directory to write reply audio into
        #[arg(long)]
        audio_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,charla_gateway=info",
        1 => "info,charla_gateway=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "loaded configuration");

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => serve(config).await,
        Command::Transcribe { file, mime } => transcribe(&config, &file, mime.as_deref()).await,
        Command::Speak { text, out } => speak(&config, &text, &out).await,
        Command::Chat { audio_dir } => chat(&config, audio_dir.as_deref()).await,
    }
}

/// Cancel `shutdown` on Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        token.cancel();
    });
    shutdown
}

async fn serve(config: Config) -> anyhow::Result<()> {
    // Every credential is checked before anything connects
    let orchestrator = Arc::new(config.build_orchestrator()?);
    let token = config.telegram_token()?;

    let (mut telegram, events) = TelegramChannel::with_receiver(token);
    telegram.connect().await?;

    let shutdown = shutdown_on_ctrl_c();
    let poller = telegram.start_polling(shutdown.clone())?;

    let (stt, tts) = backend_names(&config);
    tracing::info!(
        stt,
        tts,
        model = %config.llm.model,
        delivery = %orchestrator.delivery_format(),
        "charla gateway ready"
    );

    let gateway = Gateway::new(
        Arc::new(telegram),
        orchestrator,
        config.gateway_settings(),
        shutdown.clone(),
    );
    gateway.run(events).await?;

    shutdown.cancel();
    if let Err(e) = poller.await {
        tracing::warn!(error = %e, "polling task ended abnormally");
    }
    Ok(())
}

const fn backend_names(config: &Config) -> (&'static str, &'static str) {
    use charla_gateway::config::{SttProvider, TtsProvider};

    let stt = match config.speech.stt_provider {
        SttProvider::Whisper => "whisper",
        SttProvider::Deepgram => "deepgram",
    };
    let tts = match config.speech.tts_provider {
        TtsProvider::OpenAi => "openai",
        TtsProvider::ElevenLabs => "elevenlabs",
    };
    (stt, tts)
}

fn guess_mime(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "wav" => Some("audio/wav"),
        "mp3" => Some("audio/mpeg"),
        "ogg" | "oga" | "opus" => Some("audio/ogg"),
        "pcm" | "raw" => Some("audio/L16; rate=16000; channels=1"),
        _ => None,
    }
}

async fn transcribe(config: &Config, file: &Path, mime: Option<&str>) -> anyhow::Result<()> {
    let mime = mime
        .or_else(|| guess_mime(file))
        .context("cannot tell the audio type; pass --mime")?;
    let format = AudioFormat::from_mime(mime).with_context(|| format!("unsupported audio type: {mime}"))?;

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let waveform = AudioCodec::new(config.limits.max_audio).decode(&bytes, format)?;

    println!("Decoded {:.1}s of audio, transcribing...", waveform.duration().as_secs_f32());

    let client = config.transcription_client()?;
    let result = client.transcribe(&waveform, &config.speech.language).await?;

    println!("\n{}", result.text);
    println!("\n(confidence {:.2}, {})", result.confidence, client.backend_name());
    Ok(())
}

async fn speak(config: &Config, text: &str, out: &Path) -> anyhow::Result<()> {
    println!("Synthesizing: \"{text}\"");

    let client = config.synthesis_client()?;
    let waveform = client.synthesize(text, &config.speech.voice).await?;
    let wav = AudioCodec::default().encode(&waveform, AudioFormat::Wav)?;

    tokio::fs::write(out, &wav)
        .await
        .with_context(|| format!("failed to write {}", out.display()))?;

    println!(
        "Wrote {:.1}s of audio to {}",
        waveform.duration().as_secs_f32(),
        out.display()
    );
    Ok(())
}

async fn chat(config: &Config, audio_dir: Option<&Path>) -> anyhow::Result<()> {
    let orchestrator = config.build_orchestrator()?;
    let shutdown = shutdown_on_ctrl_c();
    let user_id = "terminal";

    if let Some(dir) = audio_dir {
        tokio::fs::create_dir_all(dir).await?;
    }

    println!("Chatting with {} (Ctrl-D to quit, /reset to start over)\n", config.persona.name);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut turn = 0_u32;

    loop {
        let line = tokio::select! {
            () = shutdown.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if charla_gateway::gateway::Command::parse(line).is_some() {
            orchestrator.dialogue().clear(user_id).await;
            println!("{}\n", config.persona.replies.history_cleared);
            continue;
        }

        match orchestrator
            .run(user_id, InboundMessage::Text(line.to_string()), &shutdown)
            .await
        {
            ExchangeOutcome::Reply(bundle) => {
                println!("{}\n", bundle.text);
                if let (Some(dir), Some(audio)) = (audio_dir, &bundle.audio) {
                    turn += 1;
                    let path = dir.join(format!("reply-{turn:03}-{}", bundle.format.file_name()));
                    tokio::fs::write(&path, audio).await?;
                    tracing::debug!(path = %path.display(), "reply audio written");
                }
            }
            ExchangeOutcome::DecodeFailed { notice, .. } => println!("{notice}\n"),
            ExchangeOutcome::Abandoned => break,
        }
    }

    Ok(())
}
