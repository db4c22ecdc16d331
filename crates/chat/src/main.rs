use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use ragchat::chat::{ChatController, ControllerResult};
use ragchat::settings::SettingsStore;
use ragchat::terminal::{Command, HELP_TEXT, print_transcript};
use ragchat_stream::{ChatMode, HttpTransport};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ragchat", version, about = "Terminal client for a RAG chat backend")]
struct Cli {
    /// Settings file; defaults to `<config dir>/ragchat/settings.json`.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Backend base URL, e.g. http://localhost:8000.
    #[arg(long)]
    base_url: Option<String>,
    #[arg(long, value_parser = parse_mode)]
    mode: Option<ChatMode>,
    /// Sent as `user_id` with every chat request.
    #[arg(long)]
    user_id: Option<String>,
}

fn parse_mode(raw: &str) -> Result<ChatMode, String> {
    ChatMode::parse(raw).ok_or_else(|| format!("unknown mode `{raw}`, expected rag or agent"))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they never interleave with the transcript.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = match cli.config {
        Some(path) => SettingsStore::new(path),
        None => SettingsStore::load(),
    };

    let mut settings = (*store.settings()).clone();
    if let Some(base_url) = cli.base_url {
        settings.base_url = base_url;
    }
    if let Some(mode) = cli.mode {
        settings.default_mode = mode;
    }
    if let Some(user_id) = cli.user_id {
        settings.user_id = Some(user_id);
    }
    let settings = settings.normalized();
    tracing::info!(base_url = %settings.base_url, mode = settings.default_mode.as_str(), "starting");

    let transport = Arc::new(HttpTransport::new(settings.transport_config())?);
    let controller = ChatController::new(Arc::clone(&transport), &settings);
    controller.init().await;

    let updates = controller.subscribe();
    let render = tokio::spawn(async move {
        if let Err(error) = print_transcript(updates, std::io::stdout()).await {
            tracing::warn!(error = %error, "stopped rendering transcript");
        }
    });
    println!("connected to {} (type /help for commands)", transport.base_url());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(command) = Command::parse(&line) else {
            continue;
        };

        match command {
            Command::Send(text) => {
                controller.set_draft(text);
                report(controller.send_draft());
            }
            Command::NewChat => report(controller.new_chat()),
            Command::Mode(mode) => {
                if controller.set_mode(mode).is_ok() {
                    println!("mode: {}", mode.as_str());
                } else {
                    println!("! wait for the current reply before switching mode");
                }
            }
            Command::Human => report(controller.request_human()),
            Command::Save => {
                let mode = controller.snapshot().mode;
                let saved = store.update(|saved| {
                    saved.base_url = settings.base_url.clone();
                    saved.user_id = settings.user_id.clone();
                    saved.default_mode = mode;
                });
                match saved {
                    Ok(_) => println!("defaults saved to {}", store.config_path().display()),
                    Err(error) => println!("! {error}"),
                }
            }
            Command::ShowPrompt => println!("{}", controller.snapshot().rag_prompt_template),
            Command::SetPrompt(template) => {
                controller.set_rag_prompt(template);
                println!("prompt saved");
            }
            Command::Upload(path) => match transport.upload_document(&path).await {
                Ok(receipt) => println!("uploaded {} as {}", path.display(), receipt.doc_id),
                Err(error) => println!("! upload failed: {error}"),
            },
            Command::Health => match transport.health().await {
                Ok(true) => println!("backend is healthy"),
                Ok(false) => println!("! backend reported a degraded status"),
                Err(error) => println!("! health check failed: {error}"),
            },
            Command::Help => println!("{HELP_TEXT}"),
            Command::Invalid(hint) => println!("{hint}"),
            Command::Quit => break,
        }
    }

    render.abort();
    Ok(())
}

fn report<T>(result: ControllerResult<T>) {
    if let Err(error) = result {
        tracing::debug!(error = ?error, "command rejected");
        println!("! {error}");
    }
}
