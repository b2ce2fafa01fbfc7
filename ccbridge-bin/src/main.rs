use ccbridge_core::{
    config::Config,
    factory::build_backend,
    model::{ChatRequest, Turn},
    normalizer::normalize_chat,
    server::{AppState, serve},
    stream::StreamEvent,
};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;

#[derive(Parser)]
#[command(author, version, about = "chat-completions bridge for the local agent", long_about = None)]
struct Cli {
    /// Config file (JSON or TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP proxy
    Serve {
        #[arg(long, help = "Override the configured bind address")]
        bind: Option<String>,
        #[arg(long, help = "Override the configured port")]
        port: Option<u16>,
    },
    /// Send one chat request and print the reply
    Chat {
        #[arg(long, default_value = "sonnet")]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
    /// Stream one chat request (prints deltas live)
    ChatStream {
        #[arg(long, default_value = "sonnet")]
        model: String,
        #[arg(short, long, help = "Message from the user")]
        message: String,
    },
}

fn one_shot_request(model: String, message: String, stream: bool) -> ChatRequest {
    normalize_chat(ChatRequest {
        model,
        turns: vec![Turn::user(message)],
        system: None,
        max_output_tokens: None,
        stream,
        request_id: None,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let cfg = match &cli.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };

    let backend = build_backend(&cfg)?;

    match cli.command {
        Commands::Serve { bind, port } => {
            let bind = bind.unwrap_or(cfg.server.bind);
            let port = port.unwrap_or(cfg.server.port);
            serve(AppState { backend }, &bind, port).await?;
        }
        Commands::Chat { model, message } => {
            let resp = backend.chat(one_shot_request(model, message, false)).await?;
            println!("{} -> {}", resp.backend, resp.text);
        }
        Commands::ChatStream { model, message } => {
            let mut stream = backend
                .chat_stream(one_shot_request(model, message, true))
                .await?;
            use std::io::{self, Write};
            let mut saw_delta = false;
            while let Some(ev) = stream.next().await {
                match ev {
                    StreamEvent::Content(txt) => {
                        saw_delta = true;
                        print!("{txt}");
                        io::stdout().flush().ok();
                    }
                    StreamEvent::Finish { reason, .. } => {
                        if saw_delta {
                            println!();
                        }
                        eprintln!("[stop: {reason}]");
                    }
                    StreamEvent::Error(err) => {
                        eprintln!("[error: {err}]");
                        break;
                    }
                    StreamEvent::Role | StreamEvent::Done => {}
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
