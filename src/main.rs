use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use easyprompt::chat::{self, ChatOptions};
use easyprompt::config::{self, ApiConfig};
use easyprompt::constants;
use easyprompt::evaluator::EvaluatorService;
use easyprompt::locale::{Language, Locale};
use easyprompt::store::FileSessionStore;
use easyprompt::web_server::{self, AppState};

// Define the command-line interface structure using clap
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding session data.
    #[arg(long, global = true, env = "EASYPROMPT_SESSIONS_DIR", default_value = "./sessions")]
    sessions_dir: PathBuf,
    /// Interface and prompt language (zh or en).
    #[arg(long, global = true, env = "EASYPROMPT_LANG", default_value = "zh")]
    lang: Language,
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the web server with the WebSocket interview endpoint.
    Serve {
        #[arg(long, default_value = "0.0.0.0", help = "Address to listen on.")]
        host: String,
        #[arg(long, env = "EASYPROMPT_PORT", default_value_t = constants::DEFAULT_PORT, help = "Port for the web server.")]
        port: u16,
    },
    /// Run a character interview in the terminal.
    Chat {
        #[arg(long, help = "Disable content safety filters for this interview.")]
        nsfw: bool,
        #[arg(long, help = "Name for the new session.")]
        name: Option<String>,
    },
    /// Inspect stored sessions.
    Sessions {
        #[command(subcommand)]
        target: SessionCommands,
    },
}

#[derive(clap::Subcommand, Debug)]
enum SessionCommands {
    /// List sessions, most recently updated first.
    List {
        #[arg(long, help = "Only sessions owned by this user.")]
        user: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Show one session with its profile and final prompt.
    Show {
        id: String,
        #[arg(long, help = "Owner of the session.")]
        user: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for environment variables like API keys)
    dotenvy::dotenv().ok();
    // Secrets may also live one per file in the env directory
    if let Err(e) = config::load_env_dir(std::path::Path::new(constants::ENV_DIR.as_str())) {
        eprintln!("Failed to read env directory {}: {}", constants::ENV_DIR.as_str(), e);
    }

    // Reads log level from RUST_LOG environment variable (e.g., RUST_LOG=info,easyprompt=debug)
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    info!("Easy-Prompt starting with command: {:?}", cli.command);

    let locale = Arc::new(Locale::new(cli.lang));
    let store = FileSessionStore::open(&cli.sessions_dir)
        .await
        .with_context(|| format!("Failed to open session store at {}", cli.sessions_dir.display()))?;

    match cli.command {
        Commands::Serve { host, port } => {
            info!("{}", locale.t("APP_STARTING"));
            let evaluator = Arc::new(EvaluatorService::start(
                store.clone(),
                locale.clone(),
                *constants::EVALUATOR_CONCURRENCY,
            ));
            let default_config = ApiConfig::from_env();
            if !default_config.is_configured() {
                info!(api_type = default_config.api_type.as_str(), "No default API key, clients must send api_config");
            }
            let state = AppState::new(
                store,
                evaluator.clone(),
                locale.clone(),
                default_config,
                *constants::SCORE_THRESHOLD,
            );

            let shutdown = async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for Ctrl-C: {:?}", e);
                }
                info!("Ctrl-C received, initiating shutdown...");
            };
            let result = web_server::start_web_server(&host, port, state, shutdown).await;

            evaluator.stop().await;
            info!("{}", locale.t("APP_SHUTDOWN"));
            result?;
        }
        Commands::Chat { nsfw, name } => {
            let evaluator = Arc::new(EvaluatorService::start(
                store.clone(),
                locale.clone(),
                *constants::EVALUATOR_CONCURRENCY,
            ));
            let mut config = ApiConfig::from_env();
            config.nsfw_mode |= nsfw;
            let options = ChatOptions {
                config,
                threshold: *constants::SCORE_THRESHOLD,
                session_name: name,
            };

            let result = tokio::select! {
                result = chat::run_chat(options, store, evaluator.clone(), locale.clone()) => result.map(|_| ()),
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    println!("{}", locale.t("EXITING"));
                    Ok(())
                }
            };
            evaluator.stop().await;
            result.context("Chat session failed")?;
        }
        Commands::Sessions { target } => match target {
            SessionCommands::List { user, limit, offset } => {
                let sessions = store.list_sessions(user.as_deref(), limit, offset).await?;
                for session in sessions {
                    println!(
                        "{}\t{}\t{:?}\t{}\t{}",
                        session.id,
                        session.updated_at.format("%Y-%m-%d %H:%M"),
                        session.status,
                        session.message_count,
                        session.name
                    );
                }
            }
            SessionCommands::Show { id, user } => {
                let session_ref = easyprompt::session::SessionRef::new(id, user);
                let session = store.get_session(&session_ref).await?;
                println!("{}", serde_json::to_string_pretty(&session)?);

                let profile = store.load_profile(&session_ref).await?;
                if !profile.is_empty() {
                    println!("\n{profile}");
                }
                if let Some(prompt) = store.load_final_prompt(&session_ref).await? {
                    println!("\n{}\n{prompt}", locale.t("FINAL_PROMPT_HEADER"));
                }
            }
        },
    }

    Ok(())
}
