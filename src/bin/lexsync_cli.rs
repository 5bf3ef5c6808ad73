//! LexSync CLI - legal assistant document sync and chat client
//!
//! Usage:
//!   lexsync login                        Connect Google Drive
//!   lexsync logout                       Disconnect Google Drive
//!   lexsync status                       Show connection status
//!   lexsync upload --agent <role> FILE.. Upload documents to an agent
//!   lexsync chat --agent <role> MESSAGE  Ask an agent a question
//!   lexsync history <list|stats|errors|clear|remove>

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use lexsync::drive::{bind_callback_listener, wait_for_callback};
use lexsync::{
    format_duration, format_file_size, load_config, AgentRole, ChatClient, FileDescriptor,
    FileManager, FileStore, FolderResolver, HttpDriveTransport, SessionStore, TokenManager,
    TokenProvider, UploadHistory, UploadStatus, Uploader,
};

#[derive(Parser)]
#[command(
    name = "lexsync",
    about = "LexSync CLI - legal assistant document sync and chat",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect Google Drive via browser authorization
    Login,
    /// Disconnect Google Drive
    Logout,
    /// Show connection status
    Status,
    /// Upload documents to an agent's Drive folder
    Upload {
        /// Agent role: contracts, labor, consumer-defense, general
        #[arg(long)]
        agent: String,
        /// Files to upload
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Send a chat message to an agent
    Chat {
        /// Agent role: contracts, labor, consumer-defense, general
        #[arg(long)]
        agent: String,
        /// Message text
        message: String,
    },
    /// Files already uploaded to an agent's Drive folder
    Files {
        #[command(subcommand)]
        command: FilesCommands,
    },
    /// Upload history
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
}

#[derive(Subcommand)]
enum FilesCommands {
    /// List files in an agent's folder, newest first
    List {
        /// Agent role: contracts, labor, consumer-defense, general
        #[arg(long)]
        agent: String,
        #[arg(long, default_value_t = 25)]
        limit: u32,
    },
    /// Permanently delete a remote file by id
    Remove { file_id: String },
}

#[derive(Subcommand)]
enum HistoryCommands {
    /// List retained upload sessions, newest first
    List,
    /// Per-agent upload totals
    Stats,
    /// Most recent upload errors
    Errors {
        #[arg(default_value_t = 10)]
        limit: usize,
    },
    /// Delete all upload history
    Clear,
    /// Delete one session by id
    Remove { session_id: String },
}

fn parse_role(key: &str) -> Result<AgentRole> {
    AgentRole::from_key(key).ok_or_else(|| {
        anyhow!(
            "Unknown agent '{}'. Valid agents: {}",
            key,
            AgentRole::ALL.map(|r| r.as_key()).join(", ")
        )
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config();
    let store: Arc<dyn lexsync::KeyValueStore> =
        Arc::new(FileStore::open_default().context("Cannot open local storage")?);
    let tokens = Arc::new(TokenManager::new(config.drive.clone(), store.clone()));

    match cli.command {
        Commands::Login => {
            let (listener, port) = bind_callback_listener().await?;
            let redirect_uri = format!("http://127.0.0.1:{}/callback", port);
            let (auth_url, _state) = tokens.authorize_url(&redirect_uri)?;

            println!("Opening browser for Google Drive authorization...");
            if open::that(&auth_url).is_err() {
                println!("Could not open a browser. Visit:\n{}", auth_url);
            }

            let (code, state) = wait_for_callback(listener).await?;
            tokens.complete_auth(&code, &state).await?;
            println!("Google Drive connected.");
        }

        Commands::Logout => {
            tokens.logout();
            println!("Google Drive disconnected.");
        }

        Commands::Status => {
            if tokens.is_authenticated() {
                println!("Google Drive: connected");
            } else {
                println!("Google Drive: not connected (run `lexsync login`)");
            }
        }

        Commands::Upload { agent, files } => {
            let role = parse_role(&agent)?;
            let agent_config = config
                .agent(role)
                .ok_or_else(|| anyhow!("No configuration for agent '{}'", agent))?;

            let descriptors = files
                .into_iter()
                .map(FileDescriptor::from_path)
                .collect::<Result<Vec<_>, _>>()?;

            let history = Arc::new(UploadHistory::new(store.clone(), config.history_max_sessions));
            let uploader = Uploader::new(
                Arc::new(HttpDriveTransport::new()),
                tokens.clone(),
                history,
                config.upload.clone(),
            );

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("\nCancelling, letting in-flight uploads settle...");
                    signal_cancel.cancel();
                }
            });

            let spinner = ProgressBar::new_spinner();
            spinner.set_style(ProgressStyle::with_template("{spinner} {msg}")?);
            spinner.set_message(format!("Uploading {} file(s) to {}...", descriptors.len(), role));
            spinner.enable_steady_tick(Duration::from_millis(100));

            let session = uploader
                .upload_batch(role, agent_config, descriptors, &cancel)
                .await?;
            spinner.finish_and_clear();

            for item in &session.items {
                match &item.status {
                    UploadStatus::Success { duration_ms } => println!(
                        "  ok    {} ({}, {})",
                        item.file_name,
                        format_file_size(item.file_size),
                        format_duration(*duration_ms)
                    ),
                    UploadStatus::Error { message, retries } => println!(
                        "  fail  {} - {} ({} retries)",
                        item.file_name, message, retries
                    ),
                    UploadStatus::Pending => {}
                }
            }
            println!(
                "{} uploaded, {} failed (session {})",
                session.success_count, session.error_count, session.id
            );
            if session.error_count > 0 {
                std::process::exit(1);
            }
        }

        Commands::Chat { agent, message } => {
            let role = parse_role(&agent)?;
            let agent_config = config
                .agent(role)
                .ok_or_else(|| anyhow!("No configuration for agent '{}'", agent))?;

            let sessions = SessionStore::new(store.clone());
            let session_id = match sessions.current() {
                Some(id) => {
                    sessions.update_with_message(&id, &message)?;
                    id
                }
                None => sessions.create_session(Some(&message))?.id,
            };

            let reply = ChatClient::new()
                .send(&agent_config.webhook_url, &message, &session_id)
                .await?;
            println!("{}", reply);
        }

        Commands::Files { command } => {
            let transport = Arc::new(HttpDriveTransport::new());
            let files = FileManager::new(transport.clone(), tokens.clone());
            match command {
                FilesCommands::List { agent, limit } => {
                    let role = parse_role(&agent)?;
                    let agent_config = config
                        .agent(role)
                        .ok_or_else(|| anyhow!("No configuration for agent '{}'", agent))?;

                    let resolver = FolderResolver::new(transport, tokens.clone());
                    let folder_id = resolver
                        .resolve(&agent_config.drive_root_folder_id, &agent_config.subfolder_name)
                        .await?;

                    let listed = files.list(&folder_id, limit).await?;
                    if listed.is_empty() {
                        println!("No files in the {} folder.", role);
                    }
                    for file in listed {
                        let size = file
                            .size
                            .map(format_file_size)
                            .unwrap_or_else(|| "-".to_string());
                        let created = file
                            .created_at
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "-".to_string());
                        println!("{}  {}  {:>10}  {}", file.id, created, size, file.name);
                    }
                }
                FilesCommands::Remove { file_id } => {
                    files.delete(&file_id).await?;
                    println!("Deleted file {}.", file_id);
                }
            }
        }

        Commands::History { command } => {
            let history = UploadHistory::new(store.clone(), config.history_max_sessions);
            match command {
                HistoryCommands::List => {
                    let sessions = history.list_sessions();
                    if sessions.is_empty() {
                        println!("No upload history.");
                    }
                    for session in sessions {
                        println!(
                            "{}  {}  {}  {} file(s), {} ok, {} failed",
                            session.id,
                            session.started_at.format("%Y-%m-%d %H:%M"),
                            session.agent_role.as_key(),
                            session.total_files,
                            session.success_count,
                            session.error_count
                        );
                    }
                }
                HistoryCommands::Stats => {
                    let stats = history.stats_by_agent();
                    for role in AgentRole::ALL {
                        if let Some(s) = stats.get(&role) {
                            println!(
                                "{:18} {} total, {} ok, {} failed",
                                role.as_key(),
                                s.total,
                                s.success,
                                s.error
                            );
                        }
                    }
                }
                HistoryCommands::Errors { limit } => {
                    for item in history.recent_errors(limit) {
                        if let UploadStatus::Error { message, retries } = &item.status {
                            println!(
                                "{}  {}  {} ({} retries)",
                                item.started_at.format("%Y-%m-%d %H:%M"),
                                item.file_name,
                                message,
                                retries
                            );
                        }
                    }
                }
                HistoryCommands::Clear => {
                    history.clear()?;
                    println!("Upload history cleared.");
                }
                HistoryCommands::Remove { session_id } => {
                    if history.get_session(&session_id).is_none() {
                        bail!("No session {}", session_id);
                    }
                    history.remove_session(&session_id)?;
                    println!("Removed session {}.", session_id);
                }
            }
        }
    }

    Ok(())
}
