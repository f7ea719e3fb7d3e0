//! graphmail - Microsoft Graph mailbox command line client
//!
//! Signs in with the configured Azure AD flow and runs one mailbox operation.

#![deny(clippy::all)]

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use graphmail::auth::token_manager::format_duration;
use graphmail::mail::{
    BodyType, FileAttachment, ForwardDraft, ItemBody, Mailbox, MailClient, OutgoingMessage,
    QueryFilters,
};
use graphmail::{Config, GraphError};

#[derive(Debug, Parser)]
#[command(name = "graphmail", version, about = "Microsoft Graph mailbox client")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file replacing the embedded defaults
    #[arg(long, global = true, env = "GRAPHMAIL_CONFIG")]
    config: Option<PathBuf>,

    /// Mailbox address; defaults to the configured mailbox or the signed-in user
    #[arg(long, global = true)]
    mailbox: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show who the token belongs to and when it expires
    Whoami,
    /// List mail folders
    Folders(FilterArgs),
    /// Print the id of a folder by display name
    FolderId { name: String },
    /// Create a mail folder
    CreateFolder {
        name: String,
        #[arg(long)]
        hidden: bool,
    },
    /// Delete a mail folder
    DeleteFolder { folder_id: String },
    /// List messages of a folder, following every page
    Messages {
        /// Folder id or well-known name; the whole mailbox when omitted
        #[arg(long)]
        folder: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// List messages of a conversation
    Thread {
        conversation_id: String,
        #[arg(long)]
        folder: Option<String>,
        #[command(flatten)]
        filters: FilterArgs,
    },
    /// Full-text search over messages
    Search { text: String },
    /// Show a message with its attachments
    Read {
        message_id: String,
        /// Body format: text or html
        #[arg(long, default_value = "text")]
        body: BodyType,
    },
    /// Download the raw MIME content of a message
    Mime {
        message_id: String,
        /// Write to a file instead of stdout
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
    /// Send a new message
    Send(SendArgs),
    /// Send a raw MIME message read from a file
    SendMime { path: PathBuf },
    /// Forward a message, through an edited draft when subject, body, cc or files are given
    Forward(ForwardArgs),
    /// Move a message to another folder
    Move {
        message_id: String,
        destination: String,
    },
    /// Move every message of a conversation to another folder
    MoveThread {
        conversation_id: String,
        destination: String,
        /// Only messages in this folder
        #[arg(long)]
        folder: Option<String>,
    },
    /// Move a message to deleted items (or another folder)
    Delete {
        message_id: String,
        #[arg(long)]
        destination: Option<String>,
    },
    /// Move every message of a conversation to deleted items
    DeleteThread {
        conversation_id: String,
        #[arg(long)]
        folder: Option<String>,
    },
}

#[derive(Debug, Args)]
struct FilterArgs {
    /// OData query option as option=value, e.g. --query select=id,subject
    #[arg(long = "query", value_parser = parse_query_option)]
    query: Vec<(String, String)>,
}

impl FilterArgs {
    fn to_filters(&self) -> Option<QueryFilters> {
        if self.query.is_empty() {
            return None;
        }
        Some(self.query.iter().cloned().collect())
    }
}

#[derive(Debug, Args)]
struct SendArgs {
    #[arg(long, required = true)]
    to: Vec<String>,
    #[arg(long)]
    cc: Vec<String>,
    #[arg(long, default_value = "")]
    subject: String,
    #[arg(long, default_value = "")]
    body: String,
    /// Treat the body as HTML
    #[arg(long)]
    html: bool,
    /// Files to attach
    #[arg(long)]
    attach: Vec<PathBuf>,
    /// Do not keep a copy in sent items
    #[arg(long)]
    no_save: bool,
}

#[derive(Debug, Args)]
struct ForwardArgs {
    message_id: String,
    #[arg(long, required = true)]
    to: Vec<String>,
    #[arg(long)]
    cc: Vec<String>,
    #[arg(long, default_value = "")]
    comment: String,
    /// Replace the subject of the forwarded draft
    #[arg(long)]
    subject: Option<String>,
    /// Replace the body of the forwarded draft
    #[arg(long)]
    body: Option<String>,
    /// Files to attach to the forwarded draft
    #[arg(long)]
    attach: Vec<PathBuf>,
}

impl ForwardArgs {
    fn needs_draft(&self) -> bool {
        !self.cc.is_empty() || self.subject.is_some() || self.body.is_some() || !self.attach.is_empty()
    }
}

fn parse_query_option(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected option=value, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file (if present) before anything else
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            eprintln!("\nPlease set the following environment variables:");
            eprintln!("  AZURE_TENANT_ID=<your-tenant-id>");
            eprintln!("  AZURE_CLIENT_ID=<your-azure-ad-client-id>");
            eprintln!("  AZURE_USERNAME / AZURE_PASSWORD (delegated flow)");
            eprintln!("  AZURE_CLIENT_SECRET (application flow)");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config.logging.level);
    info!("Starting graphmail v{}", env!("CARGO_PKG_VERSION"));

    match run(cli, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<GraphError>() {
                Some(graph_error) => eprintln!("Error: {}", graph_error.user_message()),
                None => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn init_logging(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

async fn run(cli: Cli, config: &Config) -> Result<()> {
    let mailbox = match cli.mailbox.as_deref() {
        Some(address) => Mailbox::from_address(Some(address)),
        None => config.default_mailbox(),
    };
    let client = MailClient::connect(config).await?;

    match cli.command {
        Commands::Whoami => {
            let token = client.token().await;
            let remaining = token.expires_at() - Utc::now();
            print_json(&serde_json::json!({
                "flow": config.auth.flow.as_str(),
                "mailbox": mailbox.to_string(),
                "name": token.claim_str("name"),
                "user": token.claim_str("preferred_username").or_else(|| token.claim_str("upn")),
                "app": token.claim_str("app_displayname"),
                "expires_at": token.expires_at(),
                "expires_in": format_duration(remaining),
            }))?;
        }
        Commands::Folders(filters) => {
            let folders = client
                .list_folders(&mailbox, filters.to_filters().as_ref())
                .await?;
            print_json(&folders)?;
        }
        Commands::FolderId { name } => match client.folder_id_by_name(&mailbox, &name).await? {
            Some(id) => println!("{}", id),
            None => anyhow::bail!("No folder named '{}' in {}", name, mailbox),
        },
        Commands::CreateFolder { name, hidden } => {
            print_json(&client.create_folder(&mailbox, &name, hidden).await?)?;
        }
        Commands::DeleteFolder { folder_id } => {
            client.delete_folder(&mailbox, &folder_id).await?;
            info!("Deleted folder {}", folder_id);
        }
        Commands::Messages { folder, filters } => {
            let messages = client
                .folder_messages(
                    &mailbox,
                    folder.as_deref(),
                    filters.to_filters().as_ref(),
                    None,
                )
                .await?;
            print_json(&messages)?;
        }
        Commands::Thread {
            conversation_id,
            folder,
            filters,
        } => {
            let messages = client
                .thread_messages(
                    &mailbox,
                    &conversation_id,
                    filters.to_filters().as_ref(),
                    folder.as_deref(),
                )
                .await?;
            print_json(&messages)?;
        }
        Commands::Search { text } => {
            print_json(&client.search_messages(&mailbox, &text).await?)?;
        }
        Commands::Read { message_id, body } => {
            print_json(&client.read_message(&mailbox, &message_id, body).await?)?;
        }
        Commands::Mime { message_id, output } => {
            let mime = client.read_message_mime(&mailbox, &message_id).await?;
            match output {
                Some(path) => std::fs::write(&path, &mime)
                    .with_context(|| format!("Failed to write {}", path.display()))?,
                None => std::io::stdout().write_all(&mime)?,
            }
        }
        Commands::Send(args) => {
            let body = if args.html {
                ItemBody::html(args.body)
            } else {
                ItemBody::text(args.body)
            };
            let mut message = OutgoingMessage::new(args.subject, body, args.to);
            message.cc = args.cc;
            message.attachments = read_attachments(&args.attach)?;
            message.save_to_sent_items = !args.no_save;
            client.send_mail(&mailbox, &message).await?;
        }
        Commands::SendMime { path } => {
            let raw = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            client.send_mime(&mailbox, &raw).await?;
        }
        Commands::Forward(args) => {
            if args.needs_draft() {
                let mut draft = ForwardDraft::new(args.message_id, args.to);
                draft.cc = args.cc;
                draft.subject = args.subject;
                draft.body = args.body;
                draft.attachments = read_attachments(&args.attach)?;
                client.draft_and_forward(&mailbox, &draft).await?;
            } else {
                client
                    .forward_message(&mailbox, &args.message_id, &args.to, &args.comment)
                    .await?;
            }
        }
        Commands::Move {
            message_id,
            destination,
        } => {
            print_json(&client.move_message(&mailbox, &message_id, &destination).await?)?;
        }
        Commands::MoveThread {
            conversation_id,
            destination,
            folder,
        } => {
            let moved = client
                .move_thread(&mailbox, &conversation_id, folder.as_deref(), &destination)
                .await?;
            println!("Moved {} message(s)", moved);
        }
        Commands::Delete {
            message_id,
            destination,
        } => {
            print_json(
                &client
                    .delete_message(&mailbox, &message_id, destination.as_deref())
                    .await?,
            )?;
        }
        Commands::DeleteThread {
            conversation_id,
            folder,
        } => {
            let moved = client
                .delete_thread(&mailbox, &conversation_id, folder.as_deref())
                .await?;
            println!("Deleted {} message(s)", moved);
        }
    }

    Ok(())
}

fn read_attachments(paths: &[PathBuf]) -> Result<Vec<FileAttachment>> {
    paths
        .iter()
        .map(|path| {
            let content = std::fs::read(path)
                .with_context(|| format!("Failed to read attachment {}", path.display()))?;
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Ok(FileAttachment::new(name, content))
        })
        .collect()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_query_option() {
        assert_eq!(
            parse_query_option("select=id,subject").unwrap(),
            ("select".to_string(), "id,subject".to_string())
        );
        assert_eq!(
            parse_query_option("filter=isRead eq false").unwrap().1,
            "isRead eq false"
        );
        assert!(parse_query_option("top").is_err());
        assert!(parse_query_option("=5").is_err());
    }

    #[test]
    fn test_forward_uses_draft_only_when_needed() {
        let cli = Cli::parse_from(["graphmail", "forward", "m1", "--to", "a@example.com"]);
        let Commands::Forward(args) = cli.command else {
            panic!("expected forward");
        };
        assert!(!args.needs_draft());

        let cli = Cli::parse_from([
            "graphmail", "forward", "m1", "--to", "a@example.com", "--subject", "FW: hi",
        ]);
        let Commands::Forward(args) = cli.command else {
            panic!("expected forward");
        };
        assert!(args.needs_draft());
    }

    #[test]
    fn test_global_mailbox_option() {
        let cli = Cli::parse_from([
            "graphmail", "read", "m1", "--body", "html", "--mailbox", "shared@example.com",
        ]);
        assert_eq!(cli.mailbox.as_deref(), Some("shared@example.com"));
        assert!(matches!(cli.command, Commands::Read { body: BodyType::Html, .. }));
    }
}
