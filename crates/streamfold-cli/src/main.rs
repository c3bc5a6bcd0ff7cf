//! Decode captured model output against a JSON Schema and inspect context logs.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::AsyncReadExt as _;

use streamfold::prelude::*;
use streamfold::source::{from_text_chunks, split_text};
use streamfold::sse::{ByteStream, sse_chunks};
use streamfold::{JsonlContextStore, SourceError};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser)]
#[command(name = "streamfold")]
#[command(about = "Incremental structured-output decoder and context log tool")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a chunked JSON output, printing each partial snapshot
    Decode {
        /// JSON Schema file describing the expected value
        #[arg(long)]
        schema: PathBuf,
        /// Input file (default: stdin)
        #[arg(long)]
        input: Option<PathBuf>,
        /// Treat the input as a server-sent-events body
        #[arg(long)]
        sse: bool,
        /// Characters (or bytes with --sse) per chunk
        #[arg(long, default_value = "16")]
        chunk_size: usize,
        /// Print only the final value
        #[arg(long)]
        final_only: bool,
    },
    /// Append to or inspect a JSONL context log
    Context {
        /// Log directory (default: STREAMFOLD_CONTEXT_DIR)
        #[arg(long)]
        dir: Option<PathBuf>,
        #[command(subcommand)]
        action: ContextAction,
    },
}

#[derive(Subcommand)]
enum ContextAction {
    /// Append one turn
    Append {
        #[arg(long)]
        conversation: String,
        #[arg(long, value_enum, default_value = "user")]
        role: Role,
        /// Text content
        #[arg(long, conflicts_with = "json")]
        text: Option<String>,
        /// JSON content (model turns only)
        #[arg(long)]
        json: Option<String>,
    },
    /// Print the full log as JSON
    Show {
        #[arg(long)]
        conversation: String,
    },
    /// List conversations with a log
    List,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Role {
    User,
    Model,
}

fn build_turn(role: Role, text: Option<String>, json: Option<String>) -> CliResult<Turn> {
    match (role, text, json) {
        (_, Some(_), Some(_)) => Err("--text and --json are mutually exclusive".into()),
        (Role::User, Some(text), None) => Ok(Turn::user(text)),
        (Role::Model, Some(text), None) => Ok(Turn::model(text)),
        (Role::Model, None, Some(raw)) => Ok(Turn::model_json(serde_json::from_str(&raw)?)),
        (Role::User, None, Some(_)) => Err("--json is only supported for model turns".into()),
        (_, None, None) => Err("one of --text or --json is required".into()),
    }
}

fn input_chunks(
    input: &str,
    chunk_size: usize,
    sse: bool,
    max_frame_bytes: usize,
) -> ChunkStream {
    if !sse {
        return from_text_chunks(split_text(input, chunk_size));
    }
    let pieces: Vec<Result<bytes::Bytes, SourceError>> = input
        .as_bytes()
        .chunks(chunk_size.max(1))
        .map(|piece| Ok(bytes::Bytes::copy_from_slice(piece)))
        .collect();
    let bytes_stream: ByteStream = Box::pin(futures::stream::iter(pieces));
    sse_chunks("cli", bytes_stream, max_frame_bytes)
}

async fn read_input(input: Option<&Path>) -> CliResult<String> {
    match input {
        Some(path) => Ok(tokio::fs::read_to_string(path).await?),
        None => {
            let mut buf = String::new();
            tokio::io::stdin().read_to_string(&mut buf).await?;
            Ok(buf)
        }
    }
}

async fn decode(
    schema_path: &Path,
    input: Option<&Path>,
    sse: bool,
    chunk_size: usize,
    final_only: bool,
) -> CliResult<bool> {
    let document: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(schema_path).await?)?;
    let schema = Schema::from_json_schema(&document)?;
    let text = read_input(input).await?;

    let options = DecodeOptions::from_env()?;
    let max_frame_bytes = options.max_buffer_bytes;
    let mut stream = DecodeBuilder::new(schema)
        .options(options)
        .stream(input_chunks(&text, chunk_size, sse, max_frame_bytes))?;
    while let Some(event) = stream.next_event().await {
        match event {
            DecodeEvent::Partial { value, .. } => {
                if !final_only {
                    println!("{value}");
                }
            }
            DecodeEvent::Completed { value, .. } => {
                println!("{value}");
                return Ok(true);
            }
            DecodeEvent::Failed { error, .. } => {
                eprintln!("decode failed: {error}");
                if let Some(partial) = error.partial() {
                    eprintln!("last partial: {partial}");
                }
                return Ok(false);
            }
        }
    }
    Ok(false)
}

async fn context(dir: Option<PathBuf>, action: ContextAction) -> CliResult<()> {
    let store = Arc::new(match dir {
        Some(dir) => JsonlContextStore::new(dir),
        None => JsonlContextStore::from_env()?,
    });
    match action {
        ContextAction::Append {
            conversation,
            role,
            text,
            json,
        } => {
            let turn = build_turn(role, text, json)?;
            let conversation =
                Conversation::with_id(store, conversation, ConversationConfig::named("cli"));
            let record = conversation.append(turn).await?;
            println!("{}", serde_json::to_string(&record)?);
        }
        ContextAction::Show { conversation } => {
            let conversation =
                Conversation::with_id(store, conversation, ConversationConfig::named("cli"));
            let snapshot = conversation.snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        ContextAction::List => {
            for id in store.conversations().await? {
                println!("{id}");
            }
        }
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> CliResult<()> {
    let _ = dotenvy::dotenv();
    streamfold::init_observability();

    let cli = Cli::parse();
    match cli.command {
        Command::Decode {
            schema,
            input,
            sse,
            chunk_size,
            final_only,
        } => {
            let ok = decode(&schema, input.as_deref(), sse, chunk_size, final_only).await?;
            if !ok {
                std::process::exit(1);
            }
        }
        Command::Context { dir, action } => context(dir, action).await?,
    }
    Ok(())
}
