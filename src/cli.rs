//! Command-line surface.
//!
//! `process` runs one document, `batch` runs a dataset file and `check`
//! verifies the Ollama backend. Settings come from the environment; the
//! global flags override a few of them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{ConfigError, IndexLocation, Settings};
use crate::pipeline::batch::{load_dataset, BatchError, BatchEvent, BatchRunner, DEFAULT_WORKERS};
use crate::pipeline::cache::SignatureMode;
use crate::pipeline::processor::{CancelToken, DocumentPipeline, SampleRequest};
use crate::pipeline::storage::StorageError;
use crate::pipeline::structuring::{verify_model, LlmClient, OllamaClient, StructuringError};

#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Structuring(#[from] StructuringError),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Processing cancelled")]
    Cancelled,
}

#[derive(Parser, Debug)]
#[command(name = "docsift")]
#[command(about = "Extract labeled fields from PDF documents with a local LLM")]
#[command(version)]
pub struct Cli {
    /// Document cache capacity (overrides DOCSIFT_CACHE_CAPACITY)
    #[arg(long, global = true)]
    cache_capacity: Option<usize>,

    /// File signature mode: fast, strict or hybrid
    #[arg(long, global = true, value_parser = parse_signature_mode)]
    signature_mode: Option<SignatureMode>,

    /// Similarity index directory, or "memory" (overrides DOCSIFT_INDEX_DIR)
    #[arg(long, global = true)]
    index_dir: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Extract fields from a single PDF
    Process {
        /// Document label (e.g. "invoice")
        #[arg(short, long)]
        label: String,
        /// JSON object whose keys name the fields to extract
        #[arg(short, long)]
        schema: String,
        /// Path to the PDF
        #[arg(short, long)]
        pdf: PathBuf,
        /// Use this text instead of reading the PDF
        #[arg(long)]
        text_file: Option<PathBuf>,
        /// Print cache outcome and warnings along with the payload
        #[arg(long)]
        details: bool,
    },

    /// Run every item of a dataset file
    Batch {
        /// JSON array of dataset items
        #[arg(short, long)]
        dataset: PathBuf,
        /// Directory relative PDF references resolve against (default: dataset's directory)
        #[arg(short, long)]
        root: Option<PathBuf>,
        /// Number of concurrent workers
        #[arg(short, long, default_value_t = DEFAULT_WORKERS)]
        workers: usize,
        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check Ollama connectivity and print effective settings
    Check,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

fn parse_signature_mode(value: &str) -> Result<SignatureMode, String> {
    SignatureMode::from_str(value).ok_or_else(|| format!("unknown signature mode {value:?}"))
}

impl Cli {
    /// Environment settings with this invocation's overrides applied.
    pub fn settings(&self) -> Result<Settings, ConfigError> {
        let mut settings = Settings::from_env()?;
        self.apply_overrides(&mut settings);
        Ok(settings)
    }

    fn apply_overrides(&self, settings: &mut Settings) {
        if let Some(capacity) = self.cache_capacity {
            settings.cache_capacity = capacity;
        }
        if let Some(mode) = self.signature_mode {
            settings.signature_mode = mode;
        }
        if let Some(dir) = &self.index_dir {
            settings.index_location = IndexLocation::parse(dir);
        }
    }
}

/// Parse arguments and run the selected command.
pub fn run(cli: Cli) -> Result<(), CliError> {
    let settings = cli.settings()?;

    match cli.command {
        Commands::Process {
            label,
            schema,
            pdf,
            text_file,
            details,
        } => cmd_process(&settings, &label, &schema, &pdf, text_file.as_deref(), details),
        Commands::Batch {
            dataset,
            root,
            workers,
            output,
        } => cmd_batch(&settings, &dataset, root, workers, output.as_deref()),
        Commands::Check => cmd_check(&settings),
    }
}

fn parse_schema(raw: &str) -> Result<serde_json::Map<String, serde_json::Value>, CliError> {
    match serde_json::from_str::<serde_json::Value>(raw)? {
        serde_json::Value::Object(map) => Ok(map),
        other => Err(CliError::InvalidSchema(format!(
            "expected a JSON object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

fn cmd_process(
    settings: &Settings,
    label: &str,
    schema: &str,
    pdf: &Path,
    text_file: Option<&Path>,
    details: bool,
) -> Result<(), CliError> {
    let schema = parse_schema(schema)?;
    let text = text_file.map(std::fs::read_to_string).transpose()?;

    let pipeline = DocumentPipeline::from_settings(settings)?;
    let mut request = SampleRequest::new(0, label, pdf).with_schema(schema);
    request.text = text;

    let outcome = pipeline
        .process(&request, &CancelToken::new())
        .map_err(|_| CliError::Cancelled)?;

    let json = if details {
        serde_json::to_string_pretty(&outcome)?
    } else {
        serde_json::to_string_pretty(&outcome.payload)?
    };
    println!("{json}");
    Ok(())
}

fn cmd_batch(
    settings: &Settings,
    dataset: &Path,
    root: Option<PathBuf>,
    workers: usize,
    output: Option<&Path>,
) -> Result<(), CliError> {
    let items = load_dataset(dataset)?;
    let root = match root {
        Some(root) => root,
        None => dataset
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from(".")),
    };
    if !root.is_dir() {
        return Err(BatchError::InvalidRoot(root).into());
    }

    // Built outside the runtime: the blocking HTTP clients must not be
    // created or dropped on an async thread.
    let pipeline = Arc::new(DocumentPipeline::from_settings(settings)?);
    let runner = BatchRunner::new(pipeline, workers);

    let runtime = tokio::runtime::Runtime::new()?;
    let report = runtime.block_on(async {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let progress = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                eprintln!("{}", progress_line(&event));
            }
        });
        let report = runner.run(items, &root, tx).await;
        let _ = progress.await;
        report
    });

    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(path, json)?;
            tracing::info!(path = %path.display(), "Batch report written");
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn progress_line(event: &BatchEvent) -> String {
    match event {
        BatchEvent::Start { job_id, total } => format!("[{job_id}] starting {total} item(s)"),
        BatchEvent::ItemOk {
            file_name,
            response_ms,
            processed,
            total,
            ..
        } => format!("[{processed}/{total}] ok    {file_name} ({response_ms} ms)"),
        BatchEvent::ItemError {
            file_name,
            error,
            processed,
            total,
            ..
        } => format!("[{processed}/{total}] error {file_name}: {error}"),
        BatchEvent::Complete {
            processed, failed, ..
        } => format!("done: {processed} processed, {failed} failed"),
    }
}

fn cmd_check(settings: &Settings) -> Result<(), CliError> {
    println!("{}", serde_json::to_string_pretty(settings)?);

    let client = OllamaClient::new(&settings.ollama_url, settings.llm_timeout_secs);
    let models = client.list_models().inspect_err(|e| {
        tracing::warn!(url = %settings.ollama_url, error = %e, "Ollama check failed");
    })?;
    println!("Ollama reachable at {} ({} model(s))", settings.ollama_url, models.len());

    verify_model(&client, &settings.llm_model)?;
    println!("Model {} available", settings.llm_model);
    Ok(())
}
