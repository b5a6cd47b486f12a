//! Series outline generation: one `osnova.json` per language.

pub mod citations;
pub mod config;
pub mod generator;
pub mod model;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{error, info, warn};

pub use config::OutlineConfig;
pub use generator::{OutlineGenerator, PromptBuilder};

use crate::args::OutlineArgs;
use crate::config::{AppConfig, OpenAiSettings, require_api_key};
use crate::error::{EXIT_IO, EXIT_PROVIDER, EXIT_UNEXPECTED, EXIT_VALIDATION};
use crate::events::{Event, emit};
use crate::llm::{ChatModel, LlmError, OpenAiClient, RetryPolicy, UsageMonitor};
use crate::paths::{PathResolver, Stage};

pub const DEFAULT_TEMPLATE: &str = include_str!("../../templates/outline_master.txt");

#[derive(Debug, Error)]
pub enum OutlineError {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("configuration validation failed: {0}")]
    InvalidConfig(String),

    #[error("outline failed validation: {0}")]
    InvalidOutline(String),

    #[error("could not parse JSON from response")]
    UnparsableResponse,

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl OutlineError {
    pub fn exit_code(&self) -> i32 {
        match self {
            OutlineError::ConfigNotFound(_) | OutlineError::Io(_) => EXIT_IO,
            OutlineError::InvalidConfig(_) => EXIT_VALIDATION,
            OutlineError::Llm(_) | OutlineError::InvalidOutline(_) | OutlineError::UnparsableResponse => EXIT_PROVIDER,
            OutlineError::Json(_) => EXIT_UNEXPECTED,
        }
    }
}

pub async fn run(args: &OutlineArgs, app: &AppConfig) -> Result<()> {
    emit(Event::phase("start"));
    info!("Loading configuration from {}", args.config.display());
    let mut config = OutlineConfig::load(&args.config)?;
    if !args.languages.is_empty() {
        config.languages = args.languages.clone();
        info!("Processing languages: {:?}", config.languages);
    }
    let config = Arc::new(config);

    let template = match &args.template {
        Some(path) => fs::read_to_string(path).with_context(|| format!("reading template {}", path.display()))?,
        None => DEFAULT_TEMPLATE.to_string(),
    };
    let output_dir = args.output.clone().unwrap_or_else(|| PathResolver::root(Stage::Outline));
    fs::create_dir_all(&output_dir).with_context(|| format!("creating {}", output_dir.display()))?;

    if args.dry_run {
        let prompts = PromptBuilder::new(config.clone(), &template);
        for path in generator::write_prompts(&prompts, &config, &output_dir)? {
            emit(Event::OutputPath { value: path.display().to_string() });
        }
        emit(Event::Done);
        return Ok(());
    }

    let settings = OpenAiSettings {
        model: config.model.clone(),
        temperature: config.temperature,
        ..app.openai.clone()
    };
    let client = OpenAiClient::new(&settings, require_api_key("OPENAI_API_KEY")?)?
        .with_retry_policy(RetryPolicy::outline());
    let model: Arc<dyn ChatModel> = Arc::new(client);
    let monitor = Arc::new(UsageMonitor::new());
    let generator = OutlineGenerator::new(
        config.clone(),
        &template,
        output_dir.clone(),
        model,
        !args.no_cache,
        monitor.clone(),
    );

    emit(Event::phase("generating"));
    let results = generator.generate_all(!args.sequential).await;

    monitor.log_summary();
    let stats_path = output_dir
        .join(".stats")
        .join(format!("run_{}.json", chrono::Utc::now().format("%Y%m%d_%H%M%S")));
    if let Err(e) = monitor.save(&stats_path) {
        warn!("could not save usage report: {:#}", e);
    }

    let mut first_err = None;
    let total = results.len();
    for (lang, result) in results {
        match result {
            Ok(outcome) => emit(Event::OutputPath { value: outcome.output_path.display().to_string() }),
            Err(e) => {
                error!("Failed to generate {}: {}", lang, e);
                emit(Event::error("outline-failed", format!("{lang}: {e}")));
                first_err.get_or_insert(e);
            }
        }
    }
    match first_err {
        None => {
            info!("Generation complete: {} successful", total);
            emit(Event::Done);
            Ok(())
        }
        Some(e) => Err(anyhow::Error::new(e).context("outline generation failed")),
    }
}
